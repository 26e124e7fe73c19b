pub mod data_rate;
pub mod protocol;
pub mod translate;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UdpConfig;
use crate::error::{BridgeError, Result};
use crate::gateway::connection::{Connection, TxOutcome};
use crate::gateway::registry::Registry;
use crate::gateway::{DownlinkMessage, GatewayStatus, TxSchedule, Upstream};
use protocol::{
    GatewayEui, GwmpPacket, ProtocolVersion, PullRespPayload, PushDataPayload, TxAckPayload,
};

/// Largest possible UDP payload
const MAX_DATAGRAM: usize = 65535;

/// Handle for sending downlinks through the server's socket
#[derive(Clone)]
pub struct DownlinkSender {
    socket: Arc<UdpSocket>,
    registry: Arc<Registry>,
    next_token: Arc<AtomicU16>,
    timeout: Duration,
}

/// Bind the Semtech UDP Packet Forwarder server and start its receive loop.
///
/// Decoded uplinks and status reports go to the registry's upstream sink.
/// The returned task ends with `Ok` on shutdown and with `BridgeError::Io`
/// if the socket fails.
pub async fn start_server(
    config: &UdpConfig,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> Result<(DownlinkSender, JoinHandle<Result<()>>)> {
    let socket = Arc::new(UdpSocket::bind(&config.bind).await?);
    info!("UDP server listening on {}", socket.local_addr()?);

    let sender = DownlinkSender {
        socket: socket.clone(),
        registry: registry.clone(),
        next_token: Arc::new(AtomicU16::new(Utc::now().timestamp_subsec_nanos() as u16)),
        timeout: config.downlink_timeout(),
    };

    let workers = config.workers.max(1);
    let task = tokio::spawn(run_server(socket, registry, workers, shutdown));
    Ok((sender, task))
}

async fn run_server(
    socket: Arc<UdpSocket>,
    registry: Arc<Registry>,
    workers: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let limiter = Arc::new(Semaphore::new(workers));
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("UDP server shutting down");
                return Ok(());
            }
            res = socket.recv_from(&mut buf) => res.map_err(|e| {
                error!("UDP receive failed: {}", e);
                BridgeError::Io(e)
            })?,
        };
        debug!("Received {} bytes from {}", len, src);

        // Wait for a free worker; the datagram stays queued in the kernel meanwhile
        let permit = match limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };
        let datagram = buf[..len].to_vec();
        let socket = socket.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            handle_datagram(&socket, &registry, src, &datagram).await;
            drop(permit);
        });
    }
}

async fn handle_datagram(
    socket: &UdpSocket,
    registry: &Arc<Registry>,
    src: SocketAddr,
    data: &[u8],
) {
    let (version, packet) = match GwmpPacket::decode_versioned(data) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Failed to parse GWMP packet from {}: {}", src, e);
            return;
        }
    };

    match packet {
        GwmpPacket::PushData {
            random_token,
            gateway_eui,
            payload,
        } => {
            let request = PushRequest {
                src,
                version,
                random_token,
                gateway_eui,
                digest: translate::payload_digest(data),
            };
            handle_push_data(socket, registry, request, payload).await;
        }
        GwmpPacket::PullData {
            random_token,
            gateway_eui,
        } => {
            debug!(
                "PULL_DATA from gateway {} (token: 0x{:04x})",
                gateway_eui, random_token
            );
            let Some(conn) = connect(registry, gateway_eui) else {
                return;
            };
            conn.record_pull(src, version);
            let ack = GwmpPacket::pull_ack(version, random_token);
            send_ack(socket, &ack, src, "PULL_ACK").await;
        }
        GwmpPacket::TxAck {
            random_token,
            gateway_eui,
            payload,
        } => handle_tx_ack(registry, random_token, gateway_eui, payload),
        GwmpPacket::PushAck { random_token } | GwmpPacket::PullAck { random_token } => {
            // We never originate PUSH_DATA/PULL_DATA
            debug!(
                "Ignoring unsolicited ack (token: 0x{:04x}) from {}",
                random_token, src
            );
        }
        GwmpPacket::PullResp { random_token, .. } => {
            debug!(
                "Ignoring PULL_RESP (token: 0x{:04x}) from {}",
                random_token, src
            );
        }
    }
}

/// Header fields of a PUSH_DATA
struct PushRequest {
    src: SocketAddr,
    version: ProtocolVersion,
    random_token: u16,
    gateway_eui: GatewayEui,
    /// Digest of the whole datagram
    digest: u64,
}

async fn handle_push_data(
    socket: &UdpSocket,
    registry: &Arc<Registry>,
    request: PushRequest,
    payload: PushDataPayload,
) {
    let PushRequest {
        src,
        version,
        random_token,
        gateway_eui,
        digest,
    } = request;
    info!(
        "PUSH_DATA from gateway {} (token: 0x{:04x}, {} rxpk{})",
        gateway_eui,
        random_token,
        payload.rxpk.len(),
        if payload.stat.is_some() { " + stat" } else { "" }
    );
    let Some(mut conn) = connect(registry, gateway_eui) else {
        return;
    };
    let mut fresh = conn.observe_push(random_token, digest);
    if conn.is_closed() {
        // Idle sweep or eviction got it between lookup and now
        debug!(
            "Gateway {} session closed under PUSH_DATA, reconnecting",
            gateway_eui
        );
        let Some(next) = connect(registry, gateway_eui) else {
            return;
        };
        fresh = next.observe_push(random_token, digest);
        conn = next;
    }

    let received_at = Utc::now();
    let mut upstream = Vec::with_capacity(payload.rxpk.len() + 1);

    if fresh {
        for rxpk in &payload.rxpk {
            match translate::uplink_from_rxpk(gateway_eui, rxpk, received_at) {
                Ok(up) => {
                    debug!(
                        "  rxpk: freq={} MHz, rssi={:?} dBm, datr={}, size={} bytes",
                        rxpk.freq, rxpk.rssi, rxpk.datr, rxpk.size
                    );
                    conn.record_uplink(up.timestamp, received_at);
                    upstream.push(Upstream::Uplink(up));
                }
                Err(e) => warn!("  Skipping rxpk from gateway {}: {}", gateway_eui, e),
            }
        }

        if let Some(stat) = payload.stat {
            debug!("  Gateway status: {:?}", stat);
            conn.record_status(&stat, received_at);
            upstream.push(Upstream::Status(GatewayStatus {
                gateway_eui,
                received_at,
                stat,
            }));
        }
    } else {
        debug!(
            "Retransmitted PUSH_DATA from gateway {} (token: 0x{:04x}), already forwarded",
            gateway_eui, random_token
        );
    }

    // Connection state is updated; the ack may go out before the sink catches up
    send_ack(socket, &GwmpPacket::push_ack(version, random_token), src, "PUSH_ACK").await;

    for msg in upstream {
        if let Err(e) = forward_upstream(registry, &mut conn, msg).await {
            warn!("Failed to forward upstream from gateway {}: {}", gateway_eui, e);
            break;
        }
    }
}

/// Forward through `conn`, moving to the gateway's new session if `conn` was
/// closed after the datagram was acknowledged
async fn forward_upstream(
    registry: &Arc<Registry>,
    conn: &mut Arc<Connection>,
    msg: Upstream,
) -> Result<()> {
    if !conn.is_closed() {
        match conn.forward(msg.clone()).await {
            Err(BridgeError::ConnectionClosed(_)) => {}
            res => return res,
        }
    }
    let (next, _) = registry.get_or_create(conn.gateway_eui())?;
    *conn = next;
    conn.forward(msg).await
}

fn handle_tx_ack(
    registry: &Registry,
    random_token: u16,
    gateway_eui: GatewayEui,
    payload: Option<TxAckPayload>,
) {
    let ack = payload.map(|p| p.txpk_ack).unwrap_or_default();
    debug!(
        "TX_ACK from gateway {} (token: 0x{:04x}): {}",
        gateway_eui, random_token, ack.error
    );
    if let Some(warning) = &ack.warn {
        warn!("Gateway {} TX warning: {}", gateway_eui, warning);
    }

    let Some(conn) = registry.lookup(&gateway_eui) else {
        debug!("Discarding TX_ACK from unconnected gateway {}", gateway_eui);
        return;
    };
    match conn.complete_downlink(random_token, ack.error) {
        Ok(rtt) => debug!("Downlink to gateway {} acknowledged in {:?}", gateway_eui, rtt),
        // Duplicate or late ack
        Err(e) => debug!("Discarding TX_ACK from gateway {}: {}", gateway_eui, e),
    }
}

fn connect(registry: &Arc<Registry>, gateway_eui: GatewayEui) -> Option<Arc<Connection>> {
    match registry.get_or_create(gateway_eui) {
        Ok((conn, _)) => Some(conn),
        Err(e) => {
            warn!("Dropping packet from gateway {}: {}", gateway_eui, e);
            None
        }
    }
}

async fn send_ack(socket: &UdpSocket, ack: &[u8], dst: SocketAddr, kind: &str) {
    if let Err(e) = socket.send_to(ack, dst).await {
        error!("Failed to send {} to {}: {}", kind, dst, e);
    }
}

impl DownlinkSender {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send a downlink to a gateway as PULL_RESP and wait for its TX_ACK.
    ///
    /// Returns the round-trip time on success. There is no retry: a timeout
    /// or a rejection is reported as is.
    pub async fn send_downlink(
        &self,
        gateway_eui: GatewayEui,
        msg: &DownlinkMessage,
    ) -> Result<Duration> {
        let conn = self
            .registry
            .lookup(&gateway_eui)
            .ok_or(BridgeError::NotConnected(gateway_eui))?;
        let addr = conn
            .downlink_addr()
            .ok_or(BridgeError::NoDownlinkPath(gateway_eui))?;

        if let TxSchedule::Timestamp(tmst) = msg.schedule {
            if let Some(until) = conn.until_concentrator_time(tmst) {
                if until < 0 {
                    warn!(
                        "Downlink for gateway {} scheduled {} µs in the past",
                        gateway_eui, -until
                    );
                }
            }
        }

        let (random_token, reply) = self.reserve_token(&conn)?;
        let packet = GwmpPacket::PullResp {
            random_token,
            payload: PullRespPayload {
                txpk: translate::txpk_from_downlink(msg),
            },
        }
        .encode_as(conn.downlink_version());

        if let Err(e) = self.socket.send_to(&packet, addr).await {
            error!("Failed to send PULL_RESP to {}: {}", addr, e);
            conn.cancel_downlink(random_token);
            return Err(e.into());
        }
        conn.mark_downlink_sent();
        info!(
            "PULL_RESP to gateway {} at {} (token: 0x{:04x})",
            gateway_eui, addr, random_token
        );

        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(TxOutcome::Acked(rtt))) => Ok(rtt),
            Ok(Ok(TxOutcome::Rejected(error))) => {
                warn!("Gateway {} rejected downlink: {}", gateway_eui, error);
                Err(BridgeError::DownlinkRejected(error))
            }
            Ok(Ok(TxOutcome::Expired)) => Err(BridgeError::DownlinkTimeout(self.timeout)),
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed(gateway_eui)),
            Err(_) => {
                conn.cancel_downlink(random_token);
                warn!(
                    "No TX_ACK from gateway {} for token 0x{:04x}",
                    gateway_eui, random_token
                );
                Err(BridgeError::DownlinkTimeout(self.timeout))
            }
        }
    }

    /// Next free token on this connection
    fn reserve_token(&self, conn: &Connection) -> Result<(u16, oneshot::Receiver<TxOutcome>)> {
        for _ in 0..=u16::MAX {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            if let Some(reply) = conn.register_downlink(token, self.timeout)? {
                return Ok((token, reply));
            }
        }
        Err(BridgeError::TokensExhausted(conn.gateway_eui()))
    }
}
