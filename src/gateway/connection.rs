//! A logical gateway session.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::clock::{forward_delta, ClockSync};
use super::stats::{RoundTripStats, RoundTripSummary};
use super::{Upstream, UpstreamSink};
use crate::config::GatewayConfig;
use crate::error::{BridgeError, Result};
use crate::udp::protocol::{GatewayEui, ProtocolVersion, Stat, TxError};

/// How a pending downlink ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxOutcome {
    Acked(Duration),
    Rejected(TxError),
    Expired,
}

struct PendingDownlink {
    sent_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<TxOutcome>,
}

struct State {
    last_seen: Instant,
    /// Source address of the latest PULL_DATA
    downlink_addr: Option<SocketAddr>,
    /// Header version of the latest PULL_DATA, used for PULL_RESP
    downlink_version: ProtocolVersion,
    last_pull_at: Option<DateTime<Utc>>,
    last_uplink_at: Option<DateTime<Utc>>,
    last_status_at: Option<DateTime<Utc>>,
    last_downlink_at: Option<DateTime<Utc>>,
    last_status: Option<Stat>,
    /// Server receive time minus gateway wall-clock time of the latest status
    clock_offset: Option<chrono::Duration>,
    clock: ClockSync,
    round_trip: RoundTripStats,
    /// (token, payload digest) of recent PUSH_DATA
    recent_pushes: VecDeque<(u16, u64)>,
}

/// Point-in-time view of a connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub gateway_eui: GatewayEui,
    pub created_at: DateTime<Utc>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_uplink_at: Option<DateTime<Utc>>,
    pub last_status_at: Option<DateTime<Utc>>,
    pub last_downlink_at: Option<DateTime<Utc>>,
    pub uplink_count: u64,
    pub downlink_count: u64,
    pub downlink_errors: u64,
    pub round_trip: Option<RoundTripSummary>,
    pub clock_offset: Option<chrono::Duration>,
}

/// One gateway session. Created by the registry, torn down when its
/// cancellation token fires.
pub struct Connection {
    gateway_eui: GatewayEui,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    closed: AtomicBool,
    dedup_window: usize,
    uplink_count: AtomicU64,
    downlink_count: AtomicU64,
    downlink_errors: AtomicU64,
    upstream: Mutex<Option<UpstreamSink>>,
    state: Mutex<State>,
    pending: Mutex<HashMap<u16, PendingDownlink>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub(crate) fn new(
        gateway_eui: GatewayEui,
        config: &GatewayConfig,
        upstream: UpstreamSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway_eui,
            created_at: Utc::now(),
            cancel,
            closed: AtomicBool::new(false),
            dedup_window: config.push_dedup_window,
            uplink_count: AtomicU64::new(0),
            downlink_count: AtomicU64::new(0),
            downlink_errors: AtomicU64::new(0),
            upstream: Mutex::new(Some(upstream)),
            state: Mutex::new(State {
                last_seen: Instant::now(),
                downlink_addr: None,
                downlink_version: ProtocolVersion::default(),
                last_pull_at: None,
                last_uplink_at: None,
                last_status_at: None,
                last_downlink_at: None,
                last_status: None,
                clock_offset: None,
                clock: ClockSync::default(),
                round_trip: RoundTripStats::new(config.rtt_window, config.rtt_max()),
                recent_pushes: VecDeque::with_capacity(config.push_dedup_window),
            }),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway_eui(&self) -> GatewayEui {
        self.gateway_eui
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True once the lifetime has been cancelled
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the connection is cancelled
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn downlink_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).downlink_addr
    }

    pub fn downlink_version(&self) -> ProtocolVersion {
        lock(&self.state).downlink_version
    }

    pub fn last_status(&self) -> Option<Stat> {
        lock(&self.state).last_status.clone()
    }

    pub fn uplink_count(&self) -> u64 {
        self.uplink_count.load(Ordering::Relaxed)
    }

    pub fn downlink_count(&self) -> u64 {
        self.downlink_count.load(Ordering::Relaxed)
    }

    pub fn pending_downlinks(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Estimated concentrator counter right now, once an uplink has been seen
    pub fn concentrator_time(&self) -> Option<u32> {
        lock(&self.state).clock.concentrator_time(Instant::now())
    }

    /// Microseconds until the concentrator counter reaches `tmst`
    pub fn until_concentrator_time(&self, tmst: u32) -> Option<i64> {
        lock(&self.state).clock.until(tmst, Instant::now())
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = lock(&self.state);
        ConnectionStats {
            gateway_eui: self.gateway_eui,
            created_at: self.created_at,
            last_pull_at: state.last_pull_at,
            last_uplink_at: state.last_uplink_at,
            last_status_at: state.last_status_at,
            last_downlink_at: state.last_downlink_at,
            uplink_count: self.uplink_count(),
            downlink_count: self.downlink_count(),
            downlink_errors: self.downlink_errors.load(Ordering::Relaxed),
            round_trip: state.round_trip.summary(),
            clock_offset: state.clock_offset,
        }
    }

    /// Record a PUSH_DATA. Returns false for a retransmission of one of the
    /// last `push_dedup_window` datagrams (same token, same payload).
    pub(crate) fn observe_push(&self, token: u16, digest: u64) -> bool {
        let mut state = lock(&self.state);
        state.last_seen = Instant::now();
        if self.dedup_window == 0 {
            return true;
        }
        if state.recent_pushes.contains(&(token, digest)) {
            return false;
        }
        if state.recent_pushes.len() == self.dedup_window {
            state.recent_pushes.pop_front();
        }
        state.recent_pushes.push_back((token, digest));
        true
    }

    /// Record a PULL_DATA; its source becomes the downlink return path
    pub(crate) fn record_pull(&self, addr: SocketAddr, version: ProtocolVersion) {
        let mut state = lock(&self.state);
        state.last_seen = Instant::now();
        state.last_pull_at = Some(Utc::now());
        state.downlink_version = version;
        if state.downlink_addr != Some(addr) {
            debug!("Gateway {} downlink path now {}", self.gateway_eui, addr);
            state.downlink_addr = Some(addr);
        }
    }

    pub(crate) fn record_uplink(&self, tmst: u32, received_at: DateTime<Utc>) {
        let mut state = lock(&self.state);
        if let Some(previous) = state.clock.anchor_tmst() {
            debug!(
                "Gateway {}: uplink {:?} after the previous one (concentrator time)",
                self.gateway_eui,
                forward_delta(previous, tmst)
            );
        }
        state.last_uplink_at = Some(received_at);
        state.clock.sync(tmst, Instant::now());
        self.uplink_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_status(&self, stat: &Stat, received_at: DateTime<Utc>) {
        let mut state = lock(&self.state);
        state.last_status_at = Some(received_at);
        // Some forwarders omit the time, keep the previous offset then
        if let Some(time) = stat.time {
            state.clock_offset = Some(received_at - time);
        }
        state.last_status = Some(stat.clone());
    }

    /// Hand a message to the upstream sink, waiting for room in the channel
    pub(crate) async fn forward(&self, msg: Upstream) -> Result<()> {
        let sink = lock(&self.upstream)
            .clone()
            .ok_or(BridgeError::ConnectionClosed(self.gateway_eui))?;

        tokio::select! {
            res = sink.send(msg) => {
                res.map_err(|_| BridgeError::ConnectionClosed(self.gateway_eui))
            }
            _ = self.cancel.cancelled() => Err(BridgeError::ConnectionClosed(self.gateway_eui)),
        }
    }

    /// Reserve `token` for a downlink awaiting TX_ACK.
    /// `Ok(None)` if the token is already pending on this connection.
    pub(crate) fn register_downlink(
        &self,
        token: u16,
        timeout: Duration,
    ) -> Result<Option<oneshot::Receiver<TxOutcome>>> {
        let mut pending = lock(&self.pending);
        // Checked under the pending lock so close() cannot race past us
        if self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled() {
            return Err(BridgeError::ConnectionClosed(self.gateway_eui));
        }
        if pending.contains_key(&token) {
            return Ok(None);
        }
        let (reply, rx) = oneshot::channel();
        let sent_at = Instant::now();
        pending.insert(
            token,
            PendingDownlink {
                sent_at,
                deadline: sent_at + timeout,
                reply,
            },
        );
        Ok(Some(rx))
    }

    pub(crate) fn mark_downlink_sent(&self) {
        lock(&self.state).last_downlink_at = Some(Utc::now());
    }

    /// Resolve a pending downlink from a TX_ACK
    pub(crate) fn complete_downlink(&self, token: u16, error: TxError) -> Result<Duration> {
        let entry = lock(&self.pending)
            .remove(&token)
            .ok_or(BridgeError::UnknownToken(token))?;

        let now = Instant::now();
        let rtt = now.saturating_duration_since(entry.sent_at);
        lock(&self.state)
            .round_trip
            .record_between(entry.sent_at, now);

        let outcome = if error == TxError::None {
            self.downlink_count.fetch_add(1, Ordering::Relaxed);
            TxOutcome::Acked(rtt)
        } else {
            self.downlink_errors.fetch_add(1, Ordering::Relaxed);
            TxOutcome::Rejected(error)
        };
        // The submitter may have given up already
        let _ = entry.reply.send(outcome);
        Ok(rtt)
    }

    /// Release a token without notifying anyone (the datagram never left)
    pub(crate) fn cancel_downlink(&self, token: u16) {
        lock(&self.pending).remove(&token);
    }

    /// Evict pending downlinks whose deadline has passed
    pub(crate) fn expire_downlinks(&self, now: Instant) -> usize {
        let expired: Vec<PendingDownlink> = {
            let mut pending = lock(&self.pending);
            let tokens: Vec<u16> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| pending.remove(&token))
                .collect()
        };

        let count = expired.len();
        for entry in expired {
            let _ = entry.reply.send(TxOutcome::Expired);
        }
        count
    }

    pub(crate) fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(lock(&self.state).last_seen) >= idle_timeout
    }

    /// Cancel the lifetime, refuse new downlinks, fail pending ones and drop
    /// the upstream sink. Returns false if the connection was already closed.
    pub(crate) fn close(&self) -> bool {
        let drained: Vec<PendingDownlink> = {
            let mut pending = lock(&self.pending);
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            pending.drain().map(|(_, p)| p).collect()
        };
        self.cancel.cancel();
        lock(&self.upstream).take();
        // Dropping the reply senders reports ConnectionClosed to submitters
        drop(drained);
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("gateway_eui", &self.gateway_eui)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}
