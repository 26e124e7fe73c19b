//! Connection registry — one [`Connection`] per gateway EUI.
//!
//! Lookups and creation are short critical sections on a sharded map; no I/O
//! or channel sends happen while a shard is locked. Every connection gets a
//! watchdog task that sweeps expired downlinks and closes the connection once
//! the gateway goes quiet.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::UpstreamSink;
use crate::config::GatewayConfig;
use crate::error::{BridgeError, Result};
use crate::udp::protocol::GatewayEui;

const EVENT_BUFFER: usize = 64;

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(String),
}

/// Pre-condition evaluated before a connection is created
pub type AdmissionCheck = Arc<dyn Fn(&GatewayEui) -> Admission + Send + Sync>;

/// Admission check that only lets the listed gateways in
pub fn allow_list(allowed: Vec<GatewayEui>) -> AdmissionCheck {
    Arc::new(move |eui| {
        if allowed.contains(eui) {
            Admission::Allow
        } else {
            Admission::Deny("not in allowed_gateways".to_string())
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No PUSH_DATA/PULL_DATA within the idle timeout
    IdleTimeout,
    /// Removed on request
    Evicted,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(Arc<Connection>),
    Disconnected {
        gateway_eui: GatewayEui,
        reason: DisconnectReason,
    },
}

pub struct Registry {
    connections: DashMap<GatewayEui, Arc<Connection>>,
    events: broadcast::Sender<ConnectionEvent>,
    upstream: UpstreamSink,
    shutdown: CancellationToken,
    config: GatewayConfig,
    admission: Option<AdmissionCheck>,
}

impl Registry {
    pub fn new(config: GatewayConfig, upstream: UpstreamSink) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            connections: DashMap::new(),
            events,
            upstream,
            shutdown: CancellationToken::new(),
            config,
            admission: None,
        }
    }

    pub fn with_admission_check(mut self, check: AdmissionCheck) -> Self {
        self.admission = Some(check);
        self
    }

    /// Subscribe to connect/disconnect events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Fetch the live connection for `eui`, creating it if there is none.
    ///
    /// Concurrent callers for the same EUI all receive the same connection;
    /// exactly one of them sees `created == true`.
    pub fn get_or_create(self: &Arc<Self>, eui: GatewayEui) -> Result<(Arc<Connection>, bool)> {
        if let Some(conn) = self.lookup(&eui) {
            return Ok((conn, false));
        }
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::ConnectionClosed(eui));
        }
        if let Some(check) = &self.admission {
            if let Admission::Deny(reason) = check(&eui) {
                return Err(BridgeError::Denied {
                    gateway_eui: eui,
                    reason,
                });
            }
        }

        let (conn, created) = match self.connections.entry(eui) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    // Torn down but its watchdog has not removed it yet
                    let conn = self.new_connection(eui);
                    entry.insert(conn.clone());
                    (conn, true)
                } else {
                    (entry.get().clone(), false)
                }
            }
            Entry::Vacant(entry) => {
                let conn = self.new_connection(eui);
                entry.insert(conn.clone());
                (conn, true)
            }
        };

        if created {
            info!("Gateway {} connected", eui);
            self.spawn_watchdog(conn.clone());
            let _ = self.events.send(ConnectionEvent::Connected(conn.clone()));
        }
        Ok((conn, created))
    }

    pub fn lookup(&self, eui: &GatewayEui) -> Option<Arc<Connection>> {
        self.connections
            .get(eui)
            .map(|entry| entry.value().clone())
            .filter(|conn| !conn.is_closed())
    }

    /// Evict a gateway. Returns false if it was not connected.
    pub fn remove(&self, eui: &GatewayEui) -> bool {
        let conn = self.connections.get(eui).map(|entry| entry.value().clone());
        match conn {
            Some(conn) => self.evict(&conn, DisconnectReason::Evicted),
            None => false,
        }
    }

    /// Close every connection and refuse new ones
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let all: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in all {
            self.evict(&conn, DisconnectReason::Shutdown);
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn new_connection(&self, eui: GatewayEui) -> Arc<Connection> {
        Arc::new(Connection::new(
            eui,
            &self.config,
            self.upstream.clone(),
            self.shutdown.child_token(),
        ))
    }

    /// Close `conn` and drop it from the map. The map entry is only removed
    /// if it still holds this very connection.
    fn evict(&self, conn: &Arc<Connection>, reason: DisconnectReason) -> bool {
        let eui = conn.gateway_eui();
        let closed = conn.close();
        self.connections
            .remove_if(&eui, |_, current| Arc::ptr_eq(current, conn));

        if closed {
            let stats = conn.stats();
            info!(
                "Gateway {} disconnected ({:?}): {} uplinks, {} downlinks",
                eui, reason, stats.uplink_count, stats.downlink_count
            );
            let _ = self.events.send(ConnectionEvent::Disconnected {
                gateway_eui: eui,
                reason,
            });
        }
        closed
    }

    fn spawn_watchdog(self: &Arc<Self>, conn: Arc<Connection>) {
        let registry: Weak<Registry> = Arc::downgrade(self);
        let idle_timeout = self.config.idle_timeout();
        let sweep_interval = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = conn.closed() => {
                        // Cancelled through the registry's shutdown token
                        if let Some(registry) = registry.upgrade() {
                            registry.evict(&conn, DisconnectReason::Shutdown);
                        }
                        break;
                    }
                    _ = sweep.tick() => {
                        let now = Instant::now();
                        let expired = conn.expire_downlinks(now);
                        if expired > 0 {
                            debug!(
                                "Gateway {}: {} downlink(s) expired without TX_ACK",
                                conn.gateway_eui(),
                                expired
                            );
                        }
                        if conn.is_idle(now, idle_timeout) {
                            warn!("Gateway {} idle for {:?}", conn.gateway_eui(), idle_timeout);
                            match registry.upgrade() {
                                Some(registry) => {
                                    registry.evict(&conn, DisconnectReason::IdleTimeout);
                                }
                                None => {
                                    conn.close();
                                }
                            }
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayStatus, Upstream};
    use crate::udp::protocol::ProtocolVersion;
    use std::time::Duration;
    use tokio::sync::{mpsc, Barrier};

    const EUI: GatewayEui = GatewayEui([0xAA, 0, 0, 0, 0, 0, 0, 1]);

    fn registry() -> (Arc<Registry>, mpsc::Receiver<Upstream>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(Registry::new(GatewayConfig::default(), tx)), rx)
    }

    fn status() -> Upstream {
        Upstream::Status(GatewayStatus {
            gateway_eui: EUI,
            received_at: chrono::Utc::now(),
            stat: crate::udp::protocol::Stat {
                time: Some(chrono::Utc::now()),
                lati: None,
                long: None,
                alti: None,
                rxnb: None,
                rxok: None,
                rxfw: None,
                ackr: None,
                dwnb: None,
                txnb: None,
            },
        })
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_connection() {
        let (registry, _rx) = registry();
        let mut events = registry.subscribe();

        let (first, created) = registry.get_or_create(EUI).unwrap();
        assert!(created);
        let (second, created) = registry.get_or_create(EUI).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        match events.recv().await.unwrap() {
            ConnectionEvent::Connected(conn) => assert_eq!(conn.gateway_eui(), EUI),
            other => panic!("Expected Connected, got {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_packets_create_one_connection() {
        let (registry, _rx) = registry();
        let mut events = registry.subscribe();
        let barrier = Arc::new(Barrier::new(32));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.get_or_create(EUI).unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let winner = &results[0].0;
        assert!(results.iter().all(|(conn, _)| Arc::ptr_eq(conn, winner)));
        assert_eq!(registry.len(), 1);

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected(_)
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_closes_connection() {
        let (registry, mut rx) = registry();
        let mut events = registry.subscribe();
        let (conn, _) = registry.get_or_create(EUI).unwrap();

        conn.forward(status()).await.unwrap();
        assert!(rx.recv().await.is_some());

        assert!(registry.remove(&EUI));
        assert!(!registry.remove(&EUI));
        assert!(registry.lookup(&EUI).is_none());
        assert!(conn.is_closed());
        assert!(matches!(
            conn.forward(status()).await,
            Err(BridgeError::ConnectionClosed(_))
        ));

        let _connected = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected {
                gateway_eui,
                reason,
            } => {
                assert_eq!(gateway_eui, EUI);
                assert_eq!(reason, DisconnectReason::Evicted);
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }

        let (fresh, created) = registry.get_or_create(EUI).unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&fresh, &conn));
    }

    #[tokio::test]
    async fn test_admission_check() {
        let (tx, _rx) = mpsc::channel(1);
        let registry = Arc::new(
            Registry::new(GatewayConfig::default(), tx).with_admission_check(allow_list(vec![EUI])),
        );

        assert!(registry.get_or_create(EUI).is_ok());
        let stranger = GatewayEui([0xBB; 8]);
        assert!(matches!(
            registry.get_or_create(stranger),
            Err(BridgeError::Denied { .. })
        ));
        assert!(registry.lookup(&stranger).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_dropped() {
        let (registry, _rx) = registry();
        let mut events = registry.subscribe();
        let (conn, _) = registry.get_or_create(EUI).unwrap();
        let _connected = events.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        conn.record_pull("127.0.0.1:1700".parse().unwrap(), ProtocolVersion::V2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        // Refreshed by the PULL_DATA at 45s
        assert!(registry.lookup(&EUI).is_some());

        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::IdleTimeout)
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        assert!(registry.lookup(&EUI).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (registry, _rx) = registry();
        let (a, _) = registry.get_or_create(EUI).unwrap();
        let (b, _) = registry.get_or_create(GatewayEui([2; 8])).unwrap();

        registry.shutdown();

        assert!(a.is_closed() && b.is_closed());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get_or_create(EUI),
            Err(BridgeError::ConnectionClosed(_))
        ));
    }
}
