use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gwmp_bridge::config::Config;
use gwmp_bridge::gateway::registry::{allow_list, ConnectionEvent, Registry};
use gwmp_bridge::gateway::Upstream;
use gwmp_bridge::udp;
use gwmp_bridge::udp::protocol::GatewayEui;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gwmp-bridge")]
#[command(about = "Gateway bridge for the Semtech UDP packet forwarder protocol")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("gwmp-bridge v{}", env!("CARGO_PKG_VERSION"));

    let (upstream_tx, upstream_rx) = mpsc::channel(config.gateway.upstream_buffer);
    let mut registry = Registry::new(config.gateway.clone(), upstream_tx);

    if !config.gateway.allowed_gateways.is_empty() {
        let allowed = config
            .gateway
            .allowed_gateways
            .iter()
            .map(|s| s.parse::<GatewayEui>())
            .collect::<Result<Vec<_>, _>>()?;
        info!("Admitting {} configured gateway(s)", allowed.len());
        registry = registry.with_admission_check(allow_list(allowed));
    }
    let registry = Arc::new(registry);

    tokio::spawn(log_events(registry.subscribe()));
    tokio::spawn(log_upstream(upstream_rx));

    info!("Starting Semtech UDP Packet Forwarder server...");
    let shutdown = CancellationToken::new();
    let (_downlink_sender, mut server) =
        udp::start_server(&config.udp, registry.clone(), shutdown.clone()).await?;

    info!("Bridge running. Press Ctrl+C to stop.");
    let result = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            shutdown.cancel();
            res.map_err(anyhow::Error::from)
        }
        res = &mut server => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("UDP server failed: {}", e);
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        },
    };

    for conn in registry.connections() {
        let stats = conn.stats();
        info!(
            "Gateway {}: {} uplinks, {} downlinks ({} failed), rtt {:?}",
            stats.gateway_eui,
            stats.uplink_count,
            stats.downlink_count,
            stats.downlink_errors,
            stats.round_trip.map(|rtt| rtt.median)
        );
    }
    registry.shutdown();
    result
}

/// Stand-in consumer for uplinks and gateway status
async fn log_upstream(mut rx: mpsc::Receiver<Upstream>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Upstream::Uplink(up) => info!(
                "Uplink from {}: {} Hz, {:?}, rssi={:?} snr={:?}, {} bytes: {}",
                up.gateway_eui,
                up.frequency_hz,
                up.data_rate,
                up.rssi,
                up.snr,
                up.payload.len(),
                hex::encode(&up.payload)
            ),
            Upstream::Status(status) => info!(
                "Status from {}: rxnb={:?} rxok={:?} txnb={:?}",
                status.gateway_eui, status.stat.rxnb, status.stat.rxok, status.stat.txnb
            ),
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected(conn)) => {
                info!(
                    "Event: gateway {} connected at {}",
                    conn.gateway_eui(),
                    conn.created_at()
                )
            }
            Ok(ConnectionEvent::Disconnected {
                gateway_eui,
                reason,
            }) => info!("Event: gateway {} disconnected ({:?})", gateway_eui, reason),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event logger lagged, {} event(s) dropped", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
