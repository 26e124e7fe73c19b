use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub udp: UdpConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub bind: String,
    /// Datagrams handled concurrently
    pub workers: usize,
    /// How long a downlink waits for its TX_ACK
    pub downlink_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Drop a gateway that sent no PUSH_DATA/PULL_DATA for this long
    pub idle_timeout_secs: u64,
    /// Period of the idle / pending-downlink sweep
    pub sweep_interval_ms: u64,
    /// Capacity of the upstream channel
    pub upstream_buffer: usize,
    /// Recent PUSH_DATA remembered for retransmission detection (0 = off)
    pub push_dedup_window: usize,
    pub rtt_window: usize,
    /// Round-trip samples above this are discarded
    pub rtt_max_ms: u64,
    /// Hex EUIs allowed to connect; empty allows everyone
    pub allowed_gateways: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        if config.udp.workers == 0 {
            anyhow::bail!("udp.workers must be at least 1");
        }
        if config.gateway.upstream_buffer == 0 {
            anyhow::bail!("gateway.upstream_buffer must be at least 1");
        }
        Ok(config)
    }
}

impl UdpConfig {
    pub fn downlink_timeout(&self) -> Duration {
        Duration::from_millis(self.downlink_timeout_ms)
    }
}

impl GatewayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn rtt_max(&self) -> Duration {
        Duration::from_millis(self.rtt_max_ms)
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1700".to_string(),
            workers: 64,
            downlink_timeout_ms: 5000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 90,
            sweep_interval_ms: 1000,
            upstream_buffer: 256,
            push_dedup_window: 16,
            rtt_window: 32,
            rtt_max_ms: 10_000,
            allowed_gateways: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
