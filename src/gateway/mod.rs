//! Gateway sessions and the messages they exchange with the rest of the server.
//!
//! A gateway has no connection in the UDP sense. The [`registry::Registry`]
//! turns the stream of PUSH_DATA/PULL_DATA datagrams into one
//! [`connection::Connection`] per EUI, and decoded traffic is handed to the
//! surrounding server as [`Upstream`] messages over an mpsc channel.

pub mod clock;
pub mod connection;
pub mod registry;
pub mod stats;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::udp::data_rate::RadioDataRate;
use crate::udp::protocol::{GatewayEui, Modulation, Stat};

/// A radio frame received by a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkMessage {
    pub gateway_eui: GatewayEui,
    pub frequency_hz: u64,
    pub channel: u8,
    pub rf_chain: u8,
    pub modulation: Modulation,
    pub data_rate: RadioDataRate,
    pub coding_rate: Option<String>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    /// CRC status as reported by the concentrator
    pub crc_status: Option<i8>,
    /// PHY payload (base64 decoded)
    pub payload: Vec<u8>,
    /// Concentrator timestamp at reception
    pub timestamp: u32,
    /// Server time the datagram arrived
    pub received_at: DateTime<Utc>,
}

/// A status report from a gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayStatus {
    pub gateway_eui: GatewayEui,
    pub received_at: DateTime<Utc>,
    pub stat: Stat,
}

/// What the gateway bridge delivers to the server
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    Uplink(UplinkMessage),
    Status(GatewayStatus),
}

impl Upstream {
    pub fn gateway_eui(&self) -> GatewayEui {
        match self {
            Upstream::Uplink(up) => up.gateway_eui,
            Upstream::Status(status) => status.gateway_eui,
        }
    }
}

/// Sink for decoded uplinks and status reports. A full channel blocks the
/// datagram worker; nothing is dropped here.
pub type UpstreamSink = mpsc::Sender<Upstream>;

/// When the gateway should radiate a downlink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSchedule {
    Immediate,
    /// Concentrator counter value to transmit at
    Timestamp(u32),
}

/// A transmission the server asks a gateway to make
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkMessage {
    pub frequency_hz: u64,
    pub rf_chain: u8,
    /// TX power in dBm, gateway default when unset
    pub power_dbm: Option<u8>,
    pub data_rate: RadioDataRate,
    pub coding_rate: Option<String>,
    pub invert_polarity: bool,
    pub schedule: TxSchedule,
    pub payload: Vec<u8>,
}
