//! Error types for the gateway bridge.

use std::time::Duration;

use thiserror::Error;

use crate::udp::protocol::{GatewayEui, TxError};

/// Errors raised by the codec, the connection registry and the downlink path.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Datagram could not be decoded (short header, bad version, unknown type, bad JSON)
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    /// Acknowledgement for a token with no pending request
    #[error("unknown token 0x{0:04x}")]
    UnknownToken(u16),
    /// An rxpk record that cannot be turned into an uplink message
    #[error("invalid uplink: {0}")]
    InvalidUplink(String),
    #[error("gateway {0} is not connected")]
    NotConnected(GatewayEui),
    /// Gateway is connected but has not sent PULL_DATA yet
    #[error("gateway {0} has no downlink path")]
    NoDownlinkPath(GatewayEui),
    /// Admission check refused the gateway
    #[error("gateway {gateway_eui} denied: {reason}")]
    Denied {
        gateway_eui: GatewayEui,
        reason: String,
    },
    #[error("connection to gateway {0} closed")]
    ConnectionClosed(GatewayEui),
    #[error("no TX_ACK within {0:?}")]
    DownlinkTimeout(Duration),
    #[error("downlink rejected by gateway: {0}")]
    DownlinkRejected(TxError),
    /// Every token is held by an outstanding downlink
    #[error("gateway {0} has no free downlink token")]
    TokensExhausted(GatewayEui),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        BridgeError::MalformedPacket(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
