//! Gateway bridge for the Semtech UDP packet forwarder protocol (GWMP v2).
//!
//! The UDP server decodes PUSH_DATA/PULL_DATA/TX_ACK from LoRa gateways,
//! keeps one [`gateway::connection::Connection`] per gateway EUI and hands
//! uplinks and status reports to an upstream channel. Downlinks go out as
//! PULL_RESP through [`udp::DownlinkSender`].

pub mod config;
pub mod error;
pub mod gateway;
pub mod udp;
