//! Conversion between wire records (rxpk/txpk) and the server's message model.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Utc};

use super::data_rate::{DataRate, RadioDataRate};
use super::protocol::{GatewayEui, Modulation, Rxpk, Txpk};
use crate::error::{BridgeError, Result};
use crate::gateway::{DownlinkMessage, TxSchedule, UplinkMessage};

/// Standard alphabet; some forwarders strip the padding
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn mhz_to_hz(mhz: f64) -> Option<u64> {
    if mhz.is_finite() && mhz > 0.0 {
        Some((mhz * 1_000_000.0).round() as u64)
    } else {
        None
    }
}

/// Convert an rxpk record into an uplink message
pub fn uplink_from_rxpk(
    gateway_eui: GatewayEui,
    rxpk: &Rxpk,
    received_at: DateTime<Utc>,
) -> Result<UplinkMessage> {
    let frequency_hz = mhz_to_hz(rxpk.freq)
        .ok_or_else(|| BridgeError::InvalidUplink(format!("bad frequency {}", rxpk.freq)))?;
    let data_rate = RadioDataRate::try_from(&rxpk.datr)?;
    let payload = PAYLOAD_ENGINE
        .decode(&rxpk.data)
        .map_err(|e| BridgeError::InvalidUplink(format!("Base64 decode error: {}", e)))?;

    if payload.len() != usize::from(rxpk.size) {
        return Err(BridgeError::InvalidUplink(format!(
            "payload is {} bytes, size says {}",
            payload.len(),
            rxpk.size
        )));
    }

    Ok(UplinkMessage {
        gateway_eui,
        frequency_hz,
        channel: rxpk.chan,
        rf_chain: rxpk.rfch,
        modulation: rxpk.modu,
        data_rate,
        coding_rate: rxpk.codr.clone(),
        rssi: rxpk.rssi,
        snr: rxpk.lsnr,
        crc_status: rxpk.stat,
        payload,
        timestamp: rxpk.tmst,
        received_at,
    })
}

/// Build the txpk for a downlink
pub fn txpk_from_downlink(msg: &DownlinkMessage) -> Txpk {
    let (imme, tmst) = match msg.schedule {
        TxSchedule::Immediate => (true, None),
        TxSchedule::Timestamp(tmst) => (false, Some(tmst)),
    };
    let (modu, codr, ipol, fdev) = match msg.data_rate {
        RadioDataRate::Lora { .. } => (
            Modulation::Lora,
            msg.coding_rate.clone(),
            Some(msg.invert_polarity),
            None,
        ),
        RadioDataRate::Fsk { bit_rate } => (Modulation::Fsk, None, None, Some(bit_rate / 2)),
    };

    Txpk {
        imme,
        tmst,
        tmms: None,
        freq: msg.frequency_hz as f64 / 1_000_000.0,
        rfch: msg.rf_chain,
        powe: msg.power_dbm,
        modu,
        datr: DataRate::from(&msg.data_rate),
        codr,
        fdev,
        ipol,
        prea: None,
        size: u16::try_from(msg.payload.len()).unwrap_or(u16::MAX),
        data: PAYLOAD_ENGINE.encode(&msg.payload),
        ncrc: None,
    }
}

/// Digest of a datagram body, for retransmission detection
pub fn payload_digest(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}
