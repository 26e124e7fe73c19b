//! Semtech UDP Packet Forwarder Protocol (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! The protocol uses a simple binary header followed by JSON payload.
//! All multi-byte integers are big-endian (network byte order). There is no
//! length prefix: one datagram is one packet.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::data_rate::DataRate;
use crate::error::{BridgeError, Result};

/// Header version byte. v1 forwarders are still deployed; both share the
/// same header and JSON layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolVersion {
    V1 = 0x01,
    #[default]
    V2 = 0x02,
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ProtocolVersion::V1),
            0x02 => Ok(ProtocolVersion::V2),
            _ => Err(BridgeError::malformed(format!(
                "Unsupported protocol version: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Version + token + identifier
const HEADER_LEN: usize = 4;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl PacketType {
    /// Packets sent by the gateway carry its EUI right after the header
    pub fn has_gateway_eui(self) -> bool {
        matches!(
            self,
            PacketType::PushData | PacketType::PullData | PacketType::TxAck
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(BridgeError::malformed(format!(
                "Unknown packet type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Gateway identifier (EUI-64, 8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayEui(pub [u8; 8]);

impl fmt::Display for GatewayEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for GatewayEui {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut eui = [0u8; 8];
        hex::decode_to_slice(s, &mut eui)?;
        Ok(GatewayEui(eui))
    }
}

/// Parsed GWMP packet
#[derive(Debug, Clone, PartialEq)]
pub enum GwmpPacket {
    PushData {
        random_token: u16,
        gateway_eui: GatewayEui,
        payload: PushDataPayload,
    },
    PushAck {
        random_token: u16,
    },
    PullData {
        random_token: u16,
        gateway_eui: GatewayEui,
    },
    PullResp {
        random_token: u16,
        payload: PullRespPayload,
    },
    PullAck {
        random_token: u16,
    },
    TxAck {
        random_token: u16,
        gateway_eui: GatewayEui,
        /// v2 gateways may omit the JSON object on success
        payload: Option<TxAckPayload>,
    },
}

/// Modulation family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modulation {
    Lora,
    Fsk,
}

/// Rxpk (received packet) from gateway JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of packet reception
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// GPS time (milliseconds since GPS epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    /// Concentrator timestamp (microseconds, wraps at 2^32)
    pub tmst: u32,
    /// Frequency in MHz
    pub freq: f64,
    /// Concentrator IF channel
    #[serde(default)]
    pub chan: u8,
    /// Concentrator RF chain
    #[serde(default)]
    pub rfch: u8,
    /// CRC status: 1 = OK, -1 = fail, 0 = no CRC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<i8>,
    pub modu: Modulation,
    pub datr: DataRate,
    /// LoRa coding rate (e.g., "4/5")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// RSSI in dBm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    /// LoRa signal-to-noise ratio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsnr: Option<f64>,
    /// RF packet payload size in bytes
    pub size: u16,
    /// Base64 encoded RF packet payload
    pub data: String,
}

/// Gateway status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    /// Gateway wall-clock time; not every forwarder sends it
    #[serde(default, with = "expanded_time", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lati: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alti: Option<i32>,
    /// Radio packets received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rxnb: Option<u32>,
    /// Radio packets received with a valid CRC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rxok: Option<u32>,
    /// Radio packets forwarded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rxfw: Option<u32>,
    /// Percentage of upstream datagrams that were acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ackr: Option<f64>,
    /// Downlink datagrams received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwnb: Option<u32>,
    /// Packets emitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txnb: Option<u32>,
}

/// Push data JSON wrapper
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushDataPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rxpk: Vec<Rxpk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<Stat>,
}

/// Txpk (packet to transmit) sent to the gateway in PULL_RESP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring `tmst`
    #[serde(default)]
    pub imme: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmms: Option<u64>,
    /// Frequency in MHz
    pub freq: f64,
    #[serde(default)]
    pub rfch: u8,
    /// TX output power in dBm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powe: Option<u8>,
    pub modu: Modulation,
    pub datr: DataRate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// FSK frequency deviation in Hz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fdev: Option<u32>,
    /// LoRa polarization inversion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prea: Option<u16>,
    pub size: u16,
    pub data: String,
    /// Disable CRC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncrc: Option<bool>,
}

/// Pull response JSON wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

/// Outcome reported by the gateway for a PULL_RESP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxError {
    #[default]
    #[serde(alias = "")]
    None,
    TooLate,
    TooEarly,
    CollisionPacket,
    CollisionBeacon,
    TxFreq,
    TxPower,
    GpsUnlocked,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxError::None => "NONE",
            TxError::TooLate => "TOO_LATE",
            TxError::TooEarly => "TOO_EARLY",
            TxError::CollisionPacket => "COLLISION_PACKET",
            TxError::CollisionBeacon => "COLLISION_BEACON",
            TxError::TxFreq => "TX_FREQ",
            TxError::TxPower => "TX_POWER",
            TxError::GpsUnlocked => "GPS_UNLOCKED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxPacketAck {
    #[serde(default)]
    pub error: TxError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<String>,
}

/// TX_ACK JSON wrapper
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxAckPayload {
    pub txpk_ack: TxPacketAck,
}

impl GwmpPacket {
    /// Parse a raw UDP datagram into a GWMP packet
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::decode_versioned(data).map(|(_, packet)| packet)
    }

    /// Like [`GwmpPacket::decode`], also returning the header version so
    /// replies can be sent in the same version
    pub fn decode_versioned(data: &[u8]) -> Result<(ProtocolVersion, Self)> {
        if data.len() < HEADER_LEN {
            return Err(BridgeError::malformed(format!(
                "Packet too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;

        let version = ProtocolVersion::try_from(buf.get_u8())?;
        let random_token = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;

        let packet = match packet_type {
            PacketType::PushData => Ok::<_, BridgeError>(GwmpPacket::PushData {
                random_token,
                gateway_eui: read_eui(&mut buf, packet_type)?,
                payload: parse_json(buf, packet_type)?,
            }),
            PacketType::PullData => Ok(GwmpPacket::PullData {
                random_token,
                gateway_eui: read_eui(&mut buf, packet_type)?,
            }),
            PacketType::TxAck => {
                let gateway_eui = read_eui(&mut buf, packet_type)?;
                // Some forwarders terminate the JSON with NUL bytes
                let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                let json = &buf[..end];
                let payload = if json.is_empty() {
                    None
                } else {
                    Some(parse_json(json, packet_type)?)
                };

                Ok(GwmpPacket::TxAck {
                    random_token,
                    gateway_eui,
                    payload,
                })
            }
            PacketType::PullResp => Ok(GwmpPacket::PullResp {
                random_token,
                payload: parse_json(buf, packet_type)?,
            }),
            PacketType::PushAck => Ok(GwmpPacket::PushAck { random_token }),
            PacketType::PullAck => Ok(GwmpPacket::PullAck { random_token }),
        }?;
        Ok((version, packet))
    }

    /// Serialize into a single v2 datagram
    pub fn encode(&self) -> Vec<u8> {
        self.encode_as(ProtocolVersion::V2)
    }

    pub fn encode_as(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 8);
        buf.put_u8(version as u8);
        buf.put_u16(self.token());
        buf.put_u8(self.packet_type() as u8);

        if let Some(eui) = self.gateway_eui() {
            buf.put_slice(&eui.0);
        }

        match self {
            GwmpPacket::PushData { payload, .. } => put_json(&mut buf, payload),
            GwmpPacket::PullResp { payload, .. } => put_json(&mut buf, payload),
            GwmpPacket::TxAck {
                payload: Some(payload),
                ..
            } => put_json(&mut buf, payload),
            _ => {}
        }

        buf.to_vec()
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            GwmpPacket::PushData { .. } => PacketType::PushData,
            GwmpPacket::PushAck { .. } => PacketType::PushAck,
            GwmpPacket::PullData { .. } => PacketType::PullData,
            GwmpPacket::PullResp { .. } => PacketType::PullResp,
            GwmpPacket::PullAck { .. } => PacketType::PullAck,
            GwmpPacket::TxAck { .. } => PacketType::TxAck,
        }
    }

    pub fn token(&self) -> u16 {
        match *self {
            GwmpPacket::PushData { random_token, .. }
            | GwmpPacket::PushAck { random_token }
            | GwmpPacket::PullData { random_token, .. }
            | GwmpPacket::PullResp { random_token, .. }
            | GwmpPacket::PullAck { random_token }
            | GwmpPacket::TxAck { random_token, .. } => random_token,
        }
    }

    pub fn gateway_eui(&self) -> Option<GatewayEui> {
        match *self {
            GwmpPacket::PushData { gateway_eui, .. }
            | GwmpPacket::PullData { gateway_eui, .. }
            | GwmpPacket::TxAck { gateway_eui, .. } => Some(gateway_eui),
            _ => None,
        }
    }

    /// Build a PUSH_ACK response in the request's version
    pub fn push_ack(version: ProtocolVersion, random_token: u16) -> Vec<u8> {
        GwmpPacket::PushAck { random_token }.encode_as(version)
    }

    /// Build a PULL_ACK response in the request's version
    pub fn pull_ack(version: ProtocolVersion, random_token: u16) -> Vec<u8> {
        GwmpPacket::PullAck { random_token }.encode_as(version)
    }
}

fn read_eui(buf: &mut &[u8], packet_type: PacketType) -> Result<GatewayEui> {
    if buf.remaining() < 8 {
        return Err(BridgeError::malformed(format!(
            "{:?} too short for gateway EUI",
            packet_type
        )));
    }
    let mut gateway_eui = [0u8; 8];
    buf.copy_to_slice(&mut gateway_eui);
    Ok(GatewayEui(gateway_eui))
}

fn parse_json<T: serde::de::DeserializeOwned>(json: &[u8], packet_type: PacketType) -> Result<T> {
    serde_json::from_slice(json).map_err(|e| {
        BridgeError::malformed(format!("Invalid {:?} JSON payload: {}", packet_type, e))
    })
}

fn put_json<T: Serialize>(buf: &mut BytesMut, value: &T) {
    let json = serde_json::to_vec(value).expect("GWMP payloads always serialize");
    buf.put_slice(&json);
}

/// `stat.time` in the packet forwarder's "2014-01-12 08:59:28 GMT" layout
mod expanded_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(time: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match time {
            Some(time) => s.serialize_str(&format!("{} UTC", time.format(FORMAT))),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => parse(&s)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid stat time {:?}", s))),
            None => Ok(None),
        }
    }

    pub(super) fn parse(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Some(t.with_timezone(&Utc));
        }
        let naive = s
            .strip_suffix(" UTC")
            .or_else(|| s.strip_suffix(" GMT"))
            .unwrap_or(s);
        NaiveDateTime::parse_from_str(naive, FORMAT)
            .ok()
            .map(|t| t.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EUI: GatewayEui = GatewayEui([0xAA, 0x55, 0x5A, 0x00, 0x00, 0x00, 0x01, 0x01]);

    fn lora_rxpk(tmst: u32) -> Rxpk {
        Rxpk {
            time: None,
            tmms: None,
            tmst,
            freq: 868.1,
            chan: 2,
            rfch: 0,
            stat: Some(1),
            modu: Modulation::Lora,
            datr: DataRate::Lora("SF7BW125".to_string()),
            codr: Some("4/5".to_string()),
            rssi: Some(-35.0),
            lsnr: Some(5.1),
            size: 3,
            data: "AQID".to_string(),
        }
    }

    fn fsk_rxpk() -> Rxpk {
        Rxpk {
            modu: Modulation::Fsk,
            datr: DataRate::Fsk(50000),
            codr: None,
            lsnr: None,
            ..lora_rxpk(0xFFFF_FFF0)
        }
    }

    fn stat() -> Stat {
        Stat {
            time: Some(Utc.with_ymd_and_hms(2026, 2, 18, 17, 30, 0).unwrap()),
            lati: Some(46.24),
            long: Some(3.2523),
            alti: Some(145),
            rxnb: Some(2),
            rxok: Some(2),
            rxfw: Some(2),
            ackr: Some(100.0),
            dwnb: Some(2),
            txnb: Some(2),
        }
    }

    fn txpk() -> Txpk {
        Txpk {
            imme: false,
            tmst: Some(50_000_000),
            tmms: None,
            freq: 869.525,
            rfch: 0,
            powe: Some(14),
            modu: Modulation::Lora,
            datr: DataRate::Lora("SF9BW125".to_string()),
            codr: Some("4/5".to_string()),
            fdev: None,
            ipol: Some(true),
            prea: None,
            size: 2,
            data: "qrs=".to_string(),
            ncrc: None,
        }
    }

    #[test]
    fn test_roundtrip_every_packet_type() {
        let packets = vec![
            GwmpPacket::PushData {
                random_token: 0x1234,
                gateway_eui: EUI,
                payload: PushDataPayload {
                    rxpk: vec![lora_rxpk(1000), fsk_rxpk()],
                    stat: Some(stat()),
                },
            },
            GwmpPacket::PushData {
                random_token: 0,
                gateway_eui: EUI,
                payload: PushDataPayload::default(),
            },
            GwmpPacket::PushAck {
                random_token: 0xBEEF,
            },
            GwmpPacket::PullData {
                random_token: 0xFFFF,
                gateway_eui: EUI,
            },
            GwmpPacket::PullResp {
                random_token: 7,
                payload: PullRespPayload { txpk: txpk() },
            },
            GwmpPacket::PullAck { random_token: 8 },
            GwmpPacket::TxAck {
                random_token: 9,
                gateway_eui: EUI,
                payload: Some(TxAckPayload {
                    txpk_ack: TxPacketAck {
                        error: TxError::CollisionPacket,
                        warn: None,
                    },
                }),
            },
            GwmpPacket::TxAck {
                random_token: 10,
                gateway_eui: EUI,
                payload: None,
            },
        ];

        for packet in packets {
            let bytes = packet.encode();
            let decoded = GwmpPacket::decode(&bytes).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = GwmpPacket::PullData {
            random_token: 0xABCD,
            gateway_eui: EUI,
        }
        .encode();
        assert_eq!(
            bytes,
            vec![0x02, 0xAB, 0xCD, 0x02, 0xAA, 0x55, 0x5A, 0x00, 0x00, 0x00, 0x01, 0x01]
        );

        assert_eq!(
            GwmpPacket::push_ack(ProtocolVersion::V2, 0x0102),
            vec![0x02, 0x01, 0x02, 0x01]
        );
        assert_eq!(
            GwmpPacket::pull_ack(ProtocolVersion::V2, 0x0102),
            vec![0x02, 0x01, 0x02, 0x04]
        );
    }

    #[test]
    fn test_version_one_accepted_and_echoed() {
        let mut data = vec![0x01, 0x12, 0x34, 0x02];
        data.extend_from_slice(&EUI.0);
        let (version, packet) = GwmpPacket::decode_versioned(&data).unwrap();
        assert_eq!(version, ProtocolVersion::V1);
        assert_eq!(
            packet,
            GwmpPacket::PullData {
                random_token: 0x1234,
                gateway_eui: EUI
            }
        );
        assert_eq!(
            GwmpPacket::pull_ack(version, 0x1234),
            vec![0x01, 0x12, 0x34, 0x04]
        );

        let mut data = vec![0x01, 0x00, 0x07, 0x00];
        data.extend_from_slice(&EUI.0);
        data.extend_from_slice(b"{}");
        let (version, packet) = GwmpPacket::decode_versioned(&data).unwrap();
        assert_eq!(version, ProtocolVersion::V1);
        assert_eq!(packet.encode_as(version), data);
    }

    #[test]
    fn test_short_input_fails() {
        for len in 0..4 {
            let data = vec![0x02; len];
            assert!(matches!(
                GwmpPacket::decode(&data),
                Err(BridgeError::MalformedPacket(_))
            ));
        }

        // PULL_DATA with a truncated EUI
        let data = [0x02, 0x00, 0x01, 0x02, 0xAA, 0x55];
        assert!(matches!(
            GwmpPacket::decode(&data),
            Err(BridgeError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_bad_version_fails() {
        for version in [0x00, 0x03, 0xFF] {
            let data = [version, 0x00, 0x01, 0x01];
            assert!(matches!(
                GwmpPacket::decode(&data),
                Err(BridgeError::MalformedPacket(_))
            ));
        }
    }

    #[test]
    fn test_unknown_type_fails() {
        let data = [0x02, 0x00, 0x01, 0x06];
        assert!(matches!(
            GwmpPacket::decode(&data),
            Err(BridgeError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_bad_json_fails() {
        let mut data = vec![0x02, 0x00, 0x01, 0x00];
        data.extend_from_slice(&EUI.0);
        data.extend_from_slice(br#"{"rxpk":[{"freq":"nope"}]}"#);
        assert!(matches!(
            GwmpPacket::decode(&data),
            Err(BridgeError::MalformedPacket(_))
        ));

        // PUSH_DATA without any JSON body
        let mut data = vec![0x02, 0x00, 0x01, 0x00];
        data.extend_from_slice(&EUI.0);
        assert!(GwmpPacket::decode(&data).is_err());
    }

    #[test]
    fn test_decode_forwarder_push_data() {
        let json = r#"{"rxpk":[{"time":"2013-03-31T16:21:17.528002Z","tmst":3512348611,"chan":2,"rfch":0,"freq":866.349812,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/6","rssi":-35,"lsnr":5.1,"size":32,"data":"-DS4CGaDCdG+48eJNM3Vai-zDpsR71Pn9CPA9uCON84"}],"stat":{"time":"2014-01-12 08:59:28 GMT","lati":46.24000,"long":3.25230,"alti":145,"rxnb":2,"rxok":2,"rxfw":2,"ackr":100.0,"dwnb":2,"txnb":2}}"#;
        let mut data = vec![0x02, 0x5A, 0x5A, 0x00];
        data.extend_from_slice(&EUI.0);
        data.extend_from_slice(json.as_bytes());

        match GwmpPacket::decode(&data).unwrap() {
            GwmpPacket::PushData {
                random_token,
                gateway_eui,
                payload,
            } => {
                assert_eq!(random_token, 0x5A5A);
                assert_eq!(gateway_eui, EUI);
                assert_eq!(payload.rxpk.len(), 1);
                assert_eq!(payload.rxpk[0].tmst, 3512348611);
                assert_eq!(payload.rxpk[0].datr, DataRate::Lora("SF7BW125".to_string()));
                assert_eq!(payload.rxpk[0].rssi, Some(-35.0));
                let stat = payload.stat.unwrap();
                assert_eq!(
                    stat.time,
                    Some(Utc.with_ymd_and_hms(2014, 1, 12, 8, 59, 28).unwrap())
                );
                assert_eq!(stat.alti, Some(145));
            }
            other => panic!("Expected PUSH_DATA, got {:?}", other),
        }
    }

    #[test]
    fn test_tx_ack_variants() {
        let mut data = vec![0x02, 0x00, 0x09, 0x05];
        data.extend_from_slice(&EUI.0);
        data.extend_from_slice(br#"{"txpk_ack":{"error":""}}"#);
        data.push(0);

        match GwmpPacket::decode(&data).unwrap() {
            GwmpPacket::TxAck { payload, .. } => {
                assert_eq!(payload.unwrap().txpk_ack.error, TxError::None);
            }
            other => panic!("Expected TX_ACK, got {:?}", other),
        }

        let mut data = vec![0x02, 0x00, 0x09, 0x05];
        data.extend_from_slice(&EUI.0);
        data.extend_from_slice(br#"{"txpk_ack":{"error":"TOO_LATE"}}"#);
        match GwmpPacket::decode(&data).unwrap() {
            GwmpPacket::TxAck { payload, .. } => {
                assert_eq!(payload.unwrap().txpk_ack.error, TxError::TooLate);
            }
            other => panic!("Expected TX_ACK, got {:?}", other),
        }
    }

    #[test]
    fn test_gateway_eui_text() {
        assert_eq!(EUI.to_string(), "aa555a0000000101");
        assert_eq!("AA555A0000000101".parse::<GatewayEui>().unwrap(), EUI);
        assert!("aa55".parse::<GatewayEui>().is_err());
    }

    #[test]
    fn test_stat_time_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 2, 18, 17, 30, 0).unwrap();
        assert_eq!(expanded_time::parse("2026-02-18 17:30:00 UTC"), Some(expected));
        assert_eq!(expanded_time::parse("2026-02-18 17:30:00 GMT"), Some(expected));
        assert_eq!(expanded_time::parse("2026-02-18T17:30:00Z"), Some(expected));
        assert_eq!(expanded_time::parse("yesterday"), None);
    }

    #[test]
    fn test_stat_without_time() {
        let mut data = vec![0x02, 0x00, 0x03, 0x00];
        data.extend_from_slice(&EUI.0);
        data.extend_from_slice(br#"{"stat":{"rxnb":5,"rxok":4}}"#);

        match GwmpPacket::decode(&data).unwrap() {
            GwmpPacket::PushData { payload, .. } => {
                let stat = payload.stat.unwrap();
                assert_eq!(stat.time, None);
                assert_eq!(stat.rxnb, Some(5));
            }
            other => panic!("Expected PUSH_DATA, got {:?}", other),
        }
    }
}
