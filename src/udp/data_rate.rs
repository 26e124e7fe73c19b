//! The `datr` field of rxpk/txpk objects.
//!
//! LoRa data rates travel as a string (`"SF7BW125"`), FSK data rates as a
//! bare number of bits per second (`50000`). The JSON token's shape decides
//! which one it is.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BridgeError, Result};

/// Wire form of a data rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRate {
    /// `SF<spreading factor>BW<bandwidth in kHz>`, captured verbatim
    Lora(String),
    /// Bit rate in bits per second
    Fsk(u32),
}

impl DataRate {
    /// Encode as a JSON token
    pub fn encode_json(&self) -> String {
        serde_json::to_string(self).expect("data rate always serializes")
    }

    /// Decode a JSON token (quoted string or bare unsigned integer)
    pub fn decode_json(input: &[u8]) -> Result<Self> {
        if input.is_empty() {
            return Err(BridgeError::malformed("empty data rate"));
        }
        serde_json::from_slice(input)
            .map_err(|e| BridgeError::malformed(format!("invalid data rate: {}", e)))
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataRate::Lora(s) => write!(f, "{}", s),
            DataRate::Fsk(bps) => write!(f, "{} bps", bps),
        }
    }
}

impl Serialize for DataRate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DataRate::Lora(s) => serializer.serialize_str(s),
            DataRate::Fsk(bps) => serializer.serialize_u32(*bps),
        }
    }
}

impl<'de> Deserialize<'de> for DataRate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(DataRateVisitor)
    }
}

struct DataRateVisitor;

impl<'de> Visitor<'de> for DataRateVisitor {
    type Value = DataRate;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a LoRa data rate string or an FSK bit rate")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<DataRate, E> {
        Ok(DataRate::Lora(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<DataRate, E> {
        u32::try_from(v)
            .map(DataRate::Fsk)
            .map_err(|_| E::custom(format!("FSK bit rate out of range: {}", v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<DataRate, E> {
        u64::try_from(v)
            .map_err(|_| E::custom(format!("negative FSK bit rate: {}", v)))
            .and_then(|v| self.visit_u64(v))
    }
}

/// Server-side form of a data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioDataRate {
    Lora {
        spreading_factor: u8,
        bandwidth_hz: u32,
    },
    Fsk {
        bit_rate: u32,
    },
}

impl TryFrom<&DataRate> for RadioDataRate {
    type Error = BridgeError;

    fn try_from(dr: &DataRate) -> Result<Self> {
        match dr {
            DataRate::Fsk(bit_rate) => Ok(RadioDataRate::Fsk {
                bit_rate: *bit_rate,
            }),
            DataRate::Lora(s) => {
                let invalid = || BridgeError::InvalidUplink(format!("bad LoRa data rate {:?}", s));
                let rest = s.strip_prefix("SF").ok_or_else(invalid)?;
                let (sf, bw) = rest.split_once("BW").ok_or_else(invalid)?;
                let spreading_factor: u8 = sf.parse().map_err(|_| invalid())?;
                let bandwidth_khz: u32 = bw.parse().map_err(|_| invalid())?;
                let bandwidth_hz = bandwidth_khz.checked_mul(1000).ok_or_else(invalid)?;
                Ok(RadioDataRate::Lora {
                    spreading_factor,
                    bandwidth_hz,
                })
            }
        }
    }
}

impl From<&RadioDataRate> for DataRate {
    fn from(dr: &RadioDataRate) -> Self {
        match *dr {
            RadioDataRate::Lora {
                spreading_factor,
                bandwidth_hz,
            } => DataRate::Lora(format!("SF{}BW{}", spreading_factor, bandwidth_hz / 1000)),
            RadioDataRate::Fsk { bit_rate } => DataRate::Fsk(bit_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_tokens() {
        let table = [
            (r#""SF7BW125""#, DataRate::Lora("SF7BW125".to_string())),
            ("50000", DataRate::Fsk(50000)),
        ];

        for (token, dr) in table {
            assert_eq!(dr.encode_json(), token);
            assert_eq!(DataRate::decode_json(token.as_bytes()).unwrap(), dr);
        }
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(matches!(
            DataRate::decode_json(&[]),
            Err(BridgeError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_malformed_tokens_fail() {
        for token in ["-5", "12.5", "true", "null", r#"{"sf":7}"#, "\"SF7"] {
            assert!(
                DataRate::decode_json(token.as_bytes()).is_err(),
                "{} should not decode",
                token
            );
        }
    }

    #[test]
    fn test_lora_string_captured_verbatim() {
        let dr = DataRate::decode_json(br#""SF99BW1""#).unwrap();
        assert_eq!(dr, DataRate::Lora("SF99BW1".to_string()));
    }

    #[test]
    fn test_radio_data_rate() {
        let lora = RadioDataRate::try_from(&DataRate::Lora("SF12BW500".to_string())).unwrap();
        assert_eq!(
            lora,
            RadioDataRate::Lora {
                spreading_factor: 12,
                bandwidth_hz: 500_000
            }
        );
        assert_eq!(DataRate::from(&lora), DataRate::Lora("SF12BW500".to_string()));

        let fsk = RadioDataRate::try_from(&DataRate::Fsk(50000)).unwrap();
        assert_eq!(fsk, RadioDataRate::Fsk { bit_rate: 50000 });

        for bad in ["SF7", "BW125", "SFxBW125", "SF7BW", "SF7BW5000000"] {
            assert!(RadioDataRate::try_from(&DataRate::Lora(bad.to_string())).is_err());
        }
    }
}
