//! Decoded frame and domain type definitions
//!
//! This module defines what a frame *means* once classified, the derived
//! clicker identity, the domain-level [`Response`], and the small code types
//! (poll type, frequency) that configure the base station.

use crate::error::{ProtocolError, Result};
use crate::integrity::with_checksum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Clicker identifier
///
/// Eight uppercase hex characters: three identity bytes from the response
/// frame followed by their XOR checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClickerId(String);

impl ClickerId {
    /// Derive the identifier from the three identity bytes of a response
    pub fn from_identity(identity: [u8; 3]) -> Self {
        Self(hex::encode_upper(with_checksum(identity)))
    }

    /// Identifier as text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClickerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Meaning of a frame, derived from its two tag bytes
///
/// Produced by [`Frame::classify`](crate::Frame::classify). Classification is
/// total: anything unrecognised becomes [`DecodedInfo::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DecodedInfo {
    /// `01 10`: operating frequency pair
    SetFrequency { freq1: u8, freq2: u8 },
    /// `01 11`
    StartPolling,
    /// `01 12`
    StopPolling,
    /// `01 18 01 00`
    ResetBase,
    /// `01 19`: poll type selection
    SetPollType { quiz_type: u8 },
    /// `01 2d`
    SetIClicker2Protocol,
    /// `02 13`: one remote's answer
    ClickerResponse {
        clicker_id: ClickerId,
        response: char,
        seq_num: u8,
    },
    /// Anything else, kept as hex for diagnostics
    Unknown { raw_command: String },
}

impl DecodedInfo {
    /// Whether this is a clicker response
    pub fn is_clicker_response(&self) -> bool {
        matches!(self, DecodedInfo::ClickerResponse { .. })
    }

    /// Short name of the variant, used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            DecodedInfo::SetFrequency { .. } => "SetFrequency",
            DecodedInfo::StartPolling => "StartPolling",
            DecodedInfo::StopPolling => "StopPolling",
            DecodedInfo::ResetBase => "ResetBase",
            DecodedInfo::SetPollType { .. } => "SetPollType",
            DecodedInfo::SetIClicker2Protocol => "SetIClicker2Protocol",
            DecodedInfo::ClickerResponse { .. } => "ClickerResponse",
            DecodedInfo::Unknown { .. } => "Unknown",
        }
    }
}

/// Decode the answer byte of a response sub-frame into a letter
///
/// Newer remotes count from `0x81` for A; older ones count from `0x01`. The
/// revision is inferred from the byte alone, per message.
pub fn decode_response_letter(byte: u8) -> char {
    let code = if byte >= 0x81 {
        b'A'.wrapping_add(byte - 0x81)
    } else {
        b'A'.wrapping_add(byte.wrapping_sub(0x01))
    };
    char::from(code)
}

/// A single student answer, as forwarded to the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub clicker_id: ClickerId,
    pub response: char,
    pub click_time: SystemTime,
    pub seq_num: u8,
}

impl Response {
    /// Build a response from a classified sub-frame
    ///
    /// Returns `None` for anything that is not a clicker response.
    pub fn from_info(info: &DecodedInfo, click_time: SystemTime) -> Option<Self> {
        match info {
            DecodedInfo::ClickerResponse {
                clicker_id,
                response,
                seq_num,
            } => Some(Self {
                clicker_id: clicker_id.clone(),
                response: *response,
                click_time,
                seq_num: *seq_num,
            }),
            _ => None,
        }
    }

    /// Click time as fractional seconds since the Unix epoch
    pub fn click_timestamp(&self) -> f64 {
        self.click_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        self.clicker_id == other.clicker_id
            && self.response == other.response
            && self.seq_num == other.seq_num
    }
}

impl Eq for Response {}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} at {:.3})",
            self.clicker_id,
            self.response,
            self.seq_num,
            self.click_timestamp()
        )
    }
}

/// Kind of question the base station should accept answers for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollType {
    #[default]
    Alpha,
    Numeric,
    Alphanumeric,
}

impl PollType {
    /// Numeric code used in the `01 19` command
    pub fn code(self) -> u8 {
        match self {
            PollType::Alpha => 0,
            PollType::Numeric => 1,
            PollType::Alphanumeric => 2,
        }
    }
}

impl FromStr for PollType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alpha" => Ok(PollType::Alpha),
            "numeric" => Ok(PollType::Numeric),
            "alphanumeric" => Ok(PollType::Alphanumeric),
            _ => Err(ProtocolError::UnknownPollType(s.to_string())),
        }
    }
}

impl fmt::Display for PollType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollType::Alpha => write!(f, "alpha"),
            PollType::Numeric => write!(f, "numeric"),
            PollType::Alphanumeric => write!(f, "alphanumeric"),
        }
    }
}

/// One half of the base station frequency setting, a letter `a`-`d`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrequencyCode(u8);

impl FrequencyCode {
    /// Parse a single letter (case-insensitive) into its 0-3 code
    pub fn from_char(c: char) -> Result<Self> {
        match c.to_ascii_lowercase() {
            l @ 'a'..='d' => Ok(Self(l as u8 - b'a')),
            _ => Err(ProtocolError::InvalidFrequencyCode(c)),
        }
    }

    /// Numeric value, 0 for `a` through 3 for `d`
    pub fn value(self) -> u8 {
        self.0
    }

    /// Letter form
    pub fn letter(self) -> char {
        char::from(b'a' + self.0)
    }
}

/// Frequency setting of the base station, written as two letters (`"aa"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frequency {
    pub first: FrequencyCode,
    pub second: FrequencyCode,
}

impl FromStr for Frequency {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(a), Some(b), None) => {
                let invalid = |_| ProtocolError::InvalidFrequencyPair(s.to_string());
                Ok(Self {
                    first: FrequencyCode::from_char(a).map_err(invalid)?,
                    second: FrequencyCode::from_char(b).map_err(invalid)?,
                })
            }
            _ => Err(ProtocolError::InvalidFrequencyPair(s.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.first.letter(), self.second.letter())
    }
}

impl Serialize for Frequency {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Frequency {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clicker_id_from_identity() {
        let id = ClickerId::from_identity([0x01, 0x02, 0x03]);
        assert_eq!(id.as_str(), "01020300");
        assert_eq!(ClickerId::from_identity([0xab, 0xcd, 0xef]).as_str(), "ABCDEF89");
    }

    #[test]
    fn test_response_letter_new_revision() {
        assert_eq!(decode_response_letter(0x81), 'A');
        assert_eq!(decode_response_letter(0x82), 'B');
        assert_eq!(decode_response_letter(0x85), 'E');
    }

    #[test]
    fn test_response_letter_old_revision() {
        assert_eq!(decode_response_letter(0x01), 'A');
        assert_eq!(decode_response_letter(0x02), 'B');
        assert_eq!(decode_response_letter(0x05), 'E');
    }

    #[test]
    fn test_response_letter_never_fails() {
        for byte in 0..=u8::MAX {
            let _ = decode_response_letter(byte);
        }
    }

    #[test]
    fn test_response_equality_ignores_time() {
        let info = DecodedInfo::ClickerResponse {
            clicker_id: ClickerId::from_identity([1, 2, 3]),
            response: 'C',
            seq_num: 9,
        };
        let earlier = Response::from_info(&info, UNIX_EPOCH).unwrap();
        let later = Response::from_info(&info, SystemTime::now()).unwrap();
        assert_eq!(earlier, later);
    }

    #[test]
    fn test_response_from_non_response_info() {
        assert!(Response::from_info(&DecodedInfo::StartPolling, UNIX_EPOCH).is_none());
    }

    #[test]
    fn test_response_display() {
        let info = DecodedInfo::ClickerResponse {
            clicker_id: ClickerId::from_identity([1, 2, 3]),
            response: 'A',
            seq_num: 7,
        };
        let response = Response::from_info(&info, UNIX_EPOCH).unwrap();
        assert_eq!(response.to_string(), "01020300: A (7 at 0.000)");
    }

    #[test]
    fn test_poll_type_parse() {
        assert_eq!("alpha".parse::<PollType>().unwrap(), PollType::Alpha);
        assert_eq!("Numeric".parse::<PollType>().unwrap(), PollType::Numeric);
        assert_eq!(
            "alphanumeric".parse::<PollType>().unwrap(),
            PollType::Alphanumeric
        );
        assert!("multiple".parse::<PollType>().is_err());
    }

    #[test]
    fn test_poll_type_codes() {
        assert_eq!(PollType::Alpha.code(), 0);
        assert_eq!(PollType::Numeric.code(), 1);
        assert_eq!(PollType::Alphanumeric.code(), 2);
    }

    #[test]
    fn test_frequency_parse() {
        let freq: Frequency = "ab".parse().unwrap();
        assert_eq!(freq.first.value(), 0);
        assert_eq!(freq.second.value(), 1);
        assert_eq!(freq.to_string(), "ab");

        let upper: Frequency = "DC".parse().unwrap();
        assert_eq!(upper.first.value(), 3);
        assert_eq!(upper.second.value(), 2);
    }

    #[test]
    fn test_frequency_parse_invalid() {
        assert!("ae".parse::<Frequency>().is_err());
        assert!("a".parse::<Frequency>().is_err());
        assert!("aaa".parse::<Frequency>().is_err());
        assert!("".parse::<Frequency>().is_err());
    }
}
