//! Fixed-size frame codec
//!
//! Every packet exchanged with the base station is exactly 64 bytes. Meaning
//! is positional: the first two bytes are a type tag and the rest is payload.
//! A frame read from the device may carry two independent 32-byte response
//! sub-frames.
//!
//! # Text Format
//!
//! Frames print as lowercase hex in 16-character groups:
//! ```text
//! 0110224100000000 0000000000000000 ... (8 groups)
//! ```
//!
//! # Example
//!
//! ```
//! use protocol::{DecodedInfo, Frame};
//!
//! let frame = Frame::from_hex("01 10 22 42").unwrap();
//! assert_eq!(
//!     frame.classify(),
//!     DecodedInfo::SetFrequency { freq1: 1, freq2: 1 }
//! );
//! ```

use crate::error::Result;
use crate::types::{ClickerId, DecodedInfo, decode_response_letter};
use std::fmt;
use std::str::FromStr;

/// Size of every frame in bytes
pub const FRAME_SIZE: usize = 64;

/// Size of one response sub-frame
pub const SUB_FRAME_SIZE: usize = 32;

/// Marker byte in the third position of an acknowledgement
pub const ACK_MARKER: u8 = 0xaa;

/// Characters per group in the hex text form
const HEX_GROUP: usize = 16;

/// A 64-byte base station packet
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_SIZE]);

impl Frame {
    /// All-zero frame
    pub const fn empty() -> Self {
        Self([0; FRAME_SIZE])
    }

    /// Build a frame from raw bytes, truncating or zero-padding to 64
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; FRAME_SIZE];
        let len = bytes.len().min(FRAME_SIZE);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(buf)
    }

    /// Parse a hex literal such as `"01 2a 21 41 05"`
    ///
    /// Whitespace is ignored; the decoded bytes are padded or truncated to
    /// 64 like [`Frame::from_bytes`].
    pub fn from_hex(text: &str) -> Result<Self> {
        let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(digits)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    /// Lowercase hex, grouped into 16-character chunks
    pub fn to_hex(&self) -> String {
        let digits = hex::encode(self.0);
        let mut out = String::with_capacity(digits.len() + digits.len() / HEX_GROUP);
        for (i, group) in digits.as_bytes().chunks(HEX_GROUP).enumerate() {
            if i > 0 {
                out.push(' ');
            }
            // hex::encode only produces ASCII
            out.extend(group.iter().map(|&b| char::from(b)));
        }
        out
    }

    /// The two type-tag bytes
    pub fn tag(&self) -> (u8, u8) {
        (self.0[0], self.0[1])
    }

    /// The acknowledgement the device sends back for this command
    ///
    /// `frame[0] frame[1] aa`, zero padded.
    pub fn acknowledgement(&self) -> Frame {
        Frame::from_bytes(&[self.0[0], self.0[1], ACK_MARKER])
    }

    /// Decode what this frame means
    ///
    /// Never fails: unrecognised tags become [`DecodedInfo::Unknown`].
    pub fn classify(&self) -> DecodedInfo {
        let b = &self.0;
        match (b[0], b[1]) {
            (0x01, 0x10) => DecodedInfo::SetFrequency {
                freq1: b[2].wrapping_sub(0x21),
                freq2: b[3].wrapping_sub(0x41),
            },
            (0x01, 0x11) => DecodedInfo::StartPolling,
            (0x01, 0x12) => DecodedInfo::StopPolling,
            (0x01, 0x18) if b[2] == 0x01 && b[3] == 0x00 => DecodedInfo::ResetBase,
            (0x01, 0x19) => DecodedInfo::SetPollType {
                quiz_type: b[2].wrapping_sub(0x67),
            },
            (0x01, 0x2d) => DecodedInfo::SetIClicker2Protocol,
            (0x02, 0x13) => DecodedInfo::ClickerResponse {
                clicker_id: ClickerId::from_identity([b[3], b[4], b[5]]),
                response: decode_response_letter(b[2]),
                seq_num: b[6],
            },
            _ => DecodedInfo::Unknown {
                raw_command: self.to_hex(),
            },
        }
    }

    /// Decode both 32-byte halves and keep the clicker responses
    ///
    /// Order is left half first, then right half.
    pub fn split_responses(&self) -> Vec<DecodedInfo> {
        self.0
            .chunks(SUB_FRAME_SIZE)
            .map(|half| Frame::from_bytes(half).classify())
            .filter(DecodedInfo::is_clicker_response)
            .collect()
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<[u8; FRAME_SIZE]> for Frame {
    fn from(bytes: [u8; FRAME_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Frame {
    type Err = crate::error::ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Frame::from_hex(s)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.to_hex())
    }
}
