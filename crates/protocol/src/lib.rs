//! Protocol library for the iClicker base station
//!
//! This crate defines the binary protocol spoken with the iClicker base
//! station over USB: the fixed 64-byte [`Frame`], its classification into
//! [`DecodedInfo`], the derived [`ClickerId`], the domain [`Response`], and
//! the command builders and captured command sequences used to drive the
//! device. Nothing here performs I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{DecodedInfo, Frame, Response};
//! use std::time::SystemTime;
//!
//! // A device frame carrying one answer in its left half
//! let frame = Frame::from_hex("02 13 82 12 34 56 01").unwrap();
//!
//! let responses: Vec<Response> = frame
//!     .split_responses()
//!     .iter()
//!     .filter_map(|info| Response::from_info(info, SystemTime::now()))
//!     .collect();
//!
//! assert_eq!(responses.len(), 1);
//! assert_eq!(responses[0].response, 'B');
//! assert_eq!(responses[0].clicker_id.as_str(), "12345670");
//! ```

pub mod commands;
pub mod error;
pub mod frame;
pub mod integrity;
pub mod types;

pub use commands::DisplayLine;
pub use error::{ProtocolError, Result};
pub use frame::{ACK_MARKER, FRAME_SIZE, Frame, SUB_FRAME_SIZE};
pub use types::{
    ClickerId, DecodedInfo, Frequency, FrequencyCode, PollType, Response, decode_response_letter,
};
