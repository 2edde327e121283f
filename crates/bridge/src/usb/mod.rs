//! USB device stack
//!
//! Layered bottom-up:
//! - [`device`]: opens the base station through rusb
//! - [`transport`]: reentrant, exclusive access with the ack discipline
//! - [`base_station`]: the session state machine on top

pub mod base_station;
pub mod device;
pub mod transport;

pub use base_station::{BaseStation, SessionState};
pub use device::{RusbChannel, RusbOpener};
pub use transport::{Transport, TransportGuard};
