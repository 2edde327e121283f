//! Common utilities for iclicker-bridge
//!
//! This crate provides the seams shared between the device stack and the
//! network client: USB channel traits, the response sink trait, the channel
//! bridge that carries votes to the Tokio runtime, error handling, logging,
//! and a simulated base station for tests.

pub mod channel;
pub mod error;
pub mod logging;
pub mod sink;
pub mod test_utils;
pub mod usb_types;

pub use channel::{SinkCommand, SinkHandle, SinkWorker, create_sink_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use sink::ResponseSink;
pub use usb_types::{DeviceOpener, DeviceSelector, UsbChannel};
