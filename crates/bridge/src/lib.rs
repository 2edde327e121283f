//! iClicker base station bridge
//!
//! Drives an iClicker base station over USB and forwards every clicker
//! response to a Meteor server, showing the server's display text and a
//! running vote count on the base's two-line display.
//!
//! The device side is blocking (libusb) and runs on OS threads:
//! [`usb::Transport`] serializes access to the device, [`usb::BaseStation`]
//! is the session state machine and [`poll::PollingEngine`] runs a poll.
//! The network side is a Tokio task ([`network::DdpClient`]); the two meet
//! at the [`common::ResponseSink`] seam.

pub mod config;
pub mod network;
pub mod poll;
pub mod timing;
pub mod usb;

pub use config::BridgeConfig;
pub use poll::PollingEngine;
pub use timing::Timings;
pub use usb::{BaseStation, SessionState};
