//! Common error types

use protocol::Frame;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No iClicker base station found (vendor {vendor_id:#06x}, product {product_id:#06x})")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("USB transport error: {0}")]
    Transport(String),

    #[error("Attempted synchronous write of {sent} and got {} (expecting {expected})", describe_reply(.received))]
    Protocol {
        sent: Frame,
        expected: Frame,
        received: Option<Frame>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<protocol::ProtocolError> for Error {
    fn from(err: protocol::ProtocolError) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn describe_reply(received: &Option<Frame>) -> String {
    match received {
        Some(frame) => frame.to_string(),
        None => "nothing".to_string(),
    }
}
