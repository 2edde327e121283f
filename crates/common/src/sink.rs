//! Response sink seam
//!
//! The polling engine hands every decoded [`Response`] to a sink and asks it
//! for the text to show on the bottom display line. In production the sink
//! is the Meteor connection; in tests it is a recorder.

use protocol::Response;

/// Receives decoded responses and supplies external display text
///
/// Called from the blocking reader and display threads, so implementations
/// must not block for long.
pub trait ResponseSink: Send + Sync {
    /// Forward one response to the remote peer
    fn publish(&self, response: &Response) -> crate::Result<()>;

    /// Current text for the bottom display line
    fn display_text(&self) -> crate::Result<String>;
}

impl<T: ResponseSink + ?Sized> ResponseSink for std::sync::Arc<T> {
    fn publish(&self, response: &Response) -> crate::Result<()> {
        (**self).publish(response)
    }

    fn display_text(&self) -> crate::Result<String> {
        (**self).display_text()
    }
}
