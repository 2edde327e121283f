//! Channel bridge between the blocking polling threads and the Tokio runtime
//!
//! Votes flow from the device side to the network task over a bounded
//! `async-channel`. Display text flows the other way through a shared mirror
//! the network task keeps up to date, so the display thread never waits on
//! the network.

use crate::sink::ResponseSink;
use async_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::RwLock;
use protocol::Response;
use std::sync::Arc;

/// Votes buffered while the network task is busy or reconnecting
const VOTE_QUEUE_CAPACITY: usize = 256;

/// Commands from the polling threads to the network task
#[derive(Debug)]
pub enum SinkCommand {
    /// Forward a response with the `iclicker-vote` method
    Vote {
        /// Decoded response
        response: Response,
    },

    /// Close the connection and stop the network task
    Shutdown,
}

/// Device-side handle (blocking), implements [`ResponseSink`]
#[derive(Clone)]
pub struct SinkHandle {
    cmd_tx: Sender<SinkCommand>,
    display: Arc<RwLock<String>>,
}

impl SinkHandle {
    /// Send a command, waiting for queue space
    pub async fn send_command(&self, cmd: SinkCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Ask the network task to shut down
    pub fn request_shutdown(&self) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(SinkCommand::Shutdown)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether the network task has gone away
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

impl ResponseSink for SinkHandle {
    fn publish(&self, response: &Response) -> crate::Result<()> {
        match self.cmd_tx.try_send(SinkCommand::Vote {
            response: response.clone(),
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(crate::Error::Sink(format!(
                "vote queue full, dropping {}",
                response
            ))),
            Err(TrySendError::Closed(_)) => {
                Err(crate::Error::Sink("network task stopped".to_string()))
            }
        }
    }

    fn display_text(&self) -> crate::Result<String> {
        if self.cmd_tx.is_closed() {
            return Err(crate::Error::Sink("network task stopped".to_string()));
        }
        Ok(self.display.read().clone())
    }
}

/// Network-side end (async)
pub struct SinkWorker {
    cmd_rx: Receiver<SinkCommand>,
    display: Arc<RwLock<String>>,
}

impl SinkWorker {
    /// Receive the next command
    pub async fn recv_command(&self) -> crate::Result<SinkCommand> {
        self.cmd_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without waiting
    pub fn try_recv_command(&self) -> Option<SinkCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Publish new text for the bottom display line
    pub fn set_display_text(&self, text: impl Into<String>) {
        *self.display.write() = text.into();
    }

    /// Text currently mirrored for the display
    pub fn display_text(&self) -> String {
        self.display.read().clone()
    }

    /// Close the command channel; handles start reporting sink errors
    pub fn close(&self) {
        self.cmd_rx.close();
    }
}

/// Create the bridge between the polling threads and the network task
///
/// Returns (SinkHandle for the device side, SinkWorker for the network task)
pub fn create_sink_bridge() -> (SinkHandle, SinkWorker) {
    let (cmd_tx, cmd_rx) = bounded(VOTE_QUEUE_CAPACITY);
    let display = Arc::new(RwLock::new(String::new()));

    (
        SinkHandle {
            cmd_tx,
            display: display.clone(),
        },
        SinkWorker { cmd_rx, display },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Frame;
    use std::time::SystemTime;

    fn sample_response() -> Response {
        let info = Frame::from_hex("02 13 81 01 02 03 07").unwrap().classify();
        Response::from_info(&info, SystemTime::now()).unwrap()
    }

    #[tokio::test]
    async fn test_vote_reaches_worker() {
        let (handle, worker) = create_sink_bridge();

        handle.publish(&sample_response()).unwrap();

        match worker.recv_command().await.unwrap() {
            SinkCommand::Vote { response } => assert_eq!(response, sample_response()),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_display_text_mirrors_worker() {
        let (handle, worker) = create_sink_bridge();
        assert_eq!(handle.display_text().unwrap(), "");

        worker.set_display_text("Question 3");
        assert_eq!(handle.display_text().unwrap(), "Question 3");
    }

    #[test]
    fn test_closed_worker_reports_sink_error() {
        let (handle, worker) = create_sink_bridge();
        worker.close();

        assert!(matches!(handle.display_text(), Err(crate::Error::Sink(_))));
        assert!(matches!(
            handle.publish(&sample_response()),
            Err(crate::Error::Sink(_))
        ));
    }

    #[test]
    fn test_full_queue_drops_vote() {
        let (handle, _worker) = create_sink_bridge();
        for _ in 0..VOTE_QUEUE_CAPACITY {
            handle.publish(&sample_response()).unwrap();
        }
        assert!(matches!(
            handle.publish(&sample_response()),
            Err(crate::Error::Sink(_))
        ));
    }
}
