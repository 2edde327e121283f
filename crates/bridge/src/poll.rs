//! Polling engine
//!
//! Runs a poll on one [`BaseStation`] with two threads:
//! - the reader (the thread that called [`PollingEngine::start`]) streams
//!   frames from the base and forwards every decoded response to the sink
//! - the display refresher pushes the sink's display text and a
//!   `m:ss  count` status line to the base once per refresh interval
//!
//! Both threads take the transport lock for each device operation, so they
//! interleave at operation boundaries. The `stopped` flag is the only
//! cancellation signal. A device or sink fault on either thread restarts the
//! base in place.

use crate::timing::pause;
use crate::usb::BaseStation;
use common::{Error, ResponseSink, Result};
use parking_lot::Mutex;
use protocol::commands::DISPLAY_WIDTH;
use protocol::{DisplayLine, Frame, PollType, Response};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Longest uninterrupted sleep of the display refresher
const REFRESH_SLICE: Duration = Duration::from_millis(50);

pub struct PollingEngine<S> {
    base: BaseStation,
    sink: S,
    stopped: AtomicBool,
    shutdown: AtomicBool,
    responses: AtomicUsize,
    started_at: Mutex<Instant>,
}

impl<S: ResponseSink> PollingEngine<S> {
    pub fn new(base: BaseStation, sink: S) -> Self {
        Self {
            base,
            sink,
            stopped: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            responses: AtomicUsize::new(0),
            started_at: Mutex::new(Instant::now()),
        }
    }

    pub fn base(&self) -> &BaseStation {
        &self.base
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Responses received since the poll started
    pub fn response_count(&self) -> usize {
        self.responses.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run a poll until [`stop`](Self::stop) is called
    ///
    /// Blocks the calling thread, which becomes the reader. Errors setting up
    /// the poll are returned; errors once polling are recovered from. Returns
    /// at once if a stop was already requested, even one made while the base
    /// was still being initialized.
    pub fn start(&self, poll_type: PollType) -> Result<()> {
        *self.started_at.lock() = Instant::now();
        self.responses.store(0, Ordering::SeqCst);

        {
            let _guard = self.base.lock();
            if self.is_shut_down() {
                info!("Stop requested before the poll started");
                return Ok(());
            }
            if !self.base.is_initialized() {
                self.base.reinitialize()?;
            }
            info!("Starting poll");
            self.base.start_poll(poll_type)?;
            self.stopped.store(false, Ordering::SeqCst);
        }

        let result = thread::scope(|scope| -> Result<()> {
            thread::Builder::new()
                .name("display-refresh".to_string())
                .spawn_scoped(scope, || self.refresh_loop())
                .map_err(|e| {
                    self.stopped.store(true, Ordering::SeqCst);
                    Error::Io(e)
                })?;

            self.read_loop();
            Ok(())
        });

        if let Err(e) = self.base.stop_poll() {
            warn!("Failed to stop poll: {}", e);
        }
        result
    }

    /// Ask both threads to finish
    ///
    /// Waits for any restart or setup in progress to complete first. A
    /// stopped engine stays stopped: later calls to [`start`](Self::start)
    /// return immediately.
    pub fn stop(&self) {
        let _guard = self.base.lock();
        info!("Stopping poll");
        self.shutdown.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Reopen and reinitialize the base, then resume an alpha poll
    ///
    /// Does nothing once a stop has been requested.
    pub fn restart(&self) -> Result<()> {
        let _guard = self.base.lock();
        if self.is_stopped() {
            debug!("Poll is stopping, not restarting");
            return Ok(());
        }

        info!("Restarting iClicker USB connection");
        if let Err(e) = self.base.stop_poll() {
            debug!("Ignoring error while stopping poll: {}", e);
        }
        self.base.release();
        self.base.reinitialize()?;

        info!("Restarting poll");
        self.base.start_poll(PollType::Alpha)?;
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_loop(&self) {
        while !self.is_stopped() {
            let read = {
                let _guard = self.base.lock();
                self.base
                    .read()
                    .map_err(|e| self.recover("Reading from the base", e))
            };

            match read {
                Ok(Some(frame)) => self.publish_frame(&frame),
                Ok(None) => pause(self.base.timings().idle_sleep),
                Err(recovered) => self.back_off(recovered),
            }
        }
        debug!("Reader finished");
    }

    fn publish_frame(&self, frame: &Frame) {
        for info in frame.split_responses() {
            let Some(response) = Response::from_info(&info, SystemTime::now()) else {
                continue;
            };

            self.responses.fetch_add(1, Ordering::SeqCst);
            info!("{}", response);
            if let Err(e) = self.sink.publish(&response) {
                warn!("Failed to forward {}: {}", response, e);
            }
        }
    }

    fn refresh_loop(&self) {
        while !self.is_stopped() {
            self.refresh_display();
            self.wait_for_next_refresh();
        }
        debug!("Display refresher finished");
    }

    fn refresh_display(&self) {
        let external = {
            let _guard = self.base.lock();
            self.sink
                .display_text()
                .and_then(|text| {
                    let text: String = text.chars().take(DISPLAY_WIDTH).collect();
                    self.base.set_display_line(&text, DisplayLine::Bottom)
                })
                .map_err(|e| self.recover("Updating the display", e))
        };
        if let Err(recovered) = external {
            self.back_off(recovered);
            return;
        }

        let status = status_line(self.started_at.lock().elapsed(), self.response_count());
        let result = {
            let _guard = self.base.lock();
            self.base
                .set_display_line(&status, DisplayLine::Top)
                .map_err(|e| self.recover("Updating the display", e))
        };
        if let Err(recovered) = result {
            self.back_off(recovered);
        }
    }

    fn wait_for_next_refresh(&self) {
        let deadline = Instant::now() + self.base.timings().refresh_interval;
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            pause((deadline - now).min(REFRESH_SLICE));
        }
    }

    /// Restart after a fault; returns whether the restart succeeded
    ///
    /// Called with the transport lock held.
    fn recover(&self, what: &str, error: Error) -> bool {
        warn!("{} failed: {}", what, error);
        match self.restart() {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to restart iClicker base: {}", e);
                false
            }
        }
    }

    fn back_off(&self, recovered: bool) {
        if !recovered {
            pause(self.base.timings().restart_backoff);
        }
    }
}

/// Elapsed `m:ss`, then the response count right aligned to the display width
fn status_line(elapsed: Duration, responses: usize) -> String {
    let secs = elapsed.as_secs();
    let elapsed = format!("{}:{:02}", secs / 60, secs % 60);
    let width = DISPLAY_WIDTH.saturating_sub(elapsed.len());
    format!("{}{:>width$}", elapsed, responses, width = width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::Timings;
    use common::DeviceSelector;
    use common::test_utils::{RecordingSink, SimulatedBaseStation, SimulatedOpener};
    use std::sync::Arc;

    fn engine() -> (PollingEngine<Arc<RecordingSink>>, SimulatedBaseStation) {
        let device = SimulatedBaseStation::new();
        let base = BaseStation::new(
            Box::new(SimulatedOpener::new(device.clone())),
            DeviceSelector::default(),
            Timings::immediate(),
        );
        (
            PollingEngine::new(base, Arc::new(RecordingSink::new())),
            device,
        )
    }

    #[test]
    fn test_new_engine_is_stopped() {
        let (engine, _device) = engine();
        assert!(engine.is_stopped());
        assert_eq!(engine.response_count(), 0);
    }

    #[test]
    fn test_status_line_layout() {
        let line = status_line(Duration::from_secs(65), 42);
        assert_eq!(line, "1:05          42");
        assert_eq!(line.len(), DISPLAY_WIDTH);

        assert_eq!(status_line(Duration::ZERO, 0), "0:00           0");
        assert_eq!(status_line(Duration::from_secs(600), 7), "10:00          7");
    }

    #[test]
    fn test_restart_is_skipped_once_stopped() {
        let (engine, device) = engine();
        engine.restart().unwrap();
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_start_after_stop_returns_immediately() {
        let (engine, device) = engine();
        engine.stop();

        engine.start(PollType::Alpha).unwrap();
        assert!(engine.is_stopped());
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_start_fails_when_initialization_fails() {
        let (engine, device) = engine();
        device.set_acknowledge(false);

        assert!(matches!(
            engine.start(PollType::Alpha),
            Err(Error::Protocol { .. })
        ));
        assert!(engine.is_stopped());
    }
}
