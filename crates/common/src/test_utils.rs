//! Test utilities for the iClicker bridge
//!
//! Provides a simulated base station, a simulated device opener, a recording
//! response sink, and frame builders so the device stack can be exercised
//! without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{SimulatedBaseStation, clicker_response_bytes, response_frame};
//!
//! let device = SimulatedBaseStation::new();
//! // Streamed only once the bridge has started a poll
//! device.queue_frame(response_frame(Some(clicker_response_bytes(0x81, [1, 2, 3], 7)), None));
//! assert_eq!(device.pending_stream(), 1);
//! assert!(!device.is_polling());
//! ```

use crate::sink::ResponseSink;
use crate::usb_types::{DeviceOpener, DeviceSelector, UsbChannel};
use parking_lot::Mutex;
use protocol::{FRAME_SIZE, Frame, Response, SUB_FRAME_SIZE};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a simulated read blocks when there is nothing to report
const SIMULATED_IDLE_READ: Duration = Duration::from_millis(1);

#[derive(Default)]
struct SimulatedState {
    written: Vec<Frame>,
    acks: VecDeque<Frame>,
    stream: VecDeque<Result<Frame, rusb::Error>>,
    polling: bool,
    acknowledge: bool,
    failing_writes: usize,
    reads: usize,
}

/// In-memory stand-in for the physical base station
///
/// Behaves like the device as far as the bridge can observe:
/// - `01 10` and `01 16` are acknowledged with `?? ?? aa`
/// - `01 11` starts a poll, `01 12` ends it
/// - queued frames and faults are streamed only while a poll is running
/// - a read with nothing to report fails with [`rusb::Error::Timeout`]
///
/// Clones share state, so a test keeps one clone to inspect what the
/// bridge wrote while the bridge owns another.
#[derive(Clone)]
pub struct SimulatedBaseStation {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedBaseStation {
    /// A device that acknowledges configuration commands
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimulatedState {
                acknowledge: true,
                ..Default::default()
            })),
        }
    }

    /// Queue a frame to stream once polling
    pub fn queue_frame(&self, frame: Frame) {
        self.state.lock().stream.push_back(Ok(frame));
    }

    /// Queue a read fault to raise once polling
    pub fn queue_error(&self, error: rusb::Error) {
        self.state.lock().stream.push_back(Err(error));
    }

    /// Stop (or resume) acknowledging `01 10` / `01 16`
    pub fn set_acknowledge(&self, acknowledge: bool) {
        self.state.lock().acknowledge = acknowledge;
    }

    /// Fail the next `count` control writes with [`rusb::Error::Io`]
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Every frame written so far, in order
    pub fn written(&self) -> Vec<Frame> {
        self.state.lock().written.clone()
    }

    /// Written frames excluding display updates
    pub fn written_commands(&self) -> Vec<Frame> {
        self.written()
            .into_iter()
            .filter(|f| !is_display_frame(f))
            .collect()
    }

    /// Written display updates only
    pub fn written_display(&self) -> Vec<Frame> {
        self.written()
            .into_iter()
            .filter(is_display_frame)
            .collect()
    }

    /// Forget the write log
    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    /// Whether the device is currently polling
    pub fn is_polling(&self) -> bool {
        self.state.lock().polling
    }

    /// Frames and faults not yet streamed
    pub fn pending_stream(&self) -> usize {
        self.state.lock().stream.len()
    }

    /// Number of reads the bridge issued
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }
}

impl Default for SimulatedBaseStation {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbChannel for SimulatedBaseStation {
    fn control_write(&mut self, data: &[u8]) -> Result<usize, rusb::Error> {
        let mut state = self.state.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(rusb::Error::Io);
        }

        let frame = Frame::from_bytes(data);
        state.written.push(frame);
        match frame.tag() {
            (0x01, 0x10) | (0x01, 0x16) if state.acknowledge => {
                state.acks.push_back(frame.acknowledgement());
            }
            (0x01, 0x11) => state.polling = true,
            (0x01, 0x12) => state.polling = false,
            _ => {}
        }
        Ok(data.len())
    }

    fn read_response(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, rusb::Error> {
        let next = {
            let mut state = self.state.lock();
            state.reads += 1;
            if let Some(ack) = state.acks.pop_front() {
                Some(Ok(ack))
            } else if state.polling {
                state.stream.pop_front()
            } else {
                None
            }
        };

        match next {
            Some(Ok(frame)) => {
                let len = buf.len().min(FRAME_SIZE);
                buf[..len].copy_from_slice(&frame.as_bytes()[..len]);
                Ok(len)
            }
            Some(Err(error)) => Err(error),
            None => {
                std::thread::sleep(timeout.min(SIMULATED_IDLE_READ));
                Err(rusb::Error::Timeout)
            }
        }
    }
}

/// Opens a [`SimulatedBaseStation`], or reports it missing
#[derive(Clone)]
pub struct SimulatedOpener {
    device: Option<SimulatedBaseStation>,
    opens: Arc<AtomicUsize>,
}

impl SimulatedOpener {
    /// Opener that always finds `device`
    pub fn new(device: SimulatedBaseStation) -> Self {
        Self {
            device: Some(device),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opener that never finds a device
    pub fn missing() -> Self {
        Self {
            device: None,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times the device was opened
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceOpener for SimulatedOpener {
    fn open(&mut self, selector: DeviceSelector) -> crate::Result<Box<dyn UsbChannel>> {
        match &self.device {
            Some(device) => {
                self.opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(device.clone()))
            }
            None => Err(crate::Error::DeviceNotFound {
                vendor_id: selector.vendor_id,
                product_id: selector.product_id,
            }),
        }
    }
}

/// Sink that records what it is given
#[derive(Default)]
pub struct RecordingSink {
    responses: Mutex<Vec<Response>>,
    display: Mutex<String>,
    display_failures: AtomicUsize,
    display_calls: AtomicUsize,
    publish_attempts: AtomicUsize,
    reject_publish: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose display text is `text`
    pub fn with_display(text: &str) -> Self {
        let sink = Self::default();
        sink.set_display(text);
        sink
    }

    pub fn set_display(&self, text: &str) {
        *self.display.lock() = text.to_string();
    }

    /// Fail the next `count` display queries
    pub fn fail_next_display(&self, count: usize) {
        self.display_failures.store(count, Ordering::SeqCst);
    }

    /// Reject every publish with a sink error
    pub fn reject_publish(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    /// Responses accepted so far
    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().clone()
    }

    pub fn response_count(&self) -> usize {
        self.responses.lock().len()
    }

    /// Publish calls, including rejected ones
    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn display_calls(&self) -> usize {
        self.display_calls.load(Ordering::SeqCst)
    }
}

impl ResponseSink for RecordingSink {
    fn publish(&self, response: &Response) -> crate::Result<()> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(crate::Error::Sink("publish rejected".to_string()));
        }
        self.responses.lock().push(response.clone());
        Ok(())
    }

    fn display_text(&self) -> crate::Result<String> {
        self.display_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .display_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(crate::Error::Sink("display query failed".to_string()));
        }
        Ok(self.display.lock().clone())
    }
}

/// One 32-byte response sub-frame
///
/// `answer` is the raw answer byte (`0x81` = A on new remotes, `0x01` = A on
/// old ones).
pub fn clicker_response_bytes(answer: u8, identity: [u8; 3], seq: u8) -> [u8; SUB_FRAME_SIZE] {
    let mut half = [0u8; SUB_FRAME_SIZE];
    half[..7].copy_from_slice(&[
        0x02,
        0x13,
        answer,
        identity[0],
        identity[1],
        identity[2],
        seq,
    ]);
    half
}

/// Full frame from optional left and right sub-frames
pub fn response_frame(
    left: Option<[u8; SUB_FRAME_SIZE]>,
    right: Option<[u8; SUB_FRAME_SIZE]>,
) -> Frame {
    let mut bytes = [0u8; FRAME_SIZE];
    if let Some(left) = left {
        bytes[..SUB_FRAME_SIZE].copy_from_slice(&left);
    }
    if let Some(right) = right {
        bytes[SUB_FRAME_SIZE..].copy_from_slice(&right);
    }
    Frame::from(bytes)
}

/// Whether a frame is a display line update (`01 13` / `01 14`)
pub fn is_display_frame(frame: &Frame) -> bool {
    matches!(frame.tag(), (0x01, 0x13) | (0x01, 0x14))
}

/// Poll `condition` until it holds or `timeout` elapses
///
/// Returns whether the condition was met.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Wrap an async test with a timeout
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_device_acknowledges_frequency() {
        let mut device = SimulatedBaseStation::new();
        let cmd = Frame::from_hex("01 10 21 41").unwrap();
        device.control_write(cmd.as_bytes()).unwrap();

        let mut buf = [0u8; FRAME_SIZE];
        let len = device
            .read_response(&mut buf, Duration::from_millis(10))
            .unwrap();
        assert_eq!(Frame::from_bytes(&buf[..len]), cmd.acknowledgement());

        assert_eq!(
            device.read_response(&mut buf, Duration::from_millis(10)),
            Err(rusb::Error::Timeout)
        );
    }

    #[test]
    fn test_simulated_device_streams_only_while_polling() {
        let mut device = SimulatedBaseStation::new();
        device.queue_frame(response_frame(
            Some(clicker_response_bytes(0x81, [1, 2, 3], 1)),
            None,
        ));

        let mut buf = [0u8; FRAME_SIZE];
        assert_eq!(
            device.read_response(&mut buf, Duration::ZERO),
            Err(rusb::Error::Timeout)
        );

        device.control_write(&[0x01, 0x11]).unwrap();
        assert!(device.is_polling());
        assert_eq!(device.read_response(&mut buf, Duration::ZERO), Ok(FRAME_SIZE));
        assert_eq!(buf[0], 0x02);

        device.control_write(&[0x01, 0x12]).unwrap();
        assert!(!device.is_polling());
    }

    #[test]
    fn test_simulated_device_write_failures() {
        let mut device = SimulatedBaseStation::new();
        device.fail_next_writes(1);
        assert_eq!(device.control_write(&[0x01, 0x11]), Err(rusb::Error::Io));
        assert!(device.control_write(&[0x01, 0x11]).is_ok());
        assert_eq!(device.written().len(), 1);
    }

    #[test]
    fn test_missing_opener() {
        let mut opener = SimulatedOpener::missing();
        let result = opener.open(DeviceSelector::default());
        assert!(matches!(
            result,
            Err(crate::Error::DeviceNotFound {
                vendor_id: 0x1881,
                product_id: 0x0150
            })
        ));
        assert_eq!(opener.open_count(), 0);
    }

    #[test]
    fn test_recording_sink_display_failures() {
        let sink = RecordingSink::with_display("hello");
        sink.fail_next_display(1);
        assert!(sink.display_text().is_err());
        assert_eq!(sink.display_text().unwrap(), "hello");
        assert_eq!(sink.display_calls(), 2);
    }

    #[test]
    fn test_is_display_frame() {
        assert!(is_display_frame(&Frame::from_hex("01 13 41").unwrap()));
        assert!(is_display_frame(&Frame::from_hex("01 14 41").unwrap()));
        assert!(!is_display_frame(&Frame::from_hex("01 11").unwrap()));
    }
}
