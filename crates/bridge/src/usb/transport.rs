//! Exclusive, reentrant access to the base station channel
//!
//! Every operation takes the transport lock for its whole duration. The lock
//! is reentrant: the session layer holds it across a whole command sequence
//! and recovery re-enters it from inside an already locked region. The
//! `RefCell` inside is only ever borrowed for a single USB call, so
//! re-entry never overlaps two borrows.

use common::{Error, Result, UsbChannel};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use protocol::{FRAME_SIZE, Frame};
use std::cell::RefCell;
use std::time::Duration;
use tracing::trace;

type Slot = RefCell<Option<Box<dyn UsbChannel>>>;

/// The physical channel behind a reentrant lock
pub struct Transport {
    channel: ReentrantMutex<Slot>,
}

/// Proof that the current thread holds the transport lock
///
/// Dropping it releases this level of the lock.
pub struct TransportGuard<'a> {
    _guard: ReentrantMutexGuard<'a, Slot>,
}

impl Transport {
    /// Transport with no device attached
    pub fn new() -> Self {
        Self {
            channel: ReentrantMutex::new(RefCell::new(None)),
        }
    }

    /// Hold the channel across several operations
    pub fn lock(&self) -> TransportGuard<'_> {
        TransportGuard {
            _guard: self.channel.lock(),
        }
    }

    /// Install an opened device channel, replacing any previous one
    pub fn attach(&self, channel: Box<dyn UsbChannel>) {
        let guard = self.channel.lock();
        *guard.borrow_mut() = Some(channel);
    }

    /// Drop the device channel
    pub fn detach(&self) {
        let guard = self.channel.lock();
        guard.borrow_mut().take();
    }

    pub fn is_attached(&self) -> bool {
        let guard = self.channel.lock();
        guard.borrow().is_some()
    }

    /// Send one frame with HID SET_REPORT
    pub fn write(&self, frame: &Frame) -> Result<()> {
        self.with_channel(|channel| {
            trace!("USB write: {}", frame);
            channel.control_write(frame.as_bytes())?;
            Ok(())
        })
    }

    /// Read one frame, `None` when nothing arrived within `timeout`
    pub fn read(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.with_channel(|channel| {
            let mut buf = [0u8; FRAME_SIZE];
            match channel.read_response(&mut buf, timeout) {
                Ok(len) => {
                    let frame = Frame::from_bytes(&buf[..len]);
                    trace!("USB read: {}", frame);
                    Ok(Some(frame))
                }
                Err(rusb::Error::Timeout) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Write `frame` and require the `?? ?? aa` acknowledgement
    pub fn sync_write(&self, frame: &Frame, timeout: Duration) -> Result<()> {
        let _guard = self.lock();
        let expected = frame.acknowledgement();

        self.write(frame)?;
        let received = self.read(timeout)?;

        if received != Some(expected) {
            return Err(Error::Protocol {
                sent: *frame,
                expected,
                received,
            });
        }
        Ok(())
    }

    /// Write each frame, discarding replies until the device goes quiet
    pub fn write_sequence(&self, frames: &[Frame], drain_timeout: Duration) -> Result<()> {
        let _guard = self.lock();
        for frame in frames {
            self.write(frame)?;
            while let Some(reply) = self.read(drain_timeout)? {
                trace!("Drained {}", reply);
            }
        }
        Ok(())
    }

    fn with_channel<T>(
        &self,
        op: impl FnOnce(&mut Box<dyn UsbChannel>) -> Result<T>,
    ) -> Result<T> {
        let guard = self.channel.lock();
        let mut slot = guard.borrow_mut();
        let channel = slot
            .as_mut()
            .ok_or_else(|| Error::Transport("no base station attached".to_string()))?;
        op(channel)
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{SimulatedBaseStation, clicker_response_bytes, response_frame};
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_millis(1);

    fn attached() -> (Transport, SimulatedBaseStation) {
        let device = SimulatedBaseStation::new();
        let transport = Transport::new();
        transport.attach(Box::new(device.clone()));
        (transport, device)
    }

    #[test]
    fn test_io_without_device_is_transport_error() {
        let transport = Transport::new();
        assert!(!transport.is_attached());
        assert!(matches!(
            transport.write(&Frame::empty()),
            Err(Error::Transport(_))
        ));
        assert!(matches!(transport.read(TIMEOUT), Err(Error::Transport(_))));
    }

    #[test]
    fn test_read_timeout_is_none() {
        let (transport, _device) = attached();
        assert_eq!(transport.read(TIMEOUT).unwrap(), None);
    }

    #[test]
    fn test_read_fault_is_transport_error() {
        let (transport, device) = attached();
        device.queue_error(rusb::Error::NoDevice);
        transport.write(&protocol::commands::start_polling()).unwrap();

        assert!(matches!(transport.read(TIMEOUT), Err(Error::Transport(_))));
    }

    #[test]
    fn test_sync_write_accepts_ack() {
        let (transport, device) = attached();
        let cmd = Frame::from_hex("01 10 21 41").unwrap();

        transport.sync_write(&cmd, TIMEOUT).unwrap();
        assert_eq!(device.written(), vec![cmd]);
    }

    #[test]
    fn test_sync_write_without_ack_is_protocol_error() {
        let (transport, device) = attached();
        device.set_acknowledge(false);
        let cmd = Frame::from_hex("01 10 21 41").unwrap();

        match transport.sync_write(&cmd, TIMEOUT) {
            Err(Error::Protocol {
                sent,
                expected,
                received,
            }) => {
                assert_eq!(sent, cmd);
                assert_eq!(expected, Frame::from_hex("01 10 aa").unwrap());
                assert_eq!(received, None);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_sync_write_wrong_reply_is_protocol_error() {
        let (transport, device) = attached();
        let stray = response_frame(Some(clicker_response_bytes(0x81, [1, 2, 3], 1)), None);
        device.queue_frame(stray);
        transport.write(&protocol::commands::start_polling()).unwrap();

        // Not acknowledged by the device, so the next read is the stray frame
        let cmd = Frame::from_hex("01 2d").unwrap();
        match transport.sync_write(&cmd, TIMEOUT) {
            Err(Error::Protocol { received, .. }) => assert_eq!(received, Some(stray)),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_write_sequence_drains_replies() {
        let (transport, device) = attached();
        let frames = protocol::commands::sequence(&[&[0x01, 0x16], &[0x01, 0x17, 0x03]]);

        transport.write_sequence(&frames, TIMEOUT).unwrap();

        assert_eq!(device.written(), frames);
        // The ack to 01 16 was consumed by the drain
        assert_eq!(transport.read(TIMEOUT).unwrap(), None);
    }

    #[test]
    fn test_lock_is_reentrant() {
        let (transport, _device) = attached();
        let _outer = transport.lock();
        let _inner = transport.lock();
        transport.write(&Frame::empty()).unwrap();
        transport.sync_write(&Frame::from_hex("01 16").unwrap(), TIMEOUT).unwrap();
    }

    #[test]
    fn test_lock_excludes_other_threads() {
        let (transport, device) = attached();
        let transport = Arc::new(transport);

        let guard = transport.lock();
        let other = {
            let transport = transport.clone();
            thread::spawn(move || transport.write(&Frame::from_hex("01 12").unwrap()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(device.written().is_empty());
        drop(guard);

        other.join().unwrap().unwrap();
        assert_eq!(device.written().len(), 1);
    }

    #[test]
    fn test_detach_drops_channel() {
        let (transport, _device) = attached();
        assert!(transport.is_attached());
        transport.detach();
        assert!(!transport.is_attached());
    }
}
