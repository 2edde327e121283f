//! Pacing delays and timeouts for the device stack
//!
//! The base station garbles commands that arrive too quickly, so every
//! configuration write is followed by a settle delay. All of these come
//! from the `[timing]` config section.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Pause after opening the device and after configuration writes
    pub settle: Duration,
    /// Pause after a display line write
    pub display_settle: Duration,
    /// Read timeout of the polling loop
    pub read_timeout: Duration,
    /// Sleep (outside the USB lock) after an idle read
    pub idle_sleep: Duration,
    /// How long to wait for a `?? ?? aa` acknowledgement
    pub ack_timeout: Duration,
    /// Read timeout used while draining replies to a command sequence
    pub drain_timeout: Duration,
    /// Display refresh period
    pub refresh_interval: Duration,
    /// Pause before retrying after a failed restart
    pub restart_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(200),
            display_settle: Duration::from_millis(50),
            read_timeout: Duration::from_millis(50),
            idle_sleep: Duration::from_millis(10),
            ack_timeout: Duration::from_millis(100),
            drain_timeout: Duration::from_millis(100),
            refresh_interval: Duration::from_secs(1),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

impl Timings {
    /// No pacing at all, with minimal timeouts
    ///
    /// Only useful against a simulated device.
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            display_settle: Duration::ZERO,
            read_timeout: Duration::from_millis(1),
            idle_sleep: Duration::ZERO,
            ack_timeout: Duration::from_millis(1),
            drain_timeout: Duration::from_millis(1),
            refresh_interval: Duration::from_millis(5),
            restart_backoff: Duration::from_millis(1),
        }
    }
}

/// Sleep, skipping the syscall for zero durations
pub(crate) fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}
