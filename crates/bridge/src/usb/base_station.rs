//! Base station session state machine
//!
//! ```text
//! Uninitialized --initialize--> Initialized --start_poll--> Polling
//!                                               ^              |
//!                                               +--stop_poll---+-> Stopped
//! ```
//!
//! Command sequences run with the transport lock held, so the display and
//! reader threads never interleave with them.

use crate::timing::{Timings, pause};
use crate::usb::transport::{Transport, TransportGuard};
use common::{DeviceOpener, DeviceSelector, Error, Result};
use parking_lot::Mutex;
use protocol::commands::{self, DISPLAY_WIDTH};
use protocol::{DisplayLine, Frequency, PollType};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Polling,
    Stopped,
}

impl SessionState {
    pub fn is_initialized(self) -> bool {
        self != SessionState::Uninitialized
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initialized => "initialized",
            SessionState::Polling => "polling",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

fn blank_line() -> String {
    " ".repeat(DISPLAY_WIDTH)
}

/// One iClicker base station
pub struct BaseStation {
    transport: Transport,
    opener: Mutex<Box<dyn DeviceOpener>>,
    selector: DeviceSelector,
    timings: Timings,
    state: Mutex<SessionState>,
    frequency: Mutex<Frequency>,
    screen: Mutex<[String; 2]>,
}

impl BaseStation {
    pub fn new(opener: Box<dyn DeviceOpener>, selector: DeviceSelector, timings: Timings) -> Self {
        Self {
            transport: Transport::new(),
            opener: Mutex::new(opener),
            selector,
            timings,
            state: Mutex::new(SessionState::Uninitialized),
            frequency: Mutex::new(Frequency::default()),
            screen: Mutex::new([blank_line(), blank_line()]),
        }
    }

    /// Hold the USB channel across several operations
    pub fn lock(&self) -> TransportGuard<'_> {
        self.transport.lock()
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.state().is_initialized()
    }

    /// Frequency used by the last (or next) initialization
    pub fn frequency(&self) -> Frequency {
        *self.frequency.lock()
    }

    /// Open the device unless it is already open
    pub fn acquire(&self) -> Result<()> {
        let _guard = self.transport.lock();
        if self.transport.is_attached() {
            return Ok(());
        }

        info!("Finding iClicker base {}", self.selector);
        let channel = self.opener.lock().open(self.selector)?;
        self.transport.attach(channel);
        Ok(())
    }

    /// Close the device and forget the session
    ///
    /// The next [`initialize`](Self::initialize) reopens it, which picks up a
    /// re-plugged base station.
    pub fn release(&self) {
        let _guard = self.transport.lock();
        self.transport.detach();
        *self.state.lock() = SessionState::Uninitialized;
        *self.screen.lock() = [blank_line(), blank_line()];
        debug!("Released iClicker base");
    }

    pub fn set_frequency(&self, frequency: Frequency) -> Result<()> {
        let _guard = self.transport.lock();
        debug!("Setting frequency to {}", frequency);

        pause(self.timings.settle);
        self.transport
            .sync_write(&commands::set_frequency(frequency), self.timings.ack_timeout)?;
        pause(self.timings.settle);
        self.transport
            .sync_write(&commands::confirm_frequency(), self.timings.ack_timeout)?;
        pause(self.timings.settle);
        Ok(())
    }

    /// Switch the base to the iClicker 2 protocol
    pub fn set_protocol_v2(&self) -> Result<()> {
        let _guard = self.transport.lock();
        self.transport.write(&commands::set_protocol_v2())?;
        pause(self.timings.settle);
        Ok(())
    }

    pub fn set_poll_type(&self, poll_type: PollType) -> Result<()> {
        let _guard = self.transport.lock();
        info!("Setting poll type to {}", poll_type);
        self.transport.write(&commands::set_poll_type(poll_type))?;
        pause(self.timings.settle);
        Ok(())
    }

    /// Configure the base, opening it first if needed
    pub fn initialize(&self, frequency: Frequency) -> Result<()> {
        *self.frequency.lock() = frequency;
        self.acquire()?;

        let _guard = self.transport.lock();
        info!("Initializing iClicker base");

        self.set_frequency(frequency)?;
        self.transport.write_sequence(
            &commands::sequence(commands::INIT_SEQUENCE_A),
            self.timings.drain_timeout,
        )?;
        pause(self.timings.settle);

        self.set_protocol_v2()?;
        self.transport.write_sequence(
            &commands::sequence(commands::INIT_SEQUENCE_B),
            self.timings.drain_timeout,
        )?;
        pause(self.timings.settle);

        *self.state.lock() = SessionState::Initialized;
        Ok(())
    }

    /// Initialize again with the last frequency
    pub fn reinitialize(&self) -> Result<()> {
        self.initialize(self.frequency())
    }

    pub fn start_poll(&self, poll_type: PollType) -> Result<()> {
        let _guard = self.transport.lock();
        if !self.is_initialized() {
            return Err(Error::Config(
                "cannot start a poll before the base is initialized".to_string(),
            ));
        }

        self.transport.write_sequence(
            &commands::sequence(commands::START_POLL_SEQUENCE),
            self.timings.drain_timeout,
        )?;
        pause(self.timings.settle);
        self.set_poll_type(poll_type)?;
        self.transport.write(&commands::start_polling())?;
        pause(self.timings.settle);

        *self.state.lock() = SessionState::Polling;
        debug!("Base is polling");
        Ok(())
    }

    pub fn stop_poll(&self) -> Result<()> {
        let _guard = self.transport.lock();
        self.transport.write_sequence(
            &commands::sequence(commands::STOP_POLL_SEQUENCE),
            self.timings.drain_timeout,
        )?;
        pause(self.timings.settle);

        let mut state = self.state.lock();
        if state.is_initialized() {
            *state = SessionState::Stopped;
        }
        Ok(())
    }

    /// Show `text` on one display line
    ///
    /// Does nothing before initialization or when the line already shows
    /// `text`. Writing the display too often garbles it.
    pub fn set_display_line(&self, text: &str, line: DisplayLine) -> Result<()> {
        let _guard = self.transport.lock();
        if !self.is_initialized() {
            return Ok(());
        }

        if self.screen.lock()[line.index()] == text {
            return Ok(());
        }

        self.transport.write(&commands::display_line(line, text))?;
        self.screen.lock()[line.index()] = text.to_string();
        pause(self.timings.display_settle);
        Ok(())
    }

    /// Text last written to `line`
    pub fn display_line(&self, line: DisplayLine) -> String {
        self.screen.lock()[line.index()].clone()
    }

    /// Read one frame from the reply endpoint
    pub fn read(&self) -> Result<Option<protocol::Frame>> {
        self.transport.read(self.timings.read_timeout)
    }
}
