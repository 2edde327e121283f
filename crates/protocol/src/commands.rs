//! Base station command builders and canned command sequences
//!
//! The builders encode the commands whose meaning is understood. The
//! sequences below were captured from the vendor software's USB traffic and
//! are replayed byte for byte; their individual steps are not understood and
//! must not be "cleaned up".

use crate::frame::{FRAME_SIZE, Frame};
use crate::types::{Frequency, PollType};

/// Width of one display line in characters
pub const DISPLAY_WIDTH: usize = 16;

/// Character substituted for anything the display cannot show
pub const DISPLAY_PLACEHOLDER: u8 = b'?';

/// Captured: frequency confirm and stop/reset cadence, sent after `SetFrequency`
pub const INIT_SEQUENCE_A: &[&[u8]] = &[
    &[0x01, 0x2a, 0x21, 0x41, 0x05],
    &[0x01, 0x12],
    &[0x01, 0x15],
    &[0x01, 0x16],
];

/// Captured: protocol handshake, sent after selecting the version 2 protocol
pub const INIT_SEQUENCE_B: &[&[u8]] = &[
    &[0x01, 0x29, 0xa1, 0x8f, 0x96, 0x8d, 0x99, 0x97, 0x8f],
    &[0x01, 0x17, 0x04],
    &[0x01, 0x17, 0x03],
    &[0x01, 0x16],
];

/// Captured: sent before selecting the poll type
pub const START_POLL_SEQUENCE: &[&[u8]] = &[&[0x01, 0x17, 0x03], &[0x01, 0x17, 0x05]];

/// Captured: ends a poll
pub const STOP_POLL_SEQUENCE: &[&[u8]] = &[
    &[0x01, 0x12],
    &[0x01, 0x16],
    &[0x01, 0x17, 0x01],
    &[0x01, 0x17, 0x03],
    &[0x01, 0x17, 0x04],
];

/// Turn a captured sequence into frames
pub fn sequence(steps: &[&[u8]]) -> Vec<Frame> {
    steps.iter().map(|step| Frame::from_bytes(step)).collect()
}

/// `01 10 (21+f1) (41+f2)`: select operating frequency
pub fn set_frequency(frequency: Frequency) -> Frame {
    Frame::from_bytes(&[
        0x01,
        0x10,
        0x21 + frequency.first.value(),
        0x41 + frequency.second.value(),
    ])
}

/// `01 16`: confirm the frequency change; also acknowledged by the device
pub fn confirm_frequency() -> Frame {
    Frame::from_bytes(&[0x01, 0x16])
}

/// `01 2d`: switch to the iClicker 2 protocol
pub fn set_protocol_v2() -> Frame {
    Frame::from_bytes(&[0x01, 0x2d])
}

/// `01 19 (66+k) 0a 01`: select the poll type
pub fn set_poll_type(poll_type: PollType) -> Frame {
    Frame::from_bytes(&[0x01, 0x19, 0x66 + poll_type.code(), 0x0a, 0x01])
}

/// `01 11`
pub fn start_polling() -> Frame {
    Frame::from_bytes(&[0x01, 0x11])
}

/// `01 12`
pub fn stop_polling() -> Frame {
    Frame::from_bytes(&[0x01, 0x12])
}

/// Which of the two display lines to write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayLine {
    Top,
    Bottom,
}

impl DisplayLine {
    /// Index into the display buffer
    pub fn index(self) -> usize {
        match self {
            DisplayLine::Top => 0,
            DisplayLine::Bottom => 1,
        }
    }

    fn command(self) -> u8 {
        match self {
            DisplayLine::Top => 0x13,
            DisplayLine::Bottom => 0x14,
        }
    }
}

/// Fit text to exactly one display line: left aligned, space padded
pub fn fit_display_text(text: &str) -> String {
    let mut line: String = text.chars().take(DISPLAY_WIDTH).collect();
    let len = line.chars().count();
    line.extend(std::iter::repeat_n(' ', DISPLAY_WIDTH - len));
    line
}

/// `01 13|14` followed by 16 character codes
pub fn display_line(line: DisplayLine, text: &str) -> Frame {
    let mut bytes = Vec::with_capacity(FRAME_SIZE);
    bytes.extend_from_slice(&[0x01, line.command()]);
    bytes.extend(fit_display_text(text).chars().map(|c| {
        if c.is_ascii() {
            c as u8
        } else {
            DISPLAY_PLACEHOLDER
        }
    }));
    Frame::from_bytes(&bytes)
}
