pub mod simulated;
pub mod recording;

pub use simulated::SimulatedIo;
pub use recording::{RecordingIo, RecordingHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Board layout: D2..D4 are outputs, D5..D8 inputs, A0..A3 analog
pub const NUM_DIGITAL_OUTPUTS: usize = 3;
pub const NUM_DIGITAL_INPUTS: usize = 4;
pub const NUM_ANALOG_INPUTS: usize = 4;

/// Latest readings captured from the IO backend.
///
/// `digital_inputs` has bit `i` set when input channel `i` reads high. Channels
/// that failed to initialise always contribute 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IoSnapshot {
    pub digital_outputs: u8,
    pub digital_inputs: u8,
    pub analog_inputs: [u16; NUM_ANALOG_INPUTS],
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO backend used before successful init")]
    NotInitialized,
    #[error("digital output line {0} does not exist")]
    InvalidLine(u8),
    #[error("{kind} channel {channel} failed to initialise")]
    ChannelInit { kind: &'static str, channel: usize },
    #[error("hardware fault: {0}")]
    Hardware(String),
}

/// Hardware abstraction consumed by the server.
///
/// `scan` and `write_digital` must only be called after `init` returned `Ok`.
pub trait IoBackend {
    fn init(&mut self) -> Result<(), IoError>;
    fn scan(&mut self) -> Result<IoSnapshot, IoError>;
    fn write_digital(&mut self, line: u8, value: bool) -> Result<(), IoError>;
    fn close(&mut self);
}
