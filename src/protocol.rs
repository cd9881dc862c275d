use crate::backend::{IoBackend, IoSnapshot, NUM_DIGITAL_OUTPUTS};
use crate::scheduler::RateSelector;
use arrayvec::ArrayString;
use core::fmt::Write;
use heapless::Vec;
use serde::Serialize;
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest single read handed to the parser.
pub const MAX_COMMAND_SIZE: usize = 255;
pub const MAX_RESPONSE_SIZE: usize = 256;

pub type ResponseBuffer = Vec<u8, MAX_RESPONSE_SIZE>;

pub const ACK: &[u8] = b"!\r\n";
pub const NACK: &[u8] = b"?\r\n";

pub const HELP_TEXT: &str = concat!(
    "Commands:\r\n",
    "  ra    - Read Analog\r\n",
    "  rd    - Read Digital\r\n",
    "  wdx,y - Set Digital Output 'x' to value 'y'\r\n",
    "  pux   - Set Packet Update Rate to x/second\r\n",
    "  h     - Help\r\n",
    "  q     - Quit\r\n",
    "  k     - Kill\r\n",
    "  \r\n",
);

pub const QUIT_FAREWELL: &str = "Dropping connection. Bye.\r\n";
pub const KILL_FAREWELL: &str = "Killing process. Bye.\r\n";

const_assert!(HELP_TEXT.len() <= MAX_RESPONSE_SIZE);

// Room for "65535, 65535, 65535, 65535\r\n"
type NumericReply = ArrayString<32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadAnalog,
    ReadDigital,
    WriteDigital { line: u8, value: bool },
    /// One-based rate selector as typed on the wire (`pu1` selects the first rate).
    SetPacketRate { selector: u8 },
    Help,
    Quit,
    Kill,
}

/// Why a read did not parse. Only ever logged; the wire sees `?\r\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("command of {0} bytes is too short")]
    TooShort(usize),
    #[error("command of {0} bytes exceeds the single-read limit")]
    TooLong(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand([u8; 2]),
    #[error("expected ',' separator, got byte {0:#04x}")]
    BadSeparator(u8),
    #[error("digital output line byte {0:#04x} is not 0..2")]
    LineOutOfRange(u8),
    #[error("digital value byte {0:#04x} is not 0 or 1")]
    ValueOutOfRange(u8),
    #[error("rate selector byte {0:#04x} is not 1..9")]
    RateOutOfRange(u8),
}

/// What the connection manager does once the reply has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Continue,
    EndSession,
    Terminate,
}

/// Decode one raw read.
///
/// The first two bytes are the command key. A read of exactly three bytes is a
/// one-letter command plus a two-byte terminator, so its second key byte is
/// taken as a space. Arguments are single ASCII digits at fixed offsets;
/// offsets past the end of the read count as NUL.
pub fn parse_command(input: &[u8]) -> Result<Command, ProtocolError> {
    if input.len() < 3 {
        return Err(ProtocolError::TooShort(input.len()));
    }
    if input.len() > MAX_COMMAND_SIZE {
        return Err(ProtocolError::TooLong(input.len()));
    }

    let key = [input[0], if input.len() == 3 { b' ' } else { input[1] }];
    let byte_at = |offset: usize| input.get(offset).copied().unwrap_or(0);

    match &key {
        b"ra" => Ok(Command::ReadAnalog),
        b"rd" => Ok(Command::ReadDigital),
        b"wd" => {
            let separator = byte_at(3);
            if separator != b',' {
                return Err(ProtocolError::BadSeparator(separator));
            }
            let line = byte_at(2).wrapping_sub(b'0');
            if usize::from(line) >= NUM_DIGITAL_OUTPUTS {
                return Err(ProtocolError::LineOutOfRange(byte_at(2)));
            }
            let value = byte_at(4).wrapping_sub(b'0');
            if value > 1 {
                return Err(ProtocolError::ValueOutOfRange(byte_at(4)));
            }
            Ok(Command::WriteDigital {
                line,
                value: value == 1,
            })
        }
        b"pu" => {
            let selector = byte_at(2).wrapping_sub(b'0');
            if !(1..=9).contains(&selector) {
                return Err(ProtocolError::RateOutOfRange(byte_at(2)));
            }
            Ok(Command::SetPacketRate { selector })
        }
        b"h " => Ok(Command::Help),
        b"q " => Ok(Command::Quit),
        b"k " => Ok(Command::Kill),
        _ => Err(ProtocolError::UnknownCommand(key)),
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CommandStats {
    pub accepted: u32,
    pub rejected: u32,
}

/// Executes parsed commands against the backend and rate selector.
///
/// The reply of the last command stays in a preallocated buffer until the next
/// call; read it with [`CommandHandler::response`].
#[derive(Debug, Default)]
pub struct CommandHandler {
    response: ResponseBuffer,
    stats: CommandStats,
}

impl CommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle<B: IoBackend>(
        &mut self,
        input: &[u8],
        backend: &mut B,
        rates: &mut RateSelector,
        snapshot: &mut IoSnapshot,
    ) -> SessionAction {
        self.response.clear();

        let command = match parse_command(input) {
            Ok(command) => command,
            Err(e) => {
                debug!(error = %e, "rejected command");
                return self.reject();
            }
        };
        debug!(?command, "received command");

        match command {
            Command::ReadAnalog => {
                refresh(backend, snapshot);
                let [a0, a1, a2, a3] = snapshot.analog_inputs;
                let mut line = NumericReply::new();
                if write!(line, "{a0}, {a1}, {a2}, {a3}\r\n").is_err() {
                    return self.reject();
                }
                self.reply(line.as_bytes());
            }
            Command::ReadDigital => {
                refresh(backend, snapshot);
                let mut line = NumericReply::new();
                if write!(line, "{}\r\n", snapshot.digital_inputs).is_err() {
                    return self.reject();
                }
                self.reply(line.as_bytes());
            }
            Command::WriteDigital { line, value } => {
                if let Err(e) = backend.write_digital(line, value) {
                    warn!(line, value, error = %e, "digital write failed");
                    return self.reject();
                }
                self.reply(ACK);
            }
            Command::SetPacketRate { selector } => {
                if let Err(e) = rates.select(usize::from(selector - 1)) {
                    debug!(error = %e, "rate selection refused");
                    return self.reject();
                }
                debug!(rate = rates.rate(), "telemetry rate changed");
                self.reply(ACK);
            }
            Command::Help => self.reply(HELP_TEXT.as_bytes()),
            Command::Quit => {
                self.stats.accepted += 1;
                return SessionAction::EndSession;
            }
            Command::Kill => {
                self.stats.accepted += 1;
                return SessionAction::Terminate;
            }
        }

        self.stats.accepted += 1;
        SessionAction::Continue
    }

    /// Reply produced by the last [`CommandHandler::handle`] call; empty for
    /// quit and kill.
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.response.clear();
        // Every reply is bounded by the help text, checked at compile time
        let _ = self.response.extend_from_slice(bytes);
    }

    fn reject(&mut self) -> SessionAction {
        self.stats.rejected += 1;
        self.reply(NACK);
        SessionAction::Continue
    }
}

fn refresh<B: IoBackend>(backend: &mut B, snapshot: &mut IoSnapshot) {
    match backend.scan() {
        Ok(fresh) => *snapshot = fresh,
        Err(e) => warn!(error = %e, "IO scan failed, replying with previous snapshot"),
    }
}
