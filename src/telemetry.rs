use crate::backend::{IoSnapshot, NUM_ANALOG_INPUTS};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

pub const TELEMETRY_PACKET_LEN: usize = 18;
pub const PREAMBLE: [u8; 4] = [0xAA; 4];

const SEQUENCE_OFFSET: usize = 4;
const DIGITAL_OUT_OFFSET: usize = 6;
const DIGITAL_IN_OFFSET: usize = 8;
const ANALOG_OFFSET: usize = 10;

const_assert_eq!(ANALOG_OFFSET + 2 * NUM_ANALOG_INPUTS, TELEMETRY_PACKET_LEN);

pub type TelemetryFrame = [u8; TELEMETRY_PACKET_LEN];

/// Decoded form of the fixed 18-byte UDP status packet.
///
/// Layout: preamble `AA AA AA AA`, sequence (u16 LE), digital outputs, `00`,
/// digital inputs, `00`, then analog channels 0..3 as u16 LE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub sequence: u16,
    pub digital_outputs: u8,
    pub digital_inputs: u8,
    pub analog_inputs: [u16; NUM_ANALOG_INPUTS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TelemetryError {
    #[error("expected an 18-byte telemetry packet, got {0} bytes")]
    WrongLength(usize),
    #[error("bad preamble {0:02X?}")]
    BadPreamble([u8; 4]),
}

impl TelemetryPacket {
    pub fn from_snapshot(sequence: u16, snapshot: &IoSnapshot) -> Self {
        Self {
            sequence,
            digital_outputs: snapshot.digital_outputs,
            digital_inputs: snapshot.digital_inputs,
            analog_inputs: snapshot.analog_inputs,
        }
    }

    pub fn encode(&self) -> TelemetryFrame {
        let mut frame = [0u8; TELEMETRY_PACKET_LEN];
        frame[..SEQUENCE_OFFSET].copy_from_slice(&PREAMBLE);
        frame[SEQUENCE_OFFSET..DIGITAL_OUT_OFFSET]
            .copy_from_slice(&self.sequence.to_le_bytes());
        frame[DIGITAL_OUT_OFFSET] = self.digital_outputs;
        frame[DIGITAL_IN_OFFSET] = self.digital_inputs;
        for (channel, value) in self.analog_inputs.iter().enumerate() {
            let offset = ANALOG_OFFSET + channel * 2;
            frame[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }
        frame
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TelemetryError> {
        if bytes.len() != TELEMETRY_PACKET_LEN {
            return Err(TelemetryError::WrongLength(bytes.len()));
        }
        let mut preamble = [0u8; 4];
        preamble.copy_from_slice(&bytes[..SEQUENCE_OFFSET]);
        if preamble != PREAMBLE {
            return Err(TelemetryError::BadPreamble(preamble));
        }

        let read_u16 = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let mut analog_inputs = [0u16; NUM_ANALOG_INPUTS];
        for (channel, value) in analog_inputs.iter_mut().enumerate() {
            *value = read_u16(ANALOG_OFFSET + channel * 2);
        }

        Ok(Self {
            sequence: read_u16(SEQUENCE_OFFSET),
            digital_outputs: bytes[DIGITAL_OUT_OFFSET],
            digital_inputs: bytes[DIGITAL_IN_OFFSET],
            analog_inputs,
        })
    }

    pub fn snapshot(&self) -> IoSnapshot {
        IoSnapshot {
            digital_outputs: self.digital_outputs,
            digital_inputs: self.digital_inputs,
            analog_inputs: self.analog_inputs,
        }
    }
}

/// Stamps snapshots with a wrapping 16-bit sequence number.
#[derive(Debug, Default)]
pub struct TelemetryEncoder {
    sequence: u16,
    packets_encoded: u64,
}

impl TelemetryEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from `sequence`; the next packet carries `sequence + 1`.
    pub fn with_sequence(sequence: u16) -> Self {
        Self {
            sequence,
            packets_encoded: 0,
        }
    }

    pub fn encode(&mut self, snapshot: &IoSnapshot) -> TelemetryFrame {
        self.sequence = self.sequence.wrapping_add(1);
        self.packets_encoded += 1;
        TelemetryPacket::from_snapshot(self.sequence, snapshot).encode()
    }

    /// Sequence number of the most recently encoded packet.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn packets_encoded(&self) -> u64 {
        self.packets_encoded
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SequenceStats {
    pub received: u64,
    pub gaps: u64,
    pub lost: u64,
    pub duplicates: u64,
}

/// Receiver-side gap detection over the wrapping sequence number.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
    stats: SequenceStats,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received sequence number, returning how many packets were
    /// skipped since the previous one.
    pub fn observe(&mut self, sequence: u16) -> u16 {
        self.stats.received += 1;
        let missing = match self.last {
            Some(last) if sequence == last => {
                self.stats.duplicates += 1;
                0
            }
            Some(last) => sequence.wrapping_sub(last).wrapping_sub(1),
            None => 0,
        };
        if missing > 0 {
            self.stats.gaps += 1;
            self.stats.lost += u64::from(missing);
        }
        self.last = Some(sequence);
        missing
    }

    pub fn stats(&self) -> SequenceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> IoSnapshot {
        IoSnapshot {
            digital_outputs: 0b101,
            digital_inputs: 0b1001,
            analog_inputs: [0x0102, 0x0304, 0x0506, 0xFFFF],
        }
    }

    #[test]
    fn test_frame_layout() {
        let mut encoder = TelemetryEncoder::new();
        let frame = encoder.encode(&sample_snapshot());

        assert_eq!(
            frame,
            [
                0xAA, 0xAA, 0xAA, 0xAA, // preamble
                0x01, 0x00, // sequence 1
                0b101, 0x00, 0b1001, 0x00, // digital out, pad, digital in, pad
                0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0xFF, 0xFF,
            ]
        );
    }

    #[test]
    fn test_sequence_wraps() {
        let mut encoder = TelemetryEncoder::with_sequence(u16::MAX - 1);
        let snapshot = IoSnapshot::default();

        for expected in [u16::MAX, 0, 1] {
            let frame = encoder.encode(&snapshot);
            assert_eq!(TelemetryPacket::decode(&frame).unwrap().sequence, expected);
        }
        assert_eq!(encoder.packets_encoded(), 3);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let frame = TelemetryEncoder::new().encode(&sample_snapshot());

        assert_eq!(
            TelemetryPacket::decode(&frame[..17]),
            Err(TelemetryError::WrongLength(17))
        );

        let mut corrupted = frame;
        corrupted[2] = 0x55;
        assert_eq!(
            TelemetryPacket::decode(&corrupted),
            Err(TelemetryError::BadPreamble([0xAA, 0xAA, 0x55, 0xAA]))
        );
    }

    #[test]
    fn test_tracker_counts_gaps_across_wrap() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(65534), 0);
        assert_eq!(tracker.observe(65535), 0);
        assert_eq!(tracker.observe(2), 2);
        assert_eq!(tracker.observe(2), 0);

        let stats = tracker.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.gaps, 1);
        assert_eq!(stats.lost, 2);
        assert_eq!(stats.duplicates, 1);
    }
}
