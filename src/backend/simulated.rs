use super::{
    IoBackend, IoError, IoSnapshot, NUM_ANALOG_INPUTS, NUM_DIGITAL_INPUTS, NUM_DIGITAL_OUTPUTS,
};
use tracing::{debug, info};

// 10-bit ADC, matching the default analog resolution of the target board
const ADC_MAX: u16 = 1023;
// Input channel 2 (D7) never comes up on the reference board
const DEFAULT_FAILED_INPUTS: u8 = 0b0100;

/// Simulated board used when no hardware driver is available.
///
/// Analog channels follow triangle waves of different slopes unless pinned
/// with [`SimulatedIo::set_analog`]. Digital inputs hold whatever was last set
/// through [`SimulatedIo::set_digital_input`].
#[derive(Debug)]
pub struct SimulatedIo {
    initialized: bool,
    fail_init: bool,
    outputs: u8,
    input_levels: [bool; NUM_DIGITAL_INPUTS],
    failed_inputs: u8,
    pinned_analog: [Option<u16>; NUM_ANALOG_INPUTS],
    scan_count: u32,
}

impl SimulatedIo {
    pub fn new() -> Self {
        Self {
            initialized: false,
            fail_init: false,
            outputs: 0,
            input_levels: [false; NUM_DIGITAL_INPUTS],
            failed_inputs: DEFAULT_FAILED_INPUTS,
            pinned_analog: [None; NUM_ANALOG_INPUTS],
            scan_count: 0,
        }
    }

    /// Mark input channels (bit per channel) as failed to initialise.
    #[must_use]
    pub fn with_failed_inputs(mut self, mask: u8) -> Self {
        self.failed_inputs = mask;
        self
    }

    /// Make `init` fail, for exercising startup error paths.
    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn set_digital_input(&mut self, channel: usize, level: bool) {
        if let Some(slot) = self.input_levels.get_mut(channel) {
            *slot = level;
        }
    }

    pub fn set_analog(&mut self, channel: usize, value: Option<u16>) {
        if let Some(slot) = self.pinned_analog.get_mut(channel) {
            *slot = value.map(|v| v.min(ADC_MAX));
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn analog_reading(&self, channel: usize) -> u16 {
        if let Some(value) = self.pinned_analog[channel] {
            return value;
        }
        let period = u32::from(ADC_MAX) * 2;
        let slope = channel as u32 + 1;
        let phase = self.scan_count.wrapping_mul(slope * 7) % period;
        if phase > u32::from(ADC_MAX) {
            (period - phase) as u16
        } else {
            phase as u16
        }
    }
}

impl Default for SimulatedIo {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for SimulatedIo {
    fn init(&mut self) -> Result<(), IoError> {
        if self.fail_init {
            return Err(IoError::ChannelInit {
                kind: "digital output",
                channel: 0,
            });
        }
        for channel in 0..NUM_DIGITAL_INPUTS {
            if self.failed_inputs & (1 << channel) != 0 {
                debug!(channel, "digital input unavailable, will read as 0");
            }
        }
        self.initialized = true;
        info!(
            outputs = NUM_DIGITAL_OUTPUTS,
            inputs = NUM_DIGITAL_INPUTS,
            analog = NUM_ANALOG_INPUTS,
            "simulated IO initialised"
        );
        Ok(())
    }

    fn scan(&mut self) -> Result<IoSnapshot, IoError> {
        if !self.initialized {
            return Err(IoError::NotInitialized);
        }
        self.scan_count = self.scan_count.wrapping_add(1);

        let mut digital_inputs = 0u8;
        for (channel, level) in self.input_levels.iter().enumerate() {
            if self.failed_inputs & (1 << channel) == 0 && *level {
                digital_inputs |= 1 << channel;
            }
        }

        let mut analog_inputs = [0u16; NUM_ANALOG_INPUTS];
        for (channel, reading) in analog_inputs.iter_mut().enumerate() {
            *reading = self.analog_reading(channel);
        }

        Ok(IoSnapshot {
            digital_outputs: self.outputs,
            digital_inputs,
            analog_inputs,
        })
    }

    fn write_digital(&mut self, line: u8, value: bool) -> Result<(), IoError> {
        if !self.initialized {
            return Err(IoError::NotInitialized);
        }
        if usize::from(line) >= NUM_DIGITAL_OUTPUTS {
            return Err(IoError::InvalidLine(line));
        }
        if value {
            self.outputs |= 1 << line;
        } else {
            self.outputs &= !(1 << line);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.initialized {
            self.initialized = false;
            debug!("simulated IO closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_before_init_is_rejected() {
        let mut io = SimulatedIo::new();
        assert!(matches!(io.scan(), Err(IoError::NotInitialized)));
        assert!(matches!(io.write_digital(0, true), Err(IoError::NotInitialized)));
    }

    #[test]
    fn test_failed_input_channel_reads_zero() {
        let mut io = SimulatedIo::new();
        io.init().unwrap();
        for channel in 0..NUM_DIGITAL_INPUTS {
            io.set_digital_input(channel, true);
        }

        let snapshot = io.scan().unwrap();
        assert_eq!(snapshot.digital_inputs, 0b1011);
    }

    #[test]
    fn test_output_echo_tracks_writes() {
        let mut io = SimulatedIo::new();
        io.init().unwrap();

        io.write_digital(0, true).unwrap();
        io.write_digital(2, true).unwrap();
        assert_eq!(io.scan().unwrap().digital_outputs, 0b101);

        io.write_digital(0, false).unwrap();
        assert_eq!(io.scan().unwrap().digital_outputs, 0b100);

        assert!(matches!(io.write_digital(3, true), Err(IoError::InvalidLine(3))));
    }

    #[test]
    fn test_analog_stays_within_adc_range() {
        let mut io = SimulatedIo::new();
        io.init().unwrap();
        io.set_analog(1, Some(5000));

        for _ in 0..3000 {
            let snapshot = io.scan().unwrap();
            assert!(snapshot.analog_inputs.iter().all(|v| *v <= ADC_MAX));
            assert_eq!(snapshot.analog_inputs[1], ADC_MAX);
        }
    }

    #[test]
    fn test_failing_init() {
        let mut io = SimulatedIo::new().failing_init();
        assert!(io.init().is_err());
        assert!(!io.is_initialized());
    }
}
