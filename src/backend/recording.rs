use super::{IoBackend, IoError, IoSnapshot, NUM_DIGITAL_OUTPUTS};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RecordingState {
    initialized: bool,
    closed: bool,
    snapshot: IoSnapshot,
    writes: Vec<(u8, bool)>,
    scans: u64,
    fail_writes: bool,
}

/// Deterministic backend that serves a fixed snapshot and records every write.
///
/// The backend is moved into the server; keep a [`RecordingHandle`] to inspect
/// or change its state from outside.
#[derive(Debug, Default)]
pub struct RecordingIo {
    state: Arc<Mutex<RecordingState>>,
}

/// Shared view of a [`RecordingIo`].
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    state: Arc<Mutex<RecordingState>>,
}

fn lock(state: &Mutex<RecordingState>) -> MutexGuard<'_, RecordingState> {
    // A panic while holding the lock leaves plain data behind; keep using it.
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl RecordingIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: IoSnapshot) -> Self {
        let io = Self::new();
        lock(&io.state).snapshot = snapshot;
        io
    }

    pub fn handle(&self) -> RecordingHandle {
        RecordingHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl RecordingHandle {
    pub fn set_snapshot(&self, snapshot: IoSnapshot) {
        lock(&self.state).snapshot = snapshot;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn writes(&self) -> Vec<(u8, bool)> {
        lock(&self.state).writes.clone()
    }

    pub fn scans(&self) -> u64 {
        lock(&self.state).scans
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl IoBackend for RecordingIo {
    fn init(&mut self) -> Result<(), IoError> {
        let mut state = lock(&self.state);
        state.initialized = true;
        state.closed = false;
        Ok(())
    }

    fn scan(&mut self) -> Result<IoSnapshot, IoError> {
        let mut state = lock(&self.state);
        if !state.initialized {
            return Err(IoError::NotInitialized);
        }
        state.scans += 1;
        Ok(state.snapshot)
    }

    fn write_digital(&mut self, line: u8, value: bool) -> Result<(), IoError> {
        let mut state = lock(&self.state);
        if !state.initialized {
            return Err(IoError::NotInitialized);
        }
        if state.fail_writes {
            return Err(IoError::Hardware(format!("write to line {line} rejected")));
        }
        if usize::from(line) >= NUM_DIGITAL_OUTPUTS {
            return Err(IoError::InvalidLine(line));
        }
        state.writes.push((line, value));
        if value {
            state.snapshot.digital_outputs |= 1 << line;
        } else {
            state.snapshot.digital_outputs &= !(1 << line);
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.initialized = false;
        state.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_observes_writes() {
        let mut io = RecordingIo::new();
        let handle = io.handle();
        io.init().unwrap();

        io.write_digital(1, true).unwrap();
        io.write_digital(1, false).unwrap();

        assert_eq!(handle.writes(), vec![(1, true), (1, false)]);
        assert_eq!(io.scan().unwrap().digital_outputs, 0);
        assert_eq!(handle.scans(), 1);
    }

    #[test]
    fn test_uninitialised_backend_refuses_io() {
        let mut io = RecordingIo::new();
        assert!(io.scan().is_err());
        assert!(io.write_digital(0, true).is_err());
        assert!(io.handle().writes().is_empty());
    }

    #[test]
    fn test_close_marks_handle() {
        let mut io = RecordingIo::new();
        let handle = io.handle();
        io.init().unwrap();
        io.close();
        assert!(handle.is_closed());
        assert!(!handle.is_initialized());
    }
}
