use gpiolink::backend::{IoBackend, IoSnapshot, RecordingIo};
use gpiolink::protocol::*;
use gpiolink::scheduler::RateSelector;

struct Harness {
    handler: CommandHandler,
    backend: RecordingIo,
    rates: RateSelector,
    snapshot: IoSnapshot,
}

impl Harness {
    fn new() -> Self {
        Self::with_snapshot(IoSnapshot::default())
    }

    fn with_snapshot(snapshot: IoSnapshot) -> Self {
        let mut backend = RecordingIo::with_snapshot(snapshot);
        backend.init().unwrap();
        Self {
            handler: CommandHandler::new(),
            backend,
            rates: RateSelector::default(),
            snapshot: IoSnapshot::default(),
        }
    }

    fn send(&mut self, input: &[u8]) -> (Vec<u8>, SessionAction) {
        let action = self.handler.handle(
            input,
            &mut self.backend,
            &mut self.rates,
            &mut self.snapshot,
        );
        (self.handler.response().to_vec(), action)
    }
}

#[test]
fn test_valid_digital_writes_are_acknowledged() {
    for line in 0..3u8 {
        for value in 0..2u8 {
            let mut harness = Harness::new();
            let handle = harness.backend.handle();
            let input = [b'w', b'd', b'0' + line, b',', b'0' + value, b'\r', b'\n'];

            let (reply, action) = harness.send(&input);
            assert_eq!(reply, ACK);
            assert_eq!(action, SessionAction::Continue);
            assert_eq!(handle.writes(), vec![(line, value == 1)]);
        }
    }
}

#[test]
fn test_invalid_digital_writes_never_reach_backend() {
    let inputs: [&[u8]; 8] = [
        b"wd3,1\r\n",
        b"wd9,0\r\n",
        b"wd0,2\r\n",
        b"wd1;1\r\n",
        b"wd1 1\r\n",
        b"wdx,1\r\n",
        b"wd1,\r\n",
        b"wd\r\n",
    ];

    for input in inputs {
        let mut harness = Harness::new();
        let handle = harness.backend.handle();

        let (reply, action) = harness.send(input);
        assert_eq!(reply, NACK, "input {:?}", String::from_utf8_lossy(input));
        assert_eq!(reply.len(), 3);
        assert_eq!(action, SessionAction::Continue);
        assert!(handle.writes().is_empty());
    }
}

#[test]
fn test_backend_write_failure_is_nacked() {
    let mut harness = Harness::new();
    harness.backend.handle().set_fail_writes(true);

    let (reply, _) = harness.send(b"wd0,1\r\n");
    assert_eq!(reply, NACK);
    assert_eq!(harness.handler.stats().rejected, 1);
}

#[test]
fn test_rate_selection() {
    let mut harness = Harness::new();

    for selector in 1..=9u8 {
        let (reply, _) = harness.send(&[b'p', b'u', b'0' + selector, b'\r', b'\n']);
        assert_eq!(reply, ACK);
        assert_eq!(harness.rates.index(), usize::from(selector - 1));
    }
    assert_eq!(harness.rates.rate(), 10000);
}

#[test]
fn test_bad_rate_selection_keeps_rate() {
    let mut harness = Harness::new();

    for input in [&b"pu0\r\n"[..], b"pua\r\n", b"pu\r\n", b"pu:\r\n"] {
        let (reply, _) = harness.send(input);
        assert_eq!(reply, NACK);
        assert_eq!(harness.rates.rate(), 10);
    }
}

#[test]
fn test_rate_selector_beyond_short_table() {
    let mut harness = Harness::new();
    harness.rates = RateSelector::new(&[20, 40], 0).unwrap();

    let (reply, _) = harness.send(b"pu2\r\n");
    assert_eq!(reply, ACK);
    assert_eq!(harness.rates.rate(), 40);

    let (reply, _) = harness.send(b"pu3\r\n");
    assert_eq!(reply, NACK);
    assert_eq!(harness.rates.rate(), 40);
}

#[test]
fn test_read_analog_format() {
    let mut harness = Harness::with_snapshot(IoSnapshot {
        analog_inputs: [10, 20, 30, 40],
        ..IoSnapshot::default()
    });

    let (reply, _) = harness.send(b"ra\r\n");
    assert_eq!(reply, b"10, 20, 30, 40\r\n");
    assert_eq!(harness.snapshot.analog_inputs, [10, 20, 30, 40]);
    assert_eq!(harness.backend.handle().scans(), 1);
}

#[test]
fn test_read_digital_format() {
    let mut harness = Harness::with_snapshot(IoSnapshot {
        digital_inputs: 5,
        ..IoSnapshot::default()
    });

    let (reply, _) = harness.send(b"rd\r\n");
    assert_eq!(reply, b"5\r\n");

    harness.backend.handle().set_snapshot(IoSnapshot {
        digital_inputs: 0b1011,
        ..IoSnapshot::default()
    });
    let (reply, _) = harness.send(b"rd\r\n");
    assert_eq!(reply, b"11\r\n");
}

#[test]
fn test_help_is_literal() {
    let mut harness = Harness::new();

    let (reply, action) = harness.send(b"h\r\n");
    assert_eq!(reply, HELP_TEXT.as_bytes());
    assert!(reply.starts_with(b"Commands:\r\n  ra    - Read Analog\r\n"));
    assert!(!reply.contains(&0));
    assert_eq!(action, SessionAction::Continue);
}

#[test]
fn test_quit_and_kill_have_no_command_reply() {
    let mut harness = Harness::new();

    let (reply, action) = harness.send(b"q\r\n");
    assert!(reply.is_empty());
    assert_eq!(action, SessionAction::EndSession);

    let (reply, action) = harness.send(b"k\r\n");
    assert!(reply.is_empty());
    assert_eq!(action, SessionAction::Terminate);

    // A literal space in place of the padding byte is the same command
    let (_, action) = harness.send(b"q \r\n");
    assert_eq!(action, SessionAction::EndSession);
}

#[test]
fn test_unknown_and_short_input() {
    let mut harness = Harness::new();

    for input in [&b"zz\r\n"[..], b"xy\r\n", b"RA\r\n", b"\r\n", b"", b"q\n"] {
        let (reply, action) = harness.send(input);
        assert_eq!(reply, b"?\r\n", "input {:?}", String::from_utf8_lossy(input));
        assert_eq!(action, SessionAction::Continue);
    }
    assert_eq!(harness.handler.stats().accepted, 0);
}

#[test]
fn test_reply_is_replaced_per_command() {
    let mut harness = Harness::with_snapshot(IoSnapshot {
        analog_inputs: [1023, 0, 512, 7],
        ..IoSnapshot::default()
    });

    let (reply, _) = harness.send(b"ra\r\n");
    assert_eq!(reply, b"1023, 0, 512, 7\r\n");

    let (reply, _) = harness.send(b"wd2,1\r\n");
    assert_eq!(reply, ACK);

    let stats = harness.handler.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.rejected, 0);
}
