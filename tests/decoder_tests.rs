use smbus_spy::decoder::{BusDecoder, BusEvent, LineLevels};
use smbus_spy::trace::{parse_trace, ScriptedLines, TraceBuilder};

fn drain(decoder: &mut BusDecoder) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Some(event) = decoder.next_event() {
        events.push(event);
    }
    events
}

fn decode_all(samples: Vec<LineLevels>) -> Vec<BusEvent> {
    let mut decoder = BusDecoder::new();
    let mut events = Vec::new();
    for levels in samples {
        decoder.step(levels);
        events.extend(drain(&mut decoder));
    }
    events
}

#[test]
fn test_start_condition_detected() {
    let mut decoder = BusDecoder::new();
    decoder.step(LineLevels::IDLE);
    // SDA falls while SCL is high.
    decoder.step(LineLevels::new(true, false));

    assert_eq!(drain(&mut decoder), vec![BusEvent::Start]);
}

#[test]
fn test_sda_fall_with_clock_low_is_not_a_start() {
    let mut decoder = BusDecoder::new();
    decoder.step(LineLevels::IDLE);
    decoder.step(LineLevels::new(false, true));
    decoder.step(LineLevels::new(false, false));

    assert!(drain(&mut decoder).is_empty());
}

#[test]
fn test_write_transaction_event_sequence() {
    let samples = TraceBuilder::new()
        .write_transaction(0x10, 0x20, &[50])
        .build();

    let events = decode_all(samples);
    assert_eq!(
        events,
        vec![
            BusEvent::Start,
            BusEvent::Address { byte: 0x20, read: false },
            BusEvent::Ack,
            BusEvent::Data { byte: 0x20 },
            BusEvent::Ack,
            BusEvent::Data { byte: 50 },
            BusEvent::Ack,
            BusEvent::Stop,
        ]
    );
}

#[test]
fn test_address_read_bit() {
    let samples = TraceBuilder::new().read_transaction(0x4C, &[35]).build();

    let events = decode_all(samples);
    assert_eq!(events[0], BusEvent::Start);
    assert_eq!(events[1], BusEvent::Address { byte: (0x4C << 1) | 1, read: true });
    assert_eq!(events[2], BusEvent::Ack);
    assert_eq!(events[3], BusEvent::Data { byte: 35 });
}

#[test]
fn test_nack_terminated_byte() {
    let mut builder = TraceBuilder::new();
    builder.start();
    builder.byte((0x4C << 1) | 1, true);
    builder.byte(0x2C, false);
    builder.stop();

    let events = decode_all(builder.build());
    assert_eq!(
        events,
        vec![
            BusEvent::Start,
            BusEvent::Address { byte: (0x4C << 1) | 1, read: true },
            BusEvent::Ack,
            BusEvent::Data { byte: 0x2C },
            BusEvent::Nack,
            BusEvent::Stop,
        ]
    );
}

#[test]
fn test_repeated_start_resynchronizes_bit_shifter() {
    // Three clocked bits, then a fresh start; the partial byte must not
    // contaminate the address that follows.
    let mut builder = TraceBuilder::new();
    builder.start();
    for _ in 0..3 {
        builder.byte(0xFF, true);
    }
    let mut samples = builder.build();
    samples.truncate(samples.len() - 10); // chop mid-byte
    let tail = TraceBuilder::new().write_transaction(0x10, 0x30, &[1]).build();
    samples.extend(tail);

    let events = decode_all(samples);
    let last_address = events
        .iter()
        .rev()
        .find_map(|event| match event {
            BusEvent::Address { byte, read } => Some((*byte, *read)),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_address, (0x10 << 1, false));
    assert_eq!(events.last(), Some(&BusEvent::Stop));
}

#[test]
fn test_nothing_decoded_before_first_start() {
    // Clock activity with no start condition yields no data events.
    let mut builder = TraceBuilder::new();
    builder.byte(0xA5, true);
    let events = decode_all(builder.build());
    assert!(events.is_empty());
}

#[test]
fn test_event_queue_overrun_counted() {
    let mut builder = TraceBuilder::new();
    for _ in 0..12 {
        builder.write_transaction(0x10, 0x20, &[50]);
    }

    let mut decoder = BusDecoder::new();
    for levels in builder.build() {
        decoder.step(levels);
    }

    assert_eq!(decoder.pending_events(), 64);
    assert!(decoder.overruns() > 0);
}

#[test]
fn test_reset_clears_queue_and_state() {
    let mut decoder = BusDecoder::new();
    for levels in TraceBuilder::new().write_transaction(0x10, 0x20, &[50]).build() {
        decoder.step(levels);
    }
    assert!(decoder.pending_events() > 0);

    decoder.reset();
    assert_eq!(decoder.pending_events(), 0);
    assert_eq!(decoder.next_event(), None);
}

#[test]
fn test_scripted_lines_hold_last_level_when_exhausted() {
    let mut lines = ScriptedLines::new(vec![LineLevels::new(false, false)]);
    let mut decoder = BusDecoder::new();
    decoder.poll(&mut lines);
    assert!(lines.exhausted());

    // Exhausted source keeps returning the last level; no phantom edges.
    decoder.poll(&mut lines);
    decoder.poll(&mut lines);
    assert_eq!(decoder.pending_events(), 0);
}

#[test]
fn test_parse_trace_text_format() {
    let text = "# scl sda\n1 1\n1 0\n\n0 0  # clock low\n";
    let samples = parse_trace(text).unwrap();
    assert_eq!(
        samples,
        vec![
            LineLevels::IDLE,
            LineLevels::new(true, false),
            LineLevels::new(false, false),
        ]
    );
}

#[test]
fn test_parse_trace_rejects_malformed_line() {
    let error = parse_trace("1 1\n1 2\n").unwrap_err();
    assert!(error.to_string().contains("line 2"));
}
