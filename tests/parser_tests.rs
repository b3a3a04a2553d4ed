use smbus_spy::cache::TelemetryCache;
use smbus_spy::decoder::BusEvent;
use smbus_spy::parser::{EepromLayout, SessionParser, ADDR_EEPROM, ADDR_SMC, ADDR_TEMP_SENSOR};

fn write_addr(addr7: u8) -> BusEvent {
    BusEvent::Address { byte: addr7 << 1, read: false }
}

fn read_addr(addr7: u8) -> BusEvent {
    BusEvent::Address { byte: (addr7 << 1) | 1, read: true }
}

fn feed_all(parser: &mut SessionParser, cache: &mut TelemetryCache, events: &[BusEvent], start_ms: u64) -> u64 {
    let mut now_ms = start_ms;
    for &event in events {
        parser.feed(event, now_ms, cache);
        now_ms += 1;
    }
    now_ms
}

#[test]
fn test_fan_write_committed_at_stop() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    let now = feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_SMC),
            BusEvent::Data { byte: 0x20 },
            BusEvent::Data { byte: 50 },
        ],
        0,
    );
    // Transaction still open: nothing committed yet.
    assert!(cache.read().fan_percent.is_none());

    parser.feed(BusEvent::Stop, now, &mut cache);
    assert_eq!(cache.read().fan_percent.unwrap().value, 50);
    assert_eq!(parser.stats().fields_written, 1);
}

#[test]
fn test_truncating_start_discards_pending_write() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_SMC),
            BusEvent::Data { byte: 0x20 },
            BusEvent::Data { byte: 50 },
            // New start before the stop: the fan write above never lands.
            BusEvent::Start,
            write_addr(ADDR_SMC),
            BusEvent::Data { byte: 0x2C },
            BusEvent::Data { byte: 45 },
            BusEvent::Stop,
        ],
        0,
    );

    let snapshot = cache.read();
    assert!(snapshot.fan_percent.is_none());
    assert_eq!(snapshot.cpu_temp_c.unwrap().value, 45);
    assert!(parser.stats().sessions_reset >= 1);
}

#[test]
fn test_session_timeout_commits_pending_write() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_SMC),
            BusEvent::Data { byte: 0x2D },
            BusEvent::Data { byte: 28 },
        ],
        0,
    );
    assert!(cache.read().ambient_temp_c.is_none());

    // Longer than the inactivity threshold with no stop in sight.
    parser.expire(500, &mut cache);
    assert_eq!(cache.read().ambient_temp_c.unwrap().value, 28);
    assert_eq!(parser.stats().session_timeouts, 1);
}

#[test]
fn test_app_code_mapped_to_name() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_SMC),
            BusEvent::Data { byte: 0x30 },
            BusEvent::Data { byte: 1 },
            BusEvent::Stop,
        ],
        0,
    );
    assert_eq!(cache.read().app.unwrap().value.as_str(), "Game");

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_SMC),
            BusEvent::Data { byte: 0x30 },
            BusEvent::Data { byte: 42 },
            BusEvent::Stop,
        ],
        10,
    );
    assert_eq!(cache.read().app.unwrap().value.as_str(), "Unknown");
}

#[test]
fn test_implausible_temperature_rejected() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_SMC),
            BusEvent::Data { byte: 0x2C },
            BusEvent::Data { byte: 110 },
            BusEvent::Stop,
        ],
        0,
    );

    assert!(cache.read().cpu_temp_c.is_none());
    assert_eq!(parser.stats().samples_rejected, 1);
    assert_eq!(parser.stats().fields_written, 0);
}

#[test]
fn test_temp_sensor_pointer_then_read() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    // Pointer write selects the CPU register; the data arrives in a
    // separate read transaction with no pointer byte on the wire.
    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_TEMP_SENSOR),
            BusEvent::Data { byte: 0x01 },
            BusEvent::Stop,
            BusEvent::Start,
            read_addr(ADDR_TEMP_SENSOR),
            BusEvent::Data { byte: 47 },
            BusEvent::Stop,
        ],
        0,
    );
    assert_eq!(cache.read().cpu_temp_c.unwrap().value, 47);
}

#[test]
fn test_repeated_read_reuses_remembered_pointer() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    let now = feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_TEMP_SENSOR),
            BusEvent::Data { byte: 0x00 },
            BusEvent::Stop,
            BusEvent::Start,
            read_addr(ADDR_TEMP_SENSOR),
            BusEvent::Data { byte: 24 },
            BusEvent::Stop,
        ],
        0,
    );
    assert_eq!(cache.read().ambient_temp_c.unwrap().value, 24);

    // Second read, still no pointer sent: attribution survives.
    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            read_addr(ADDR_TEMP_SENSOR),
            BusEvent::Data { byte: 26 },
            BusEvent::Stop,
        ],
        now,
    );
    assert_eq!(cache.read().ambient_temp_c.unwrap().value, 26);
}

#[test]
fn test_read_without_any_pointer_is_unattributable() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            read_addr(ADDR_TEMP_SENSOR),
            BusEvent::Data { byte: 55 },
            BusEvent::Stop,
        ],
        0,
    );

    let snapshot = cache.read();
    assert!(snapshot.cpu_temp_c.is_none());
    assert!(snapshot.ambient_temp_c.is_none());
}

fn mac_events(layout: EepromLayout, octets: &[u8]) -> Vec<BusEvent> {
    let mut events = vec![
        BusEvent::Start,
        write_addr(ADDR_EEPROM),
        BusEvent::Data { byte: layout.mac_base() },
        BusEvent::Stop,
        BusEvent::Start,
        read_addr(ADDR_EEPROM),
    ];
    events.extend(octets.iter().map(|&byte| BusEvent::Data { byte }));
    events.push(BusEvent::Stop);
    events
}

#[test]
fn test_mac_capture_complete() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &mac_events(EepromLayout::Retail, &[0x00, 0x50, 0xF2, 0xAB, 0xCD, 0xEF]),
        0,
    );
    assert_eq!(cache.read().mac.unwrap().value.as_str(), "00:50:F2:AB:CD:EF");
}

#[test]
fn test_truncated_mac_capture_never_written() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    // Only five of six octets before the stop: the capture is torn.
    feed_all(
        &mut parser,
        &mut cache,
        &mac_events(EepromLayout::Retail, &[0x00, 0x50, 0xF2, 0xAB, 0xCD]),
        0,
    );
    assert!(cache.read().mac.is_none());
}

#[test]
fn test_mac_base_differs_per_layout() {
    // A retail-offset MAC read parsed under the late-firmware layout must
    // not produce a MAC.
    let mut parser = SessionParser::new(EepromLayout::LateFirmware);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &mac_events(EepromLayout::Retail, &[0x00, 0x50, 0xF2, 0xAB, 0xCD, 0xEF]),
        0,
    );
    assert!(cache.read().mac.is_none());

    let mut parser = SessionParser::new(EepromLayout::LateFirmware);
    let mut cache = TelemetryCache::new();
    feed_all(
        &mut parser,
        &mut cache,
        &mac_events(EepromLayout::LateFirmware, &[0x00, 0x50, 0xF2, 0x01, 0x02, 0x03]),
        0,
    );
    assert_eq!(cache.read().mac.unwrap().value.as_str(), "00:50:F2:01:02:03");
}

#[test]
fn test_ip_capture() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_EEPROM),
            BusEvent::Data { byte: 0x6A },
            BusEvent::Stop,
            BusEvent::Start,
            read_addr(ADDR_EEPROM),
            BusEvent::Data { byte: 192 },
            BusEvent::Data { byte: 168 },
            BusEvent::Data { byte: 0 },
            BusEvent::Data { byte: 2 },
            BusEvent::Stop,
        ],
        0,
    );
    assert_eq!(cache.read().ip.unwrap().value.as_str(), "192.168.0.2");
}

#[test]
fn test_serial_capture_cleans_padding() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    let mut events = vec![
        BusEvent::Start,
        write_addr(ADDR_EEPROM),
        BusEvent::Data { byte: EepromLayout::Retail.serial_base() },
        BusEvent::Stop,
        BusEvent::Start,
        read_addr(ADDR_EEPROM),
    ];
    for &byte in b"1234567\0\xFF\xFF\xFF\xFF" {
        events.push(BusEvent::Data { byte });
    }
    events.push(BusEvent::Stop);

    feed_all(&mut parser, &mut cache, &events, 0);
    assert_eq!(cache.read().serial.unwrap().value.as_str(), "1234567");
}

#[test]
fn test_region_read_committed_at_stop() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(ADDR_EEPROM),
            BusEvent::Data { byte: 0x58 },
            BusEvent::Stop,
            BusEvent::Start,
            read_addr(ADDR_EEPROM),
            BusEvent::Data { byte: 0x02 },
            BusEvent::Stop,
        ],
        0,
    );
    assert_eq!(cache.read().region.unwrap().value.as_str(), "PAL");
}

#[test]
fn test_unknown_device_ignored() {
    let mut parser = SessionParser::new(EepromLayout::Retail);
    let mut cache = TelemetryCache::new();

    feed_all(
        &mut parser,
        &mut cache,
        &[
            BusEvent::Start,
            write_addr(0x45),
            BusEvent::Data { byte: 0x20 },
            BusEvent::Data { byte: 99 },
            BusEvent::Stop,
        ],
        0,
    );

    assert_eq!(cache.read(), TelemetryCache::new().read());
    assert_eq!(parser.stats().fields_written, 0);
}
