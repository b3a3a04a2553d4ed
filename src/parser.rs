use crate::cache::TelemetryCache;
use crate::decoder::BusEvent;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// Known 7-bit addresses on the observed bus.
pub const ADDR_SMC: u8 = 0x10;
pub const ADDR_TEMP_SENSOR: u8 = 0x4C;
pub const ADDR_EEPROM: u8 = 0x54;

/// A session that sees no event for this long is torn down rather than
/// stitched across transactions.
pub const SESSION_TIMEOUT_MS: u64 = 100;

// System-controller registers.
const SMC_REG_PIC_VERSION: u8 = 0x01;
const SMC_REG_TRAY_STATE: u8 = 0x03;
const SMC_REG_AV_PACK: u8 = 0x04;
const SMC_REG_FAN_SPEED: u8 = 0x20;
const SMC_REG_FAN_MODE: u8 = 0x21;
const SMC_REG_POWER_LED: u8 = 0x24;
const SMC_REG_CPU_TEMP: u8 = 0x2C;
const SMC_REG_AMBIENT_TEMP: u8 = 0x2D;
const SMC_REG_APP: u8 = 0x30;

// ADM1032 registers.
const TEMP_REG_AMBIENT: u8 = 0x00;
const TEMP_REG_CPU: u8 = 0x01;

// EEPROM offsets common to both layouts.
const EEPROM_REG_IP: u8 = 0x6A;
const EEPROM_REG_REGION: u8 = 0x58;

const MAC_LEN: usize = 6;
const IP_LEN: usize = 4;
const SERIAL_LEN: usize = 12;

/// EEPROM field offsets differ between firmware revisions, and dumps exist
/// for both. Which layout a given console uses cannot be inferred from the
/// bus traffic alone, so the choice is explicit configuration, never a
/// silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EepromLayout {
    /// Seen in newer firmware dumps: serial number at 0x14, MAC at 0x24.
    LateFirmware,
    /// The retail-common layout: serial number at 0x09, MAC at 0x3C.
    Retail,
}

impl EepromLayout {
    pub fn serial_base(self) -> u8 {
        match self {
            EepromLayout::LateFirmware => 0x14,
            EepromLayout::Retail => 0x09,
        }
    }

    pub fn mac_base(self) -> u8 {
        match self {
            EepromLayout::LateFirmware => 0x24,
            EepromLayout::Retail => 0x3C,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "late-firmware" => Some(EepromLayout::LateFirmware),
            "retail" => Some(EepromLayout::Retail),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EepromLayout::LateFirmware => "late-firmware",
            EepromLayout::Retail => "retail",
        }
    }
}

/// Application codes written by the console to the system controller.
pub fn app_name(code: u8) -> &'static str {
    match code {
        0 => "Dashboard",
        1 => "Game",
        2 => "DVD",
        3 => "AudioCD",
        4 => "Update",
        5 => "LiveDash",
        6 => "Linux",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObservedDevice {
    Smc,
    TempSensor,
    Eeprom,
}

impl ObservedDevice {
    fn from_addr(addr7: u8) -> Option<Self> {
        match addr7 {
            ADDR_SMC => Some(ObservedDevice::Smc),
            ADDR_TEMP_SENSOR => Some(ObservedDevice::TempSensor),
            ADDR_EEPROM => Some(ObservedDevice::Eeprom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureKind {
    Mac,
    Ip,
    Serial,
}

impl CaptureKind {
    fn target_len(self) -> usize {
        match self {
            CaptureKind::Mac => MAC_LEN,
            CaptureKind::Ip => IP_LEN,
            CaptureKind::Serial => SERIAL_LEN,
        }
    }
}

#[derive(Debug)]
struct Capture {
    kind: CaptureKind,
    buf: Vec<u8, SERIAL_LEN>,
}

const MAX_PENDING_WRITES: usize = 8;

/// Exactly one live transaction at a time. Scalar register writes are held
/// here and committed only once the transaction ends at `Stop` or times
/// out; a session torn down by a new `Start` never reaches the cache.
#[derive(Debug, Default)]
struct Session {
    active: bool,
    addr7: u8,
    read: bool,
    reg: Option<u8>,
    capture: Option<Capture>,
    pending: Vec<(u8, u8), MAX_PENDING_WRITES>,
    last_event_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ParserStats {
    pub sessions_reset: u32,
    pub session_timeouts: u32,
    pub fields_written: u32,
    pub samples_rejected: u32,
}

/// Reconstructs transactions from the decoder's event stream and writes
/// validated field updates into the telemetry cache.
#[derive(Debug)]
pub struct SessionParser {
    layout: EepromLayout,
    session: Session,
    // Last register pointer written to each device; a read transaction
    // re-reads without re-sending a pointer, so this is what attributes
    // its data bytes.
    remembered_reg: [Option<u8>; 3],
    stats: ParserStats,
}

impl SessionParser {
    pub fn new(layout: EepromLayout) -> Self {
        Self {
            layout,
            session: Session::default(),
            remembered_reg: [None; 3],
            stats: ParserStats::default(),
        }
    }

    pub fn layout(&self) -> EepromLayout {
        self.layout
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Tear down a session that has gone silent for longer than the
    /// inactivity threshold. Completed register/value pairs are committed;
    /// an incomplete capture is discarded.
    pub fn expire(&mut self, now_ms: u64, cache: &mut TelemetryCache) {
        if self.session.active && now_ms.saturating_sub(self.session.last_event_ms) > SESSION_TIMEOUT_MS {
            debug!(addr = self.session.addr7, "session timed out");
            self.stats.session_timeouts += 1;
            self.commit_pending(now_ms, cache);
            self.reset_session();
        }
    }

    pub fn feed(&mut self, event: BusEvent, now_ms: u64, cache: &mut TelemetryCache) {
        self.expire(now_ms, cache);
        match event {
            BusEvent::Start => {
                // A Start before the previous Stop truncates that session;
                // nothing it carried reaches the cache.
                self.reset_session();
            }
            BusEvent::Stop => {
                self.commit_pending(now_ms, cache);
                self.reset_session();
            }
            BusEvent::Address { byte, read } => {
                let addr7 = byte >> 1;
                self.session = Session {
                    active: true,
                    addr7,
                    read,
                    reg: None,
                    capture: None,
                    pending: Vec::new(),
                    last_event_ms: now_ms,
                };
                if read {
                    if let Some(device) = ObservedDevice::from_addr(addr7) {
                        self.session.reg = self.remembered_reg[device as usize];
                        if addr7 == ADDR_EEPROM {
                            if let Some(reg) = self.session.reg {
                                self.maybe_open_capture(reg);
                            }
                        }
                    }
                }
            }
            BusEvent::Data { byte } => {
                if self.session.active {
                    self.session.last_event_ms = now_ms;
                    self.handle_data(byte, now_ms, cache);
                }
            }
            BusEvent::Ack | BusEvent::Nack => {
                if self.session.active {
                    self.session.last_event_ms = now_ms;
                }
            }
        }
    }

    fn handle_data(&mut self, byte: u8, now_ms: u64, cache: &mut TelemetryCache) {
        if let Some(capture) = self.session.capture.as_mut() {
            if capture.buf.push(byte).is_err() {
                // Cannot happen while target_len <= buffer capacity.
                self.session.capture = None;
                return;
            }
            if capture.buf.len() == capture.kind.target_len() {
                self.finish_capture(now_ms, cache);
            }
            return;
        }

        match self.session.reg {
            None => {
                if self.session.read {
                    // Read with no pointer on record: unattributable bytes.
                    trace!(addr = self.session.addr7, byte, "unattributable read data");
                    return;
                }
                self.session.reg = Some(byte);
                self.remember(byte);
                if self.session.addr7 == ADDR_EEPROM {
                    self.maybe_open_capture(byte);
                }
            }
            Some(reg) => {
                if self.session.pending.push((reg, byte)).is_err() {
                    trace!(reg, byte, "pending-write buffer full, value dropped");
                }
                if self.session.read {
                    if self.session.addr7 == ADDR_EEPROM {
                        // Sequential reads auto-advance the EEPROM pointer.
                        let next = reg.wrapping_add(1);
                        self.session.reg = Some(next);
                        self.remember(next);
                    }
                } else {
                    self.session.reg = None;
                }
            }
        }
    }

    fn commit_pending(&mut self, now_ms: u64, cache: &mut TelemetryCache) {
        let addr7 = self.session.addr7;
        let pending = core::mem::take(&mut self.session.pending);
        for (reg, value) in pending {
            self.dispatch_value(addr7, reg, value, now_ms, cache);
        }
    }

    fn dispatch_value(&mut self, addr7: u8, reg: u8, value: u8, now_ms: u64, cache: &mut TelemetryCache) {
        match addr7 {
            ADDR_TEMP_SENSOR => match reg {
                TEMP_REG_AMBIENT => self.write_checked(cache.update_ambient_temp(value as i8, now_ms)),
                TEMP_REG_CPU => self.write_checked(cache.update_cpu_temp(value as i8, now_ms)),
                _ => trace!(reg, value, "unmapped temp-sensor register"),
            },
            ADDR_SMC => match reg {
                SMC_REG_FAN_SPEED => {
                    cache.update_fan(value, now_ms);
                    self.stats.fields_written += 1;
                }
                SMC_REG_FAN_MODE | SMC_REG_POWER_LED => {
                    // Observed but carries no telemetry.
                }
                SMC_REG_CPU_TEMP => self.write_checked(cache.update_cpu_temp(value as i8, now_ms)),
                SMC_REG_AMBIENT_TEMP => self.write_checked(cache.update_ambient_temp(value as i8, now_ms)),
                SMC_REG_APP => {
                    cache.update_app(app_name(value), now_ms);
                    self.stats.fields_written += 1;
                }
                SMC_REG_PIC_VERSION => {
                    cache.update_pic_version(value, now_ms);
                    self.stats.fields_written += 1;
                }
                SMC_REG_TRAY_STATE => {
                    cache.update_tray_state(value, now_ms);
                    self.stats.fields_written += 1;
                }
                SMC_REG_AV_PACK => {
                    cache.update_av_pack(value, now_ms);
                    self.stats.fields_written += 1;
                }
                _ => trace!(reg, value, "unmapped system-controller register"),
            },
            ADDR_EEPROM => match reg {
                EEPROM_REG_REGION => {
                    cache.update_region(value, now_ms);
                    self.stats.fields_written += 1;
                }
                _ => trace!(reg, value, "unmapped configuration-memory register"),
            },
            other => trace!(addr = other, reg, value, "data for unobserved device"),
        }
    }

    fn write_checked(&mut self, result: Result<(), crate::cache::RangeError>) {
        match result {
            Ok(()) => self.stats.fields_written += 1,
            Err(error) => {
                debug!(%error, "rejected implausible sample");
                self.stats.samples_rejected += 1;
            }
        }
    }

    fn maybe_open_capture(&mut self, reg: u8) {
        let kind = if reg == self.layout.mac_base() {
            Some(CaptureKind::Mac)
        } else if reg == EEPROM_REG_IP {
            Some(CaptureKind::Ip)
        } else if reg == self.layout.serial_base() {
            Some(CaptureKind::Serial)
        } else {
            None
        };
        if let Some(kind) = kind {
            self.session.capture = Some(Capture { kind, buf: Vec::new() });
        }
    }

    fn finish_capture(&mut self, now_ms: u64, cache: &mut TelemetryCache) {
        let Some(capture) = self.session.capture.take() else {
            return;
        };
        match capture.kind {
            CaptureKind::Mac => {
                let mut octets = [0u8; MAC_LEN];
                octets.copy_from_slice(&capture.buf[..MAC_LEN]);
                cache.update_mac(&octets, now_ms);
            }
            CaptureKind::Ip => {
                let mut octets = [0u8; IP_LEN];
                octets.copy_from_slice(&capture.buf[..IP_LEN]);
                cache.update_ip(&octets, now_ms);
            }
            CaptureKind::Serial => {
                cache.update_serial(&capture.buf, now_ms);
            }
        }
        self.stats.fields_written += 1;
        // The capture consumed the pointer; forget it rather than keep a
        // mid-field offset on record.
        self.session.reg = None;
        self.remembered_reg[ObservedDevice::Eeprom as usize] = None;
    }

    fn remember(&mut self, reg: u8) {
        if let Some(device) = ObservedDevice::from_addr(self.session.addr7) {
            self.remembered_reg[device as usize] = Some(reg);
        }
    }

    fn reset_session(&mut self) {
        if self.session.active {
            if self.session.capture.is_some() {
                debug!(addr = self.session.addr7, "discarding incomplete capture");
            }
            self.stats.sessions_reset += 1;
        }
        self.session = Session::default();
    }
}
