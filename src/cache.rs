use arrayvec::ArrayString;
use core::fmt::Write as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Plausibility bands, all exclusive. Samples outside them are bus noise,
// not telemetry.
const CPU_TEMP_MIN_C: i8 = 10;
const CPU_TEMP_MAX_C: i8 = 80;
const AMBIENT_TEMP_MIN_C: i8 = 0;
const AMBIENT_TEMP_MAX_C: i8 = 60;

// The three video encoder chips ever fitted to the console.
pub const ENCODER_CONEXANT: u8 = 0x45;
pub const ENCODER_FOCUS: u8 = 0x6A;
pub const ENCODER_XCALIBUR: u8 = 0x70;

pub const MAX_APP_NAME: usize = 16;
pub const MAX_SERIAL: usize = 12;

pub type AppName = ArrayString<MAX_APP_NAME>;
pub type MacString = ArrayString<17>;
pub type IpString = ArrayString<15>;
pub type SerialString = ArrayString<MAX_SERIAL>;
pub type RegionName = ArrayString<8>;
pub type ResolutionString = ArrayString<24>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{field} value {value} outside plausible range ({min}, {max})")]
pub struct RangeError {
    pub field: &'static str,
    pub value: i32,
    pub min: i32,
    pub max: i32,
}

/// A field value plus the instant it was last refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub updated_at_ms: u64,
}

/// Freshest-known console telemetry. `None` means never observed.
/// Fields are independent channels; there is no cross-field atomicity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub fan_percent: Option<Stamped<u8>>,
    pub cpu_temp_c: Option<Stamped<i8>>,
    pub ambient_temp_c: Option<Stamped<i8>>,
    pub app: Option<Stamped<AppName>>,
    pub mac: Option<Stamped<MacString>>,
    pub ip: Option<Stamped<IpString>>,
    pub serial: Option<Stamped<SerialString>>,
    pub region: Option<Stamped<RegionName>>,

    // Expansion fields
    pub tray_state: Option<Stamped<u8>>,
    pub av_pack: Option<Stamped<u8>>,
    pub pic_version: Option<Stamped<u8>>,
    pub hardware_family: Option<Stamped<u8>>,
    pub encoder_id: Option<Stamped<u8>>,
    pub resolution: Option<Stamped<ResolutionString>>,
}

/// Single-writer / many-reader cache of the latest validated field values.
/// Constructor-created and passed by handle; readers only ever get copies.
#[derive(Debug, Default)]
pub struct TelemetryCache {
    snapshot: TelemetrySnapshot,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable copy of every field. Calling this twice without an
    /// intervening write returns identical snapshots.
    pub fn read(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }

    /// Reset every field to never-observed.
    pub fn clear(&mut self) {
        self.snapshot = TelemetrySnapshot::default();
    }

    /// Fan duty: 0-100 taken directly, 101-255 rescaled from the raw
    /// 8-bit register onto 0-100.
    pub fn update_fan(&mut self, raw: u8, now_ms: u64) {
        let percent = if raw > 100 {
            (u16::from(raw) * 100 / 255) as u8
        } else {
            raw
        };
        stamp(&mut self.snapshot.fan_percent, percent, now_ms);
    }

    pub fn update_cpu_temp(&mut self, temp_c: i8, now_ms: u64) -> Result<(), RangeError> {
        check_band("cpu_temp_c", temp_c, CPU_TEMP_MIN_C, CPU_TEMP_MAX_C)?;
        stamp(&mut self.snapshot.cpu_temp_c, temp_c, now_ms);
        Ok(())
    }

    pub fn update_ambient_temp(&mut self, temp_c: i8, now_ms: u64) -> Result<(), RangeError> {
        check_band("ambient_temp_c", temp_c, AMBIENT_TEMP_MIN_C, AMBIENT_TEMP_MAX_C)?;
        stamp(&mut self.snapshot.ambient_temp_c, temp_c, now_ms);
        Ok(())
    }

    pub fn update_app(&mut self, name: &str, now_ms: u64) {
        let mut buf = AppName::new();
        for ch in name.chars() {
            if buf.try_push(ch).is_err() {
                break;
            }
        }
        stamp(&mut self.snapshot.app, buf, now_ms);
    }

    pub fn update_mac(&mut self, octets: &[u8; 6], now_ms: u64) {
        let mut buf = MacString::new();
        for (index, octet) in octets.iter().enumerate() {
            if index > 0 {
                let _ = buf.try_push(':');
            }
            let _ = write!(buf, "{octet:02X}");
        }
        stamp(&mut self.snapshot.mac, buf, now_ms);
    }

    pub fn update_ip(&mut self, octets: &[u8; 4], now_ms: u64) {
        let mut buf = IpString::new();
        let _ = write!(buf, "{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
        stamp(&mut self.snapshot.ip, buf, now_ms);
    }

    /// Serial numbers come off the EEPROM padded with NUL/0xFF and with
    /// unstable case; keep upper-case alphanumerics only.
    pub fn update_serial(&mut self, raw: &[u8], now_ms: u64) {
        let mut buf = SerialString::new();
        for &byte in raw {
            if byte == 0x00 || byte == 0xFF {
                break;
            }
            let ch = (byte as char).to_ascii_uppercase();
            if ch.is_ascii_alphanumeric() && buf.try_push(ch).is_err() {
                break;
            }
        }
        stamp(&mut self.snapshot.serial, buf, now_ms);
    }

    pub fn update_region(&mut self, code: u8, now_ms: u64) {
        let name = match code {
            0x00 => "NTSC-U",
            0x01 => "NTSC-J",
            0x02 => "PAL",
            _ => "UNKNOWN",
        };
        let mut buf = RegionName::new();
        let _ = buf.try_push_str(name);
        stamp(&mut self.snapshot.region, buf, now_ms);
    }

    pub fn update_tray_state(&mut self, state: u8, now_ms: u64) {
        stamp(&mut self.snapshot.tray_state, state, now_ms);
    }

    pub fn update_av_pack(&mut self, code: u8, now_ms: u64) {
        stamp(&mut self.snapshot.av_pack, code, now_ms);
    }

    pub fn update_pic_version(&mut self, version: u8, now_ms: u64) {
        stamp(&mut self.snapshot.pic_version, version, now_ms);
    }

    pub fn update_hardware_family(&mut self, family: u8, now_ms: u64) {
        stamp(&mut self.snapshot.hardware_family, family, now_ms);
    }

    pub fn update_encoder_id(&mut self, encoder: u8, now_ms: u64) -> Result<(), RangeError> {
        match encoder {
            ENCODER_CONEXANT | ENCODER_FOCUS | ENCODER_XCALIBUR => {
                stamp(&mut self.snapshot.encoder_id, encoder, now_ms);
                Ok(())
            }
            other => Err(RangeError {
                field: "encoder_id",
                value: i32::from(other),
                min: i32::from(ENCODER_CONEXANT),
                max: i32::from(ENCODER_XCALIBUR),
            }),
        }
    }

    pub fn update_resolution(&mut self, width: u16, height: u16, now_ms: u64) -> Result<(), RangeError> {
        if width == 0 || width > 1920 {
            return Err(RangeError {
                field: "resolution_width",
                value: i32::from(width),
                min: 0,
                max: 1921,
            });
        }
        if height == 0 || height > 1080 {
            return Err(RangeError {
                field: "resolution_height",
                value: i32::from(height),
                min: 0,
                max: 1081,
            });
        }
        stamp(&mut self.snapshot.resolution, format_resolution(width, height), now_ms);
        Ok(())
    }
}

/// Pretty-print a video mode the way the PC viewer labels it.
pub fn format_resolution(width: u16, height: u16) -> ResolutionString {
    let label = match (width, height) {
        (640, 480) => " (480p)",
        (720, 480) => " (480p WS)",
        (720, 576) => " (576i/p)",
        (1280, 720) => " (720p)",
        (1920, 1080) => " (1080i)",
        _ => "",
    };
    let mut buf = ResolutionString::new();
    let _ = write!(buf, "{width}x{height}{label}");
    buf
}

fn check_band(field: &'static str, value: i8, min: i8, max: i8) -> Result<(), RangeError> {
    if value > min && value < max {
        Ok(())
    } else {
        Err(RangeError {
            field,
            value: i32::from(value),
            min: i32::from(min),
            max: i32::from(max),
        })
    }
}

// Value replacement is always allowed, but displayed freshness never moves
// backward under a stale caller clock.
fn stamp<T>(slot: &mut Option<Stamped<T>>, value: T, now_ms: u64) {
    let updated_at_ms = match slot {
        Some(previous) => previous.updated_at_ms.max(now_ms),
        None => now_ms,
    };
    *slot = Some(Stamped { value, updated_at_ms });
}
