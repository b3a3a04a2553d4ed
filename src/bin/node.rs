use clap::{App, Arg};
use smbus_spy::detect::{IdentityArbitrator, UdpLink, DETECT_PORT};
use smbus_spy::monitor::{BusMonitor, MonitorConfig};
use smbus_spy::parser::EepromLayout;
use smbus_spy::trace::{parse_trace, ScriptedLines};
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{error, info};

// Line sampling must outpace the bus clock; the decoder itself only asks
// to be called often enough.
const SAMPLE_TICK_MS: u64 = 5;
const SAMPLES_PER_TICK: usize = 64;
const ARBITRATION_TICK_MS: u64 = 20;
const SNAPSHOT_LOG_MS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("smbus-spy-node")
        .version("0.1.0")
        .author("Console Telemetry Team")
        .about("Bus observer daemon with distributed device-id arbitration")
        .arg(
            Arg::with_name("trace")
                .long("trace")
                .value_name("FILE")
                .help("Replay a recorded line-level trace as the bus source")
                .takes_value(true)
                // The EEPROM field layout differs between firmware
                // revisions and cannot be guessed from the traffic.
                .requires("layout"),
        )
        .arg(
            Arg::with_name("layout")
                .long("layout")
                .value_name("LAYOUT")
                .help("EEPROM field layout of the observed console")
                .takes_value(true)
                .possible_values(&["late-firmware", "retail"]),
        )
        .get_matches();

    println!("SMBus Spy Node");
    println!("==============");

    let mut link = UdpLink::bind(DETECT_PORT)?;
    let mut arbitrator = IdentityArbitrator::new();
    info!(port = DETECT_PORT, "identity arbitration listening");

    let layout = matches.value_of("layout").and_then(EepromLayout::from_name);
    let mut bus = match (matches.value_of("trace"), layout) {
        (Some(path), Some(layout)) => {
            let text = std::fs::read_to_string(path)?;
            let samples = parse_trace(&text)?;
            info!(samples = samples.len(), layout = layout.name(), "replaying bus trace");
            Some((
                BusMonitor::new(MonitorConfig::new(layout)),
                ScriptedLines::new(samples),
            ))
        }
        _ => None,
    };

    let start = Instant::now();
    let mut sample_tick = time::interval(Duration::from_millis(SAMPLE_TICK_MS));
    let mut arbitration_tick = time::interval(Duration::from_millis(ARBITRATION_TICK_MS));
    let mut snapshot_tick = time::interval(Duration::from_millis(SNAPSHOT_LOG_MS));

    loop {
        tokio::select! {
            _ = sample_tick.tick() => {
                if let Some((monitor, lines)) = bus.as_mut() {
                    let now_ms = start.elapsed().as_millis() as u64;
                    for _ in 0..SAMPLES_PER_TICK {
                        monitor.poll(lines, now_ms);
                    }
                }
            }
            _ = arbitration_tick.tick() => {
                let now_ms = start.elapsed().as_millis() as u64;
                arbitrator.poll(now_ms, &mut link);
            }
            _ = snapshot_tick.tick() => {
                let id = arbitrator.assigned_id();
                let phase = arbitrator.phase();
                match bus.as_ref() {
                    Some((monitor, _)) => match serde_json::to_string(&monitor.snapshot()) {
                        Ok(json) => info!(id, ?phase, telemetry = %json, "status"),
                        Err(e) => error!("snapshot serialization failed: {e}"),
                    },
                    None => info!(id, ?phase, "status"),
                }
            }
        }
    }
}
