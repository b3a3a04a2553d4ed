use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use smbus_spy::cache::TelemetrySnapshot;
use smbus_spy::decoder::{BusDecoder, BusEvent};
use smbus_spy::detect::{IdentityArbitrator, PhaseKind, UdpLink, DETECT_PORT};
use smbus_spy::monitor::{BusMonitor, MonitorConfig};
use smbus_spy::parser::EepromLayout;
use smbus_spy::trace::{parse_trace, ScriptedLines};
use std::time::Instant;

const LAYOUT_NAMES: [&str; 2] = ["late-firmware", "retail"];

fn main() {
    let matches = App::new("smbus-spy")
        .version("0.1.0")
        .author("Console Telemetry Team")
        .about("Passive SMBus trace inspection and device-id arbitration")
        .subcommand(
            SubCommand::with_name("decode")
                .about("Decode a recorded line-level trace into protocol events")
                .arg(
                    Arg::with_name("trace")
                        .help("Trace file: one '<scl> <sda>' sample per line")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("replay")
                .about("Replay a trace through the full pipeline and print the telemetry snapshot")
                .arg(
                    Arg::with_name("trace")
                        .help("Trace file: one '<scl> <sda>' sample per line")
                        .required(true),
                )
                .arg(
                    Arg::with_name("layout")
                        .long("layout")
                        .value_name("LAYOUT")
                        .help("EEPROM field layout (ambiguous across firmware revisions, so it must be stated)")
                        .takes_value(true)
                        .possible_values(&LAYOUT_NAMES)
                        .required(true),
                )
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .value_name("FORMAT")
                        .help("Output format")
                        .takes_value(true)
                        .possible_values(&["table", "json"])
                        .default_value("table"),
                ),
        )
        .subcommand(
            SubCommand::with_name("arbitrate")
                .about("Negotiate a device id on the local broadcast domain and print it")
                .arg(
                    Arg::with_name("timeout")
                        .long("timeout")
                        .value_name("SECONDS")
                        .help("Give up if no id settles within this long")
                        .takes_value(true)
                        .default_value("30"),
                ),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("decode", Some(sub)) => cmd_decode(sub),
        ("replay", Some(sub)) => cmd_replay(sub),
        ("arbitrate", Some(sub)) => cmd_arbitrate(sub),
        _ => {
            eprintln!("{}", "No subcommand given; try --help".yellow());
            std::process::exit(2);
        }
    };

    if let Err(message) = result {
        eprintln!("{} {}", "error:".red().bold(), message);
        std::process::exit(1);
    }
}

fn load_trace(path: &str) -> Result<Vec<smbus_spy::LineLevels>, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    parse_trace(&text).map_err(|e| e.to_string())
}

fn cmd_decode(matches: &ArgMatches) -> Result<(), String> {
    let samples = load_trace(matches.value_of("trace").unwrap_or_default())?;
    let mut decoder = BusDecoder::new();

    let total = samples.len();
    for levels in samples {
        decoder.step(levels);
        while let Some(event) = decoder.next_event() {
            print_event(&event);
        }
    }

    println!(
        "{} {} samples, {} queue overruns",
        "done:".green().bold(),
        total,
        decoder.overruns()
    );
    Ok(())
}

fn print_event(event: &BusEvent) {
    match event {
        BusEvent::Start => println!("{}", "START".cyan().bold()),
        BusEvent::Stop => println!("{}", "STOP".cyan().bold()),
        BusEvent::Address { byte, read } => {
            let direction = if *read { "R" } else { "W" };
            println!(
                "  {} 0x{:02X} ({})",
                "ADDR".yellow(),
                byte >> 1,
                direction
            );
        }
        BusEvent::Data { byte } => println!("  {} 0x{byte:02X}", "DATA".white()),
        BusEvent::Ack => println!("    {}", "ACK".green()),
        BusEvent::Nack => println!("    {}", "NACK".red()),
    }
}

fn cmd_replay(matches: &ArgMatches) -> Result<(), String> {
    let layout_name = matches.value_of("layout").unwrap_or_default();
    let layout = EepromLayout::from_name(layout_name)
        .ok_or_else(|| format!("unknown layout {layout_name:?}"))?;
    let samples = load_trace(matches.value_of("trace").unwrap_or_default())?;

    let mut monitor = BusMonitor::new(MonitorConfig::new(layout));
    let mut lines = ScriptedLines::new(samples);
    let mut now_ms = 0u64;
    while !lines.exhausted() {
        monitor.poll(&mut lines, now_ms);
        // A generous virtual millisecond per sample keeps replayed sessions
        // well inside the inactivity threshold.
        now_ms += 1;
    }

    let snapshot = monitor.snapshot();
    match matches.value_of("format") {
        Some("json") => {
            let json = serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())?;
            println!("{json}");
        }
        _ => print_snapshot_table(&snapshot),
    }

    let stats = monitor.parser_stats();
    println!(
        "{} {} fields written, {} samples rejected, {} sessions reset",
        "stats:".green().bold(),
        stats.fields_written,
        stats.samples_rejected,
        stats.sessions_reset
    );
    Ok(())
}

fn print_snapshot_table(snapshot: &TelemetrySnapshot) {
    fn row<T: std::fmt::Display>(label: &str, field: &Option<smbus_spy::cache::Stamped<T>>) {
        match field {
            Some(stamped) => println!(
                "  {:<12} {} {}",
                label.bold(),
                stamped.value,
                format!("(@{}ms)", stamped.updated_at_ms).dimmed()
            ),
            None => println!("  {:<12} {}", label.bold(), "never observed".dimmed()),
        }
    }

    println!("{}", "Telemetry snapshot".cyan().bold());
    row("fan %", &snapshot.fan_percent);
    row("cpu °C", &snapshot.cpu_temp_c);
    row("ambient °C", &snapshot.ambient_temp_c);
    row("app", &snapshot.app);
    row("mac", &snapshot.mac);
    row("ip", &snapshot.ip);
    row("serial", &snapshot.serial);
    row("region", &snapshot.region);
    row("tray", &snapshot.tray_state);
    row("av pack", &snapshot.av_pack);
    row("pic ver", &snapshot.pic_version);
    row("hw family", &snapshot.hardware_family);
    row("encoder", &snapshot.encoder_id);
    row("resolution", &snapshot.resolution);
}

fn cmd_arbitrate(matches: &ArgMatches) -> Result<(), String> {
    let timeout_s: u64 = matches
        .value_of("timeout")
        .unwrap_or("30")
        .parse()
        .map_err(|_| "timeout must be a number of seconds".to_string())?;

    let mut link = UdpLink::bind(DETECT_PORT).map_err(|e| e.to_string())?;
    let mut arbitrator = IdentityArbitrator::new();

    let start = Instant::now();
    while start.elapsed().as_secs() < timeout_s {
        let now_ms = start.elapsed().as_millis() as u64;
        arbitrator.poll(now_ms, &mut link);
        if arbitrator.phase() == PhaseKind::Settled {
            println!(
                "{} assigned id {}",
                "settled:".green().bold(),
                arbitrator.assigned_id().to_string().bold()
            );
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    Err(format!(
        "no id settled within {timeout_s}s (last phase {:?}, candidate {})",
        arbitrator.phase(),
        arbitrator.assigned_id()
    ))
}
