//! # SMBus Spy
//!
//! Passive observer for an original Xbox console's system-management bus,
//! reconstructing register traffic into a freshest-known-value telemetry
//! cache, plus a distributed identity arbitrator so that several observer
//! nodes on one network agree on disjoint small-integer ids.
//!
//! ## Features
//!
//! - **Passive bus decode**: start/stop framing, 7-bit addressing and
//!   ACK/NACK recovered purely from sampled line levels
//! - **Session reconstruction**: register-pointer tracking, per-device
//!   dispatch, multi-byte MAC/IP/serial captures with torn-field discard
//! - **Telemetry cache**: per-field freshness timestamps and plausibility
//!   filtering, snapshot reads for external broadcasters
//! - **Identity arbitration**: coordinator-free id negotiation over lossy
//!   UDP broadcast with jittered claim storms and conflict backoff
//! - **Hardware-free testing**: whole transactions synthesized as scripted
//!   line-level traces
//!
//! ## Quick Start
//!
//! ```rust
//! use smbus_spy::monitor::{BusMonitor, MonitorConfig};
//! use smbus_spy::parser::EepromLayout;
//! use smbus_spy::trace::{ScriptedLines, TraceBuilder};
//!
//! let mut monitor = BusMonitor::new(MonitorConfig::new(EepromLayout::Retail));
//!
//! // Fan-speed write as seen on a real console: SMC register 0x20 <- 50.
//! let mut trace = TraceBuilder::new();
//! trace.write_transaction(0x10, 0x20, &[50]);
//! let mut lines = ScriptedLines::new(trace.build());
//!
//! let mut now_ms = 0;
//! while !lines.exhausted() {
//!     monitor.poll(&mut lines, now_ms);
//!     now_ms += 1;
//! }
//! assert_eq!(monitor.snapshot().fan_percent.map(|f| f.value), Some(50));
//! ```

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod cache;
pub mod decoder;
pub mod detect;
pub mod monitor;
pub mod parser;
pub mod trace;

// Re-export the main public types for convenience
pub use cache::{TelemetryCache, TelemetrySnapshot};
pub use decoder::{BusDecoder, BusEvent, LineLevels, LineSampler};
pub use detect::{DetectLink, DetectMessage, IdentityArbitrator, PhaseKind};
pub use monitor::{BusMonitor, MonitorConfig};
pub use parser::{EepromLayout, SessionParser};
