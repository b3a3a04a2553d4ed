//! Scripted line-level traces.
//!
//! The decoder is driven from a plain sequence of `LineLevels`, so whole bus
//! transactions can be synthesized for tests and the replay CLI without any
//! hardware in the loop.

use crate::decoder::{LineLevels, LineSampler};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("line {line}: expected two binary columns, got {text:?}")]
    Malformed { line: usize, text: String },
}

/// Builds sample sequences that encode well-formed bus waveforms.
#[derive(Debug, Default)]
pub struct TraceBuilder {
    samples: Vec<LineLevels>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self { samples: vec![LineLevels::IDLE] }
    }

    /// SDA falls while SCL is high.
    pub fn start(&mut self) -> &mut Self {
        self.push(true, true);
        self.push(true, false);
        self
    }

    /// SDA rises while SCL is high. If SDA is currently high (after a NACK)
    /// it must be driven low first while the clock is low, which costs one
    /// spurious sampled bit; the decoder discards it on the stop condition.
    pub fn stop(&mut self) -> &mut Self {
        if self.samples.last().map_or(true, |levels| levels.sda) {
            self.push(false, false);
            self.push(true, false);
        }
        self.push(true, true);
        self
    }

    /// Clock out one byte MSB-first, followed by the acknowledge slot.
    pub fn byte(&mut self, value: u8, acked: bool) -> &mut Self {
        for bit in (0..8).rev() {
            let sda = (value >> bit) & 1 != 0;
            self.push(false, sda);
            self.push(true, sda);
        }
        // Acknowledge slot: low = ACK, high = NACK.
        self.push(false, !acked);
        self.push(true, !acked);
        self
    }

    /// Full write transaction: address, register pointer, value bytes.
    pub fn write_transaction(&mut self, addr7: u8, reg: u8, values: &[u8]) -> &mut Self {
        self.start();
        self.byte(addr7 << 1, true);
        self.byte(reg, true);
        for &value in values {
            self.byte(value, true);
        }
        self.stop()
    }

    /// Full read transaction: address with the read bit set, then data bytes
    /// supplied by the addressed device (no register pointer on the wire).
    pub fn read_transaction(&mut self, addr7: u8, values: &[u8]) -> &mut Self {
        self.start();
        self.byte((addr7 << 1) | 1, true);
        for &value in values {
            self.byte(value, true);
        }
        self.stop()
    }

    /// Hold the idle level for `count` samples.
    pub fn idle(&mut self, count: usize) -> &mut Self {
        for _ in 0..count {
            self.samples.push(LineLevels::IDLE);
        }
        self
    }

    pub fn build(&self) -> Vec<LineLevels> {
        self.samples.clone()
    }

    fn push(&mut self, scl: bool, sda: bool) {
        self.samples.push(LineLevels::new(scl, sda));
    }
}

/// Parse the two-column text trace format: one `<scl> <sda>` pair per line,
/// blank lines and `#` comments skipped.
pub fn parse_trace(text: &str) -> Result<Vec<LineLevels>, TraceError> {
    let mut samples = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut cols = line.split_whitespace();
        let levels = match (cols.next(), cols.next(), cols.next()) {
            (Some(scl), Some(sda), None) => {
                let parse = |s: &str| match s {
                    "0" => Some(false),
                    "1" => Some(true),
                    _ => None,
                };
                match (parse(scl), parse(sda)) {
                    (Some(scl), Some(sda)) => LineLevels::new(scl, sda),
                    _ => {
                        return Err(TraceError::Malformed {
                            line: index + 1,
                            text: raw.to_string(),
                        })
                    }
                }
            }
            _ => {
                return Err(TraceError::Malformed {
                    line: index + 1,
                    text: raw.to_string(),
                })
            }
        };
        samples.push(levels);
    }
    Ok(samples)
}

/// Replays a recorded sample vector; holds the final level once exhausted.
#[derive(Debug)]
pub struct ScriptedLines {
    samples: Vec<LineLevels>,
    position: usize,
}

impl ScriptedLines {
    pub fn new(samples: Vec<LineLevels>) -> Self {
        Self { samples, position: 0 }
    }

    pub fn exhausted(&self) -> bool {
        self.position >= self.samples.len()
    }
}

impl LineSampler for ScriptedLines {
    fn sample(&mut self) -> LineLevels {
        match self.samples.get(self.position) {
            Some(&levels) => {
                self.position += 1;
                levels
            }
            None => self.samples.last().copied().unwrap_or(LineLevels::IDLE),
        }
    }
}
