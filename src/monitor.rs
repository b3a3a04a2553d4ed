use crate::cache::{TelemetryCache, TelemetrySnapshot};
use crate::decoder::{BusDecoder, LineSampler};
use crate::parser::{EepromLayout, ParserStats, SessionParser};
use serde::{Deserialize, Serialize};

/// Configuration the pipeline cannot guess on its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub eeprom_layout: EepromLayout,
}

impl MonitorConfig {
    pub fn new(eeprom_layout: EepromLayout) -> Self {
        Self { eeprom_layout }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    pub samples_taken: u64,
    pub events_decoded: u64,
    pub decoder_overruns: u32,
}

/// Owns the decode pipeline end to end: decoder, session parser, and the
/// telemetry cache, constructor-created and passed by handle rather than
/// living in process-wide state.
#[derive(Debug)]
pub struct BusMonitor {
    decoder: BusDecoder,
    parser: SessionParser,
    cache: TelemetryCache,
    stats: MonitorStats,
}

impl BusMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            decoder: BusDecoder::new(),
            parser: SessionParser::new(config.eeprom_layout),
            cache: TelemetryCache::new(),
            stats: MonitorStats::default(),
        }
    }

    /// Take one line sample and push every resulting event through the
    /// parser. Also expires a session that has gone silent, so stale state
    /// dies even on a quiet bus.
    pub fn poll(&mut self, sampler: &mut impl LineSampler, now_ms: u64) {
        self.decoder.poll(sampler);
        self.stats.samples_taken += 1;
        while let Some(event) = self.decoder.next_event() {
            self.stats.events_decoded += 1;
            self.parser.feed(event, now_ms, &mut self.cache);
        }
        self.parser.expire(now_ms, &mut self.cache);
        self.stats.decoder_overruns = self.decoder.overruns();
    }

    /// Immutable copy of the current telemetry; safe to hand to any reader.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.cache.read()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    pub fn parser_stats(&self) -> ParserStats {
        self.parser.stats()
    }

    pub fn eeprom_layout(&self) -> EepromLayout {
        self.parser.layout()
    }
}
