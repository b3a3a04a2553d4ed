use heapless::Deque;
use serde::{Deserialize, Serialize};

pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Instantaneous levels of the two observed bus lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineLevels {
    pub scl: bool,
    pub sda: bool,
}

impl LineLevels {
    pub const IDLE: LineLevels = LineLevels { scl: true, sda: true };

    pub fn new(scl: bool, sda: bool) -> Self {
        Self { scl, sda }
    }
}

/// Source of line samples. The decoder never touches hardware directly;
/// whatever drives the polling loop implements this seam.
pub trait LineSampler {
    fn sample(&mut self) -> LineLevels;
}

impl<F: FnMut() -> LineLevels> LineSampler for F {
    fn sample(&mut self) -> LineLevels {
        self()
    }
}

/// One protocol-level condition observed on the bus, in temporal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusEvent {
    Start,
    Stop,
    Address { byte: u8, read: bool },
    Data { byte: u8 },
    Ack,
    Nack,
}

/// Passive bus decoder. Keeps exactly one previous sample for edge
/// detection; a missed poll degrades to a dropped byte or a stuck started
/// state until the next Stop/Start resynchronizes it.
#[derive(Debug)]
pub struct BusDecoder {
    prev: LineLevels,
    started: bool,
    bit_count: u8,
    shift: u8,
    expect_ack: bool,
    expect_address: bool,
    events: Deque<BusEvent, EVENT_QUEUE_DEPTH>,
    overruns: u32,
}

impl BusDecoder {
    pub fn new() -> Self {
        Self {
            prev: LineLevels::IDLE,
            started: false,
            bit_count: 0,
            shift: 0,
            expect_ack: false,
            expect_address: false,
            events: Deque::new(),
            overruns: 0,
        }
    }

    /// Take one sample from the sampler and feed it through the decoder.
    pub fn poll(&mut self, sampler: &mut impl LineSampler) {
        let levels = sampler.sample();
        self.step(levels);
    }

    /// Advance the decoder by one observed sample, emitting zero or more
    /// events into the internal queue.
    pub fn step(&mut self, levels: LineLevels) {
        // Start: SDA falls while SCL is high.
        if self.prev.sda && !levels.sda && levels.scl {
            self.push(BusEvent::Start);
            self.started = true;
            self.bit_count = 0;
            self.shift = 0;
            self.expect_ack = false;
            self.expect_address = true;
        }

        // Stop: SDA rises while SCL is high.
        if !self.prev.sda && levels.sda && levels.scl {
            self.push(BusEvent::Stop);
            self.started = false;
            self.bit_count = 0;
            self.shift = 0;
            self.expect_ack = false;
            self.expect_address = false;
        }

        // Rising SCL samples SDA.
        if self.started && !self.prev.scl && levels.scl {
            if self.expect_ack {
                self.push(if levels.sda { BusEvent::Nack } else { BusEvent::Ack });
                self.expect_ack = false;
                self.bit_count = 0;
                self.shift = 0;
            } else {
                self.shift = (self.shift << 1) | u8::from(levels.sda);
                self.bit_count += 1;
                if self.bit_count == 8 {
                    let byte = self.shift;
                    if self.expect_address {
                        self.push(BusEvent::Address { byte, read: byte & 1 != 0 });
                        self.expect_address = false;
                    } else {
                        self.push(BusEvent::Data { byte });
                    }
                    self.expect_ack = true;
                    self.bit_count = 0;
                    self.shift = 0;
                }
            }
        }

        self.prev = levels;
    }

    /// Pop the oldest decoded event, if any.
    pub fn next_event(&mut self) -> Option<BusEvent> {
        self.events.pop_front()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Events dropped because the queue was not drained fast enough.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    pub fn reset(&mut self) {
        self.prev = LineLevels::IDLE;
        self.started = false;
        self.bit_count = 0;
        self.shift = 0;
        self.expect_ack = false;
        self.expect_address = false;
        self.events.clear();
    }

    fn push(&mut self, event: BusEvent) {
        if self.events.push_back(event).is_err() {
            self.overruns = self.overruns.saturating_add(1);
        }
    }
}

impl Default for BusDecoder {
    fn default() -> Self {
        Self::new()
    }
}
