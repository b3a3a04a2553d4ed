use core::fmt::Write as _;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DETECT_PORT: u16 = 50501;

pub const ID_MIN: u8 = 1;
pub const ID_MAX: u8 = 4;
/// Identity used while the network is down; never broadcast.
pub const FALLBACK_ID: u8 = 1;

const_assert!(ID_MIN <= ID_MAX);
const_assert!(FALLBACK_ID >= ID_MIN && FALLBACK_ID <= ID_MAX);

pub const DISCOVER_WINDOW_MS: u64 = 3000;
pub const PROPOSAL_WINDOW_MS: u64 = 2000;
pub const CLAIM_INTERVAL_MS: u64 = 200;
pub const BEACON_INTERVAL_MS: u64 = 3000;

const DISCOVER_JITTER_MS: core::ops::Range<u64> = 200..800;
const PROPOSE_JITTER_MS: core::ops::Range<u64> = 100..800;
const BACKOFF_MS: core::ops::Range<u64> = 300..1200;

const DISCOVER_TOKEN: &str = "<DISCOVER>?";
const CLAIM_PREFIX: &str = "<ID-CLAIM>:";

pub const MAX_WIRE_LEN: usize = 32;
pub type WireBuffer = arrayvec::ArrayString<MAX_WIRE_LEN>;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("message does not fit the wire buffer")]
    Encode,
}

/// The two ASCII datagram formats the protocol speaks. Anything else on the
/// channel is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectMessage {
    Discover,
    Claim(u8),
}

impl DetectMessage {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = core::str::from_utf8(payload).ok()?.trim_end_matches('\0').trim();
        if text == DISCOVER_TOKEN {
            return Some(DetectMessage::Discover);
        }
        let id = text.strip_prefix(CLAIM_PREFIX)?.parse::<u8>().ok()?;
        Some(DetectMessage::Claim(id))
    }

    pub fn encode(&self) -> Result<WireBuffer, DetectError> {
        let mut buf = WireBuffer::new();
        match self {
            DetectMessage::Discover => {
                buf.try_push_str(DISCOVER_TOKEN).map_err(|_| DetectError::Encode)?;
            }
            DetectMessage::Claim(id) => {
                write!(buf, "{CLAIM_PREFIX}{id}").map_err(|_| DetectError::Encode)?;
            }
        }
        Ok(buf)
    }
}

/// Broadcast channel seam. Production runs over UDP broadcast; tests script
/// an in-memory link.
pub trait DetectLink {
    fn link_up(&self) -> bool;
    fn local_addr(&self) -> SocketAddr;
    fn broadcast(&mut self, message: &DetectMessage) -> Result<(), DetectError>;
    fn reply(&mut self, origin: SocketAddr, message: &DetectMessage) -> Result<(), DetectError>;
    fn try_recv(&mut self) -> Result<Option<(SocketAddr, DetectMessage)>, DetectError>;
}

/// Externally visible arbitration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseKind {
    Unknown,
    Discovering,
    Proposing,
    Settled,
    Conflicted,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Unknown,
    Discovering { announce_at: u64, deadline: u64, announced: bool },
    Proposing { deadline: u64, next_claim_at: u64 },
    Settled { next_beacon_at: u64 },
    Conflicted { retry_at: u64 },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ArbitrationStats {
    pub discover_rounds: u32,
    pub conflicts: u32,
    pub claims_sent: u32,
    pub settled_count: u32,
}

/// Self-organizing small-integer identity, negotiated over a lossy broadcast
/// domain with no coordinator. An explicit polled state machine: every wait
/// is a deadline checked on the next `poll`, never a blocking sleep and
/// never a recursive retry.
#[derive(Debug)]
pub struct IdentityArbitrator {
    candidate: u8,
    known_in_use: [bool; (ID_MAX as usize) + 1],
    phase: Phase,
    link_was_up: bool,
    rng: StdRng,
    stats: ArbitrationStats,
}

impl IdentityArbitrator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic timing for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            candidate: FALLBACK_ID,
            known_in_use: [false; (ID_MAX as usize) + 1],
            phase: Phase::Unknown,
            link_was_up: false,
            rng,
            stats: ArbitrationStats::default(),
        }
    }

    /// The id this node currently answers to. Stable once `Settled`;
    /// `FALLBACK_ID` whenever the network is down.
    pub fn assigned_id(&self) -> u8 {
        self.candidate
    }

    pub fn phase(&self) -> PhaseKind {
        match self.phase {
            Phase::Unknown => PhaseKind::Unknown,
            Phase::Discovering { .. } => PhaseKind::Discovering,
            Phase::Proposing { .. } => PhaseKind::Proposing,
            Phase::Settled { .. } => PhaseKind::Settled,
            Phase::Conflicted { .. } => PhaseKind::Conflicted,
        }
    }

    pub fn stats(&self) -> ArbitrationStats {
        self.stats
    }

    /// Advance the state machine. Call at a steady cadence; all timing is
    /// derived from `now_ms`.
    pub fn poll<L: DetectLink + ?Sized>(&mut self, now_ms: u64, link: &mut L) {
        if !link.link_up() {
            if self.link_was_up || !matches!(self.phase, Phase::Unknown) {
                info!(id = FALLBACK_ID, "network down, forcing fallback id");
            }
            self.candidate = FALLBACK_ID;
            self.phase = Phase::Unknown;
            self.link_was_up = false;
            return;
        }

        if !self.link_was_up {
            // Fresh link: a pre-disconnect id is never assumed valid.
            self.link_was_up = true;
            self.enter_discovering(now_ms);
        }

        self.drain_inbound(now_ms, link);

        match self.phase {
            Phase::Unknown => self.enter_discovering(now_ms),
            Phase::Discovering { announce_at, deadline, announced } => {
                if !announced && now_ms >= announce_at {
                    self.send(link, &DetectMessage::Discover);
                    self.phase = Phase::Discovering { announce_at, deadline, announced: true };
                }
                if now_ms >= deadline {
                    self.choose_candidate();
                    let next_claim_at = now_ms + self.rng.gen_range(PROPOSE_JITTER_MS);
                    self.phase = Phase::Proposing {
                        deadline: next_claim_at + PROPOSAL_WINDOW_MS,
                        next_claim_at,
                    };
                    info!(id = self.candidate, "proposing candidate id");
                }
            }
            Phase::Proposing { deadline, next_claim_at } => {
                if now_ms >= next_claim_at {
                    self.send(link, &DetectMessage::Claim(self.candidate));
                    self.stats.claims_sent += 1;
                    self.phase = Phase::Proposing {
                        deadline,
                        next_claim_at: next_claim_at + CLAIM_INTERVAL_MS,
                    };
                }
                if now_ms >= deadline {
                    self.stats.settled_count += 1;
                    info!(id = self.candidate, "id settled");
                    self.phase = Phase::Settled { next_beacon_at: now_ms + BEACON_INTERVAL_MS };
                }
            }
            Phase::Settled { next_beacon_at } => {
                if now_ms >= next_beacon_at {
                    self.send(link, &DetectMessage::Claim(self.candidate));
                    self.phase = Phase::Settled { next_beacon_at: now_ms + BEACON_INTERVAL_MS };
                }
            }
            Phase::Conflicted { retry_at } => {
                if now_ms >= retry_at {
                    self.enter_discovering(now_ms);
                }
            }
        }
    }

    fn drain_inbound<L: DetectLink + ?Sized>(&mut self, now_ms: u64, link: &mut L) {
        loop {
            let (origin, message) = match link.try_recv() {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, "receive failed, dropping datagram");
                    break;
                }
            };
            if origin == link.local_addr() {
                continue;
            }
            match message {
                DetectMessage::Discover => {
                    // Whatever phase we are in, answer with the id we hold.
                    let reply = DetectMessage::Claim(self.candidate);
                    if let Err(error) = link.reply(origin, &reply) {
                        warn!(%error, "discover reply failed");
                    }
                }
                DetectMessage::Claim(id) => self.handle_claim(id, origin, now_ms),
            }
        }
    }

    fn handle_claim(&mut self, id: u8, origin: SocketAddr, now_ms: u64) {
        if (ID_MIN..=ID_MAX).contains(&id) {
            self.known_in_use[id as usize] = true;
        }
        let contested = id == self.candidate;
        match self.phase {
            Phase::Proposing { .. } | Phase::Settled { .. } if contested => {
                self.stats.conflicts += 1;
                let retry_at = now_ms + self.rng.gen_range(BACKOFF_MS);
                warn!(id, %origin, retry_at, "id conflict, backing off");
                self.phase = Phase::Conflicted { retry_at };
            }
            _ => {}
        }
    }

    fn enter_discovering(&mut self, now_ms: u64) {
        self.known_in_use = [false; (ID_MAX as usize) + 1];
        self.stats.discover_rounds += 1;
        let announce_at = now_ms + self.rng.gen_range(DISCOVER_JITTER_MS);
        self.phase = Phase::Discovering {
            announce_at,
            deadline: announce_at + DISCOVER_WINDOW_MS,
            announced: false,
        };
        debug!(announce_at, "entering discovery");
    }

    /// Lowest id not seen in use; if every slot is claimed (simultaneous
    /// boot can do this), deterministically take the highest allowed id
    /// rather than failing open.
    fn choose_candidate(&mut self) {
        self.candidate = (ID_MIN..=ID_MAX)
            .find(|&id| !self.known_in_use[id as usize])
            .unwrap_or(ID_MAX);
    }

    fn send<L: DetectLink + ?Sized>(&mut self, link: &mut L, message: &DetectMessage) {
        if let Err(error) = link.broadcast(message) {
            warn!(%error, "broadcast failed");
        }
    }
}

impl Default for IdentityArbitrator {
    fn default() -> Self {
        Self::new()
    }
}

/// UDP broadcast implementation of [`DetectLink`]. Nonblocking; send
/// failures mark the link down until a send succeeds again.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    broadcast_to: SocketAddr,
    local: SocketAddr,
    up: bool,
}

impl UdpLink {
    pub fn bind(port: u16) -> Result<Self, DetectError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let broadcast_to = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
        let local = SocketAddr::new(local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
        Ok(Self { socket, broadcast_to, local, up: true })
    }
}

impl DetectLink for UdpLink {
    fn link_up(&self) -> bool {
        self.up
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn broadcast(&mut self, message: &DetectMessage) -> Result<(), DetectError> {
        let wire = message.encode()?;
        match self.socket.send_to(wire.as_bytes(), self.broadcast_to) {
            Ok(_) => {
                self.up = true;
                Ok(())
            }
            Err(error) => {
                self.up = false;
                Err(error.into())
            }
        }
    }

    fn reply(&mut self, origin: SocketAddr, message: &DetectMessage) -> Result<(), DetectError> {
        let wire = message.encode()?;
        self.socket.send_to(wire.as_bytes(), origin)?;
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<(SocketAddr, DetectMessage)>, DetectError> {
        let mut buf = [0u8; 64];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, origin)) => match DetectMessage::parse(&buf[..len]) {
                    Some(message) => return Ok(Some((origin, message))),
                    None => continue,
                },
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(error) => return Err(error.into()),
            }
        }
    }
}

// Own broadcasts loop back with our routable address as origin; discover it
// the portable way, via the local end of a connected probe socket.
fn local_ip() -> Option<IpAddr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.set_broadcast(true).ok()?;
    probe.connect((Ipv4Addr::BROADCAST, DETECT_PORT)).ok()?;
    probe.local_addr().ok().map(|addr| addr.ip())
}
