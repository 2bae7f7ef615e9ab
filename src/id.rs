//! Time-partitioned request identifiers.
//!
//! # Layout
//!
//! A [`RequestId`] is a 63-bit unsigned value:
//!
//! ```text
//! | 39 bits elapsed time | 8 bits sequence | 16 bits machine id |
//! ```
//!
//! - **elapsed time**: 10 ms partitions since the generator's start time
//!   (2014-09-01 UTC unless configured). ~174 years of range.
//! - **sequence**: disambiguates IDs issued within one partition. Resets to
//!   zero whenever the partition advances.
//! - **machine id**: distinguishes processes sharing a fleet. Defaults to a
//!   hash of the host name; pass [`Settings::machine_id`] when you need a
//!   guarantee rather than a very good chance.
//!
//! Because the partition sits in the high bits, IDs sort roughly by creation
//! time across the whole fleet.
//!
//! # Text form
//!
//! The value is written as an unsigned LEB128 varint into a fixed,
//! zero-padded [`ENCODED_BYTES`]-byte buffer and rendered as URL-safe base64.
//! Nine bytes is the widest varint a 63-bit value can produce, so every token
//! is exactly 12 characters, never padded, and safe in a header value as-is.
//!
//! # Sequence exhaustion
//!
//! At most 256 IDs fit in one partition per machine. The 257th caller
//! borrows the next partition and sleeps until it starts on the clock, so a
//! burst above ~25 600 IDs/s shows up as latency, never as a duplicate. The
//! sleep happens outside the lock.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub const BIT_LEN_TIME: u32 = 39;
pub const BIT_LEN_SEQUENCE: u32 = 8;
pub const BIT_LEN_MACHINE_ID: u32 = 63 - BIT_LEN_TIME - BIT_LEN_SEQUENCE;

/// Width of the zero-padded varint buffer behind every token.
pub const ENCODED_BYTES: usize = 9;

const TIME_UNIT_MS: u64 = 10;
const SEQUENCE_MASK: u16 = (1 << BIT_LEN_SEQUENCE) - 1;
const MACHINE_ID_MASK: u64 = (1 << BIT_LEN_MACHINE_ID) - 1;

// 2014-09-01T00:00:00Z
const DEFAULT_START_MS: u64 = 1_409_529_600_000;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("cannot determine machine id: {0}")]
    NoMachineId(String),

    #[error("machine id {0} rejected by validator")]
    InvalidMachineId(u16),

    #[error("start time is in the future")]
    StartTimeInFuture,

    #[error("start time is before the Unix epoch")]
    StartTimeBeforeEpoch,

    #[error("clock moved backwards: partition {now} is earlier than {last}")]
    ClockMovedBackwards { last: u64, now: u64 },

    #[error("time partition {0} does not fit in the id layout")]
    OverTimeLimit(u64),

    #[error("malformed request id: {0}")]
    Malformed(&'static str),
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Source of wall-clock time for the generator.
///
/// Swap in a virtual clock to make partition changes and regressions
/// deterministic in tests.
pub trait ClockSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now(&self) -> u64;

    /// Blocks the calling thread for `duration`.
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Reads [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Construction options for [`IdGenerator`]. Every field is optional.
///
/// ```rust
/// use reqlog::id::{IdGenerator, Settings};
///
/// let generator = IdGenerator::new(Settings::new().machine_id(7)).unwrap();
/// assert_eq!(generator.machine_id(), 7);
/// ```
#[derive(Default)]
pub struct Settings {
    start_time: Option<DateTime<Utc>>,
    machine_id: Option<u16>,
    check_machine_id: Option<Box<dyn Fn(u16) -> bool + Send + Sync>>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Epoch the elapsed-time component counts from. Must not be in the future.
    pub fn start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Fixes the machine component instead of deriving it from the host name.
    pub fn machine_id(mut self, id: u16) -> Self {
        self.machine_id = Some(id);
        self
    }

    /// Validator run once at construction, e.g. against a registry of IDs
    /// already claimed in the fleet. Returning `false` fails construction.
    pub fn check_machine_id(mut self, check: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        self.check_machine_id = Some(Box::new(check));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }
}

// ── RequestId ─────────────────────────────────────────────────────────────────

/// A generated correlation identifier.
///
/// `Display` renders the URL-safe token; [`FromStr`] parses it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

/// The fields packed into a [`RequestId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdParts {
    /// Partitions elapsed since the generator's start time.
    pub time: u64,
    pub sequence: u16,
    pub machine_id: u16,
}

impl RequestId {
    /// Largest representable value (63 bits).
    pub const MAX: u64 = (1 << 63) - 1;

    /// Wraps a raw value, rejecting anything wider than 63 bits.
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn decompose(self) -> IdParts {
        IdParts {
            time: self.0 >> (BIT_LEN_SEQUENCE + BIT_LEN_MACHINE_ID),
            sequence: ((self.0 >> BIT_LEN_MACHINE_ID) & u64::from(SEQUENCE_MASK)) as u16,
            machine_id: (self.0 & MACHINE_ID_MASK) as u16,
        }
    }

    pub fn encode(self) -> String {
        let mut buf = [0u8; ENCODED_BYTES];
        let mut value = self.0;
        for byte in &mut buf {
            if value < 0x80 {
                *byte = value as u8;
                break;
            }
            *byte = (value as u8) | 0x80;
            value >>= 7;
        }
        URL_SAFE.encode(buf)
    }

    pub fn decode(token: &str) -> Result<Self, IdError> {
        let bytes = URL_SAFE
            .decode(token)
            .map_err(|_| IdError::Malformed("not url-safe base64"))?;
        let buf: [u8; ENCODED_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdError::Malformed("wrong length"))?;

        let mut value = 0u64;
        for (i, byte) in buf.iter().copied().enumerate() {
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                if buf[i + 1..].iter().any(|&b| b != 0) {
                    return Err(IdError::Malformed("trailing bytes after varint"));
                }
                return Self::from_raw(value).ok_or(IdError::Malformed("value out of range"));
            }
        }
        Err(IdError::Malformed("unterminated varint"))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for RequestId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

// ── Generator ─────────────────────────────────────────────────────────────────

/// Issues unique [`RequestId`]s.
///
/// Build one at startup and share it as `Arc<IdGenerator>`. A process that
/// cannot build one must not serve traffic:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use reqlog::id::{IdGenerator, Settings};
///
/// let generator = Arc::new(
///     IdGenerator::new(Settings::new()).expect("request id generator"),
/// );
/// ```
pub struct IdGenerator {
    /// Start time, in partitions since the Unix epoch.
    start: u64,
    machine_id: u16,
    clock: Arc<dyn ClockSource>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Partition stamped on the last issued ID. May run ahead of the clock
    /// after a sequence wrap.
    elapsed: u64,
    sequence: u16,
    /// Latest partition read from the clock.
    last_seen: u64,
}

impl IdGenerator {
    pub fn new(settings: Settings) -> Result<Self, IdError> {
        let clock = settings.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let start_ms = match settings.start_time {
            Some(start) => u64::try_from(start.timestamp_millis())
                .map_err(|_| IdError::StartTimeBeforeEpoch)?,
            None => DEFAULT_START_MS,
        };
        if start_ms > clock.now() {
            return Err(IdError::StartTimeInFuture);
        }

        let machine_id = match settings.machine_id {
            Some(id) => id,
            None => host_machine_id()?,
        };
        if let Some(check) = &settings.check_machine_id {
            if !check(machine_id) {
                return Err(IdError::InvalidMachineId(machine_id));
            }
        }

        Ok(Self {
            start: start_ms / TIME_UNIT_MS,
            machine_id,
            clock,
            state: Mutex::new(State::default()),
        })
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    /// Returns a new, never-before-issued ID.
    ///
    /// May block when the sequence for the current partition is exhausted,
    /// until the borrowed partition begins. Fails if the clock is observed
    /// moving backwards, including while waiting; the caller decides whether
    /// to retry.
    pub fn next_id(&self) -> Result<RequestId, IdError> {
        let reservation = self.reserve()?;
        self.wait_for(&reservation)?;
        Ok(reservation.id)
    }

    /// Wall-clock time of the partition an ID was stamped with.
    pub fn time_of(&self, id: RequestId) -> Option<DateTime<Utc>> {
        let ms = (self.start + id.decompose().time).checked_mul(TIME_UNIT_MS)?;
        DateTime::from_timestamp_millis(i64::try_from(ms).ok()?)
    }

    /// Claims the next partition/sequence pair. The partition may not have
    /// begun on the clock yet; see [`wait_for`](Self::wait_for).
    pub(crate) fn reserve(&self) -> Result<Reservation, IdError> {
        let (elapsed, sequence, observed) = {
            let mut state = self.state.lock();
            let current = self.partition_at(self.clock.now());
            if current < state.last_seen {
                return Err(IdError::ClockMovedBackwards { last: state.last_seen, now: current });
            }
            state.last_seen = current;

            if state.elapsed < current {
                state.elapsed = current;
                state.sequence = 0;
            } else {
                state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
                if state.sequence == 0 {
                    state.elapsed += 1;
                }
            }
            (state.elapsed, state.sequence, current)
        };

        if elapsed >= 1 << BIT_LEN_TIME {
            return Err(IdError::OverTimeLimit(elapsed));
        }

        let id = RequestId(
            elapsed << (BIT_LEN_SEQUENCE + BIT_LEN_MACHINE_ID)
                | u64::from(sequence) << BIT_LEN_MACHINE_ID
                | u64::from(self.machine_id),
        );
        Ok(Reservation { id, observed })
    }

    /// Whether the reserved partition has begun on the clock.
    pub(crate) fn is_due(&self, reservation: &Reservation) -> bool {
        self.clock.now() >= self.partition_start_ms(reservation.id.decompose().time)
    }

    /// Sleeps until the reserved partition begins.
    ///
    /// The clock may not read earlier than the partition observed under the
    /// lock; if it does, the wait ends with [`IdError::ClockMovedBackwards`].
    pub(crate) fn wait_for(&self, reservation: &Reservation) -> Result<(), IdError> {
        let target_ms = self.partition_start_ms(reservation.id.decompose().time);
        let floor_ms = self.partition_start_ms(reservation.observed);
        loop {
            let now = self.clock.now();
            if now >= target_ms {
                return Ok(());
            }
            if now < floor_ms {
                return Err(IdError::ClockMovedBackwards {
                    last: reservation.observed,
                    now: self.partition_at(now),
                });
            }
            self.clock.sleep(Duration::from_millis(target_ms - now));
        }
    }

    fn partition_at(&self, now_ms: u64) -> u64 {
        (now_ms / TIME_UNIT_MS).saturating_sub(self.start)
    }

    fn partition_start_ms(&self, partition: u64) -> u64 {
        (self.start + partition) * TIME_UNIT_MS
    }
}

/// An ID claimed under the generator's lock, with the partition the clock
/// read at the time.
pub(crate) struct Reservation {
    pub(crate) id: RequestId,
    observed: u64,
}

fn host_machine_id() -> Result<u16, IdError> {
    let name = hostname::get().map_err(|e| IdError::NoMachineId(e.to_string()))?;
    let name = name.to_string_lossy();
    if name.is_empty() {
        return Err(IdError::NoMachineId("empty host name".to_owned()));
    }
    let digest = Sha256::digest(name.as_bytes());
    Ok(u16::from_be_bytes([digest[0], digest[1]]))
}
