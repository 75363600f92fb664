//! Native source positions
//!
//! The oplog orders entries by a BSON timestamp (seconds + increment), the
//! profiler by a millisecond wall-clock datetime. The two are not
//! interchangeable, so every cutoff comparison happens in the source's own
//! position type.
//!
//! Positions also encode to a non-zero `u64` so that `SourceState` can store
//! the last received position in an atomic without a lock.

use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::Timestamp;
use std::fmt;

/// Raw encoding reserved for "no position yet"
pub const NO_POSITION: u64 = 0;

/// A totally ordered, source-native position
pub trait SourcePosition: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    /// Position corresponding to a wall-clock instant
    fn from_wall_clock(at: DateTime<Utc>) -> Self;

    /// Lossless non-zero encoding
    fn to_raw(self) -> u64;

    /// Inverse of [`SourcePosition::to_raw`]
    fn from_raw(raw: u64) -> Self;

    /// Human-readable form for status lines
    fn describe(self) -> String;

    /// Describe a raw encoding, `None` for [`NO_POSITION`]
    fn describe_raw(raw: u64) -> Option<String> {
        if raw == NO_POSITION {
            None
        } else {
            Some(Self::from_raw(raw).describe())
        }
    }
}

/// Oplog timestamp: seconds since the epoch plus an increment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OplogTimestamp {
    /// Seconds since the epoch
    pub secs: u32,

    /// Ordinal within the second
    pub inc: u32,
}

impl OplogTimestamp {
    /// Create a timestamp
    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Convert to the BSON representation
    pub fn to_bson(self) -> Timestamp {
        Timestamp {
            time: self.secs,
            increment: self.inc,
        }
    }
}

impl From<Timestamp> for OplogTimestamp {
    fn from(ts: Timestamp) -> Self {
        Self::new(ts.time, ts.increment)
    }
}

impl fmt::Display for OplogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

impl SourcePosition for OplogTimestamp {
    fn from_wall_clock(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp().clamp(0, u32::MAX as i64) as u32;
        Self::new(secs, 0)
    }

    fn to_raw(self) -> u64 {
        // (0, 0) is not a real oplog position
        ((self.secs as u64) << 32) | self.inc as u64
    }

    fn from_raw(raw: u64) -> Self {
        Self::new((raw >> 32) as u32, raw as u32)
    }

    fn describe(self) -> String {
        self.to_string()
    }
}

impl SourcePosition for DateTime<Utc> {
    fn from_wall_clock(at: DateTime<Utc>) -> Self {
        at
    }

    fn to_raw(self) -> u64 {
        self.timestamp_millis().max(1) as u64
    }

    fn from_raw(raw: u64) -> Self {
        Utc.timestamp_millis_opt(raw as i64)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn describe(self) -> String {
        self.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }
}

/// Plain sequence numbers; wall-clock instants map to epoch milliseconds
impl SourcePosition for u64 {
    fn from_wall_clock(at: DateTime<Utc>) -> Self {
        at.timestamp_millis().max(1) as u64
    }

    fn to_raw(self) -> u64 {
        self
    }

    fn from_raw(raw: u64) -> Self {
        raw
    }

    fn describe(self) -> String {
        self.to_string()
    }
}
