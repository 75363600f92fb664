//! Shared recording state
//!
//! One [`SourceState`] per configured source, plus the session-wide
//! "timeout requested" flag. There are no locks: every field has exactly one
//! writer.
//!
//! | field                | writer                 |
//! |----------------------|------------------------|
//! | `entries_received`   | the source's tailer    |
//! | `entries_written`    | the writer worker      |
//! | `alive`              | the source's tailer    |
//! | `last_received_at`   | the source's tailer    |
//! | `last_empty_poll_at` | the source's tailer    |
//! | `timeout_requested`  | the orchestrator       |
//!
//! The status reporter only reads, and may see slightly stale values.

use crate::error::ConfigError;
use crate::source::{SourcePosition, SourceRole, NO_POSITION};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Marker for "no empty poll yet"
const NEVER: i64 = i64::MIN;

/// Run-state of one source
pub struct SourceState {
    key: String,
    role: SourceRole,
    entries_received: AtomicU64,
    entries_written: AtomicU64,
    alive: AtomicBool,
    last_received_at: AtomicU64,
    last_empty_poll_at: AtomicI64,
    describe_position: fn(u64) -> Option<String>,
}

impl SourceState {
    /// Create the state of a source whose records are ordered by `P`
    pub fn new<P: SourcePosition>(key: impl Into<String>, role: SourceRole) -> Self {
        Self {
            key: key.into(),
            role,
            entries_received: AtomicU64::new(0),
            entries_written: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            last_received_at: AtomicU64::new(NO_POSITION),
            last_empty_poll_at: AtomicI64::new(NEVER),
            describe_position: P::describe_raw,
        }
    }

    /// Source key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Source role
    pub fn role(&self) -> SourceRole {
        self.role
    }

    /// Events polled and enqueued
    pub fn entries_received(&self) -> u64 {
        self.entries_received.load(Ordering::SeqCst)
    }

    /// Events persisted
    pub fn entries_written(&self) -> u64 {
        self.entries_written.load(Ordering::SeqCst)
    }

    /// Check if the source's tailer is still looping
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Raw encoding of the last polled position
    pub fn last_received_raw(&self) -> u64 {
        self.last_received_at.load(Ordering::SeqCst)
    }

    /// Last polled position, for display
    pub fn last_received(&self) -> Option<String> {
        (self.describe_position)(self.last_received_raw())
    }

    /// Wall-clock time of the last empty poll
    pub fn last_empty_poll_at(&self) -> Option<DateTime<Utc>> {
        match self.last_empty_poll_at.load(Ordering::SeqCst) {
            NEVER => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }

    // Tailer-owned writes

    pub(crate) fn set_last_received<P: SourcePosition>(&self, position: P) {
        self.last_received_at.store(position.to_raw(), Ordering::SeqCst);
    }

    pub(crate) fn set_last_empty_poll(&self, at: DateTime<Utc>) {
        self.last_empty_poll_at.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub(crate) fn record_received(&self) {
        self.entries_received.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo [`SourceState::record_received`] for an event that never made
    /// it onto the queue
    pub(crate) fn unrecord_received(&self) {
        self.entries_received.fetch_sub(1, Ordering::SeqCst);
    }

    /// Mark the tailer as exited; returns `true` the first time only
    pub(crate) fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    // Writer-owned writes

    pub(crate) fn record_written(&self) {
        self.entries_written.fetch_add(1, Ordering::SeqCst);
    }

    /// Consistent-enough copy for reporting
    ///
    /// `entries_written` is read before `entries_received`; since an event
    /// is counted as received before it is enqueued, the snapshot always
    /// satisfies `written <= received`.
    pub fn snapshot(&self) -> SourceSnapshot {
        let entries_written = self.entries_written();
        let entries_received = self.entries_received();
        SourceSnapshot {
            key: self.key.clone(),
            role: self.role,
            entries_received,
            entries_written,
            alive: self.is_alive(),
            last_received: self.last_received(),
            last_empty_poll_at: self.last_empty_poll_at(),
        }
    }
}

impl fmt::Debug for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceState")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("entries_received", &self.entries_received())
            .field("entries_written", &self.entries_written())
            .field("alive", &self.is_alive())
            .field("last_received_at", &self.last_received())
            .field("last_empty_poll_at", &self.last_empty_poll_at())
            .finish()
    }
}

/// Run-state of a whole session
#[derive(Debug, Default)]
pub struct RecordingState {
    sources: BTreeMap<String, SourceState>,
    timeout_requested: AtomicBool,
}

impl RecordingState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source before the session starts
    pub fn add_source<P: SourcePosition>(
        &mut self,
        key: impl Into<String>,
        role: SourceRole,
    ) -> Result<(), ConfigError> {
        let key = key.into();
        if self.sources.contains_key(&key) {
            return Err(ConfigError::DuplicateSourceKey(key));
        }
        let state = SourceState::new::<P>(key.clone(), role);
        self.sources.insert(key, state);
        Ok(())
    }

    /// State of one source
    pub fn source(&self, key: &str) -> Option<&SourceState> {
        self.sources.get(key)
    }

    /// All sources, in key order
    pub fn sources(&self) -> impl Iterator<Item = &SourceState> {
        self.sources.values()
    }

    /// Number of sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Check if no source is registered
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Check if every source is still alive
    pub fn all_alive(&self) -> bool {
        self.sources.values().all(SourceState::is_alive)
    }

    /// Check if at least one source is still alive
    pub fn any_alive(&self) -> bool {
        self.sources.values().any(SourceState::is_alive)
    }

    /// Close the session window (orchestrator only)
    pub fn request_timeout(&self) {
        self.timeout_requested.store(true, Ordering::SeqCst);
    }

    /// Check if the session window has been closed
    pub fn timeout_requested(&self) -> bool {
        self.timeout_requested.load(Ordering::SeqCst)
    }

    /// Copy of every source's counters
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            sources: self.sources.values().map(SourceState::snapshot).collect(),
        }
    }
}

/// Point-in-time copy of one source's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub key: String,
    pub role: SourceRole,
    pub entries_received: u64,
    pub entries_written: u64,
    pub alive: bool,
    pub last_received: Option<String>,
    pub last_empty_poll_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the session state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateSnapshot {
    pub sources: Vec<SourceSnapshot>,
}

impl StateSnapshot {
    /// Snapshot of one source
    pub fn source(&self, key: &str) -> Option<&SourceSnapshot> {
        self.sources.iter().find(|s| s.key == key)
    }

    /// Total events received across sources
    pub fn total_received(&self) -> u64 {
        self.sources.iter().map(|s| s.entries_received).sum()
    }

    /// Total events written across sources
    pub fn total_written(&self) -> u64 {
        self.sources.iter().map(|s| s.entries_written).sum()
    }
}

fn or_none<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "None".to_string(),
    }
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for source in &self.sources {
            write!(
                f,
                "\n\t{}: received {} entries, {} of them were written, \
                 last received entry ts: {}, last get-none ts: {}",
                source.key,
                source.entries_received,
                source.entries_written,
                or_none(&source.last_received),
                or_none(&source.last_empty_poll_at.map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f"))),
            )?;
        }
        Ok(())
    }
}
