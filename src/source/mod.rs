//! Pollable change sources
//!
//! A recording session tails two kinds of sources that share one polling
//! routine:
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────────┐
//! │     OplogSource      │        │     ProfilerSource (N)   │
//! │  local.oplog.rs      │        │  <db>.system.profile     │
//! │  position: Timestamp │        │  position: DateTime<Utc> │
//! └──────────┬───────────┘        └────────────┬─────────────┘
//!            │        TailSource::fetch_next     │
//!            └────────────────┬─────────────────┘
//!                             ▼
//!                     tail_to_queue (one thread each)
//! ```
//!
//! The tailer only needs "next event, nothing yet, or an error", plus an
//! out-of-band [`CancelHandle`] that forces a pending fetch to fail during a
//! forced shutdown. The MongoDB sources run their reads on a [`Poller`]
//! thread so that the cancel releases a fetch blocked on the network.

pub mod mongo;
pub mod oplog;
pub mod poller;
pub mod position;
pub mod profiler;

pub use mongo::{ClientHandle, MongoConnector};
pub use oplog::OplogSource;
pub use poller::Poller;
pub use position::{OplogTimestamp, SourcePosition, NO_POSITION};
pub use profiler::ProfilerSource;

use crate::error::SourceResult;
use mongodb::bson::Document;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which side of the recording a source feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceRole {
    /// The single ordered change-feed (oplog)
    ChangeFeed,

    /// A per-database profiling collection
    Profiler,
}

impl fmt::Display for SourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRole::ChangeFeed => write!(f, "oplog"),
            SourceRole::Profiler => write!(f, "profiler"),
        }
    }
}

/// Outcome of a successful poll
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch<P> {
    /// One raw record and its native position
    Event { position: P, document: Document },

    /// Nothing new is available right now
    Empty,
}

/// A source that can be tailed by a worker thread
pub trait TailSource: Send {
    /// Native ordering of this source's records
    type Position: SourcePosition;

    /// Namespace being tailed (for logs)
    fn namespace(&self) -> &str;

    /// Begin polling after the given position
    fn start_at(&mut self, position: Self::Position);

    /// Fetch the next record, or report that none is available yet
    fn fetch_next(&mut self) -> SourceResult<Fetch<Self::Position>>;

    /// Handle that aborts a pending fetch, if the source supports it
    fn cancel_handle(&self) -> Option<CancelHandle>;
}

/// Out-of-band cancellation for a source's in-flight fetch
#[derive(Clone)]
pub struct CancelHandle {
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl CancelHandle {
    /// Wrap an arbitrary cancellation callback
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Cancellation that raises a shared flag checked by the source
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self::new(move || flag.store(true, Ordering::SeqCst))
    }

    /// Invoke the callback (idempotent for flag-based handles)
    pub fn cancel(&self) {
        (self.callback)();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! In-memory source driven by a fixed script, for tests

    use super::*;
    use crate::error::SourceError;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// One scripted poll result
    #[derive(Debug, Clone)]
    pub enum Step {
        Event(u64),
        Empty,
        Unavailable,
        Decode,
        Query,
        Fatal,
    }

    /// Source that replays `steps`, then reports `Empty` (or keeps
    /// reporting `Unavailable` when `stuck_unavailable` is set)
    pub struct ScriptedSource {
        pub namespace: String,
        pub steps: VecDeque<Step>,
        pub stuck_unavailable: bool,
        pub cancelled: Arc<AtomicBool>,
        pub polls: Arc<AtomicUsize>,
        pub started_at: Option<u64>,
    }

    impl ScriptedSource {
        pub fn new(namespace: &str, steps: Vec<Step>) -> Self {
            Self {
                namespace: namespace.to_string(),
                steps: steps.into(),
                stuck_unavailable: false,
                cancelled: Arc::new(AtomicBool::new(false)),
                polls: Arc::new(AtomicUsize::new(0)),
                started_at: None,
            }
        }

        /// Events 1..=count followed by empty polls
        pub fn counting(namespace: &str, count: u64) -> Self {
            Self::new(namespace, (1..=count).map(Step::Event).collect())
        }

        pub fn unavailable(namespace: &str) -> Self {
            let mut source = Self::new(namespace, Vec::new());
            source.stuck_unavailable = true;
            source
        }
    }

    impl TailSource for ScriptedSource {
        type Position = u64;

        fn namespace(&self) -> &str {
            &self.namespace
        }

        fn start_at(&mut self, position: u64) {
            self.started_at = Some(position);
        }

        fn fetch_next(&mut self) -> SourceResult<Fetch<u64>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(SourceError::Cancelled {
                    namespace: self.namespace.clone(),
                });
            }
            let step = match self.steps.pop_front() {
                Some(step) => step,
                None if self.stuck_unavailable => Step::Unavailable,
                None => Step::Empty,
            };
            let namespace = self.namespace.clone();
            match step {
                Step::Event(n) => Ok(Fetch::Event {
                    position: n,
                    document: mongodb::bson::doc! { "seq": n as i64, "ns": namespace },
                }),
                Step::Empty => Ok(Fetch::Empty),
                Step::Unavailable => Err(SourceError::Unavailable {
                    namespace,
                    reason: "collection not found".into(),
                }),
                Step::Decode => Err(SourceError::Decode {
                    namespace,
                    reason: "missing ts".into(),
                }),
                Step::Query => Err(SourceError::Query {
                    namespace,
                    reason: "socket reset".into(),
                }),
                Step::Fatal => Err(SourceError::Cancelled { namespace }),
            }
        }

        fn cancel_handle(&self) -> Option<CancelHandle> {
            Some(CancelHandle::from_flag(Arc::clone(&self.cancelled)))
        }
    }
}
