//! Tailer worker: polls one source into the fan-in queue
//!
//! Loop contract (one thread per source):
//!
//! - keep going while this source and every sibling source are alive; the
//!   oplog and the profilers are only useful as a matched set, so one dying
//!   source ends all of them
//! - an event past the cutoff ends the loop once the window is closed; the
//!   comparison uses the event's own position, not wall-clock time
//! - an empty poll ends the loop once the window is closed, otherwise the
//!   tailer backs off and polls again
//! - a missing or non-capped collection is logged on the first iteration
//!   only and polling continues
//! - a malformed record is logged and dropped

use crate::error::{ConfigError, SourceError, WorkerError, WorkerResult};
use crate::recorder::queue::{QueueItem, QueueSender};
use crate::recorder::state::RecordingState;
use crate::recorder::worker::WorkerDescriptor;
use crate::source::{Fetch, SourcePosition, SourceRole, TailSource};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why a tailer loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailExit {
    /// An event at or past the cutoff arrived after the window closed
    CutoffReached,

    /// An empty poll after the window closed
    WindowClosed,

    /// This source or a sibling is no longer alive
    SiblingExited,

    /// The source failed and cannot continue
    SourceFailed(String),

    /// The writer side of the queue is gone
    QueueClosed,

    /// The source key is not in the recording state
    NotRegistered,
}

/// Everything a tailer shares with the rest of the session
#[derive(Clone)]
pub struct TailerContext {
    /// Source key (queue tag and state key)
    pub key: Arc<str>,

    /// Shared run-state
    pub state: Arc<RecordingState>,

    /// Queue to the writer
    pub queue: QueueSender,

    /// Sleep between empty or failed polls
    pub backoff: Duration,
}

/// Poll `source` into the queue until one of the exit conditions holds
///
/// Marks the source dead and logs completion exactly once on return.
pub fn tail_to_queue<S: TailSource>(
    mut source: S,
    ctx: TailerContext,
    cutoff: S::Position,
) -> TailExit {
    let key = ctx.key.as_ref();
    let Some(own) = ctx.state.source(key) else {
        error!(source = %key, "Tailer started for an unregistered source");
        return TailExit::NotRegistered;
    };

    let mut loops: u64 = 0;
    let mut exit = TailExit::SiblingExited;

    while own.is_alive() && ctx.state.all_alive() {
        match source.fetch_next() {
            Ok(Fetch::Event { position, document }) => {
                own.set_last_received(position);
                if ctx.state.timeout_requested() && position >= cutoff {
                    debug!(source = %key, position = %position.describe(), "Cutoff reached");
                    exit = TailExit::CutoffReached;
                    break;
                }

                own.record_received();
                if ctx.queue.send(QueueItem::new(Arc::clone(&ctx.key), document)).is_err() {
                    own.unrecord_received();
                    error!(source = %key, "Queue closed, dropping record");
                    exit = TailExit::QueueClosed;
                    break;
                }
            }
            Ok(Fetch::Empty) => {
                if ctx.state.timeout_requested() {
                    exit = TailExit::WindowClosed;
                    break;
                }
                own.set_last_empty_poll(Utc::now());
                thread::sleep(ctx.backoff);
            }
            Err(e) if e.is_unavailable() => {
                if loops == 0 {
                    error!(
                        source = %key,
                        namespace = %source.namespace(),
                        error = %e,
                        "BADRUN: collection appears to be missing or non-capped"
                    );
                }
                thread::sleep(ctx.backoff);
            }
            Err(e) if e.is_fatal() => {
                warn!(source = %key, error = %e, "Source stopped");
                exit = TailExit::SourceFailed(e.to_string());
                break;
            }
            Err(e @ SourceError::Decode { .. }) => {
                error!(source = %key, error = %e, "SKIPPING record");
            }
            Err(e) => {
                warn!(source = %key, error = %e, "Poll failed, retrying");
                thread::sleep(ctx.backoff);
            }
        }
        loops += 1;
    }

    if own.mark_dead() {
        info!(
            source = %key,
            received = own.entries_received(),
            reason = ?exit,
            "Tailing to queue completed"
        );
    }
    exit
}

/// Start and end of a recording window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A source ready to be registered and tailed, with its position type
/// erased so oplog and profiler sources can share one plan
pub trait SessionSource: Send {
    /// Source key
    fn key(&self) -> &str;

    /// Oplog or profiler
    fn role(&self) -> SourceRole;

    /// Worker name, for logs
    fn worker_name(&self) -> String;

    /// Add this source's state to the session
    fn register(&self, state: &mut RecordingState) -> Result<(), ConfigError>;

    /// Position the source at the window start and start its tailer,
    /// stopping at the window end
    fn spawn(self: Box<Self>, ctx: TailerContext, window: SessionWindow) -> WorkerResult<WorkerDescriptor>;
}

/// Typed source plus the metadata the session needs
pub struct TailerSpec<S> {
    key: String,
    role: SourceRole,
    name: String,
    source: S,
}

impl<S: TailSource + 'static> TailerSpec<S> {
    /// Create a spec for `source` under `key`
    pub fn new(key: impl Into<String>, role: SourceRole, source: S) -> Self {
        let key = key.into();
        Self {
            name: format!("tailing-{} {}", role, key),
            key,
            role,
            source,
        }
    }

    /// Override the worker name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<S: TailSource + 'static> SessionSource for TailerSpec<S> {
    fn key(&self) -> &str {
        &self.key
    }

    fn role(&self) -> SourceRole {
        self.role
    }

    fn worker_name(&self) -> String {
        self.name.clone()
    }

    fn register(&self, state: &mut RecordingState) -> Result<(), ConfigError> {
        state.add_source::<S::Position>(self.key.clone(), self.role)
    }

    fn spawn(self: Box<Self>, ctx: TailerContext, window: SessionWindow) -> WorkerResult<WorkerDescriptor> {
        let TailerSpec { key, name, mut source, .. } = *self;
        if ctx.key.as_ref() != key {
            return Err(WorkerError::UnknownSource(key));
        }

        source.start_at(S::Position::from_wall_clock(window.start));
        let cutoff = S::Position::from_wall_clock(window.end);
        let cancel = source.cancel_handle();

        debug!(source = %key, cutoff = %cutoff.describe(), "Starting tailer");
        WorkerDescriptor::spawn(name, cancel, move || {
            tail_to_queue(source, ctx, cutoff);
        })
    }
}
