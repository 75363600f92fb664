//! Recording orchestrator - runs one bounded recording session
//!
//! ```text
//!   Idle ──► Running ──► Draining ──► Closed
//!             │             │            │
//!             │             │            └─ stop reporter, close streams,
//!             │             │               reconcile
//!             │             └─ timeout_requested = true, join workers
//!             │                with doubling budgets
//!             └─ open streams, start tailers, writer, reporter; wait for
//!                window end, all sources gone, or operator stop
//! ```
//!
//! Workers are joined in start order: tailers first, then the writer. The
//! writer cannot finish before the last tailer, so joining it first would
//! leave a stuck tailer without its cancel callback ever being reached.

use crate::error::{ConfigError, RecorderError, Result, WorkerError};
use crate::merge::{MergeSummary, ReconcileInputs, Reconciler};
use crate::recorder::queue::{FanInQueue, QueueCounts};
use crate::recorder::state::{RecordingState, StateSnapshot};
use crate::recorder::status::StatusReporter;
use crate::recorder::tailer::{SessionSource, SessionWindow, TailerContext};
use crate::recorder::worker::{join_with_escalation, JoinReport, WorkerDescriptor};
use crate::recorder::writer::{write_to_streams, WriterOutcome};
use crate::source::SourceRole;
use crate::stream::{StreamInfo, StreamSet};
use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Name of the writer worker
const WRITER_NAME: &str = "write-all-docs-to-file";

/// Session tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderOptions {
    /// Tailer sleep after an empty or failed poll
    pub poll_backoff: Duration,

    /// Writer receive timeout between liveness checks
    pub writer_poll: Duration,

    /// Status line interval
    pub status_interval: Duration,

    /// Orchestrator wait-loop interval
    pub check_interval: Duration,

    /// First join budget while draining (doubles on every miss)
    pub join_budget: Duration,

    /// Fan-in queue capacity
    pub queue_capacity: usize,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            poll_backoff: Duration::from_secs(1),
            writer_poll: Duration::from_secs(1),
            status_interval: Duration::from_secs(3),
            check_interval: Duration::from_secs(1),
            join_budget: Duration::from_secs(5),
            queue_capacity: 100_000,
        }
    }
}

/// A source and the stream it records into
pub struct PlannedSource {
    pub source: Box<dyn SessionSource>,
    pub stream: PathBuf,
}

/// Sources of one session and the final trace path
pub struct SessionPlan {
    sources: Vec<PlannedSource>,
    output: PathBuf,
}

impl SessionPlan {
    /// Create an empty plan writing the trace to `output`
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            sources: Vec::new(),
            output: output.into(),
        }
    }

    /// Add a source recording into `stream`
    pub fn with_source(mut self, source: impl SessionSource + 'static, stream: impl Into<PathBuf>) -> Self {
        self.push(Box::new(source), stream);
        self
    }

    /// Add a boxed source recording into `stream`
    pub fn push(&mut self, source: Box<dyn SessionSource>, stream: impl Into<PathBuf>) {
        self.sources.push(PlannedSource {
            source,
            stream: stream.into(),
        });
    }

    /// Planned sources, in start order
    pub fn sources(&self) -> &[PlannedSource] {
        &self.sources
    }

    /// Final trace path
    pub fn output(&self) -> &PathBuf {
        &self.output
    }

    /// Check for exactly one oplog, at least one profiler and unique keys
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let feeds = self
            .sources
            .iter()
            .filter(|p| p.source.role() == SourceRole::ChangeFeed)
            .count();
        if feeds != 1 {
            return Err(ConfigError::InvalidPlan(format!(
                "expected exactly one oplog source, found {}",
                feeds
            )));
        }
        if !self.sources.iter().any(|p| p.source.role() == SourceRole::Profiler) {
            return Err(ConfigError::InvalidPlan("no profiler sources".into()));
        }

        let mut keys = HashSet::new();
        let mut paths = HashSet::new();
        for planned in &self.sources {
            if !keys.insert(planned.source.key()) {
                return Err(ConfigError::DuplicateSourceKey(planned.source.key().to_string()));
            }
            if !paths.insert(&planned.stream) {
                return Err(ConfigError::InvalidPlan(format!(
                    "stream '{}' is used by more than one source",
                    planned.stream.display()
                )));
            }
        }
        Ok(())
    }

    /// Inputs for the reconciler
    fn reconcile_inputs(&self) -> ReconcileInputs {
        let mut oplog_stream = PathBuf::new();
        let mut profiler_streams = Vec::new();
        for planned in &self.sources {
            match planned.source.role() {
                SourceRole::ChangeFeed => oplog_stream = planned.stream.clone(),
                SourceRole::Profiler => profiler_streams.push(planned.stream.clone()),
            }
        }
        ReconcileInputs {
            oplog_stream,
            profiler_streams,
            output: self.output.clone(),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Running => "running",
            SessionPhase::Draining => "draining",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why the running phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured duration elapsed
    WindowElapsed,

    /// A source exited on its own
    SourcesExited,

    /// The operator asked to stop
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::WindowElapsed => "window elapsed",
            StopReason::SourcesExited => "a source exited",
            StopReason::Interrupted => "interrupted",
        };
        f.write_str(reason)
    }
}

/// Result of a completed session
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    /// Window start
    pub start: DateTime<Utc>,

    /// Planned window end
    pub end: DateTime<Utc>,

    /// When the running phase actually ended
    pub stopped_at: DateTime<Utc>,

    /// Why it ended
    pub reason: StopReason,

    /// Final per-source counters
    pub sources: StateSnapshot,

    /// Closed streams, in key order
    pub streams: Vec<StreamInfo>,

    /// Join outcome per worker, in join order
    pub joins: Vec<JoinReport>,

    /// Records the writer failed to persist
    pub write_failures: u64,

    /// Fan-in queue counters
    pub queue: QueueCounts,

    /// Reconciliation counts
    pub merge: MergeSummary,

    /// Final trace path
    pub output: PathBuf,
}

impl RecordingSummary {
    /// Check if the operator stopped the session
    pub fn interrupted(&self) -> bool {
        self.reason == StopReason::Interrupted
    }
}

/// Runs recording sessions
pub struct Recorder<R> {
    options: RecorderOptions,
    reconciler: R,
    stop: Arc<AtomicBool>,
    phase: SessionPhase,
}

impl<R: Reconciler> Recorder<R> {
    /// Create a recorder
    pub fn new(options: RecorderOptions, reconciler: R) -> Self {
        Self {
            options,
            reconciler,
            stop: Arc::new(AtomicBool::new(false)),
            phase: SessionPhase::Idle,
        }
    }

    /// Get a clone of the external stop flag (for signal handlers)
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Current phase
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Session options
    pub fn options(&self) -> &RecorderOptions {
        &self.options
    }

    fn enter(&mut self, phase: SessionPhase) {
        info!(from = %self.phase, to = %phase, "Recording phase changed");
        self.phase = phase;
    }

    /// Record `plan` for `duration`, then reconcile its streams
    pub fn record(&mut self, plan: SessionPlan, duration: Duration) -> Result<RecordingSummary> {
        if self.phase != SessionPhase::Idle {
            return Err(ConfigError::InvalidPlan(format!("recorder is {}, not idle", self.phase)).into());
        }
        plan.validate()?;
        let window_len = chrono::Duration::from_std(duration)
            .map_err(|e| ConfigError::InvalidPlan(format!("bad duration: {}", e)))?;

        // Idle -> Running
        let start = Utc::now();
        let end = start
            .checked_add_signed(window_len)
            .ok_or_else(|| ConfigError::InvalidPlan(format!("window of {:?} ends out of range", duration)))?;
        let window = SessionWindow { start, end };
        let inputs = plan.reconcile_inputs();

        let streams = StreamSet::create(
            plan.sources
                .iter()
                .map(|p| (p.source.key().to_string(), p.stream.clone())),
        )?;

        let mut state = RecordingState::new();
        for planned in &plan.sources {
            planned.source.register(&mut state)?;
        }
        let state = Arc::new(state);

        let queue = FanInQueue::new(self.options.queue_capacity);
        let queue_stats = queue.stats();
        self.enter(SessionPhase::Running);
        info!(
            sources = state.len(),
            start = %start.to_rfc3339(),
            end = %end.to_rfc3339(),
            "Recording started"
        );

        let mut workers: Vec<WorkerDescriptor> = Vec::with_capacity(plan.sources.len() + 1);
        let mut spawn_error: Option<RecorderError> = None;
        for planned in plan.sources {
            let ctx = TailerContext {
                key: Arc::from(planned.source.key()),
                state: Arc::clone(&state),
                queue: queue.sender(),
                backoff: self.options.poll_backoff,
            };
            match planned.source.spawn(ctx, window) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    spawn_error = Some(e.into());
                    break;
                }
            }
        }

        let (writer_tx, writer_rx) = bounded::<WriterOutcome>(1);
        if spawn_error.is_none() {
            let receiver = queue.receiver();
            let writer_state = Arc::clone(&state);
            let poll = self.options.writer_poll;
            match WorkerDescriptor::spawn(WRITER_NAME, None, move || {
                let outcome = write_to_streams(receiver, streams, writer_state, poll);
                let _ = writer_tx.send(outcome);
            }) {
                Ok(worker) => workers.push(worker),
                Err(e) => spawn_error = Some(e.into()),
            }
        }
        drop(queue);

        let reporter = match StatusReporter::start(Arc::clone(&state), self.options.status_interval) {
            Ok(reporter) => Some(reporter),
            Err(e) => {
                warn!(error = %e, "Status reporter unavailable");
                None
            }
        };

        // Running -> Draining
        let reason = match spawn_error {
            Some(_) => StopReason::SourcesExited,
            None => self.wait_for_stop(&state, end),
        };
        let stopped_at = Utc::now();
        state.request_timeout();
        self.enter(SessionPhase::Draining);
        info!(reason = %reason, "Time to stop");

        let joins: Vec<JoinReport> = workers
            .into_iter()
            .map(|worker| join_with_escalation(worker, self.options.join_budget, &self.stop))
            .collect();

        // Draining -> Closed
        let reports = reporter.map(StatusReporter::stop).unwrap_or(0);
        let sources = state.snapshot();
        let queue_counts = queue_stats.counts();
        info!(
            status_reports = reports,
            enqueued = queue_counts.enqueued,
            backpressure = queue_counts.backpressure_events,
            "Preliminary recording completed!{}",
            sources
        );

        if let Some(e) = spawn_error {
            error!(error = %e, "Worker failed to start");
            self.enter(SessionPhase::Closed);
            return Err(e);
        }

        let outcome = writer_rx.try_recv().map_err(|_| WorkerError::WriterLost)?;
        let write_failures = outcome.failed;
        let streams = outcome.streams.close_all()?;
        self.enter(SessionPhase::Closed);

        let merge = self.reconciler.reconcile(&inputs)?;

        Ok(RecordingSummary {
            start,
            end,
            stopped_at,
            reason,
            sources,
            streams,
            joins,
            write_failures,
            queue: queue_counts,
            merge,
            output: inputs.output,
        })
    }

    /// Block until the window ends, every source is gone, or a stop arrives
    fn wait_for_stop(&self, state: &RecordingState, end: DateTime<Utc>) -> StopReason {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return StopReason::Interrupted;
            }
            if !state.all_alive() {
                return StopReason::SourcesExited;
            }
            let now = Utc::now();
            if now >= end {
                return StopReason::WindowElapsed;
            }

            let remaining = (end - now).to_std().unwrap_or_default();
            thread::sleep(self.options.check_interval.min(remaining));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeSummary;
    use crate::recorder::tailer::TailerSpec;
    use crate::error::{SourceError, SourceResult};
    use crate::source::scripted::{ScriptedSource, Step};
    use crate::source::{CancelHandle, Fetch, TailSource};
    use crate::stream::RecordStreamReader;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Captures what it was asked to reconcile
    #[derive(Default)]
    struct Capture {
        inputs: Mutex<Option<ReconcileInputs>>,
    }

    impl Reconciler for &Capture {
        fn reconcile(&self, inputs: &ReconcileInputs) -> crate::error::MergeResult<MergeSummary> {
            *self.inputs.lock().unwrap() = Some(inputs.clone());
            Ok(MergeSummary::default())
        }
    }

    fn fast_options() -> RecorderOptions {
        RecorderOptions {
            poll_backoff: Duration::from_millis(5),
            writer_poll: Duration::from_millis(5),
            status_interval: Duration::from_millis(20),
            check_interval: Duration::from_millis(5),
            join_budget: Duration::from_millis(200),
            queue_capacity: 16,
        }
    }

    fn oplog(source: ScriptedSource) -> TailerSpec<ScriptedSource> {
        TailerSpec::new("oplog", SourceRole::ChangeFeed, source)
    }

    fn profiler(key: &str, source: ScriptedSource) -> TailerSpec<ScriptedSource> {
        TailerSpec::new(key, SourceRole::Profiler, source)
    }

    #[test]
    fn test_plan_validation() {
        let dir = tempdir().unwrap();
        let only_profiler = SessionPlan::new(dir.path().join("out"))
            .with_source(profiler("p", ScriptedSource::counting("p", 0)), dir.path().join("p"));
        assert!(matches!(only_profiler.validate(), Err(ConfigError::InvalidPlan(_))));

        let only_oplog = SessionPlan::new(dir.path().join("out"))
            .with_source(oplog(ScriptedSource::counting("o", 0)), dir.path().join("o"));
        assert!(matches!(only_oplog.validate(), Err(ConfigError::InvalidPlan(_))));

        let duplicate = SessionPlan::new(dir.path().join("out"))
            .with_source(oplog(ScriptedSource::counting("o", 0)), dir.path().join("o"))
            .with_source(profiler("p", ScriptedSource::counting("p", 0)), dir.path().join("p1"))
            .with_source(profiler("p", ScriptedSource::counting("p", 0)), dir.path().join("p2"));
        assert!(matches!(duplicate.validate(), Err(ConfigError::DuplicateSourceKey(k)) if k == "p"));

        let shared_stream = SessionPlan::new(dir.path().join("out"))
            .with_source(oplog(ScriptedSource::counting("o", 0)), dir.path().join("same"))
            .with_source(profiler("p", ScriptedSource::counting("p", 0)), dir.path().join("same"));
        assert!(matches!(shared_stream.validate(), Err(ConfigError::InvalidPlan(_))));
    }

    #[test]
    fn test_session_records_everything_before_window_end() {
        let dir = tempdir().unwrap();
        let capture = Capture::default();
        let plan = SessionPlan::new(dir.path().join("out"))
            .with_source(oplog(ScriptedSource::counting("local.oplog.rs", 40)), dir.path().join("oplog"))
            .with_source(
                profiler("app_db1:27017", ScriptedSource::counting("app.system.profile", 25)),
                dir.path().join("app_db1:27017"),
            );

        let mut recorder = Recorder::new(fast_options(), &capture);
        let summary = recorder.record(plan, Duration::from_millis(300)).unwrap();

        assert_eq!(recorder.phase(), SessionPhase::Closed);
        assert_eq!(summary.reason, StopReason::WindowElapsed);
        assert_eq!(summary.write_failures, 0);
        assert_eq!(summary.queue.enqueued, 65);
        assert_eq!(summary.queue.dequeued, 65);
        for (key, expected) in [("oplog", 40), ("app_db1:27017", 25)] {
            let source = summary.sources.source(key).unwrap();
            assert_eq!(source.entries_received, expected, "{}", key);
            assert_eq!(source.entries_written, expected, "{}", key);
            assert!(!source.alive);
        }
        assert_eq!(
            RecordStreamReader::read_all(dir.path().join("oplog")).unwrap().len(),
            40
        );

        // Tailers joined first, writer last
        let names: Vec<&str> = summary.joins.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["tailing-oplog oplog", "tailing-profiler app_db1:27017", WRITER_NAME]
        );

        let inputs = capture.inputs.lock().unwrap().clone().unwrap();
        assert_eq!(inputs.oplog_stream, dir.path().join("oplog"));
        assert_eq!(inputs.profiler_streams, vec![dir.path().join("app_db1:27017")]);
        assert_eq!(inputs.output, dir.path().join("out"));
    }

    #[test]
    fn test_failed_source_ends_session_early() {
        let dir = tempdir().unwrap();
        let capture = Capture::default();
        let plan = SessionPlan::new(dir.path().join("out"))
            .with_source(
                oplog(ScriptedSource::new("local.oplog.rs", vec![Step::Event(1), Step::Fatal])),
                dir.path().join("oplog"),
            )
            .with_source(profiler("p", ScriptedSource::counting("p", 3)), dir.path().join("p"));

        let mut recorder = Recorder::new(fast_options(), &capture);
        let summary = recorder.record(plan, Duration::from_secs(60)).unwrap();

        assert_eq!(summary.reason, StopReason::SourcesExited);
        assert!(summary.stopped_at < summary.end);
        let oplog = summary.sources.source("oplog").unwrap();
        assert_eq!(oplog.entries_received, 1);
        assert_eq!(oplog.entries_written, 1);
    }

    #[test]
    fn test_external_stop_interrupts() {
        let dir = tempdir().unwrap();
        let capture = Capture::default();
        let plan = SessionPlan::new(dir.path().join("out"))
            .with_source(oplog(ScriptedSource::counting("o", 0)), dir.path().join("oplog"))
            .with_source(profiler("p", ScriptedSource::counting("p", 0)), dir.path().join("p"));

        let mut recorder = Recorder::new(fast_options(), &capture);
        let flag = recorder.stop_flag();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        let summary = recorder.record(plan, Duration::from_secs(60)).unwrap();
        stopper.join().unwrap();

        assert!(summary.interrupted());
        assert!(summary.joins.iter().all(|j| !j.cancelled));
    }

    #[test]
    fn test_recorder_is_single_use() {
        let dir = tempdir().unwrap();
        let capture = Capture::default();
        let plan = || {
            SessionPlan::new(dir.path().join("out"))
                .with_source(oplog(ScriptedSource::counting("o", 0)), dir.path().join("oplog"))
                .with_source(profiler("p", ScriptedSource::counting("p", 0)), dir.path().join("p"))
        };

        let mut recorder = Recorder::new(fast_options(), &capture);
        recorder.record(plan(), Duration::from_millis(20)).unwrap();
        assert!(matches!(
            recorder.record(plan(), Duration::from_millis(20)),
            Err(RecorderError::Config(ConfigError::InvalidPlan(_)))
        ));
    }

    /// Source whose first fetch blocks until its cancel handle fires
    struct StuckSource {
        release: crossbeam_channel::Receiver<()>,
        trigger: crossbeam_channel::Sender<()>,
    }

    impl StuckSource {
        fn new() -> Self {
            let (trigger, release) = bounded(1);
            Self { release, trigger }
        }
    }

    impl TailSource for StuckSource {
        type Position = u64;

        fn namespace(&self) -> &str {
            "app.system.profile"
        }

        fn start_at(&mut self, _position: u64) {}

        fn fetch_next(&mut self) -> SourceResult<Fetch<u64>> {
            let _ = self.release.recv();
            Err(SourceError::Cancelled {
                namespace: "app.system.profile".into(),
            })
        }

        fn cancel_handle(&self) -> Option<CancelHandle> {
            let trigger = self.trigger.clone();
            Some(CancelHandle::new(move || {
                let _ = trigger.try_send(());
            }))
        }
    }

    #[test]
    fn test_interrupt_cancels_blocked_read() {
        let dir = tempdir().unwrap();
        let capture = Capture::default();
        let plan = SessionPlan::new(dir.path().join("out"))
            .with_source(oplog(ScriptedSource::counting("o", 3)), dir.path().join("oplog"))
            .with_source(
                TailerSpec::new("app_db1:27017", SourceRole::Profiler, StuckSource::new()),
                dir.path().join("p"),
            );

        let mut options = fast_options();
        options.join_budget = Duration::from_millis(20);
        let mut recorder = Recorder::new(options, &capture);
        let flag = recorder.stop_flag();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        let summary = recorder.record(plan, Duration::from_secs(60)).unwrap();
        stopper.join().unwrap();

        assert!(summary.interrupted());
        let stuck = summary
            .joins
            .iter()
            .find(|j| j.name == "tailing-profiler app_db1:27017")
            .unwrap();
        assert!(stuck.cancelled);
        assert_eq!(summary.sources.source("oplog").unwrap().entries_written, 3);
    }

    #[test]
    fn test_window_end_out_of_range_rejected() {
        let dir = tempdir().unwrap();
        let capture = Capture::default();
        let plan = SessionPlan::new(dir.path().join("out"))
            .with_source(oplog(ScriptedSource::counting("o", 0)), dir.path().join("oplog"))
            .with_source(profiler("p", ScriptedSource::counting("p", 0)), dir.path().join("p"));

        let mut recorder = Recorder::new(fast_options(), &capture);
        let result = recorder.record(plan, Duration::from_secs(9_000_000_000_000));

        assert!(matches!(result, Err(RecorderError::Config(ConfigError::InvalidPlan(_)))));
        assert_eq!(recorder.phase(), SessionPhase::Idle);
        assert!(!dir.path().join("oplog").exists());
    }
}
