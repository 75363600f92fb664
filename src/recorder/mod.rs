//! Concurrent capture pipeline
//!
//! ```text
//!  ┌───────────┐ ┌───────────┐     ┌───────────┐
//!  │ tailer    │ │ tailer    │ ... │ tailer    │   one thread per source
//!  │ (oplog)   │ │ (profiler)│     │ (profiler)│
//!  └─────┬─────┘ └─────┬─────┘     └─────┬─────┘
//!        └─────────────┼─────────────────┘
//!                      ▼
//!            ┌───────────────────┐
//!            │   FanInQueue      │   bounded crossbeam channel
//!            └─────────┬─────────┘
//!                      ▼
//!            ┌───────────────────┐
//!            │   writer worker   │──► one stream per source
//!            └───────────────────┘
//!
//!  RecordingState (atomics, one writer per field) is shared by all of the
//!  above and read by the status reporter every few seconds.
//! ```

pub mod orchestrator;
pub mod queue;
pub mod state;
pub mod status;
pub mod tailer;
pub mod worker;
pub mod writer;

pub use orchestrator::{
    PlannedSource, Recorder, RecorderOptions, RecordingSummary, SessionPhase, SessionPlan, StopReason,
};
pub use queue::{FanInQueue, QueueItem, QueueReceiver, QueueSender};
pub use state::{RecordingState, SourceSnapshot, SourceState, StateSnapshot};
pub use status::StatusReporter;
pub use tailer::{tail_to_queue, SessionSource, SessionWindow, TailExit, TailerContext, TailerSpec};
pub use worker::{join_with_escalation, JoinBackoff, JoinReport, WorkerDescriptor};
pub use writer::{write_to_streams, WriterOutcome};
