//! mongo-recorder - MongoDB Traffic Recorder
//!
//! Records the inbound traffic of a MongoDB deployment for a fixed window by
//! tailing the oplog and the profiler collections of the target databases,
//! then merges both into one replayable trace.
//!
//! # Features
//!
//! - **Two kinds of sources**: one oplog (ground truth for inserted
//!   documents) and one profiler source per (database, server) pair.
//!
//! - **Exact window**: each source compares its own native timestamps
//!   against the cutoff, so the window boundary does not depend on when
//!   the stop signal arrives.
//!
//! - **Coordinated shutdown**: one dying source stops all of them; stuck
//!   workers are joined with doubling budgets and force-cancelled only on
//!   operator interrupt.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────────────┐
//! │   local.oplog.rs     │      │  <db>.system.profile (N)     │
//! └──────────┬───────────┘      └──────────────┬───────────────┘
//!            │ poll                            │ poll
//!            ▼                                 ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Tailer Threads                          │
//! │   ┌─────────┐   ┌─────────┐   ┌─────────┐       ┌─────────┐  │
//! │   │ oplog   │   │ app_h1  │   │ app_h2  │  ...  │ db_hN   │  │
//! │   └────┬────┘   └────┬────┘   └────┬────┘       └────┬────┘  │
//! │        └─────────────┴──────┬──────┴─────────────────┘       │
//! │                             ▼                                │
//! │               ┌──────────────────────────┐                   │
//! │               │      Fan-in Queue        │                   │
//! │               │  (crossbeam bounded)     │                   │
//! │               └────────────┬─────────────┘                   │
//! │                            ▼                                 │
//! │               ┌──────────────────────────┐                   │
//! │               │      Writer Thread       │                   │
//! │               └────────────┬─────────────┘                   │
//! └────────────────────────────┼─────────────────────────────────┘
//!                              ▼
//!              one BSON stream per source ──► merge ──► trace
//! ```
//!
//! # Example
//!
//! ```bash
//! # Record database "app" for one minute
//! mongo-recorder -o db1:27017 -p db1:27017 -d app -s 60
//!
//! # Use a config file and store the recording in a directory
//! mongo-recorder -f recorder.toml -l /var/lib/recordings -n peak
//! ```

pub mod config;
pub mod error;
pub mod merge;
pub mod progress;
pub mod recorder;
pub mod source;
pub mod stream;
pub mod topology;

pub use config::{CliArgs, RecordConfig, ServerSpec, Targets};
pub use error::{RecorderError, Result};
pub use merge::{MergeSummary, OplogMerge, ReconcileInputs, Reconciler};
pub use recorder::{Recorder, RecorderOptions, RecordingSummary, SessionPlan};
