//! Periodic status reporter
//!
//! Logs one line per interval with every source's counters. Read-only and
//! unsynchronized with the workers, so the numbers are advisory.

use crate::error::{WorkerError, WorkerResult};
use crate::recorder::state::RecordingState;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Log the current state of every source
pub fn report_status(state: &RecordingState) {
    info!("{}", state.snapshot());
}

/// Handle to the running reporter thread
pub struct StatusReporter {
    stop: Sender<()>,
    handle: JoinHandle<u64>,
}

impl StatusReporter {
    /// Start reporting every `interval`
    pub fn start(state: Arc<RecordingState>, interval: Duration) -> WorkerResult<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("status-reporter".into())
            .spawn(move || {
                let mut reports = 0u64;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            report_status(&state);
                            reports += 1;
                        }
                        _ => break,
                    }
                }
                reports
            })
            .map_err(|e| WorkerError::SpawnFailed {
                name: "status-reporter".into(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            stop: stop_tx,
            handle,
        })
    }

    /// Stop the reporter; returns how many reports it emitted
    pub fn stop(self) -> u64 {
        let _ = self.stop.try_send(());
        match self.handle.join() {
            Ok(reports) => reports,
            Err(_) => {
                warn!("Status reporter panicked");
                0
            }
        }
    }
}
