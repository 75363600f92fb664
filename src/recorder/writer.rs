//! Writer worker: drains the fan-in queue into the per-source streams
//!
//! Only one writer runs per session; all streams usually live on the same
//! device, so more writers would just compete for it. The writer keeps
//! polling while any source is alive, then performs one final drain and
//! flushes every stream before handing the streams back.

use crate::recorder::queue::{QueueItem, QueueReceiver};
use crate::recorder::state::RecordingState;
use crate::stream::StreamSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Streams and counters handed back when the writer exits
pub struct WriterOutcome {
    /// The session's streams, flushed but still open
    pub streams: StreamSet,

    /// Records persisted
    pub written: u64,

    /// Records that could not be persisted
    pub failed: u64,
}

/// Drain `receiver` into `streams` until no source is alive
pub fn write_to_streams(
    receiver: QueueReceiver,
    mut streams: StreamSet,
    state: Arc<RecordingState>,
    poll: Duration,
) -> WriterOutcome {
    let mut written = 0u64;
    let mut failed = 0u64;

    let mut persist = |item: QueueItem, streams: &mut StreamSet| match streams.append(&item.key, &item.document) {
        Ok(()) => {
            if let Some(source) = state.source(&item.key) {
                source.record_written();
            }
            written += 1;
        }
        Err(e) => {
            error!(source = %item.key, error = %e, "Failed to persist record");
            failed += 1;
        }
    };

    while state.any_alive() {
        if let Some(item) = receiver.recv_timeout(poll) {
            persist(item, &mut streams);
        }
    }

    // Every tailer has exited; anything it enqueued is already visible
    while let Some(item) = receiver.try_recv() {
        persist(item, &mut streams);
    }

    if let Err(e) = streams.flush_all() {
        error!(error = %e, "Failed to flush streams");
    }
    info!(written = written, failed = failed, "All received docs are processed");

    WriterOutcome {
        streams,
        written,
        failed,
    }
}
