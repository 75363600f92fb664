//! Worker threads and the draining join protocol
//!
//! Every worker runs on a named OS thread. A zero-capacity "done" channel
//! is held by the thread for its whole life; when the thread ends (normally
//! or by panic) the sender drops and the receiver disconnects, which lets
//! the orchestrator wait for a worker with a timeout.
//!
//! Draining joins each worker with a doubling budget (5s, 10s, 20s, ...).
//! A worker that outlives a budget gets its cancel callback invoked, but
//! only when the operator asked to stop; otherwise the join keeps waiting.

use crate::error::{WorkerError, WorkerResult};
use crate::source::CancelHandle;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A running worker and how to force it to stop
pub struct WorkerDescriptor {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
    cancel: Option<CancelHandle>,
}

impl WorkerDescriptor {
    /// Spawn `work` on a named thread
    pub fn spawn<F>(name: impl Into<String>, cancel: Option<CancelHandle>, work: F) -> WorkerResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done: Sender<()> = done_tx;
                work();
            })
            .map_err(|e| WorkerError::SpawnFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        info!(worker = %name, "Starting thread");
        Ok(Self {
            name,
            handle: Some(handle),
            done: done_rx,
            cancel,
        })
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the thread has finished
    pub fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected))
    }

    /// Wait up to `timeout` for the thread to finish
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Invoke the cancel callback, if any
    pub fn cancel(&self) -> bool {
        match &self.cancel {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Join a finished thread, reporting a panic
    fn join(mut self) -> WorkerResult<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| WorkerError::Panicked {
                name: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Worker thread panicked".to_string()
    }
}

/// Doubling join budgets: `initial`, `2 * initial`, `4 * initial`, ...
#[derive(Debug, Clone)]
pub struct JoinBackoff {
    next: Duration,
}

impl JoinBackoff {
    /// Create a new sequence
    pub fn new(initial: Duration) -> Self {
        Self { next: initial }
    }
}

impl Iterator for JoinBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.checked_mul(2).unwrap_or(Duration::MAX);
        Some(current)
    }
}

/// What happened while joining one worker
#[derive(Debug, Clone)]
pub struct JoinReport {
    /// Worker name
    pub name: String,

    /// Budgets waited, in order; the last one saw the worker exit
    pub waits: Vec<Duration>,

    /// Whether the cancel callback was invoked
    pub cancelled: bool,

    /// Panic message, if the worker panicked
    pub panicked: Option<String>,

    /// Total time spent joining
    pub elapsed: Duration,
}

/// Join `worker`, doubling the budget until it exits
///
/// `force` is read after every missed budget; the cancel callback is only
/// invoked while it is set.
pub fn join_with_escalation(worker: WorkerDescriptor, initial: Duration, force: &AtomicBool) -> JoinReport {
    let started = Instant::now();
    let name = worker.name().to_string();
    let mut waits = Vec::new();
    let mut cancelled = false;

    info!(worker = %name, "Time to stop, waiting for thread to finish");
    let mut budgets = JoinBackoff::new(initial).peekable();
    while let Some(budget) = budgets.next() {
        waits.push(budget);
        if worker.wait(budget) {
            break;
        }

        if force.load(Ordering::SeqCst) && worker.cancel() {
            cancelled = true;
        }
        let next = budgets.peek().copied().unwrap_or(budget);
        warn!(
            worker = %name,
            waited = ?budget,
            next = ?next,
            cancelled = cancelled,
            "Thread didn't exit in time, waiting again"
        );
    }

    let panicked = match worker.join() {
        Ok(()) => {
            info!(worker = %name, "Thread exits normally");
            None
        }
        Err(e) => {
            error!(worker = %name, error = %e, "Thread panicked");
            match e {
                WorkerError::Panicked { message, .. } => Some(message),
                other => Some(other.to_string()),
            }
        }
    };

    JoinReport {
        name,
        waits,
        cancelled,
        panicked,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_join_backoff_doubles() {
        let budgets: Vec<u64> = JoinBackoff::new(Duration::from_secs(5))
            .take(5)
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(budgets, vec![5, 10, 20, 40, 80]);

        let mut huge = JoinBackoff::new(Duration::MAX / 2 + Duration::from_secs(1));
        huge.next();
        assert_eq!(huge.next(), Some(Duration::MAX));
    }

    #[test]
    fn test_quick_worker_joins_in_first_budget() {
        let worker = WorkerDescriptor::spawn("quick", None, || {}).unwrap();
        let report = join_with_escalation(worker, Duration::from_secs(5), &AtomicBool::new(false));
        assert_eq!(report.waits, vec![Duration::from_secs(5)]);
        assert!(!report.cancelled);
        assert!(report.panicked.is_none());
    }

    #[test]
    fn test_stuck_worker_waits_double() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let worker = WorkerDescriptor::spawn(
            "stuck",
            Some(CancelHandle::from_flag(Arc::clone(&cancel_flag))),
            move || {
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
        )
        .unwrap();

        // Release after the first two budgets (20ms + 40ms) have passed
        let releaser = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(90));
                release.store(true, Ordering::SeqCst);
            })
        };

        let report = join_with_escalation(worker, Duration::from_millis(20), &AtomicBool::new(false));
        releaser.join().unwrap();

        let ms: Vec<u128> = report.waits.iter().map(Duration::as_millis).collect();
        assert!(ms.len() >= 3, "waits: {:?}", ms);
        assert_eq!(&ms[..3], &[20, 40, 80]);
        // No external stop: cancel must not fire
        assert!(!report.cancelled);
        assert!(!cancel_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_forced_stop_invokes_cancel() {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel_flag);
        let worker = WorkerDescriptor::spawn(
            "blocked-read",
            Some(CancelHandle::from_flag(Arc::clone(&cancel_flag))),
            move || {
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
        )
        .unwrap();

        let report = join_with_escalation(worker, Duration::from_millis(10), &AtomicBool::new(true));
        assert!(report.cancelled);
        assert_eq!(report.waits[0], Duration::from_millis(10));
        assert!(report.waits.len() >= 2);
    }

    #[test]
    fn test_panicking_worker_reported() {
        let worker = WorkerDescriptor::spawn("boom", None, || panic!("bad record")).unwrap();
        assert!(worker.wait(Duration::from_secs(5)));
        assert!(worker.is_finished());
        let report = join_with_escalation(worker, Duration::from_secs(1), &AtomicBool::new(false));
        assert_eq!(report.panicked.as_deref(), Some("bad record"));
    }
}
