//! Abandonable blocking polls
//!
//! The synchronous driver offers no way to interrupt a read that is stuck
//! on a silent socket. Each source therefore runs its polls on a helper
//! thread and waits for either the reply or an abort signal:
//!
//! ```text
//!   fetch_next ──job──► [poll thread] ──reply──┐
//!        ▲                                     │
//!        └──────── select(reply, abort) ◄──────┘
//!                          ▲
//!                 CancelHandle::cancel
//! ```
//!
//! A cancelled wait returns `Cancelled` at once. The helper thread is left
//! to finish (or fail) its read on its own and exits when its job channel
//! closes.

use crate::error::{SourceError, SourceResult};
use crate::source::CancelHandle;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::debug;

type Job<T> = Box<dyn FnOnce() -> T + Send>;

/// Runs blocking jobs on a helper thread, one at a time, so that a waiting
/// caller can be released by a cancel
pub struct Poller<T: Send + 'static> {
    namespace: String,
    jobs: Option<Sender<Job<T>>>,
    replies: Receiver<T>,
    abort_tx: Sender<()>,
    abort_rx: Receiver<()>,
    cancelled: Arc<AtomicBool>,
    on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<T: Send + 'static> Poller<T> {
    /// Start the helper thread for `namespace`
    pub fn spawn(namespace: &str) -> SourceResult<Self> {
        let (jobs_tx, jobs_rx) = bounded::<Job<T>>(1);
        let (replies_tx, replies_rx) = bounded::<T>(1);
        let (abort_tx, abort_rx) = bounded(1);

        thread::Builder::new()
            .name(format!("poll-{}", namespace))
            .spawn(move || {
                for job in jobs_rx {
                    if replies_tx.send(job()).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| SourceError::ConnectionFailed {
                server: namespace.to_string(),
                reason: format!("failed to spawn poll thread: {}", e),
            })?;

        Ok(Self {
            namespace: namespace.to_string(),
            jobs: Some(jobs_tx),
            replies: replies_rx,
            abort_tx,
            abort_rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            on_cancel: None,
        })
    }

    /// Extra action run once on the first cancel, such as closing the
    /// connection the job is blocked on
    pub fn on_cancel(mut self, action: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Arc::new(action));
        self
    }

    /// Whether a cancel has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` once a cancel has been requested
    pub fn check_cancelled(&self) -> SourceResult<()> {
        if self.is_cancelled() {
            return Err(self.cancelled_error());
        }
        Ok(())
    }

    /// Run `job` on the helper thread and wait for its reply or a cancel
    pub fn run(&self, job: impl FnOnce() -> T + Send + 'static) -> SourceResult<T> {
        self.check_cancelled()?;

        let jobs = self.jobs.as_ref().ok_or_else(|| self.cancelled_error())?;
        jobs.send(Box::new(job)).map_err(|_| self.thread_gone())?;

        select! {
            recv(self.replies) -> reply => {
                let reply = reply.map_err(|_| self.thread_gone())?;
                // A reply racing the cancel is discarded
                self.check_cancelled()?;
                Ok(reply)
            }
            recv(self.abort_rx) -> _ => {
                debug!(namespace = %self.namespace, "Abandoned in-flight poll");
                Err(self.cancelled_error())
            }
        }
    }

    /// Handle that releases a waiting `run` and runs the `on_cancel` action
    pub fn cancel_handle(&self) -> CancelHandle {
        let cancelled = Arc::clone(&self.cancelled);
        let abort = self.abort_tx.clone();
        let on_cancel = self.on_cancel.clone();

        CancelHandle::new(move || {
            if cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            let _ = abort.try_send(());
            if let Some(action) = &on_cancel {
                action();
            }
        })
    }

    fn cancelled_error(&self) -> SourceError {
        SourceError::Cancelled {
            namespace: self.namespace.clone(),
        }
    }

    fn thread_gone(&self) -> SourceError {
        SourceError::Query {
            namespace: self.namespace.clone(),
            reason: "poll thread exited".into(),
        }
    }
}

impl<T: Send + 'static> Drop for Poller<T> {
    fn drop(&mut self) {
        // Closing the job channel ends the helper thread after its current job
        self.jobs.take();
    }
}
