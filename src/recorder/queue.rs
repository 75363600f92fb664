//! Fan-in queue from the tailers to the writer
//!
//! A bounded crossbeam channel of `(source key, record)` items. Every tailer
//! holds a [`QueueSender`]; the writer worker holds the only
//! [`QueueReceiver`] and polls it with a short timeout so it can re-check
//! source liveness between records.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mongodb::bson::Document;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A record tagged with the key of the source it came from
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    /// Source key
    pub key: Arc<str>,

    /// Raw record, not interpreted by the pipeline
    pub document: Document,
}

impl QueueItem {
    /// Create a new item
    pub fn new(key: Arc<str>, document: Document) -> Self {
        Self { key, document }
    }
}

/// Statistics for the fan-in queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total items enqueued
    pub enqueued: AtomicU64,

    /// Total items dequeued
    pub dequeued: AtomicU64,

    /// Number of sends that found the queue full
    pub backpressure_events: AtomicU64,
}

impl QueueStats {
    /// Get enqueued item count
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Get dequeued item count
    pub fn dequeued(&self) -> u64 {
        self.dequeued.load(Ordering::Relaxed)
    }

    /// Get backpressure event count
    pub fn backpressure_count(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }

    /// Copy of the counters
    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            enqueued: self.enqueued(),
            dequeued: self.dequeued(),
            backpressure_events: self.backpressure_count(),
        }
    }
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub enqueued: u64,
    pub dequeued: u64,
    pub backpressure_events: u64,
}

/// Bounded multi-producer, single-consumer queue
pub struct FanInQueue {
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
    stats: Arc<QueueStats>,
}

impl FanInQueue {
    /// Create a new queue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));

        Self {
            sender,
            receiver,
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Get a sender (one per tailer)
    pub fn sender(&self) -> QueueSender {
        QueueSender {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Get the receiver (for the writer)
    pub fn receiver(&self) -> QueueReceiver {
        QueueReceiver {
            receiver: self.receiver.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Get queue statistics
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    /// Get current queue length
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Handle for enqueuing records
#[derive(Clone)]
pub struct QueueSender {
    sender: Sender<QueueItem>,
    stats: Arc<QueueStats>,
}

impl QueueSender {
    /// Enqueue an item, blocking while the queue is full
    ///
    /// Returns the item back if the writer side is gone.
    pub fn send(&self, item: QueueItem) -> Result<(), QueueItem> {
        let item = match self.sender.try_send(item) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Full(item)) => {
                self.stats.backpressure_events.fetch_add(1, Ordering::Relaxed);
                item
            }
            Err(TrySendError::Disconnected(item)) => return Err(item),
        };

        self.sender.send(item).map_err(|e| e.into_inner())?;
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Handle for draining records
pub struct QueueReceiver {
    receiver: Receiver<QueueItem>,
    stats: Arc<QueueStats>,
}

impl QueueReceiver {
    /// Receive with timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(_) => None,
        }
    }

    /// Try to receive an item without blocking
    pub fn try_recv(&self) -> Option<QueueItem> {
        match self.receiver.try_recv() {
            Ok(item) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            Err(_) => None,
        }
    }
}
