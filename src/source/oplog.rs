//! Oplog (change-feed) source
//!
//! Polls `local.oplog.rs` for insert entries of the target namespaces,
//! strictly after the last timestamp seen. Oplog timestamps are unique, so
//! `$gt` never skips or repeats an entry.

use crate::config::Targets;
use crate::error::{SourceError, SourceResult};
use crate::source::mongo::{ensure_capped, poll_batch, ClientHandle};
use crate::source::poller::Poller;
use crate::source::{CancelHandle, Fetch, OplogTimestamp, TailSource};
use mongodb::bson::{doc, Bson, Document};
use mongodb::sync::{Collection, Database};
use std::collections::VecDeque;
use std::time::Duration;

const OPLOG_DB: &str = "local";
const OPLOG_COLLECTION: &str = "oplog.rs";

/// Operation types captured from the oplog (inserts only; the profiler
/// does not record inserted documents)
pub const CAPTURED_OPS: &[&str] = &["i"];

/// Filter selecting captured entries of `ns_filter` after `last`
pub fn oplog_query(ns_filter: &Bson, last: Option<OplogTimestamp>) -> Document {
    let ops: Vec<Bson> = CAPTURED_OPS.iter().map(|op| Bson::from(*op)).collect();
    let mut filter = doc! {
        "op": { "$in": ops },
        "ns": ns_filter.clone(),
    };
    if let Some(last) = last {
        filter.insert("ts", doc! { "$gt": Bson::Timestamp(last.to_bson()) });
    }
    filter
}

/// Native position of an oplog entry
pub fn entry_position(document: &Document, namespace: &str) -> SourceResult<OplogTimestamp> {
    document
        .get_timestamp("ts")
        .map(OplogTimestamp::from)
        .map_err(|e| SourceError::Decode {
            namespace: namespace.to_string(),
            reason: format!("bad ts: {}", e),
        })
}

/// Tails the oplog of one server
pub struct OplogSource {
    database: Database,
    collection: Collection<Document>,
    namespace: String,
    ns_filter: Bson,
    last: Option<OplogTimestamp>,
    buffer: VecDeque<Document>,
    verified: bool,
    batch_size: i64,
    max_time: Duration,
    poller: Poller<SourceResult<Vec<Document>>>,
}

impl OplogSource {
    /// Create an oplog source for the target namespaces
    ///
    /// The source gets its own client so that a cancel can close the
    /// connection a pending poll is blocked on.
    pub fn new(client: &ClientHandle, targets: &Targets) -> SourceResult<Self> {
        let client = client.dedicated()?;
        let database = client.database(OPLOG_DB);
        let collection = database.collection::<Document>(OPLOG_COLLECTION);
        let namespace = format!("{}.{}", OPLOG_DB, OPLOG_COLLECTION);

        let closer = client.clone();
        let poller = Poller::spawn(&namespace)?.on_cancel(move || closer.shutdown());

        Ok(Self {
            database,
            collection,
            namespace,
            ns_filter: targets.oplog_ns_filter(),
            last: None,
            buffer: VecDeque::new(),
            verified: false,
            batch_size: 1000,
            max_time: Duration::from_secs(5),
            poller,
        })
    }

    /// Set the number of entries fetched per poll
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the server-side time limit of a poll
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    fn verify(&mut self) -> SourceResult<()> {
        let database = self.database.clone();
        let namespace = self.namespace.clone();
        self.poller
            .run(move || ensure_capped(&database, OPLOG_COLLECTION, &namespace).map(|_| Vec::new()))??;
        self.verified = true;
        Ok(())
    }

    fn refill(&mut self) -> SourceResult<()> {
        let collection = self.collection.clone();
        let filter = oplog_query(&self.ns_filter, self.last);
        let (limit, max_time, namespace) = (self.batch_size, self.max_time, self.namespace.clone());

        let batch = self
            .poller
            .run(move || poll_batch(&collection, filter, limit, max_time, &namespace))??;
        self.buffer.extend(batch);
        Ok(())
    }
}

impl TailSource for OplogSource {
    type Position = OplogTimestamp;

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn start_at(&mut self, position: OplogTimestamp) {
        self.last = Some(position);
        self.buffer.clear();
    }

    fn fetch_next(&mut self) -> SourceResult<Fetch<OplogTimestamp>> {
        self.poller.check_cancelled()?;

        if !self.verified {
            self.verify()?;
        }

        if self.buffer.is_empty() {
            self.refill()?;
        }

        let Some(document) = self.buffer.pop_front() else {
            return Ok(Fetch::Empty);
        };

        let position = entry_position(&document, &self.namespace)?;
        self.last = Some(position);

        Ok(Fetch::Event { position, document })
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        Some(self.poller.cancel_handle())
    }
}
