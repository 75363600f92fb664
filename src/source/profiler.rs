//! Profiler source
//!
//! Polls `<db>.system.profile` on one server. Profiler times have
//! millisecond resolution, several operations can share one, and
//! operations that finish concurrently can land in the collection slightly
//! out of time order. Every poll therefore re-reads a short lookback before
//! the newest time seen and drops the records it already handed out.

use crate::config::Targets;
use crate::error::{SourceError, SourceResult};
use crate::source::mongo::{ensure_capped, poll_batch, ClientHandle};
use crate::source::poller::Poller;
use crate::source::{CancelHandle, Fetch, TailSource};
use chrono::{DateTime, TimeZone, Utc};
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::sync::{Collection, Database};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;

const PROFILE_COLLECTION: &str = "system.profile";

/// How far before the newest record time each poll reads again, in ms
pub const LOOKBACK_MILLIS: i64 = 1000;

/// Filter selecting profile records of `ns_filter` at or after `from`
pub fn profiler_query(ns_filter: &Bson, from: Option<DateTime<Utc>>) -> Document {
    let mut filter = doc! { "ns": ns_filter.clone() };
    if let Some(from) = from {
        filter.insert(
            "ts",
            doc! { "$gte": Bson::DateTime(BsonDateTime::from_millis(from.timestamp_millis())) },
        );
    }
    filter
}

/// Profiler time of a record
pub fn record_time(document: &Document, namespace: &str) -> SourceResult<DateTime<Utc>> {
    let millis = document
        .get_datetime("ts")
        .map_err(|e| SourceError::Decode {
            namespace: namespace.to_string(),
            reason: format!("bad ts: {}", e),
        })?
        .timestamp_millis();

    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| SourceError::Decode {
            namespace: namespace.to_string(),
            reason: format!("ts out of range: {}", millis),
        })
}

fn fingerprint(document: &Document) -> u64 {
    let mut hasher = DefaultHasher::new();
    document.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Records already handed out, counted per (millisecond, content)
///
/// Identical records at the same millisecond are distinct operations, so
/// the set counts them instead of collapsing them.
#[derive(Debug, Default)]
pub struct Delivered {
    by_millis: BTreeMap<i64, HashMap<u64, usize>>,
    total: usize,
}

impl Delivered {
    /// Number of records remembered
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Forget records older than `millis`
    pub fn prune_before(&mut self, millis: i64) {
        let kept = self.by_millis.split_off(&millis);
        let dropped: usize = self.by_millis.values().flat_map(HashMap::values).sum();
        self.total -= dropped;
        self.by_millis = kept;
    }

    fn count(&self, millis: i64, print: u64) -> usize {
        self.by_millis
            .get(&millis)
            .and_then(|prints| prints.get(&print))
            .copied()
            .unwrap_or(0)
    }

    fn raise(&mut self, millis: i64, print: u64, count: usize) {
        let slot = self.by_millis.entry(millis).or_default().entry(print).or_insert(0);
        if count > *slot {
            self.total += count - *slot;
            *slot = count;
        }
    }

    fn clear(&mut self) {
        self.by_millis.clear();
        self.total = 0;
    }
}

/// Pick the records of `batch` not yet in `delivered`, in batch order
///
/// Stops after `limit` new records; the rest are left for the next poll.
/// A record with a bad `ts` is handed out as its decode error.
pub fn select_new(
    batch: Vec<Document>,
    delivered: &mut Delivered,
    limit: usize,
    namespace: &str,
) -> Vec<SourceResult<(DateTime<Utc>, Document)>> {
    let mut in_batch: HashMap<(i64, u64), usize> = HashMap::new();
    let mut fresh = Vec::new();

    for document in batch {
        if fresh.len() >= limit {
            break;
        }
        let time = match record_time(&document, namespace) {
            Ok(time) => time,
            Err(e) => {
                fresh.push(Err(e));
                continue;
            }
        };

        let millis = time.timestamp_millis();
        let print = fingerprint(&document);
        let seen = in_batch.entry((millis, print)).or_insert(0);
        *seen += 1;

        if *seen > delivered.count(millis, print) {
            delivered.raise(millis, print, *seen);
            fresh.push(Ok((time, document)));
        }
    }
    fresh
}

/// Tails the profiling collection of one database on one server
pub struct ProfilerSource {
    database: Database,
    collection: Collection<Document>,
    namespace: String,
    ns_filter: Bson,
    floor: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    delivered: Delivered,
    buffer: VecDeque<SourceResult<(DateTime<Utc>, Document)>>,
    verified: bool,
    batch_size: i64,
    max_time: Duration,
    poller: Poller<SourceResult<Vec<Document>>>,
}

impl ProfilerSource {
    /// Create a profiler source for database `db`
    ///
    /// The source gets its own client so that a cancel can close the
    /// connection a pending poll is blocked on.
    pub fn new(client: &ClientHandle, db: &str, targets: &Targets) -> SourceResult<Self> {
        let client = client.dedicated()?;
        let database = client.database(db);
        let collection = database.collection::<Document>(PROFILE_COLLECTION);
        let namespace = format!("{}.{}", db, PROFILE_COLLECTION);

        let closer = client.clone();
        let poller = Poller::spawn(&namespace)?.on_cancel(move || closer.shutdown());

        Ok(Self {
            database,
            collection,
            namespace,
            ns_filter: targets.profiler_ns_filter(db),
            floor: None,
            newest: None,
            delivered: Delivered::default(),
            buffer: VecDeque::new(),
            verified: false,
            batch_size: 1000,
            max_time: Duration::from_secs(5),
            poller,
        })
    }

    /// Set the number of new records fetched per poll
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the server-side time limit of a poll
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    /// Time the next poll reads from: the lookback before the newest
    /// record, never before the start position
    fn resume_from(&self) -> Option<DateTime<Utc>> {
        let lookback = chrono::Duration::milliseconds(LOOKBACK_MILLIS);
        let back = self
            .newest
            .map(|newest| newest.checked_sub_signed(lookback).unwrap_or(newest));
        match (back, self.floor) {
            (Some(back), Some(floor)) => Some(back.max(floor)),
            (back, floor) => back.or(floor),
        }
    }

    fn verify(&mut self) -> SourceResult<()> {
        let database = self.database.clone();
        let namespace = self.namespace.clone();
        self.poller
            .run(move || ensure_capped(&database, PROFILE_COLLECTION, &namespace).map(|_| Vec::new()))??;
        self.verified = true;
        Ok(())
    }

    /// Poll once and buffer the records not delivered yet
    fn refill(&mut self) -> SourceResult<()> {
        let from = self.resume_from();
        if let Some(from) = from {
            self.delivered.prune_before(from.timestamp_millis());
        }

        // Already delivered records come back too; read past them
        let limit = self.batch_size.saturating_add(self.delivered.len() as i64);
        let collection = self.collection.clone();
        let filter = profiler_query(&self.ns_filter, from);
        let (max_time, namespace) = (self.max_time, self.namespace.clone());

        let batch = self
            .poller
            .run(move || poll_batch(&collection, filter, limit, max_time, &namespace))??;

        let fresh = select_new(batch, &mut self.delivered, self.batch_size as usize, &self.namespace);
        self.buffer.extend(fresh);
        Ok(())
    }
}

impl TailSource for ProfilerSource {
    type Position = DateTime<Utc>;

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn start_at(&mut self, position: DateTime<Utc>) {
        self.floor = Some(position);
        self.newest = None;
        self.delivered.clear();
        self.buffer.clear();
    }

    fn fetch_next(&mut self) -> SourceResult<Fetch<DateTime<Utc>>> {
        self.poller.check_cancelled()?;

        if !self.verified {
            self.verify()?;
        }

        if self.buffer.is_empty() {
            self.refill()?;
        }

        let Some(next) = self.buffer.pop_front() else {
            return Ok(Fetch::Empty);
        };
        let (position, document) = next?;

        self.newest = Some(self.newest.map_or(position, |newest| newest.max(position)));
        Ok(Fetch::Event { position, document })
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        Some(self.poller.cancel_handle())
    }
}
