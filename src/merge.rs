//! Reconciliation of the recorded streams into one trace
//!
//! The profiler sees every operation but not the documents an insert
//! carried; the oplog has the documents. [`OplogMerge`] orders all profiler
//! records by time and fills each profiler insert with the documents of the
//! matching oplog inserts (same namespace, in oplog order).

use crate::error::{MergeError, MergeResult};
use crate::stream::{RecordStreamReader, RecordStreamWriter};
use mongodb::bson::{Bson, Document};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Streams produced by a session and where the trace goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileInputs {
    /// Change-feed stream
    pub oplog_stream: PathBuf,

    /// One stream per (database, profiling server)
    pub profiler_streams: Vec<PathBuf>,

    /// Final trace
    pub output: PathBuf,
}

/// Counts from a finished merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Records in the final trace
    pub records_written: u64,

    /// Profiler inserts that got all their documents
    pub inserts_filled: u64,

    /// Profiler inserts left short of documents
    pub inserts_unmatched: u64,

    /// Oplog inserts no profiler insert claimed
    pub oplog_inserts_unused: u64,
}

/// Turns the session's streams into the final trace
pub trait Reconciler {
    /// Build `inputs.output` from the session streams
    fn reconcile(&self, inputs: &ReconcileInputs) -> MergeResult<MergeSummary>;
}

/// Default reconciler: profiler timeline with oplog insert documents
#[derive(Debug, Clone, Copy, Default)]
pub struct OplogMerge;

impl OplogMerge {
    /// Inserted documents of every oplog insert, per namespace
    fn load_oplog_inserts(path: &Path) -> MergeResult<HashMap<String, VecDeque<Document>>> {
        let mut inserts: HashMap<String, VecDeque<Document>> = HashMap::new();
        for record in RecordStreamReader::open(path)? {
            let record = record?;
            if record.get_str("op").ok() != Some("i") {
                continue;
            }
            let (Ok(ns), Ok(document)) = (record.get_str("ns"), record.get_document("o")) else {
                warn!(path = %path.display(), "Skipping oplog insert without ns or o");
                continue;
            };
            inserts.entry(ns.to_string()).or_default().push_back(document.clone());
        }
        Ok(inserts)
    }

    /// Every profiler record, tagged with its time in milliseconds
    fn load_profiler_records(paths: &[PathBuf]) -> MergeResult<Vec<(i64, Document)>> {
        let mut records = Vec::new();
        for path in paths {
            for record in RecordStreamReader::open(path)? {
                let record = record?;
                let millis = record
                    .get_datetime("ts")
                    .map_err(|_| MergeError::MissingField {
                        path: path.clone(),
                        field: "ts".into(),
                    })?
                    .timestamp_millis();
                records.push((millis, record));
            }
        }
        // Stable: records with equal times keep their stream order
        records.sort_by_key(|(millis, _)| *millis);
        Ok(records)
    }
}

/// Number of documents a profiler insert reports
fn inserted_count(record: &Document) -> usize {
    match record.get("ninserted") {
        Some(Bson::Int32(n)) => (*n).max(0) as usize,
        Some(Bson::Int64(n)) => (*n).max(0) as usize,
        Some(Bson::Double(n)) if *n > 0.0 => *n as usize,
        _ => 1,
    }
}

impl Reconciler for OplogMerge {
    fn reconcile(&self, inputs: &ReconcileInputs) -> MergeResult<MergeSummary> {
        let mut inserts = Self::load_oplog_inserts(&inputs.oplog_stream)?;
        let records = Self::load_profiler_records(&inputs.profiler_streams)?;
        debug!(
            profiler_records = records.len(),
            namespaces = inserts.len(),
            "Merging profiler records with oplog inserts"
        );

        let mut summary = MergeSummary::default();
        let mut output = RecordStreamWriter::create("output", &inputs.output)?;

        for (_, mut record) in records {
            if record.get_str("op").ok() == Some("insert") {
                let wanted = inserted_count(&record);
                let ns = record.get_str("ns").unwrap_or_default().to_string();
                let available = inserts.get_mut(&ns);
                let documents: Vec<Bson> = match available {
                    Some(queue) => {
                        let take = wanted.min(queue.len());
                        queue.drain(..take).map(Bson::Document).collect()
                    }
                    None => Vec::new(),
                };

                if documents.len() == wanted {
                    summary.inserts_filled += 1;
                } else {
                    summary.inserts_unmatched += 1;
                }
                record.insert("o", documents);
            }

            output.append(&record)?;
            summary.records_written += 1;
        }

        output.close()?;
        summary.oplog_inserts_unused = inserts.values().map(|q| q.len() as u64).sum();

        info!(
            output = %inputs.output.display(),
            records = summary.records_written,
            inserts_filled = summary.inserts_filled,
            inserts_unmatched = summary.inserts_unmatched,
            oplog_unused = summary.oplog_inserts_unused,
            "Merged final output"
        );
        Ok(summary)
    }
}
