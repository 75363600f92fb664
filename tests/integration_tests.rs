//! Integration tests for mongo-recorder
//!
//! Note: Recording against a live deployment needs a MongoDB server.
//! These tests drive full sessions with in-memory sources instead.

use chrono::Local;
use mongo_recorder::config::{CliArgs, ConfigFile, RecordConfig, ServerSelection, ServerSpec};
use mongo_recorder::error::{SourceError, SourceResult};
use mongo_recorder::recorder::{SessionPhase, StopReason, TailerSpec};
use mongo_recorder::source::{CancelHandle, Fetch, OplogTimestamp, SourceRole, TailSource};
use mongo_recorder::stream::RecordStreamReader;
use mongo_recorder::{OplogMerge, Recorder, RecorderOptions, SessionPlan};
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Source that hands out a fixed list of records, then reports nothing new
struct ReplaySource {
    namespace: String,
    records: VecDeque<(u64, Document)>,
    unavailable: bool,
    cancelled: Arc<AtomicBool>,
}

impl ReplaySource {
    fn new(namespace: &str, records: Vec<Document>) -> Self {
        Self {
            namespace: namespace.to_string(),
            records: (1u64..).zip(records).collect(),
            unavailable: false,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn missing(namespace: &str) -> Self {
        let mut source = Self::new(namespace, Vec::new());
        source.unavailable = true;
        source
    }
}

impl TailSource for ReplaySource {
    type Position = u64;

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn start_at(&mut self, _position: u64) {}

    fn fetch_next(&mut self) -> SourceResult<Fetch<u64>> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SourceError::Cancelled {
                namespace: self.namespace.clone(),
            });
        }
        if self.unavailable {
            return Err(SourceError::Unavailable {
                namespace: self.namespace.clone(),
                reason: "collection does not exist".into(),
            });
        }
        Ok(match self.records.pop_front() {
            Some((position, document)) => Fetch::Event { position, document },
            None => Fetch::Empty,
        })
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        Some(CancelHandle::from_flag(Arc::clone(&self.cancelled)))
    }
}

fn fast_options() -> RecorderOptions {
    RecorderOptions {
        poll_backoff: Duration::from_millis(5),
        writer_poll: Duration::from_millis(5),
        status_interval: Duration::from_millis(50),
        check_interval: Duration::from_millis(5),
        join_budget: Duration::from_millis(500),
        queue_capacity: 32,
    }
}

fn profile_entry(n: i64, op: &str) -> Document {
    doc! { "op": op, "ns": "app.users", "ts": BsonDateTime::from_millis(1_700_000_000_000 + n), "n": n }
}

fn plan_for(dir: &Path, oplog: ReplaySource, profiler: ReplaySource) -> SessionPlan {
    SessionPlan::new(dir.join("output"))
        .with_source(
            TailerSpec::new("oplog", SourceRole::ChangeFeed, oplog),
            dir.join("oplog_output"),
        )
        .with_source(
            TailerSpec::new("app_db1:27017", SourceRole::Profiler, profiler),
            dir.join("app_db1:27017"),
        )
}

#[test]
fn test_every_record_before_window_end_is_written() {
    let dir = tempdir().unwrap();
    let oplog = ReplaySource::new(
        "local.oplog.rs",
        (0..100).map(|n| doc! { "op": "n", "ns": "", "n": n }).collect(),
    );
    let profiler = ReplaySource::new("app.system.profile", (0..100).map(|n| profile_entry(n, "query")).collect());

    let mut recorder = Recorder::new(fast_options(), OplogMerge);
    let summary = recorder
        .record(plan_for(dir.path(), oplog, profiler), Duration::from_millis(400))
        .unwrap();

    assert_eq!(recorder.phase(), SessionPhase::Closed);
    assert_eq!(summary.reason, StopReason::WindowElapsed);
    assert_eq!(summary.sources.total_received(), 200);
    assert_eq!(summary.sources.total_written(), 200);
    for source in &summary.sources.sources {
        assert_eq!(source.entries_received, 100, "{}", source.key);
        assert_eq!(source.entries_written, 100, "{}", source.key);
    }

    assert_eq!(RecordStreamReader::read_all(dir.path().join("oplog_output")).unwrap().len(), 100);
    let profiled = RecordStreamReader::read_all(dir.path().join("app_db1:27017")).unwrap();
    let order: Vec<i64> = profiled.iter().map(|d| d.get_i64("n").unwrap()).collect();
    assert_eq!(order, (0..100).collect::<Vec<_>>());

    // Every profiler record ends up in the trace
    assert_eq!(summary.merge.records_written, 100);
    assert_eq!(RecordStreamReader::read_all(&summary.output).unwrap().len(), 100);
}

#[test]
fn test_missing_profiler_collection_still_closes() {
    let dir = tempdir().unwrap();
    let oplog = ReplaySource::new("local.oplog.rs", vec![doc! { "op": "n", "ns": "" }]);
    let profiler = ReplaySource::missing("app.system.profile");

    let mut recorder = Recorder::new(fast_options(), OplogMerge);
    let summary = recorder
        .record(plan_for(dir.path(), oplog, profiler), Duration::from_millis(200))
        .unwrap();

    assert_eq!(recorder.phase(), SessionPhase::Closed);
    let missing = summary.sources.source("app_db1:27017").unwrap();
    assert_eq!(missing.entries_received, 0);
    assert!(missing.last_received.is_none());
    assert!(RecordStreamReader::read_all(dir.path().join("app_db1:27017")).unwrap().is_empty());
    assert_eq!(summary.sources.source("oplog").unwrap().entries_written, 1);
}

#[test]
fn test_session_trace_carries_inserted_documents() {
    let dir = tempdir().unwrap();
    let oplog = ReplaySource::new(
        "local.oplog.rs",
        vec![
            doc! { "op": "i", "ns": "app.users", "o": { "_id": 1, "name": "a" } },
            doc! { "op": "i", "ns": "app.users", "o": { "_id": 2, "name": "b" } },
        ],
    );
    let profiler = ReplaySource::new(
        "app.system.profile",
        vec![profile_entry(1, "insert"), profile_entry(2, "query"), profile_entry(3, "insert")],
    );

    let mut recorder = Recorder::new(fast_options(), OplogMerge);
    let summary = recorder
        .record(plan_for(dir.path(), oplog, profiler), Duration::from_millis(200))
        .unwrap();

    assert_eq!(summary.merge.records_written, 3);
    assert_eq!(summary.merge.inserts_filled, 2);
    assert_eq!(summary.merge.inserts_unmatched, 0);

    let trace = RecordStreamReader::read_all(dir.path().join("output")).unwrap();
    let first = trace[0].get_array("o").unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].as_document().unwrap().get_i32("_id").unwrap(), 1);
    assert!(trace[1].get("o").is_none());
}

#[test]
fn test_config_file_with_cli_overrides() {
    let dir = tempdir().unwrap();
    let file = ConfigFile::parse(
        r#"
duration_secs = 30
target_databases = ["app"]
user = "ops"
password = "secret"

[[oplog_servers]]
mongodb_uri = "mongodb://db1:27017"

[[profiler_servers]]
mongodb_uri = "mongodb://db1:27017"
"#,
        Path::new("recorder.toml"),
    )
    .unwrap();

    let args = CliArgs {
        seconds: Some(90),
        databases: Some(vec!["app".into(), "billing".into()]),
        logdir: Some(dir.path().to_path_buf()),
        recording_name: Some("peak".into()),
        ..CliArgs::default()
    };
    let config = RecordConfig::from_parts(file, &args, Local::now()).unwrap();

    assert_eq!(config.duration, Duration::from_secs(90));
    assert_eq!(config.targets.databases, vec!["app", "billing"]);
    assert!(matches!(config.servers, ServerSelection::Explicit { .. }));
    assert!(config.output.starts_with(dir.path()));
    assert!(config
        .oplog_output
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with("-peak_oplog_output_file"));

    let rendered = config.effective_toml().unwrap();
    assert!(!rendered.contains("secret"));
}

#[test]
fn test_server_address_validation() {
    let spec = ServerSpec::from_address("db1.example.com:27017").unwrap();
    assert_eq!(spec.mongodb_uri, "mongodb://db1.example.com:27017");
    assert!(ServerSpec::from_address("db1.example.com").is_err());
    assert!(ServerSpec::from_address("mongodb://db1:27017").is_err());
}

#[test]
fn test_oplog_timestamp_order() {
    assert!(OplogTimestamp::new(10, 2) > OplogTimestamp::new(10, 1));
    assert!(OplogTimestamp::new(11, 0) > OplogTimestamp::new(10, u32::MAX));
}
