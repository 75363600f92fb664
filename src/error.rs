//! Error types for mongo-recorder
//!
//! This module defines the error hierarchy that covers:
//! - Source (oplog / profiler) connection and polling errors
//! - Persisted record stream errors
//! - Configuration and CLI errors
//! - Worker thread errors
//! - Merge (reconciliation) errors
//!
//! Per-event and per-source errors are handled inside the tailer loop and
//! never reach the top level; only startup and reconciliation failures
//! propagate out of a recording session.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the recorder
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Source connection / polling errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Record stream errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// Reconciliation errors
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a source handle
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// Could not reach the server
    #[error("Failed to connect to '{server}': {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// Server rejected the credentials
    #[error("Unable to authenticate to '{server}': {reason}")]
    AuthFailed { server: String, reason: String },

    /// Collection is missing or not capped
    #[error("Collection '{namespace}' is missing or non-capped: {reason}")]
    Unavailable { namespace: String, reason: String },

    /// A single record could not be decoded
    #[error("Malformed record from '{namespace}': {reason}")]
    Decode { namespace: String, reason: String },

    /// A poll query failed
    #[error("Query on '{namespace}' failed: {reason}")]
    Query { namespace: String, reason: String },

    /// The source was cancelled during shutdown
    #[error("Source '{namespace}' was cancelled")]
    Cancelled { namespace: String },

    /// Cluster topology could not be determined
    #[error("Topology discovery failed: {0}")]
    Topology(String),
}

impl SourceError {
    /// Check if this error ends the source (the tailer loop must exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SourceError::Cancelled { .. }
                | SourceError::ConnectionFailed { .. }
                | SourceError::AuthFailed { .. }
                | SourceError::Topology(_)
        )
    }

    /// Check if this error means the collection cannot be tailed (yet)
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SourceError::Unavailable { .. })
    }
}

/// Record stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Failed to create the stream file
    #[error("Failed to create stream at '{path}': {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    /// Failed to open a stream for reading
    #[error("Failed to open stream '{path}': {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// BSON encoding failed
    #[error("Failed to encode record: {0}")]
    Encode(String),

    /// BSON decoding failed
    #[error("Failed to decode record #{index} in '{path}': {reason}")]
    Decode {
        path: PathBuf,
        index: u64,
        reason: String,
    },

    /// Stream ends in the middle of a record
    #[error("Stream '{path}' is truncated after {records} records")]
    Truncated { path: PathBuf, records: u64 },

    /// Two streams registered under one key
    #[error("Duplicate stream key '{0}'")]
    DuplicateKey(String),

    /// Record for a key with no open stream
    #[error("No stream open for key '{0}'")]
    UnknownKey(String),

    /// I/O error while writing or reading
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read or parsed
    #[error("Invalid config file '{path}': {reason}")]
    InvalidFile { path: PathBuf, reason: String },

    /// HOST:PORT override did not parse
    #[error("Invalid server address '{address}': expected HOST:PORT")]
    InvalidServerAddress { address: String },

    /// MongoDB URI could not be used
    #[error("Invalid MongoDB URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// No recording duration configured
    #[error("Recording duration must be a positive number of seconds")]
    MissingDuration,

    /// Recording duration above the supported maximum
    #[error("Recording duration of {secs}s exceeds the maximum of {max}s")]
    DurationTooLong { secs: u64, max: u64 },

    /// No target databases configured
    #[error("At least one target database is required")]
    NoTargetDatabases,

    /// No oplog servers configured
    #[error("Detected no oplog servers, bailing")]
    NoOplogServers,

    /// No profiler servers configured
    #[error("Detected no profiler servers, bailing")]
    NoProfilerServers,

    /// A session records exactly one oplog
    #[error("Exactly one oplog server is supported, found {count}")]
    MultipleOplogServers { count: usize },

    /// Output path error
    #[error("Invalid output path '{path}': {reason}")]
    InvalidOutputPath { path: PathBuf, reason: String },

    /// Session plan is not a valid oplog + profilers pairing
    #[error("Invalid session plan: {0}")]
    InvalidPlan(String),

    /// Two sources share one key
    #[error("Duplicate source key '{0}'")]
    DuplicateSourceKey(String),
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    /// Thread could not be spawned
    #[error("Failed to spawn worker '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// Tailer started for a key missing from the recording state
    #[error("No recording state for source '{0}'")]
    UnknownSource(String),

    /// Writer thread exited without reporting its streams
    #[error("Writer worker exited without returning its streams")]
    WriterLost,
}

/// Reconciliation errors
#[derive(Error, Debug)]
pub enum MergeError {
    /// Reading or writing a stream failed
    #[error("{0}")]
    Stream(#[from] StreamError),

    /// A record lacks a field the merge relies on
    #[error("Record in '{path}' is missing '{field}'")]
    MissingField { path: PathBuf, field: String },
}

/// Result type alias for RecorderError
pub type Result<T> = std::result::Result<T, RecorderError>;

/// Result type alias for SourceError
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result type alias for StreamError
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Result type alias for WorkerError
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Result type alias for MergeError
pub type MergeResult<T> = std::result::Result<T, MergeError>;
