//! Persisted per-source record streams
//!
//! Every source gets one append-only file. Records are raw BSON documents
//! written back to back; a BSON document starts with its own little-endian
//! `i32` length, so the stream needs no extra framing:
//!
//! ```text
//! ┌──────────┬────────────────┬──────────┬────────────────┬─────
//! │ len (4B) │ document body  │ len (4B) │ document body  │ ...
//! └──────────┴────────────────┴──────────┴────────────────┴─────
//! ```
//!
//! The writer side is owned by the writer worker for the whole session.
//! Readers stop at a clean end of file and report a partial trailing
//! record as [`StreamError::Truncated`].

use crate::error::{StreamError, StreamResult};
use mongodb::bson::Document;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Smallest valid BSON document (length + terminating NUL)
const MIN_DOCUMENT_LEN: usize = 5;

/// Largest document accepted when reading (server limit plus headroom)
const MAX_DOCUMENT_LEN: usize = 48 * 1024 * 1024;

/// Write buffer size
const WRITE_BUFFER: usize = 256 * 1024;

/// Summary of a closed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Source key the stream belongs to
    pub key: String,

    /// File path
    pub path: PathBuf,

    /// Records written
    pub records: u64,

    /// Bytes written
    pub bytes: u64,
}

/// Append-only writer for one source's stream
pub struct RecordStreamWriter {
    key: String,
    path: PathBuf,
    writer: BufWriter<File>,
    scratch: Vec<u8>,
    records: u64,
    bytes: u64,
}

impl RecordStreamWriter {
    /// Create (or truncate) the stream file
    pub fn create(key: impl Into<String>, path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| StreamError::CreateFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            key: key.into(),
            path,
            writer: BufWriter::with_capacity(WRITE_BUFFER, file),
            scratch: Vec::with_capacity(4096),
            records: 0,
            bytes: 0,
        })
    }

    /// Append one record
    pub fn append(&mut self, document: &Document) -> StreamResult<()> {
        self.scratch.clear();
        document
            .to_writer(&mut self.scratch)
            .map_err(|e| StreamError::Encode(e.to_string()))?;
        self.writer.write_all(&self.scratch)?;
        self.records += 1;
        self.bytes += self.scratch.len() as u64;
        Ok(())
    }

    /// Flush buffered records to the OS
    pub fn flush(&mut self) -> StreamResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Source key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Bytes appended so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Flush, sync to disk and close
    pub fn close(self) -> StreamResult<StreamInfo> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(StreamInfo {
            key: self.key,
            path: self.path,
            records: self.records,
            bytes: self.bytes,
        })
    }
}

/// Iterator over the records of a stream, in write order
pub struct RecordStreamReader {
    path: PathBuf,
    reader: BufReader<File>,
    index: u64,
    done: bool,
}

impl RecordStreamReader {
    /// Open a stream for reading
    pub fn open(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| StreamError::OpenFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            path,
            reader: BufReader::new(file),
            index: 0,
            done: false,
        })
    }

    /// Read every record of a stream
    pub fn read_all(path: impl AsRef<Path>) -> StreamResult<Vec<Document>> {
        Self::open(path)?.collect()
    }

    fn truncated(&self) -> StreamError {
        StreamError::Truncated {
            path: self.path.clone(),
            records: self.index,
        }
    }

    fn read_record(&mut self) -> StreamResult<Option<Document>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        if let Err(e) = self.reader.read_exact(&mut len_buf) {
            return Err(match e.kind() {
                ErrorKind::UnexpectedEof => self.truncated(),
                _ => e.into(),
            });
        }

        let len = i32::from_le_bytes(len_buf);
        let len = usize::try_from(len).unwrap_or(0);
        if !(MIN_DOCUMENT_LEN..=MAX_DOCUMENT_LEN).contains(&len) {
            return Err(StreamError::Decode {
                path: self.path.clone(),
                index: self.index,
                reason: format!("invalid record length {}", len),
            });
        }

        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&len_buf);
        if let Err(e) = self.reader.read_exact(&mut frame[4..]) {
            return Err(match e.kind() {
                ErrorKind::UnexpectedEof => self.truncated(),
                _ => e.into(),
            });
        }

        let document = Document::from_reader(&frame[..]).map_err(|e| StreamError::Decode {
            path: self.path.clone(),
            index: self.index,
            reason: e.to_string(),
        })?;
        self.index += 1;
        Ok(Some(document))
    }
}

impl Iterator for RecordStreamReader {
    type Item = StreamResult<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(document)) => Some(Ok(document)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// The open streams of a session, keyed by source
#[derive(Default)]
pub struct StreamSet {
    streams: BTreeMap<String, RecordStreamWriter>,
}

impl StreamSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one stream per `(key, path)`
    pub fn create<I, K, P>(streams: I) -> StreamResult<Self>
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: AsRef<Path>,
    {
        let mut set = Self::new();
        for (key, path) in streams {
            set.insert(RecordStreamWriter::create(key, path)?)?;
        }
        Ok(set)
    }

    /// Add an open stream
    pub fn insert(&mut self, writer: RecordStreamWriter) -> StreamResult<()> {
        if self.streams.contains_key(writer.key()) {
            return Err(StreamError::DuplicateKey(writer.key().to_string()));
        }
        self.streams.insert(writer.key().to_string(), writer);
        Ok(())
    }

    /// Append a record to the stream of `key`
    pub fn append(&mut self, key: &str, document: &Document) -> StreamResult<()> {
        self.streams
            .get_mut(key)
            .ok_or_else(|| StreamError::UnknownKey(key.to_string()))?
            .append(document)
    }

    /// Flush every stream
    pub fn flush_all(&mut self) -> StreamResult<()> {
        for stream in self.streams.values_mut() {
            stream.flush()?;
        }
        Ok(())
    }

    /// Number of open streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Check if no stream is open
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Close every stream, returning their summaries in key order
    ///
    /// Every stream is closed even if one fails; the first failure is
    /// returned.
    pub fn close_all(self) -> StreamResult<Vec<StreamInfo>> {
        let mut infos = Vec::with_capacity(self.streams.len());
        let mut first_error = None;

        for (_, stream) in self.streams {
            match stream.close() {
                Ok(info) => infos.push(info),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to close stream");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(infos),
        }
    }
}
