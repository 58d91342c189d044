//! Retention-managed history of process samples and operational events.
//!
//! A [`RetentionStore`] wraps exactly one [`Sink`], chosen once when the store
//! is opened. Every sink operation runs under a single mutex, so appends and
//! retention runs never interleave and readers never observe a half-written
//! row.

pub mod flat_file;
pub mod sqlite;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::format::{bytes_to_mb, format_epoch, now_epoch};
use crate::system::process::ProcessSample;
use crate::system::snapshot::Snapshot;

pub const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown storage backend `{0}` (expected `structured` or `flat-file`)")]
    UnknownBackend(String),
    #[error("store lock poisoned by a panicked writer")]
    Poisoned,
}

/// A persisted sample of one process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: f64,
    pub datetime: String,
    pub pid: u32,
    pub name: String,
    pub username: String,
    pub status: String,
    pub memory_rss: u64,
    pub memory_rss_mb: f64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

impl HistoryRecord {
    pub fn from_sample(timestamp: f64, datetime: &str, sample: &ProcessSample) -> Self {
        HistoryRecord {
            timestamp,
            datetime: datetime.to_string(),
            pid: sample.pid,
            name: sample.name.clone(),
            username: sample.username.clone(),
            status: sample.status.clone(),
            memory_rss: sample.memory_rss,
            memory_rss_mb: bytes_to_mb(sample.memory_rss),
            memory_percent: sample.memory_percent,
            cpu_percent: sample.cpu_percent,
        }
    }
}

/// A persisted operational occurrence, e.g. the outcome of a kill request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: f64,
    pub datetime: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(timestamp: f64, event_type: &str, payload: serde_json::Value) -> Self {
        Event {
            timestamp,
            datetime: format_epoch(timestamp),
            event_type: event_type.to_string(),
            payload,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub max_rows: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            retention_days: 7,
            max_rows: 10_000,
        }
    }
}

impl RetentionPolicy {
    pub fn cutoff(&self, now: f64) -> f64 {
        now - f64::from(self.retention_days) * SECONDS_PER_DAY
    }
}

/// Rows removed by one retention run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub expired_samples: usize,
    pub expired_events: usize,
    pub trimmed_samples: usize,
    pub trimmed_events: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.expired_samples + self.expired_events + self.trimmed_samples + self.trimmed_events
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub samples: usize,
    pub events: usize,
}

/// Backing storage for the retention store.
pub trait Sink: Send {
    fn name(&self) -> &'static str;
    fn append_samples(&mut self, rows: &[HistoryRecord]) -> Result<(), StoreError>;
    fn append_event(&mut self, event: &Event) -> Result<(), StoreError>;
    /// At most `limit` rows for `pid`, newest first.
    fn history(&mut self, pid: u32, limit: usize) -> Result<Vec<HistoryRecord>, StoreError>;
    /// At most `limit` events, newest first.
    fn events(&mut self, limit: usize) -> Result<Vec<Event>, StoreError>;
    /// Drop rows older than `cutoff`, then keep only the `max_rows` most
    /// recent rows of each kind.
    fn enforce_retention(
        &mut self,
        cutoff: f64,
        max_rows: usize,
    ) -> Result<RetentionReport, StoreError>;
    fn row_counts(&mut self) -> Result<RowCounts, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Structured { db_path: PathBuf },
    FlatFile { dir: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Structured,
    FlatFile,
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "structured" | "sqlite" => Ok(BackendKind::Structured),
            "flat-file" | "flat_file" | "csv" | "jsonl" => Ok(BackendKind::FlatFile),
            other => Err(StoreError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Structured => f.write_str("structured"),
            BackendKind::FlatFile => f.write_str("flat-file"),
        }
    }
}

impl StorageBackend {
    pub fn open(&self) -> Result<Box<dyn Sink>, StoreError> {
        match self {
            StorageBackend::Structured { db_path } => {
                Ok(Box::new(sqlite::SqliteSink::open(db_path)?))
            }
            StorageBackend::FlatFile { dir } => Ok(Box::new(flat_file::FlatFileSink::open(dir)?)),
        }
    }
}

/// Append-only history under a time- and count-bounded retention policy.
#[derive(Clone)]
pub struct RetentionStore {
    sink: Arc<Mutex<Box<dyn Sink>>>,
    policy: RetentionPolicy,
    backend: &'static str,
}

impl fmt::Debug for RetentionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetentionStore")
            .field("backend", &self.backend)
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetentionStore {
    pub fn open(backend: &StorageBackend, policy: RetentionPolicy) -> Result<Self, StoreError> {
        let sink = backend.open()?;
        info!(backend = sink.name(), ?policy, "retention store opened");
        Ok(Self::with_sink(sink, policy))
    }

    pub fn with_sink(sink: Box<dyn Sink>, policy: RetentionPolicy) -> Self {
        let backend = sink.name();
        RetentionStore {
            sink: Arc::new(Mutex::new(sink)),
            policy,
            backend,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn Sink>>, StoreError> {
        self.sink.lock().map_err(|_| StoreError::Poisoned)
    }

    /// One row per process, all sharing the snapshot's timestamp.
    pub fn append_sample(&self, snapshot: &Snapshot) -> Result<usize, StoreError> {
        let rows: Vec<HistoryRecord> = snapshot
            .processes
            .iter()
            .map(|p| HistoryRecord::from_sample(snapshot.timestamp, &snapshot.datetime, p))
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }
        self.lock()?.append_samples(&rows)?;
        debug!(rows = rows.len(), "snapshot persisted");
        Ok(rows.len())
    }

    pub fn append_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let event = Event::new(now_epoch(), event_type, payload);
        self.lock()?.append_event(&event)
    }

    pub fn history(&self, pid: u32, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        self.lock()?.history(pid, limit)
    }

    pub fn events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        self.lock()?.events(limit)
    }

    pub fn row_counts(&self) -> Result<RowCounts, StoreError> {
        self.lock()?.row_counts()
    }

    pub fn enforce_retention(&self) -> Result<RetentionReport, StoreError> {
        self.enforce_retention_at(now_epoch())
    }

    /// Retention as if run at `now`.
    pub fn enforce_retention_at(&self, now: f64) -> Result<RetentionReport, StoreError> {
        let cutoff = self.policy.cutoff(now);
        let report = self
            .lock()?
            .enforce_retention(cutoff, self.policy.max_rows)?;
        info!(
            backend = self.backend,
            removed = report.total(),
            expired_samples = report.expired_samples,
            trimmed_samples = report.trimmed_samples,
            "retention enforced"
        );
        Ok(report)
    }
}

/// Newest-first ordering shared by the sinks that sort in memory. Rows with
/// equal timestamps keep the order they are given in.
pub(crate) fn newest_first<T>(rows: &mut [T], timestamp: impl Fn(&T) -> f64) {
    rows.sort_by(|a, b| timestamp(b).total_cmp(&timestamp(a)));
}
