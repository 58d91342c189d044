use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::process::{ProcessSample, SortField, sort_descending};
use crate::format::{format_epoch, now_epoch};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMemory {
    pub total: u64,
    pub available: u64,
    pub percent: f64,
}

/// One complete, timestamped capture of the process table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: f64,
    pub datetime: String,
    pub total_processes: usize,
    pub filtered_processes: usize,
    pub system_memory: SystemMemory,
    pub processes: Vec<ProcessSample>,
    /// Field the process list is ordered by.
    #[serde(skip)]
    pub sorted_by: SortField,
}

impl Snapshot {
    pub fn new(
        timestamp: f64,
        system_memory: SystemMemory,
        processes: Vec<ProcessSample>,
        sorted_by: SortField,
    ) -> Self {
        Snapshot {
            timestamp,
            datetime: format_epoch(timestamp),
            total_processes: processes.len(),
            filtered_processes: processes.len(),
            system_memory,
            processes,
            sorted_by,
        }
    }

    /// Placeholder held before the first sample. Stamped at the epoch so any
    /// real sample supersedes it.
    pub fn empty() -> Self {
        Snapshot::new(0.0, SystemMemory::default(), Vec::new(), SortField::default())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewQuery {
    pub top: Option<usize>,
    pub sort_by: Option<SortField>,
    pub min_mem_percent: Option<f64>,
}

/// Assemble a filtered view from a canonical snapshot without touching it.
pub fn apply_view(
    canonical: &Snapshot,
    query: &ViewQuery,
    system_memory: SystemMemory,
    now: f64,
) -> Snapshot {
    let mut processes = canonical.processes.clone();

    if let Some(field) = query.sort_by
        && field != canonical.sorted_by
    {
        sort_descending(&mut processes, field);
    }

    if let Some(threshold) = query.min_mem_percent {
        processes.retain(|p| p.memory_percent >= threshold);
    }

    if let Some(top) = query.top
        && top > 0
    {
        processes.truncate(top);
    }

    Snapshot {
        timestamp: now,
        datetime: format_epoch(now),
        total_processes: canonical.processes.len(),
        filtered_processes: processes.len(),
        system_memory,
        processes,
        sorted_by: query.sort_by.unwrap_or(canonical.sorted_by),
    }
}

/// Holds the most recent canonical snapshot. Replacement swaps the whole
/// `Arc`, so a reader sees either the previous or the new list.
#[derive(Debug)]
pub struct SnapshotCache {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotCache {
    pub fn new(initial: Arc<Snapshot>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Replace only when `snapshot` is at least as new as the cached one.
    /// Returns the snapshot that is current afterwards.
    pub fn advance(&self, snapshot: Arc<Snapshot>) -> Arc<Snapshot> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if snapshot.timestamp >= guard.timestamp {
            *guard = snapshot;
        }
        Arc::clone(&*guard)
    }

    pub fn view(&self, query: &ViewQuery, system_memory: SystemMemory) -> Snapshot {
        let canonical = self.current();
        apply_view(&canonical, query, system_memory, now_epoch())
    }
}
