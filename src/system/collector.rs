use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, ThreadKind,
    UpdateKind, Users,
};
use tracing::{debug, warn};

use super::process::{ProcessSample, RawProcess, SortField, sort_descending};
use super::snapshot::{Snapshot, SystemMemory};
use crate::format::{now_epoch, round_2};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Why a single process was left out of a sample.
#[derive(Debug)]
enum SampleError {
    /// Vanished, zombie, or unreadable; expected churn, skipped silently.
    Transient,
    /// Readings that make no sense; logged and skipped.
    Processing(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub available: u64,
    pub percent: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SystemMemoryReport {
    pub memory: MemoryStats,
    pub swap: MemoryStats,
}

/// Reads the OS process table and produces snapshots.
pub struct Collector {
    sys: System,
    users: Users,
    sort_field: SortField,
    update_interval: Duration,
    last_update: Option<Instant>,
    last_snapshot: Option<Arc<Snapshot>>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_INTERVAL, SortField::default())
    }
}

impl Collector {
    pub fn new(update_interval: Duration, sort_field: SortField) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        // Prime CPU accounting so the first real scan has a baseline.
        sys.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());
        Collector {
            sys,
            users: Users::new_with_refreshed_list(),
            sort_field,
            update_interval,
            last_update: None,
            last_snapshot: None,
        }
    }

    pub fn sort_field(&self) -> SortField {
        self.sort_field
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    /// Change the ordering used by subsequent scans. Unknown names are
    /// rejected with a warning and the current field is kept.
    pub fn set_sort_field(&mut self, name: &str) -> bool {
        match name.parse::<SortField>() {
            Ok(field) => {
                self.sort_field = field;
                true
            }
            Err(err) => {
                warn!(%err, current = %self.sort_field, "ignoring invalid sort field");
                false
            }
        }
    }

    pub fn last_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.last_snapshot.clone()
    }

    /// Rate-limited scan: inside the update interval the cached snapshot is
    /// returned unchanged.
    pub fn sample(&mut self) -> Arc<Snapshot> {
        if let (Some(last), Some(cached)) = (self.last_update, &self.last_snapshot)
            && last.elapsed() < self.update_interval
        {
            return Arc::clone(cached);
        }
        self.refresh()
    }

    /// Unconditional scan of the process table.
    pub fn refresh(&mut self) -> Arc<Snapshot> {
        self.sys.refresh_memory();
        self.sys
            .refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());
        let timestamp = now_epoch();
        let system_memory = system_memory(&self.sys);
        self.refresh_users_if_stale();

        let total_memory = self.sys.total_memory();
        let mut samples = Vec::with_capacity(self.sys.processes().len());
        for (pid, process) in self.sys.processes() {
            match read_sample(*pid, process, total_memory, &self.users) {
                Ok(sample) => samples.push(sample),
                Err(SampleError::Transient) => {}
                Err(SampleError::Processing(reason)) => {
                    warn!(pid = pid.as_u32(), %reason, "dropping process from sample");
                }
            }
        }
        sort_descending(&mut samples, self.sort_field);

        let snapshot = Arc::new(Snapshot::new(
            timestamp,
            system_memory,
            samples,
            self.sort_field,
        ));
        debug!(processes = snapshot.total_processes, "process table sampled");
        self.last_update = Some(Instant::now());
        self.last_snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    fn refresh_users_if_stale(&mut self) {
        let stale = self.sys.processes().values().any(|p| {
            p.user_id()
                .is_some_and(|uid| self.users.get_user_by_id(uid).is_none())
        });
        if stale {
            self.users = Users::new_with_refreshed_list();
        }
    }
}

fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::nothing()
        .with_memory()
        .with_cpu()
        .with_user(UpdateKind::OnlyIfNotSet)
}

fn read_sample(
    pid: Pid,
    process: &Process,
    total_memory: u64,
    users: &Users,
) -> Result<ProcessSample, SampleError> {
    if matches!(process.thread_kind(), Some(ThreadKind::Userland)) {
        return Err(SampleError::Transient);
    }
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return Err(SampleError::Transient);
    }
    let cpu = f64::from(process.cpu_usage());
    if !cpu.is_finite() {
        return Err(SampleError::Processing(format!("cpu usage reads {cpu}")));
    }
    let memory_rss = process.memory();
    if total_memory > 0 && memory_rss > total_memory.saturating_mul(2) {
        return Err(SampleError::Processing(format!(
            "rss {memory_rss} exceeds physical memory {total_memory}"
        )));
    }
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        memory_rss as f64 / total_memory as f64 * 100.0
    };
    let username = process
        .user_id()
        .and_then(|uid| users.get_user_by_id(uid))
        .map(|user| user.name().to_string());

    Ok(RawProcess {
        pid: pid.as_u32(),
        name: process.name().to_string_lossy().to_string(),
        username,
        status: process.status().to_string().to_lowercase(),
        memory_rss,
        memory_percent,
        cpu_percent: cpu,
        create_time: process.start_time(),
    }
    .into())
}

fn system_memory(sys: &System) -> SystemMemory {
    let total = sys.total_memory();
    let available = sys.available_memory();
    SystemMemory {
        total,
        available,
        percent: used_percent(total, total.saturating_sub(available)),
    }
}

fn used_percent(total: u64, used: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        round_2(used as f64 / total as f64 * 100.0)
    }
}

/// Fresh read of system memory totals, independent of any collector.
pub fn read_system_memory() -> SystemMemory {
    let mut sys = System::new();
    sys.refresh_memory();
    system_memory(&sys)
}

/// Memory and swap totals read fresh.
pub fn read_memory_report() -> SystemMemoryReport {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    let available = sys.available_memory();
    let used = sys.used_memory();
    let swap_total = sys.total_swap();
    let swap_used = sys.used_swap();
    SystemMemoryReport {
        memory: MemoryStats {
            total,
            used,
            free: sys.free_memory(),
            available,
            percent: used_percent(total, total.saturating_sub(available)),
        },
        swap: MemoryStats {
            total: swap_total,
            used: swap_used,
            free: sys.free_swap(),
            available: sys.free_swap(),
            percent: used_percent(swap_total, swap_used),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sample_within_interval_is_cached() {
        let mut collector = Collector::new(Duration::from_secs(1), SortField::MemoryPercent);
        let first = collector.sample();
        std::thread::sleep(Duration::from_millis(300));
        let second = collector.sample();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.timestamp, second.timestamp);
    }

    #[test]
    fn sample_after_interval_rescans() {
        let mut collector = Collector::new(Duration::from_millis(10), SortField::MemoryPercent);
        let first = collector.sample();
        std::thread::sleep(Duration::from_millis(30));
        let second = collector.sample();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.timestamp >= first.timestamp);
    }

    #[test]
    fn refresh_contains_current_process_with_unique_pids() {
        let mut collector = Collector::default();
        let snapshot = collector.refresh();
        let own = std::process::id();
        assert!(snapshot.processes.iter().any(|p| p.pid == own));

        let mut pids: Vec<u32> = snapshot.processes.iter().map(|p| p.pid).collect();
        let before = pids.len();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), before);
        assert_eq!(snapshot.total_processes, before);
    }

    #[test]
    fn refresh_orders_by_configured_field() {
        let mut collector = Collector::new(DEFAULT_UPDATE_INTERVAL, SortField::Pid);
        let snapshot = collector.refresh();
        assert!(snapshot.processes.windows(2).all(|w| w[0].pid >= w[1].pid));
        assert_eq!(snapshot.sorted_by, SortField::Pid);
    }

    #[test]
    fn invalid_sort_field_keeps_previous() {
        let mut collector = Collector::new(DEFAULT_UPDATE_INTERVAL, SortField::CpuPercent);
        assert!(!collector.set_sort_field("bogus"));
        assert_eq!(collector.sort_field(), SortField::CpuPercent);
        assert!(collector.set_sort_field("create_time"));
        assert_eq!(collector.sort_field(), SortField::CreateTime);
    }

    #[test]
    fn memory_report_is_consistent() {
        let report = read_memory_report();
        assert!(report.memory.total >= report.memory.available);
        assert!((0.0..=100.0).contains(&report.memory.percent));
        assert!((0.0..=100.0).contains(&report.swap.percent));
    }
}
