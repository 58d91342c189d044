use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::format::{bytes_to_mb, format_epoch, round_2};

pub const UNKNOWN_USER: &str = "unknown";

/// One process's measurements at the instant of a sampling pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub username: String,
    pub status: String,
    pub memory_rss: u64,
    pub memory_rss_mb: f64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub create_time: u64,
    pub start_time: String,
}

/// Raw per-process readings before rounding and derived fields are applied.
#[derive(Clone, Debug)]
pub struct RawProcess {
    pub pid: u32,
    pub name: String,
    pub username: Option<String>,
    pub status: String,
    pub memory_rss: u64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub create_time: u64,
}

impl From<RawProcess> for ProcessSample {
    fn from(raw: RawProcess) -> Self {
        ProcessSample {
            pid: raw.pid,
            name: raw.name,
            username: raw.username.unwrap_or_else(|| UNKNOWN_USER.to_string()),
            status: raw.status,
            memory_rss: raw.memory_rss,
            memory_rss_mb: bytes_to_mb(raw.memory_rss),
            memory_percent: round_2(raw.memory_percent),
            cpu_percent: round_2(raw.cpu_percent.max(0.0)),
            create_time: raw.create_time,
            start_time: format_epoch(raw.create_time as f64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Pid,
    Name,
    Username,
    MemoryRss,
    #[default]
    MemoryPercent,
    CpuPercent,
    CreateTime,
}

impl SortField {
    pub const ALL: [SortField; 7] = [
        SortField::Pid,
        SortField::Name,
        SortField::Username,
        SortField::MemoryRss,
        SortField::MemoryPercent,
        SortField::CpuPercent,
        SortField::CreateTime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SortField::Pid => "pid",
            SortField::Name => "name",
            SortField::Username => "username",
            SortField::MemoryRss => "memory_rss",
            SortField::MemoryPercent => "memory_percent",
            SortField::CpuPercent => "cpu_percent",
            SortField::CreateTime => "create_time",
        }
    }

    /// Ascending comparison of two samples on this field.
    pub fn compare(self, a: &ProcessSample, b: &ProcessSample) -> Ordering {
        match self {
            SortField::Pid => a.pid.cmp(&b.pid),
            SortField::Name => a.name.cmp(&b.name),
            SortField::Username => a.username.cmp(&b.username),
            SortField::MemoryRss => a.memory_rss.cmp(&b.memory_rss),
            SortField::MemoryPercent => a.memory_percent.total_cmp(&b.memory_percent),
            SortField::CpuPercent => a.cpu_percent.total_cmp(&b.cpu_percent),
            SortField::CreateTime => a.create_time.cmp(&b.create_time),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSortField(pub String);

impl fmt::Display for UnknownSortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sort field `{}`", self.0)
    }
}

impl std::error::Error for UnknownSortField {}

impl FromStr for SortField {
    type Err = UnknownSortField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| UnknownSortField(s.to_string()))
    }
}

/// Stable descending sort: samples that compare equal keep their relative order.
pub fn sort_descending(samples: &mut [ProcessSample], field: SortField) {
    samples.sort_by(|a, b| field.compare(b, a));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pid: u32, name: &str, rss: u64, mem: f64, cpu: f64) -> RawProcess {
        RawProcess {
            pid,
            name: name.to_string(),
            username: None,
            status: "running".into(),
            memory_rss: rss,
            memory_percent: mem,
            cpu_percent: cpu,
            create_time: 1_700_000_000,
        }
    }

    #[test]
    fn raw_conversion_rounds_and_defaults_username() {
        let sample = ProcessSample::from(raw(7, "worker", 3_145_728, 12.3456, 0.004));
        assert_eq!(sample.username, "unknown");
        assert_eq!(sample.memory_percent, 12.35);
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_rss_mb, 3.0);
        assert_eq!(sample.start_time.len(), 19);
    }

    #[test]
    fn negative_cpu_is_clamped() {
        let sample = ProcessSample::from(raw(1, "x", 0, 0.0, -3.0));
        assert_eq!(sample.cpu_percent, 0.0);
    }

    #[test]
    fn sort_field_parses_every_name() {
        for field in SortField::ALL {
            assert_eq!(field.as_str().parse::<SortField>(), Ok(field));
        }
        assert_eq!(
            "rss".parse::<SortField>(),
            Err(UnknownSortField("rss".into()))
        );
    }

    #[test]
    fn sort_descending_is_stable_on_ties() {
        let mut samples: Vec<ProcessSample> = vec![
            raw(1, "a", 10, 5.0, 0.0).into(),
            raw(2, "b", 20, 9.0, 0.0).into(),
            raw(3, "c", 30, 5.0, 0.0).into(),
            raw(4, "d", 40, 1.0, 0.0).into(),
        ];
        sort_descending(&mut samples, SortField::MemoryPercent);
        let pids: Vec<u32> = samples.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![2, 1, 3, 4]);
    }

    #[test]
    fn name_sort_is_descending_lexicographic() {
        let mut samples: Vec<ProcessSample> = vec![
            raw(1, "alpha", 0, 0.0, 0.0).into(),
            raw(2, "gamma", 0, 0.0, 0.0).into(),
            raw(3, "beta", 0, 0.0, 0.0).into(),
        ];
        sort_descending(&mut samples, SortField::Name);
        let names: Vec<&str> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["gamma", "beta", "alpha"]);
    }
}
