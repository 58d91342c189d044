use memwatch::store::{RetentionPolicy, RetentionStore, StorageBackend};
use memwatch::system::process::{ProcessSample, RawProcess, SortField};
use memwatch::system::snapshot::{Snapshot, SystemMemory};
use serde_json::json;
use tempfile::TempDir;

fn sample(pid: u32, rss: u64) -> ProcessSample {
    RawProcess {
        pid,
        name: format!("proc_{pid}"),
        username: Some("tester".to_string()),
        status: "running".to_string(),
        memory_rss: rss,
        memory_percent: 1.5,
        cpu_percent: 0.25,
        create_time: 1_700_000_000,
    }
    .into()
}

fn snapshot_at(timestamp: f64, pids: &[u32]) -> Snapshot {
    let processes = pids
        .iter()
        .map(|&pid| sample(pid, 123_456_789 + u64::from(pid)))
        .collect();
    Snapshot::new(timestamp, SystemMemory::default(), processes, SortField::MemoryPercent)
}

fn backends(dir: &TempDir) -> Vec<StorageBackend> {
    vec![
        StorageBackend::Structured {
            db_path: dir.path().join("db").join("process_logs.db"),
        },
        StorageBackend::FlatFile {
            dir: dir.path().join("logs"),
        },
    ]
}

#[test]
fn history_round_trips_through_both_backends() {
    let dir = tempfile::tempdir().unwrap();
    for backend in backends(&dir) {
        let store = RetentionStore::open(&backend, RetentionPolicy::default()).unwrap();
        for i in 0..4 {
            let written = store
                .append_sample(&snapshot_at(1_000.0 + f64::from(i), &[10, 20, 30]))
                .unwrap();
            assert_eq!(written, 3);
        }

        let rows = store.history(20, 3).unwrap();
        assert_eq!(rows.len(), 3, "{backend:?}");
        let stamps: Vec<f64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![1_003.0, 1_002.0, 1_001.0], "{backend:?}");
        for row in &rows {
            assert_eq!(row.pid, 20);
            assert_eq!(row.name, "proc_20");
            assert_eq!(row.username, "tester");
            assert_eq!(row.memory_rss, 123_456_809);
            let mb = (row.memory_rss as f64 / 1_048_576.0 * 100.0).round() / 100.0;
            assert_eq!(row.memory_rss_mb, mb);
            assert_eq!(row.memory_percent, 1.5);
            assert_eq!(row.cpu_percent, 0.25);
        }
        assert!(store.history(99, 10).unwrap().is_empty());
    }
}

#[test]
fn zero_day_retention_removes_everything_older_than_now() {
    let dir = tempfile::tempdir().unwrap();
    for backend in backends(&dir) {
        let policy = RetentionPolicy {
            retention_days: 0,
            max_rows: 10_000,
        };
        let store = RetentionStore::open(&backend, policy).unwrap();
        store.append_sample(&snapshot_at(500.0, &[1, 2])).unwrap();
        store.append_sample(&snapshot_at(600.0, &[1, 2])).unwrap();

        let report = store.enforce_retention_at(700.0).unwrap();
        assert_eq!(report.expired_samples, 4, "{backend:?}");
        assert!(store.history(1, 100).unwrap().is_empty());
        assert_eq!(store.row_counts().unwrap().samples, 0);
    }
}

#[test]
fn row_count_is_bounded_by_max_rows() {
    let dir = tempfile::tempdir().unwrap();
    for backend in backends(&dir) {
        let policy = RetentionPolicy {
            retention_days: 7,
            max_rows: 5,
        };
        let store = RetentionStore::open(&backend, policy).unwrap();
        let now = memwatch::format::now_epoch();
        for i in 0..6 {
            store
                .append_sample(&snapshot_at(now - 60.0 + f64::from(i), &[7, 8]))
                .unwrap();
        }
        for i in 0..8 {
            store
                .append_event("process_kill", json!({"pid": i, "success": true}))
                .unwrap();
        }

        let report = store.enforce_retention().unwrap();
        assert_eq!(report.expired_samples, 0, "{backend:?}");
        assert_eq!(report.trimmed_samples, 7, "{backend:?}");
        assert_eq!(report.trimmed_events, 3, "{backend:?}");

        let counts = store.row_counts().unwrap();
        assert_eq!(counts.samples, 5);
        assert_eq!(counts.events, 5);

        let newest = store.history(8, 10).unwrap();
        assert_eq!(newest[0].timestamp, now - 55.0);
    }
}

#[test]
fn events_are_newest_first_with_payload() {
    let dir = tempfile::tempdir().unwrap();
    for backend in backends(&dir) {
        let store = RetentionStore::open(&backend, RetentionPolicy::default()).unwrap();
        store
            .append_event("process_kill", json!({"pid": 1, "success": false, "message": "Process 1 not found"}))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .append_event("process_kill", json!({"pid": 2, "success": true}))
            .unwrap();

        let events = store.events(10).unwrap();
        assert_eq!(events.len(), 2, "{backend:?}");
        assert_eq!(events[0].payload["pid"], 2);
        assert_eq!(events[1].payload["message"], "Process 1 not found");
        assert!(events.iter().all(|e| e.event_type == "process_kill"));
    }
}

#[test]
fn reopening_keeps_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    for backend in backends(&dir) {
        {
            let store = RetentionStore::open(&backend, RetentionPolicy::default()).unwrap();
            store.append_sample(&snapshot_at(42.0, &[3])).unwrap();
        }
        let store = RetentionStore::open(&backend, RetentionPolicy::default()).unwrap();
        assert_eq!(store.history(3, 10).unwrap().len(), 1, "{backend:?}");
    }
}

#[test]
fn concurrent_appends_and_retention_keep_every_row_whole() {
    const WRITERS: u32 = 4;
    const CYCLES: u32 = 25;
    let dir = tempfile::tempdir().unwrap();
    for backend in backends(&dir) {
        let policy = RetentionPolicy {
            retention_days: 7,
            max_rows: 60,
        };
        let store = RetentionStore::open(&backend, policy).unwrap();
        let now = memwatch::format::now_epoch();

        std::thread::scope(|scope| {
            for w in 0..WRITERS {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..CYCLES {
                        let pids = [w * 10 + 1, w * 10 + 2];
                        store
                            .append_sample(&snapshot_at(now - 100.0 + f64::from(i), &pids))
                            .unwrap();
                        store
                            .append_event("process_kill", json!({"pid": pids[0], "cycle": i}))
                            .unwrap();
                    }
                });
            }
            let store = store.clone();
            scope.spawn(move || {
                for _ in 0..20 {
                    store.enforce_retention_at(now).unwrap();
                    std::thread::yield_now();
                }
            });
        });

        store.enforce_retention_at(now).unwrap();
        let counts = store.row_counts().unwrap();
        assert!(counts.samples <= 60, "{backend:?}: {counts:?}");
        assert!(counts.events <= 60, "{backend:?}: {counts:?}");

        let read_back: usize = (0..WRITERS)
            .flat_map(|w| [w * 10 + 1, w * 10 + 2])
            .map(|pid| store.history(pid, 10_000).unwrap().len())
            .sum();
        assert_eq!(read_back, counts.samples, "{backend:?}");
        assert_eq!(store.events(10_000).unwrap().len(), counts.events, "{backend:?}");

        if let StorageBackend::FlatFile { dir } = &backend {
            for name in ["process_snapshots.jsonl", "events.jsonl"] {
                let text = std::fs::read_to_string(dir.join(name)).unwrap();
                assert!(text.is_empty() || text.ends_with('\n'), "{name}");
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    serde_json::from_str::<serde_json::Value>(line)
                        .unwrap_or_else(|err| panic!("{name}: unparseable row {line:?}: {err}"));
                }
            }
        }
    }
}
