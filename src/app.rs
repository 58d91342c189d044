use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::broadcast::{Broadcaster, SubscriberId, Subscription};
use crate::config::Config;
use crate::error::MonitorError;
use crate::scheduler::{CycleContext, Pipeline, SharedCollector, lock_collector};
use crate::store::{DEFAULT_HISTORY_LIMIT, Event, HistoryRecord, RetentionStore, StorageBackend};
use crate::system::collector::{
    Collector, SystemMemoryReport, read_memory_report, read_system_memory,
};
use crate::system::kill::{TerminationController, TerminationError, TerminationOutcome};
use crate::system::process::SortField;
use crate::system::snapshot::{Snapshot, SnapshotCache, ViewQuery};

pub const PROCESS_KILL_EVENT: &str = "process_kill";

/// Owns one instance of every component. Built once at startup, torn down
/// through the [`Pipeline`] returned by [`App::start`].
pub struct App {
    collector: SharedCollector,
    cache: Arc<SnapshotCache>,
    broadcaster: Broadcaster,
    store: Option<RetentionStore>,
    terminator: TerminationController,
    interval: Duration,
    retention_interval: Duration,
}

impl App {
    pub fn new(config: &Config) -> Self {
        let interval = config.general.interval();
        let mut collector = Collector::new(interval, SortField::default());
        collector.set_sort_field(&config.general.default_sort);

        let store = if config.general.logging_enabled {
            open_store(config)
        } else {
            None
        };

        let mut app = Self::with_parts(
            collector,
            store,
            TerminationController::new(config.general.terminate_timeout()),
        );
        app.retention_interval = config.storage.retention_interval();
        app
    }

    /// Assemble from ready-made components.
    pub fn with_parts(
        collector: Collector,
        store: Option<RetentionStore>,
        terminator: TerminationController,
    ) -> Self {
        let interval = collector.update_interval();
        App {
            collector: Arc::new(Mutex::new(collector)),
            cache: Arc::new(SnapshotCache::new(Arc::new(Snapshot::empty()))),
            broadcaster: Broadcaster::new(),
            store,
            terminator,
            interval,
            retention_interval: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn set_retention_interval(&mut self, every: Duration) {
        self.retention_interval = every;
    }

    pub fn store(&self) -> Option<&RetentionStore> {
        self.store.as_ref()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Start the sampling loop, and persistence plus retention when a store
    /// is configured.
    pub fn start(&self) -> Pipeline {
        Pipeline::start(
            CycleContext {
                collector: Arc::clone(&self.collector),
                cache: Arc::clone(&self.cache),
                broadcaster: self.broadcaster.clone(),
            },
            self.store.clone(),
            self.interval,
            self.retention_interval,
        )
    }

    /// On-demand sample that respects the collector's rate limit. Returns the
    /// cached snapshot afterwards, which is a scheduled cycle's if that one
    /// finished later.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, MonitorError> {
        let collector = Arc::clone(&self.collector);
        let snapshot =
            tokio::task::spawn_blocking(move || lock_collector(&collector).sample()).await?;
        Ok(self.cache.advance(snapshot))
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.cache.current()
    }

    pub fn view(&self, query: &ViewQuery) -> Result<Snapshot, MonitorError> {
        if let Some(threshold) = query.min_mem_percent
            && (threshold.is_nan() || threshold < 0.0)
        {
            return Err(MonitorError::InvalidThreshold(threshold));
        }
        Ok(self.cache.view(query, read_system_memory()))
    }

    /// Same as [`App::view`] with the sort field given by name.
    pub fn view_named(
        &self,
        top: Option<usize>,
        sort_by: Option<&str>,
        min_mem_percent: Option<f64>,
    ) -> Result<Snapshot, MonitorError> {
        let sort_by = sort_by.map(str::parse::<SortField>).transpose()?;
        self.view(&ViewQuery {
            top,
            sort_by,
            min_mem_percent,
        })
    }

    /// Run the terminate sequence off the async executor. With a store the
    /// outcome is recorded as a `process_kill` event in the background.
    pub async fn terminate(&self, pid: u32, force: bool) -> TerminationOutcome {
        let (outcome, _recording) = self.terminate_inner(pid, force).await;
        outcome
    }

    /// Like [`App::terminate`], but returns only once the kill event has been
    /// written.
    pub async fn terminate_recorded(&self, pid: u32, force: bool) -> TerminationOutcome {
        let (outcome, recording) = self.terminate_inner(pid, force).await;
        if let Some(recording) = recording {
            let _ = recording.await;
        }
        outcome
    }

    async fn terminate_inner(
        &self,
        pid: u32,
        force: bool,
    ) -> (TerminationOutcome, Option<JoinHandle<()>>) {
        let terminator = self.terminator.clone();
        let outcome =
            match tokio::task::spawn_blocking(move || terminator.terminate(pid, force)).await {
                Ok(outcome) => outcome,
                Err(err) => TerminationOutcome::failed(TerminationError::Other(err.to_string())),
            };

        let recording = self.store.clone().map(|store| {
            let payload = json!({
                "pid": pid,
                "success": outcome.success,
                "message": outcome.message,
            });
            tokio::spawn(async move {
                let recorded = tokio::task::spawn_blocking(move || {
                    store.append_event(PROCESS_KILL_EVENT, payload)
                })
                .await;
                match recorded {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(pid, %err, "failed to record kill event"),
                    Err(err) => error!(pid, %err, "kill event task failed"),
                }
            })
        });
        (outcome, recording)
    }

    pub async fn history(
        &self,
        pid: u32,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryRecord>, MonitorError> {
        let store = self.store.clone().ok_or(MonitorError::LoggingDisabled)?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let rows = tokio::task::spawn_blocking(move || store.history(pid, limit)).await??;
        Ok(rows)
    }

    pub async fn events(&self, limit: usize) -> Result<Vec<Event>, MonitorError> {
        let store = self.store.clone().ok_or(MonitorError::LoggingDisabled)?;
        let events = tokio::task::spawn_blocking(move || store.events(limit)).await??;
        Ok(events)
    }

    /// Join the live feed. The latest sampled snapshot, if any, arrives first.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe_with(|| {
            let current = self.cache.current();
            (current.total_processes > 0).then_some(current)
        })
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    pub fn memory_report(&self) -> SystemMemoryReport {
        read_memory_report()
    }
}

/// A store that fails to open leaves logging disabled rather than stopping
/// the monitor.
fn open_store(config: &Config) -> Option<RetentionStore> {
    let backend = match config.storage.backend() {
        Ok(backend) => backend,
        Err(err) => {
            error!(%err, "invalid storage backend, process logging disabled");
            return None;
        }
    };
    match RetentionStore::open(&backend, config.storage.policy()) {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(%err, location = %backend_location(&backend), "failed to open store, process logging disabled");
            None
        }
    }
}

fn backend_location(backend: &StorageBackend) -> String {
    match backend {
        StorageBackend::Structured { db_path } => db_path.display().to_string(),
        StorageBackend::FlatFile { dir } => dir.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RetentionPolicy;
    use crate::store::sqlite::SqliteSink;

    fn app_with_store() -> App {
        let store = RetentionStore::with_sink(
            Box::new(SqliteSink::open_in_memory().unwrap()),
            RetentionPolicy::default(),
        );
        App::with_parts(
            Collector::new(Duration::from_millis(50), SortField::MemoryPercent),
            Some(store),
            TerminationController::new(Duration::from_millis(200)),
        )
    }

    fn app_without_store() -> App {
        App::with_parts(
            Collector::default(),
            None,
            TerminationController::default(),
        )
    }

    #[tokio::test]
    async fn history_requires_logging() {
        let app = app_without_store();
        let err = app.history(1, None).await.unwrap_err();
        assert!(matches!(err, MonitorError::LoggingDisabled));
    }

    #[tokio::test]
    async fn view_rejects_bad_queries() {
        let app = app_without_store();
        let err = app
            .view(&ViewQuery {
                min_mem_percent: Some(-1.0),
                ..ViewQuery::default()
            })
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidThreshold(_)));

        let err = app
            .view(&ViewQuery {
                min_mem_percent: Some(f64::NAN),
                ..ViewQuery::default()
            })
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidThreshold(_)));

        let err = app.view_named(None, Some("bogus"), None).unwrap_err();
        assert!(matches!(err, MonitorError::InvalidSortField(_)));
    }

    #[tokio::test]
    async fn refresh_fills_cache_and_view_reports_totals() {
        let app = app_without_store();
        let snapshot = app.refresh().await.unwrap();
        assert!(Arc::ptr_eq(&snapshot, &app.current()));

        let view = app
            .view(&ViewQuery {
                top: Some(1),
                ..ViewQuery::default()
            })
            .unwrap();
        assert_eq!(view.total_processes, snapshot.total_processes);
        assert!(view.filtered_processes <= 1);
    }

    #[tokio::test]
    async fn refresh_does_not_roll_back_a_newer_cycle() {
        let app = app_without_store();
        let mut newer = Snapshot::empty();
        newer.timestamp = crate::format::now_epoch() + 3600.0;
        let newer = Arc::new(newer);
        app.cache.advance(Arc::clone(&newer));

        let current = app.refresh().await.unwrap();
        assert!(Arc::ptr_eq(&current, &newer));
        assert!(Arc::ptr_eq(&app.current(), &newer));
    }

    #[tokio::test]
    async fn subscribe_after_refresh_starts_with_cached_snapshot() {
        let app = app_without_store();
        let sampled = app.refresh().await.unwrap();
        let mut sub = app.subscribe();
        assert!(Arc::ptr_eq(&sub.try_recv().unwrap(), &sampled));
    }

    #[tokio::test]
    async fn subscribe_before_first_sample_gets_nothing_yet() {
        let app = app_without_store();
        let mut sub = app.subscribe();
        assert!(sub.try_recv().is_none());
        assert!(app.unsubscribe(sub.id()));
    }

    #[tokio::test]
    async fn terminate_missing_pid_records_event() {
        let app = app_with_store();
        let outcome = app.terminate(999_999_999, false).await;
        assert!(!outcome.success);

        let mut events = Vec::new();
        for _ in 0..50 {
            events = app.events(10).await.unwrap();
            if !events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PROCESS_KILL_EVENT);
        assert_eq!(events[0].payload["pid"], 999_999_999);
        assert_eq!(events[0].payload["success"], false);
    }

    #[test]
    fn unknown_backend_disables_logging() {
        let mut config = Config::default();
        config.general.logging_enabled = true;
        config.storage.backend = "mongo".into();
        assert!(open_store(&config).is_none());
    }
}
