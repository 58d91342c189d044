//! Background loops: the sampling cycle, the persistence writer and the
//! retention sweep.
//!
//! Each cycle samples, replaces the cached snapshot, queues the snapshot for
//! persistence and fans it out to subscribers. Persistence runs on its own
//! task so a slow sink never delays the next sample, and the queue keeps
//! cycles in the order they were taken. The queue is bounded: while the sink
//! is stalled, new cycles are not recorded.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::store::RetentionStore;
use crate::system::collector::Collector;
use crate::system::snapshot::{Snapshot, SnapshotCache};

pub type SharedCollector = Arc<Mutex<Collector>>;

/// Cycles that may wait for the persistence writer before new ones are dropped.
pub const PERSIST_QUEUE_DEPTH: usize = 8;

/// Pause in sampling after a failed cycle.
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) fn lock_collector(collector: &SharedCollector) -> MutexGuard<'_, Collector> {
    match collector.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A named loop that runs `tick` once per period until stopped.
///
/// The first tick fires immediately. Ticks that fall behind are skipped rather
/// than replayed. A tick in progress always finishes before the loop exits.
pub struct RecurringTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RecurringTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(task = name, "recurring task stopped");
        });
        debug!(task = name, period_ms = period.as_millis() as u64, "recurring task started");
        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await
            && err.is_panic()
        {
            error!(task = self.name, %err, "recurring task panicked");
        }
    }
}

/// Shared state the sampling cycle reads from and writes to.
#[derive(Clone)]
pub struct CycleContext {
    pub collector: SharedCollector,
    pub cache: Arc<SnapshotCache>,
    pub broadcaster: Broadcaster,
}

/// Running background work started by [`Pipeline::start`].
pub struct Pipeline {
    sampling: RecurringTask,
    retention: Option<RecurringTask>,
    writer: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start sampling every `interval`. With a store, snapshots are persisted
    /// and retention runs every `retention_interval`, first at startup.
    pub fn start(
        ctx: CycleContext,
        store: Option<RetentionStore>,
        interval: Duration,
        retention_interval: Duration,
    ) -> Self {
        let (persist, writer) = match &store {
            Some(store) => {
                let (tx, handle) = spawn_writer(store.clone());
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let cooldown = Arc::new(Cooldown::new(backoff_ticks(interval)));
        let sampling = RecurringTask::spawn("sampling", interval, move || {
            let ctx = ctx.clone();
            let persist = persist.clone();
            let cooldown = Arc::clone(&cooldown);
            async move {
                if cooldown.skip_tick() {
                    return;
                }
                if !run_cycle(&ctx, persist.as_ref()).await {
                    cooldown.trip();
                }
            }
        });

        let retention = store.map(|store| {
            RecurringTask::spawn("retention", retention_interval, move || {
                let store = store.clone();
                async move { run_retention(store).await }
            })
        });

        info!(
            interval_ms = interval.as_millis() as u64,
            persistence = writer.is_some(),
            "monitoring pipeline started"
        );
        Pipeline {
            sampling,
            retention,
            writer,
        }
    }

    /// Stop the loops, letting any in-flight cycle finish and the persistence
    /// queue drain.
    pub async fn shutdown(self) {
        let Pipeline {
            sampling,
            retention,
            writer,
        } = self;

        let sampling_done = async move {
            sampling.stop().await;
            // The sampling closure owned the last queue sender, so the writer
            // ends once everything queued is written.
            if let Some(writer) = writer
                && let Err(err) = writer.await
            {
                error!(%err, "persistence writer failed");
            }
        };
        let retention_done = async move {
            if let Some(retention) = retention {
                retention.stop().await;
            }
        };
        join(sampling_done, retention_done).await;
        info!("monitoring pipeline stopped");
    }
}

/// Number of ticks that cover [`FAILURE_BACKOFF`] at `interval`, at least one.
pub fn backoff_ticks(interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    let ticks = (FAILURE_BACKOFF.as_secs_f64() / interval.as_secs_f64()).ceil();
    (ticks as u32).max(1)
}

/// Counts down the ticks to skip after a failed cycle.
#[derive(Debug)]
pub struct Cooldown {
    ticks: u32,
    remaining: AtomicU32,
}

impl Cooldown {
    pub fn new(ticks: u32) -> Self {
        Cooldown {
            ticks,
            remaining: AtomicU32::new(0),
        }
    }

    pub fn trip(&self) {
        self.remaining.store(self.ticks, Ordering::SeqCst);
        warn!(skipped_ticks = self.ticks, "sampling paused after failed cycle");
    }

    /// True (and one tick consumed) while cooling down.
    pub fn skip_tick(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// One sampling cycle. Returns false when sampling failed; the failure is
/// logged and nothing is cached, persisted or published.
pub async fn run_cycle(ctx: &CycleContext, persist: Option<&mpsc::Sender<Arc<Snapshot>>>) -> bool {
    let collector = Arc::clone(&ctx.collector);
    let snapshot =
        match tokio::task::spawn_blocking(move || lock_collector(&collector).refresh()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(%err, "sampling cycle failed");
                return false;
            }
        };

    ctx.cache.advance(Arc::clone(&snapshot));

    if let Some(tx) = persist {
        match tx.try_send(Arc::clone(&snapshot)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    timestamp = snapshot.timestamp,
                    depth = PERSIST_QUEUE_DEPTH,
                    "persistence queue full, snapshot not recorded"
                )
            }
            Err(TrySendError::Closed(_)) => {
                warn!("persistence writer has stopped, snapshot not recorded")
            }
        }
    }

    let report = ctx.broadcaster.publish(&snapshot);
    debug!(
        processes = snapshot.total_processes,
        delivered = report.delivered,
        skipped = report.skipped,
        dropped = report.dropped,
        "cycle complete"
    );
    true
}

fn spawn_writer(store: RetentionStore) -> (mpsc::Sender<Arc<Snapshot>>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Arc<Snapshot>>(PERSIST_QUEUE_DEPTH);
    let handle = tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.append_sample(&snapshot)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => error!(%err, "failed to persist snapshot"),
                Err(err) => error!(%err, "persistence task failed"),
            }
        }
    });
    (tx, handle)
}

async fn run_retention(store: RetentionStore) {
    match tokio::task::spawn_blocking(move || store.enforce_retention()).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => error!(%err, "retention sweep failed"),
        Err(err) => error!(%err, "retention task failed"),
    }
}
