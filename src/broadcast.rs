//! Live fan-out of snapshots to a dynamic set of subscribers.
//!
//! Each subscriber gets a one-slot channel. A subscriber that has not taken
//! the previous snapshot yet misses the next one (no backlog, no replay); a
//! subscriber whose receiver is gone is dropped from the set on the next
//! publish.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::debug;

use crate::system::snapshot::Snapshot;

pub type SubscriberId = u64;

#[derive(Default)]
struct Registry {
    next_id: SubscriberId,
    subscribers: BTreeMap<SubscriberId, mpsc::Sender<Arc<Snapshot>>>,
}

#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
}

/// Receiving end of one live feed.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<Snapshot>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next delivered snapshot; `None` once the subscriber has been removed.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Snapshot>> {
        match self.rx.try_recv() {
            Ok(snapshot) => Some(snapshot),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// What happened to one `publish` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers still holding the previous snapshot.
    pub skipped: usize,
    /// Subscribers found disconnected and removed.
    pub dropped: usize,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new subscriber; `current` is delivered to it immediately.
    pub fn subscribe(&self, current: Option<Arc<Snapshot>>) -> Subscription {
        self.subscribe_with(|| current)
    }

    /// Register a new subscriber whose first snapshot is read by `current`
    /// while the registry is locked. A concurrent publish therefore either
    /// finished before the read or has the new subscriber among its targets.
    pub fn subscribe_with(
        &self,
        current: impl FnOnce() -> Option<Arc<Snapshot>>,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let mut registry = self.registry();
        if let Some(snapshot) = current() {
            // The channel is fresh and empty, this cannot fail.
            let _ = tx.try_send(snapshot);
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        debug!(subscriber = id, active = registry.subscribers.len(), "subscriber connected");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry().subscribers.remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }

    /// Deliver `snapshot` to every active subscriber. Iterates over a copy of
    /// the set, so concurrent subscribe/unsubscribe calls never disturb an
    /// in-progress fan-out.
    pub fn publish(&self, snapshot: &Arc<Snapshot>) -> PublishReport {
        let targets: Vec<(SubscriberId, mpsc::Sender<Arc<Snapshot>>)> = self
            .registry()
            .subscribers
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(snapshot)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.skipped += 1,
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut registry = self.registry();
            for id in &closed {
                registry.subscribers.remove(id);
                debug!(subscriber = id, "dropping disconnected subscriber");
            }
            report.dropped = closed.len();
        }
        report
    }
}
