//! Fan-out of aggregate snapshots to a dynamic set of subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::aggregator::SharedAggregator;
use crate::types::{Snapshot, StatsUpdate, UpdateKind};

struct Inner {
    stats: SharedAggregator,
    tx: broadcast::Sender<Arc<StatsUpdate>>,
    sequence: AtomicU64,
    next_id: AtomicU64,
    /// Serializes snapshot + sequence assignment so sequence order matches state order.
    publish_lock: Mutex<()>,
}

/// Broadcasts [`StatsUpdate`]s to every live subscriber.
///
/// Each subscriber reads from its own bounded queue. A subscriber that falls
/// behind loses its oldest queued updates; publishing never waits on it.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    pub fn new(stats: SharedAggregator, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                stats,
                tx,
                sequence: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                publish_lock: Mutex::new(()),
            }),
        }
    }

    /// Register a subscriber. Its first update is the current snapshot.
    pub fn subscribe(&self) -> Subscription {
        // Receiver first: anything published from here on is queued, and
        // anything at or below `baseline` is already covered by the snapshot.
        let rx = self.inner.tx.subscribe();
        let baseline = self.inner.sequence.load(Ordering::SeqCst);
        let snapshot = self.inner.stats.snapshot();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        debug!(subscriber = id, baseline, "subscriber registered");
        Subscription {
            id,
            initial: Some(Arc::new(StatsUpdate {
                kind: UpdateKind::InitialStats,
                sequence: baseline,
                snapshot: Arc::new(snapshot),
            })),
            rx,
            baseline,
            dropped: 0,
        }
    }

    /// Remove a subscriber. Dropping the [`Subscription`] does the same.
    pub fn unsubscribe(&self, subscription: Subscription) {
        debug!(
            subscriber = subscription.id,
            dropped = subscription.dropped,
            "subscriber removed"
        );
        drop(subscription);
    }

    /// Deliver `snapshot` to every subscriber; returns its sequence number.
    pub fn publish(&self, snapshot: Snapshot) -> u64 {
        let _guard = self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.send(snapshot)
    }

    /// Snapshot the aggregator and publish the result.
    pub fn publish_latest(&self) -> u64 {
        let _guard = self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot = self.inner.stats.snapshot();
        self.send(snapshot)
    }

    fn send(&self, snapshot: Snapshot) -> u64 {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let update = Arc::new(StatsUpdate {
            kind: UpdateKind::StatsUpdate,
            sequence,
            snapshot: Arc::new(snapshot),
        });
        // Err only means nobody is listening right now.
        match self.inner.tx.send(update) {
            Ok(receivers) => debug!(sequence, receivers, "published update"),
            Err(_) => debug!(sequence, "published update with no subscribers"),
        }
        sequence
    }

    /// Current state, straight from the aggregator.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.stats.snapshot()
    }

    /// Sequence number of the last published update (0 before the first).
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

/// One subscriber's view of the update stream.
pub struct Subscription {
    id: u64,
    initial: Option<Arc<StatsUpdate>>,
    rx: broadcast::Receiver<Arc<StatsUpdate>>,
    baseline: u64,
    dropped: u64,
}

impl Subscription {
    /// Next update, waiting if none is queued. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Arc<StatsUpdate>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(update) if update.sequence <= self.baseline => continue,
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next queued update without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<StatsUpdate>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.try_recv() {
                Ok(update) if update.sequence <= self.baseline => continue,
                Ok(update) => return Some(update),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!(
            subscriber = self.id,
            skipped, "Subscriber lagging, oldest updates dropped"
        );
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Updates lost to queue overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.dropped > 0 {
            info!(
                subscriber = self.id,
                dropped = self.dropped,
                "Subscriber closed after missing updates"
            );
        }
    }
}
