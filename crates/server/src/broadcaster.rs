//! Push broadcaster.
//!
//! Subscribers live in an index-keyed registry. Each entry owns a bounded
//! FIFO queue and the snapshot it was last sent, which is the baseline its
//! next diff is computed against. Publishing never waits: a subscriber whose
//! queue is full is evicted on the spot and everyone else carries on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{Component, HealthEvent, PortfolioSnapshot, SnapshotSink};
use observability::BroadcastMetrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{diff_snapshot, full_update, Heartbeat, PushEnvelope};

pub type SubscriberId = u64;

/// Receiving side handed to the connection that registered
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<PushEnvelope>,
    /// Cancelled when the broadcaster evicts this subscriber
    pub evicted: CancellationToken,
}

/// Registry view of one subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub baseline_sequence: Option<u64>,
    pub last_acknowledged: Option<u64>,
}

struct SubscriberEntry {
    peer: String,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<PushEnvelope>,
    /// Last snapshot enqueued for this subscriber; diffs are taken against it.
    ///
    /// The queue is FIFO and a subscriber that falls behind is evicted rather
    /// than skipped, so once the client has drained its queue it holds exactly
    /// this snapshot. Diffing against the last acknowledged sequence instead
    /// would resend fields the client already has in flight. Acks are only
    /// recorded; `resync` resets the baseline to a full snapshot.
    baseline: Option<Arc<PortfolioSnapshot>>,
    last_acknowledged: Option<u64>,
    evicted: CancellationToken,
}

enum Delivery {
    Sent,
    Overflow,
    Gone,
}

impl SubscriberEntry {
    fn deliver(&self, envelope: PushEnvelope) -> Delivery {
        match self.tx.try_send(envelope) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Overflow,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    fn info(&self, id: SubscriberId) -> SubscriberInfo {
        SubscriberInfo {
            id,
            peer: self.peer.clone(),
            connected_at: self.connected_at,
            baseline_sequence: self.baseline.as_ref().map(|b| b.sequence),
            last_acknowledged: self.last_acknowledged,
        }
    }
}

struct Inner {
    registry: Mutex<BTreeMap<SubscriberId, SubscriberEntry>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    latest: RwLock<Option<Arc<PortfolioSnapshot>>>,
    last_event: RwLock<Option<HealthEvent>>,
    alerts: RwLock<Option<Arc<dyn SnapshotSink>>>,
    metrics: BroadcastMetrics,
}

/// Cloneable handle to the subscriber registry
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
                latest: RwLock::new(None),
                last_event: RwLock::new(None),
                alerts: RwLock::new(None),
                metrics: BroadcastMetrics::new(),
            }),
        }
    }

    /// Where eviction events are reported
    pub fn set_alerts(&self, sink: Arc<dyn SnapshotSink>) {
        *self.inner.alerts.write() = Some(sink);
    }

    /// Add a subscriber. If a snapshot has been published it is queued at
    /// once as a full update.
    pub fn register(&self, peer: impl Into<String>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, receiver) = mpsc::channel(self.inner.queue_capacity);
        let evicted = CancellationToken::new();

        let latest = self.inner.latest.read().clone();
        let mut entry = SubscriberEntry {
            peer: peer.into(),
            connected_at: Utc::now(),
            tx,
            baseline: None,
            last_acknowledged: None,
            evicted: evicted.clone(),
        };
        if let Some(latest) = latest {
            // Fresh queue, cannot be full
            if let Delivery::Sent = entry.deliver(PushEnvelope::snapshot(full_update(&latest))) {
                entry.baseline = Some(latest);
            }
        }

        let count = {
            let mut registry = self.inner.registry.lock();
            info!(subscriber = id, peer = %entry.peer, "Subscriber registered");
            registry.insert(id, entry);
            registry.len()
        };
        self.inner.metrics.set_subscribers(count);

        Subscription {
            id,
            receiver,
            evicted,
        }
    }

    /// Remove a subscriber that disconnected
    pub fn unregister(&self, id: SubscriberId) {
        let count = {
            let mut registry = self.inner.registry.lock();
            if registry.remove(&id).is_some() {
                debug!(subscriber = id, "Subscriber unregistered");
            }
            registry.len()
        };
        self.inner.metrics.set_subscribers(count);
    }

    /// Record the last sequence the client reports having applied
    pub fn acknowledge(&self, id: SubscriberId, sequence: u64) -> bool {
        match self.inner.registry.lock().get_mut(&id) {
            Some(entry) => {
                entry.last_acknowledged = Some(
                    entry
                        .last_acknowledged
                        .map_or(sequence, |prev| prev.max(sequence)),
                );
                true
            }
            None => false,
        }
    }

    /// Drop the subscriber's baseline and queue the latest snapshot in full
    pub fn request_resync(&self, id: SubscriberId) -> bool {
        let latest = self.inner.latest.read().clone();
        let mut registry = self.inner.registry.lock();
        let Some(entry) = registry.get_mut(&id) else {
            return false;
        };
        entry.baseline = None;

        let Some(latest) = latest else {
            return true;
        };
        match entry.deliver(PushEnvelope::snapshot(full_update(&latest))) {
            Delivery::Sent => {
                entry.baseline = Some(latest);
                true
            }
            Delivery::Overflow => {
                let removed = vec![(id, registry.remove(&id))];
                drop(registry);
                self.finish_evictions(removed);
                false
            }
            Delivery::Gone => {
                registry.remove(&id);
                false
            }
        }
    }

    /// Queue `snapshot` for every subscriber, diffed against what each was
    /// last sent
    pub fn publish(&self, snapshot: Arc<PortfolioSnapshot>) {
        *self.inner.latest.write() = Some(Arc::clone(&snapshot));

        let mut registry = self.inner.registry.lock();
        let mut overflow = Vec::new();
        let mut gone = Vec::new();
        for (id, entry) in registry.iter_mut() {
            let update = diff_snapshot(entry.baseline.as_deref(), &snapshot);
            match entry.deliver(PushEnvelope::snapshot(update)) {
                Delivery::Sent => entry.baseline = Some(Arc::clone(&snapshot)),
                Delivery::Overflow => overflow.push(*id),
                Delivery::Gone => gone.push(*id),
            }
        }
        for id in gone {
            registry.remove(&id);
        }
        let removed: Vec<_> = overflow.iter().map(|id| (*id, registry.remove(id))).collect();
        drop(registry);
        self.finish_evictions(removed);
    }

    /// Queue a heartbeat for every subscriber
    pub fn publish_heartbeat(&self, heartbeat: Heartbeat) {
        let mut registry = self.inner.registry.lock();
        let mut overflow = Vec::new();
        registry.retain(|id, entry| match entry.deliver(PushEnvelope::heartbeat(heartbeat.clone())) {
            Delivery::Sent => true,
            Delivery::Overflow => {
                overflow.push(*id);
                true
            }
            Delivery::Gone => false,
        });
        let removed: Vec<_> = overflow.iter().map(|id| (*id, registry.remove(id))).collect();
        drop(registry);
        self.finish_evictions(removed);
    }

    fn finish_evictions(&self, removed: Vec<(SubscriberId, Option<SubscriberEntry>)>) {
        if removed.is_empty() {
            return;
        }
        let count = self.inner.registry.lock().len();
        self.inner.metrics.set_subscribers(count);

        for (id, entry) in removed {
            let Some(entry) = entry else { continue };
            entry.evicted.cancel();
            self.inner.metrics.eviction();
            warn!(subscriber = id, peer = %entry.peer, "Subscriber queue full, evicted");

            let event = HealthEvent::warning(
                Component::Broadcaster,
                format!("subscriber {} ({}) evicted: outbound queue full", id, entry.peer),
            );
            self.record_event(event.clone());
            let alerts = self.inner.alerts.read().clone();
            if let Some(sink) = alerts {
                sink.publish_health(event);
            }
        }
    }

    fn record_event(&self, event: HealthEvent) {
        *self.inner.last_event.write() = Some(event);
    }

    /// Drop every subscriber's queue sender. Connections drain what is
    /// already queued and then close.
    pub fn close_all(&self) {
        let drained = std::mem::take(&mut *self.inner.registry.lock());
        if !drained.is_empty() {
            info!(subscribers = drained.len(), "Closing all subscriber queues");
        }
        self.inner.metrics.set_subscribers(0);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        self.inner
            .registry
            .lock()
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<PortfolioSnapshot>> {
        self.inner.latest.read().clone()
    }

    pub fn last_event(&self) -> Option<HealthEvent> {
        self.inner.last_event.read().clone()
    }
}

impl SnapshotSink for Broadcaster {
    fn publish_snapshot(&self, snapshot: Arc<PortfolioSnapshot>) {
        self.publish(snapshot);
    }

    /// Health events reach clients through the next heartbeat
    fn publish_health(&self, event: HealthEvent) {
        self.record_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{leg, snapshot};
    use crate::codec::ClientView;
    use uuid::Uuid;

    fn next_update(sub: &mut Subscription) -> crate::codec::SnapshotUpdate {
        let envelope = sub.receiver.try_recv().expect("queued update");
        envelope.as_snapshot().cloned().expect("snapshot envelope")
    }

    #[test]
    fn test_late_subscriber_gets_full_latest() {
        let broadcaster = Broadcaster::new(8);
        let session = Uuid::new_v4();
        broadcaster.publish(Arc::new(snapshot(
            session,
            1,
            vec![leg("ETH-27DEC30-3000-C", "ETH", 1.0, 0.6)],
        )));

        let mut sub = broadcaster.register("127.0.0.1:5000");
        let update = next_update(&mut sub);
        assert!(update.is_full());
        assert_eq!(update.sequence, 1);
        assert_eq!(broadcaster.subscribers()[0].baseline_sequence, Some(1));
    }

    #[test]
    fn test_subscribers_receive_diffs_in_order() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.register("a");
        let session = Uuid::new_v4();

        let first = Arc::new(snapshot(session, 1, vec![leg("ETH-27DEC30-3000-C", "ETH", 1.0, 0.60)]));
        let second = Arc::new(snapshot(session, 2, vec![leg("ETH-27DEC30-3000-C", "ETH", 1.0, 0.65)]));
        broadcaster.publish(first.clone());
        broadcaster.publish(second.clone());

        let mut view = ClientView::new();
        let u1 = next_update(&mut sub);
        assert!(u1.is_full());
        assert_eq!(view.apply(&u1).unwrap(), first.as_ref());

        let u2 = next_update(&mut sub);
        assert_eq!(u2.base_sequence, Some(1));
        assert_eq!(view.apply(&u2).unwrap(), second.as_ref());
    }

    #[test]
    fn test_diff_base_is_last_enqueued_not_last_acknowledged() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.register("a");
        let session = Uuid::new_v4();
        for (sequence, vol) in [(1, 0.60), (2, 0.65), (3, 0.70)] {
            broadcaster.publish(Arc::new(snapshot(
                session,
                sequence,
                vec![leg("ETH-27DEC30-3000-C", "ETH", 1.0, vol)],
            )));
        }
        // Only the first snapshot has been acknowledged
        assert!(broadcaster.acknowledge(sub.id, 1));

        let mut view = ClientView::new();
        for expected_base in [None, Some(1), Some(2)] {
            let update = next_update(&mut sub);
            assert_eq!(update.base_sequence, expected_base);
            view.apply(&update).unwrap();
        }
        assert_eq!(view.sequence(), Some(3));
        let info = &broadcaster.subscribers()[0];
        assert_eq!(info.baseline_sequence, Some(3));
        assert_eq!(info.last_acknowledged, Some(1));
    }

    #[test]
    fn test_slow_subscriber_evicted_others_unaffected() {
        let broadcaster = Broadcaster::new(2);
        let slow = broadcaster.register("slow");
        let mut fast = broadcaster.register("fast");
        let session = Uuid::new_v4();

        for sequence in 1..=5 {
            broadcaster.publish(Arc::new(snapshot(
                session,
                sequence,
                vec![leg("ETH-27DEC30-3000-C", "ETH", sequence as f64, 0.6)],
            )));
            // The fast subscriber keeps up
            assert_eq!(next_update(&mut fast).sequence, sequence);
        }

        assert!(slow.evicted.is_cancelled());
        assert!(!fast.evicted.is_cancelled());
        assert_eq!(broadcaster.subscriber_count(), 1);
        let event = broadcaster.last_event().unwrap();
        assert_eq!(event.component, Component::Broadcaster);
    }

    #[test]
    fn test_resync_sends_full_update() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.register("a");
        let session = Uuid::new_v4();
        broadcaster.publish(Arc::new(snapshot(session, 1, vec![leg("ETH-27DEC30-3000-C", "ETH", 1.0, 0.6)])));
        next_update(&mut sub);

        assert!(broadcaster.acknowledge(sub.id, 1));
        assert!(broadcaster.request_resync(sub.id));
        let update = next_update(&mut sub);
        assert!(update.is_full());
        assert_eq!(update.sequence, 1);

        let info = &broadcaster.subscribers()[0];
        assert_eq!(info.last_acknowledged, Some(1));
        assert!(!broadcaster.acknowledge(999, 1));
    }

    #[test]
    fn test_dropped_receiver_is_removed() {
        let broadcaster = Broadcaster::new(8);
        let sub = broadcaster.register("a");
        drop(sub);
        broadcaster.publish_heartbeat(Heartbeat::default());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_ends_queues_after_drain() {
        let broadcaster = Broadcaster::new(8);
        let mut sub = broadcaster.register("a");
        broadcaster.publish_heartbeat(Heartbeat::default());
        broadcaster.close_all();

        assert!(sub.receiver.recv().await.unwrap().as_heartbeat().is_some());
        assert!(sub.receiver.recv().await.is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_health_events_recorded() {
        let broadcaster = Broadcaster::new(8);
        broadcaster.publish_health(HealthEvent::info(Component::Ingestion, "feed streaming"));
        assert_eq!(broadcaster.last_event().unwrap().message, "feed streaming");
    }
}
