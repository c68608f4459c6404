//! Archive writer task.
//!
//! The ingestion loop hands records to an [`ArchiveHandle`], which enqueues
//! them without waiting. A single [`ArchiveWriter`] task commits them in
//! arrival order. A record that cannot be committed is dropped after its
//! retries and reported to the alert sink; the next record proceeds as usual.

use std::sync::Arc;
use std::time::Instant;

use common::{Component, HealthEvent, PortfolioSnapshot, SnapshotSink};
use observability::ArchiveMetrics;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveStore;
use crate::retry::{retry_blocking, RetryPolicy};

#[derive(Debug, Clone)]
pub enum ArchiveRecord {
    Snapshot(Arc<PortfolioSnapshot>),
    Health(HealthEvent),
}

/// Non-blocking producer side of the archive queue
#[derive(Clone)]
pub struct ArchiveHandle {
    tx: mpsc::Sender<ArchiveRecord>,
    metrics: ArchiveMetrics,
}

impl ArchiveHandle {
    fn enqueue(&self, record: ArchiveRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.metrics.dropped();
                match record {
                    ArchiveRecord::Snapshot(s) => {
                        warn!(sequence = s.sequence, "Archive queue full, snapshot dropped")
                    }
                    ArchiveRecord::Health(_) => warn!("Archive queue full, health event dropped"),
                }
            }
            Err(TrySendError::Closed(_)) => debug!("Archive writer stopped, record discarded"),
        }
    }
}

impl SnapshotSink for ArchiveHandle {
    fn publish_snapshot(&self, snapshot: Arc<PortfolioSnapshot>) {
        self.enqueue(ArchiveRecord::Snapshot(snapshot));
    }

    fn publish_health(&self, event: HealthEvent) {
        self.enqueue(ArchiveRecord::Health(event));
    }
}

pub struct ArchiveWriter {
    store: Arc<dyn ArchiveStore>,
    policy: RetryPolicy,
    rx: mpsc::Receiver<ArchiveRecord>,
    alerts: Option<Arc<dyn SnapshotSink>>,
    metrics: ArchiveMetrics,
}

impl ArchiveWriter {
    pub fn new(
        store: Arc<dyn ArchiveStore>,
        policy: RetryPolicy,
        capacity: usize,
    ) -> (Self, ArchiveHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let metrics = ArchiveMetrics::new();
        let writer = Self {
            store,
            policy,
            rx,
            alerts: None,
            metrics: metrics.clone(),
        };
        (writer, ArchiveHandle { tx, metrics })
    }

    /// Where to report records that could not be committed
    pub fn with_alerts(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    /// Commit records until cancelled, then drain what is already queued
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Archive writer started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = self.rx.recv() => match record {
                    Some(record) => self.write(record).await,
                    None => {
                        info!("Archive queue closed");
                        return;
                    }
                },
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Ok(record) = self.rx.try_recv() {
            self.write(record).await;
            drained += 1;
        }
        info!(drained, "Archive writer stopped");
    }

    async fn write(&self, record: ArchiveRecord) {
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        let started = Instant::now();

        let (label, result) = match &record {
            ArchiveRecord::Snapshot(snapshot) => {
                let snapshot = Arc::clone(snapshot);
                let result = retry_blocking(
                    self.policy,
                    "append_snapshot",
                    move || store.append_snapshot(&snapshot),
                    |_, _| metrics.retry(),
                )
                .await;
                if result.is_ok() {
                    self.metrics.snapshot_written(started.elapsed());
                }
                ("snapshot", result)
            }
            ArchiveRecord::Health(event) => {
                let event = event.clone();
                let result = retry_blocking(
                    self.policy,
                    "append_health",
                    move || store.append_health(&event),
                    |_, _| metrics.retry(),
                )
                .await;
                if result.is_ok() {
                    self.metrics.health_written(started.elapsed());
                }
                ("health event", result)
            }
        };

        if let Err(err) = result {
            self.metrics.failure();
            let detail = match &record {
                ArchiveRecord::Snapshot(s) => format!("{} {} not archived: {}", label, s.sequence, err),
                ArchiveRecord::Health(_) => format!("{} not archived: {}", label, err),
            };
            error!(error = %err, "{}", detail);
            if let Some(alerts) = &self.alerts {
                alerts.publish_health(HealthEvent::error(Component::Persistence, detail));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::SnapshotArchive;
    use crate::error::StorageError;
    use crate::Result;
    use chrono::Utc;
    use common::SnapshotTrigger;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn snapshot(sequence: u64) -> Arc<PortfolioSnapshot> {
        Arc::new(PortfolioSnapshot {
            session_id: uuid::Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            trigger: SnapshotTrigger::Change,
            positions: Vec::new(),
            net: Vec::new(),
            excluded: Vec::new(),
        })
    }

    /// Fails every write of the listed sequences, records the rest
    #[derive(Default)]
    struct FlakyStore {
        fail: Vec<u64>,
        written: Mutex<Vec<u64>>,
    }

    impl ArchiveStore for FlakyStore {
        fn append_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
            if self.fail.contains(&snapshot.sequence) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk unavailable",
                )));
            }
            self.written.lock().push(snapshot.sequence);
            Ok(())
        }

        fn append_health(&self, _event: &HealthEvent) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Alerts(Mutex<Vec<HealthEvent>>);

    impl SnapshotSink for Alerts {
        fn publish_snapshot(&self, _snapshot: Arc<PortfolioSnapshot>) {}

        fn publish_health(&self, event: HealthEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_reported_and_next_proceeds() {
        let store = Arc::new(FlakyStore {
            fail: vec![2],
            ..Default::default()
        });
        let alerts = Arc::new(Alerts::default());
        let (writer, handle) = ArchiveWriter::new(store.clone(), RetryPolicy::default(), 16);
        let writer = writer.with_alerts(alerts.clone());

        for seq in 1..=3 {
            handle.publish_snapshot(snapshot(seq));
        }
        drop(handle);
        writer.run(CancellationToken::new()).await;

        assert_eq!(*store.written.lock(), vec![1, 3]);
        let alerts = alerts.0.lock();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].component, Component::Persistence);
        assert!(alerts[0].message.contains("snapshot 2"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let store = Arc::new(FlakyStore::default());
        let (writer, handle) = ArchiveWriter::new(store.clone(), RetryPolicy::default(), 2);

        for seq in 1..=5 {
            handle.publish_snapshot(snapshot(seq));
        }
        drop(handle);
        writer.run(CancellationToken::new()).await;

        assert_eq!(*store.written.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_drains_queue_into_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(
            SnapshotArchive::open(dir.path().join("greeks.db"), Duration::from_millis(250))
                .unwrap(),
        );
        let (writer, handle) = ArchiveWriter::new(archive.clone(), RetryPolicy::default(), 16);

        handle.publish_snapshot(snapshot(1));
        handle.publish_health(HealthEvent::info(Component::Ingestion, "streaming"));
        handle.publish_snapshot(snapshot(2));

        let cancel = CancellationToken::new();
        cancel.cancel();
        writer.run(cancel).await;

        assert_eq!(archive.latest_sequence().unwrap(), Some(2));
        assert_eq!(archive.statistics().unwrap().health_event_count, 1);
    }
}
