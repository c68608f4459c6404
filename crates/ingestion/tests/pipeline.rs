//! End-to-end: in-process exchange -> ingestion -> broadcaster + archive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use common::{
    Component, FeedStatus, Fanout, HealthEvent, PortfolioSnapshot, Severity, SnapshotSink,
    SnapshotTrigger,
};
use parking_lot::Mutex;
use ingestion::protocol;
use ingestion::{memory_feed, BackoffPolicy, ExchangeSession, IngestionLoop, IngestionSettings, MemoryExchange};
use portfolio::PositionUpdate;
use serde_json::json;
use server::{Broadcaster, ClientView, Subscription};
use storage::{ArchiveStore, ArchiveWriter, RetryPolicy, SnapshotArchive, StorageError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CALL: &str = "ETH-27DEC30-3000-C";

/// Rejects every write
struct FailingStore;

impl ArchiveStore for FailingStore {
    fn append_snapshot(&self, _snapshot: &PortfolioSnapshot) -> storage::Result<()> {
        Err(StorageError::Corrupt("disk full".to_string()))
    }

    fn append_health(&self, _event: &HealthEvent) -> storage::Result<()> {
        Err(StorageError::Corrupt("disk full".to_string()))
    }
}

/// Reports lock contention for the first `failures` snapshot writes, then
/// writes through to the archive
struct ContendedStore {
    archive: Arc<SnapshotArchive>,
    failures: AtomicU32,
}

impl ContendedStore {
    fn new(archive: Arc<SnapshotArchive>, failures: u32) -> Self {
        Self {
            archive,
            failures: AtomicU32::new(failures),
        }
    }
}

impl ArchiveStore for ContendedStore {
    fn append_snapshot(&self, snapshot: &PortfolioSnapshot) -> storage::Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "database is locked",
            )));
        }
        self.archive.append_snapshot(snapshot)
    }

    fn append_health(&self, event: &HealthEvent) -> storage::Result<()> {
        self.archive.append_health(event)
    }
}

/// Archive writer alerts, forwarded to the broadcaster and kept for asserts
struct AlertLog {
    broadcaster: Broadcaster,
    events: Mutex<Vec<HealthEvent>>,
}

impl SnapshotSink for AlertLog {
    fn publish_snapshot(&self, snapshot: Arc<PortfolioSnapshot>) {
        self.broadcaster.publish_snapshot(snapshot);
    }

    fn publish_health(&self, event: HealthEvent) {
        self.events.lock().push(event.clone());
        self.broadcaster.publish_health(event);
    }
}

impl AlertLog {
    fn persistence_events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.component == Component::Persistence)
            .cloned()
            .collect()
    }
}

struct Pipeline {
    exchange: MemoryExchange,
    broadcaster: Broadcaster,
    subscription: Subscription,
    view: ClientView,
    alerts: Arc<AlertLog>,
    cancel: CancellationToken,
}

impl Pipeline {
    fn start(store: Arc<dyn ArchiveStore>, last_sequence: u64) -> Self {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
        };
        Self::start_with_retry(store, last_sequence, retry)
    }

    fn start_with_retry(store: Arc<dyn ArchiveStore>, last_sequence: u64, retry: RetryPolicy) -> Self {
        let settings = IngestionSettings {
            coalesce_window: Duration::from_millis(10),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                max_attempts: 5,
            },
            ..IngestionSettings::default()
        };

        let (exchange, connector) = memory_feed();
        let broadcaster = Broadcaster::new(256);
        let subscription = broadcaster.register("pipeline-test");
        let cancel = CancellationToken::new();

        let (writer, archive) = ArchiveWriter::new(store, retry, 256);
        let alerts = Arc::new(AlertLog {
            broadcaster: broadcaster.clone(),
            events: Mutex::new(Vec::new()),
        });
        let writer = writer.with_alerts(alerts.clone());
        tokio::spawn(writer.run(cancel.child_token()));

        let sink = Fanout::new()
            .with(Arc::new(broadcaster.clone()))
            .with(Arc::new(archive));
        let ingestion = IngestionLoop::new(
            settings,
            Arc::new(connector),
            Arc::new(sink),
            Arc::new(FeedStatus::new()),
        )
        .with_positions(vec![PositionUpdate::new(CALL, 2.0)])
        .unwrap()
        .with_sequence_start(last_sequence);
        tokio::spawn(ingestion.run(cancel.child_token()));

        Self {
            exchange,
            broadcaster,
            subscription,
            view: ClientView::new(),
            alerts,
            cancel,
        }
    }

    /// Apply pushed updates until the rebuilt snapshot satisfies `pred`
    async fn pushed_where(&mut self, pred: impl Fn(&PortfolioSnapshot) -> bool) -> PortfolioSnapshot {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(5), self.subscription.receiver.recv())
                .await
                .expect("no push within 5s")
                .expect("subscription closed");
            if let Some(update) = envelope.as_snapshot() {
                let snapshot = self.view.apply(update).unwrap();
                if pred(snapshot) {
                    return snapshot.clone();
                }
            }
        }
    }
}

async fn accept_subscribe(session: &mut ExchangeSession) {
    let request = session.expect("public/subscribe").await.unwrap();
    let channels = protocol::channel_list(&request["params"]["channels"]);
    session.respond(request["id"].as_u64().unwrap(), json!(channels));
}

fn ticker(session: &ExchangeSession, iv_percent: f64) {
    session.notify(
        &protocol::ticker_channel(CALL, "100ms"),
        json!({
            "instrument_name": CALL,
            "underlying_price": 3000.0,
            "mark_iv": iv_percent,
            "timestamp": Utc::now().timestamp_millis()
        }),
    );
}

fn priced_at(iv: f64) -> impl Fn(&PortfolioSnapshot) -> bool {
    move |s| s.position(CALL).map_or(false, |p| p.inputs.volatility == iv)
}

fn archive() -> (tempfile::TempDir, Arc<SnapshotArchive>) {
    let dir = tempfile::tempdir().unwrap();
    let archive = SnapshotArchive::open(dir.path().join("greeks.db"), Duration::from_secs(1)).unwrap();
    (dir, Arc::new(archive))
}

async fn archived_through(archive: &SnapshotArchive, sequence: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while archive.latest_sequence().unwrap().unwrap_or(0) < sequence {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot not archived within 5s");
}

#[tokio::test]
async fn test_iv_change_reaches_subscriber_and_archive() {
    let (_dir, archive) = archive();
    let mut pipeline = Pipeline::start(archive.clone(), 0);
    let mut session = pipeline.exchange.accept();
    accept_subscribe(&mut session).await;

    ticker(&session, 60.0);
    let first = pipeline.pushed_where(priced_at(0.60)).await;

    ticker(&session, 65.0);
    let second = pipeline.pushed_where(priced_at(0.65)).await;

    let vega = |s: &PortfolioSnapshot| s.position(CALL).unwrap().position_greeks.vega;
    assert!(second.sequence > first.sequence);
    assert_ne!(vega(&second), vega(&first));
    assert_eq!(second.net_for("ETH").unwrap().greeks.vega, vega(&second));

    archived_through(&archive, second.sequence).await;
    let stored = archive.latest_snapshot().unwrap().unwrap();
    assert_eq!(stored.sequence, second.sequence);
    assert_eq!(stored.position(CALL).unwrap().inputs.volatility, 0.65);
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn test_persistence_failure_does_not_hold_back_broadcast() {
    let mut pipeline = Pipeline::start(Arc::new(FailingStore), 0);
    let mut session = pipeline.exchange.accept();
    accept_subscribe(&mut session).await;

    ticker(&session, 60.0);
    let first = pipeline.pushed_where(priced_at(0.60)).await;
    ticker(&session, 70.0);
    let second = pipeline.pushed_where(priced_at(0.70)).await;
    assert!(second.sequence > first.sequence);

    // The writer reports what it dropped; the stream is unaffected
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(event) = pipeline.broadcaster.last_event() {
                if event.component == Component::Persistence {
                    assert_eq!(event.severity, Severity::Error);
                    assert!(event.message.contains("not archived"));
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no persistence alert");

    ticker(&session, 75.0);
    pipeline.pushed_where(priced_at(0.75)).await;
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn test_sequence_continues_from_archive_across_reconnects() {
    let (_dir, archive) = archive();
    archive
        .append_snapshot(&PortfolioSnapshot {
            session_id: Uuid::new_v4(),
            sequence: 41,
            timestamp: Utc::now(),
            trigger: SnapshotTrigger::Periodic,
            positions: Vec::new(),
            net: Vec::new(),
            excluded: Vec::new(),
        })
        .unwrap();
    let last = archive.latest_sequence().unwrap().unwrap();

    let mut pipeline = Pipeline::start(archive.clone(), last);
    let mut first_session = pipeline.exchange.accept();
    accept_subscribe(&mut first_session).await;
    ticker(&first_session, 60.0);
    let before = pipeline.pushed_where(priced_at(0.60)).await;
    assert!(before.sequence > 41);

    let mut second_session = pipeline.exchange.accept();
    drop(first_session);
    accept_subscribe(&mut second_session).await;
    ticker(&second_session, 80.0);
    let after = pipeline.pushed_where(priced_at(0.80)).await;

    assert!(after.sequence > before.sequence);
    assert_eq!(after.session_id, before.session_id);

    // Every emitted sequence was archived once, with no holes
    archived_through(&archive, after.sequence).await;
    let from = Utc::now() - ChronoDuration::hours(1);
    let to = Utc::now() + ChronoDuration::minutes(1);
    assert!(archive.sequence_gaps(from, to).unwrap().is_empty());
    let stats = archive.statistics().unwrap();
    assert_eq!(stats.first_sequence, Some(41));
    assert_eq!(stats.snapshot_count, stats.last_sequence.unwrap() - 40);
    pipeline.cancel.cancel();
}

fn retrying() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(400),
        max_delay: Duration::from_millis(800),
    }
}

#[tokio::test]
async fn test_broadcast_keeps_pace_while_archive_write_is_retried() {
    let (_dir, archive) = archive();
    // Two contended attempts, then the third commits: about 1.2s of backoff
    let store = Arc::new(ContendedStore::new(archive.clone(), 2));
    let mut pipeline = Pipeline::start_with_retry(store, 0, retrying());
    let mut session = pipeline.exchange.accept();
    accept_subscribe(&mut session).await;

    let mut sequences = Vec::new();
    for iv in [60.0, 65.0, 70.0] {
        let sent = Instant::now();
        ticker(&session, iv);
        let pushed = pipeline.pushed_where(priced_at(iv / 100.0)).await;
        assert!(
            sent.elapsed() < Duration::from_millis(300),
            "push waited on the archive: {:?}",
            sent.elapsed()
        );
        sequences.push(pushed.sequence);
    }
    assert!(sequences.windows(2).all(|w| w[1] > w[0]));

    // Every pushed sequence is archived once the retries succeed
    let last = *sequences.last().unwrap();
    archived_through(&archive, last).await;
    let from = Utc::now() - ChronoDuration::hours(1);
    let to = Utc::now() + ChronoDuration::minutes(1);
    let stored: Vec<u64> = archive
        .snapshots_between(from, to, 1000)
        .unwrap()
        .iter()
        .map(|s| s.sequence)
        .collect();
    for sequence in &sequences {
        assert!(stored.contains(sequence), "sequence {} missing from archive", sequence);
    }
    assert!(archive.sequence_gaps(from, to).unwrap().is_empty());
    assert!(pipeline.alerts.persistence_events().is_empty());
    pipeline.cancel.cancel();
}

#[tokio::test]
async fn test_persistence_alert_only_after_retries_run_out() {
    let (_dir, archive) = archive();
    let store = Arc::new(ContendedStore::new(archive.clone(), u32::MAX));
    let mut pipeline = Pipeline::start_with_retry(store, 0, retrying());
    let mut session = pipeline.exchange.accept();
    accept_subscribe(&mut session).await;

    ticker(&session, 60.0);
    let pushed = pipeline.pushed_where(priced_at(0.60)).await;
    assert!(pipeline.alerts.persistence_events().is_empty());

    let alert = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(event) = pipeline.alerts.persistence_events().into_iter().next() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no persistence alert after retries ran out");
    assert_eq!(alert.severity, Severity::Error);
    assert!(alert.message.contains("after 3 attempts"));
    assert!(archive.latest_sequence().unwrap().is_none());
    assert!(pushed.sequence >= 1);
    pipeline.cancel.cancel();
}

