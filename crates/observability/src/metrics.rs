//! Prometheus metrics infrastructure
//!
//! Each pipeline stage owns one handle struct. Handles are cheap to clone and
//! record into whatever recorder is installed; with none installed they are
//! no-ops, which keeps tests free of global state.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Start the Prometheus exporter, serving `/metrics` on `host:port`
pub fn init_metrics(host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Feed ingestion metrics
///
/// * `ingest_messages_total{kind}` - decoded inbound frames
/// * `ingest_decode_errors_total` - malformed or invalid frames skipped
/// * `ingest_reconnects_total` - reconnect attempts
/// * `ingest_snapshots_total{trigger}` - snapshots emitted
/// * `ingest_recompute_seconds` - aggregator + pricing time per snapshot
#[derive(Clone)]
pub struct IngestionMetrics {
    tickers: Counter,
    portfolio: Counter,
    decode_errors: Counter,
    reconnects: Counter,
    change_snapshots: Counter,
    periodic_snapshots: Counter,
    recompute: Histogram,
    positions: Gauge,
}

impl IngestionMetrics {
    pub fn new() -> Self {
        Self {
            tickers: counter!("ingest_messages_total", "kind" => "ticker"),
            portfolio: counter!("ingest_messages_total", "kind" => "portfolio"),
            decode_errors: counter!("ingest_decode_errors_total"),
            reconnects: counter!("ingest_reconnects_total"),
            change_snapshots: counter!("ingest_snapshots_total", "trigger" => "change"),
            periodic_snapshots: counter!("ingest_snapshots_total", "trigger" => "periodic"),
            recompute: histogram!("ingest_recompute_seconds"),
            positions: gauge!("ingest_positions"),
        }
    }

    pub fn ticker(&self) {
        self.tickers.increment(1);
    }

    pub fn portfolio_update(&self) {
        self.portfolio.increment(1);
    }

    pub fn decode_error(&self) {
        self.decode_errors.increment(1);
    }

    pub fn reconnect(&self) {
        self.reconnects.increment(1);
    }

    pub fn snapshot(&self, periodic: bool, recompute: Duration, positions: usize) {
        if periodic {
            self.periodic_snapshots.increment(1);
        } else {
            self.change_snapshots.increment(1);
        }
        self.recompute.record(recompute.as_secs_f64());
        self.positions.set(positions as f64);
    }
}

impl Default for IngestionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Push broadcaster metrics
///
/// * `broadcast_subscribers` - registered subscribers
/// * `broadcast_evictions_total` - subscribers dropped for a full queue
/// * `broadcast_frames_total` - frames written to sockets
/// * `broadcast_batch_messages` - messages per frame
#[derive(Clone)]
pub struct BroadcastMetrics {
    subscribers: Gauge,
    evictions: Counter,
    frames: Counter,
    batch_messages: Histogram,
}

impl BroadcastMetrics {
    pub fn new() -> Self {
        Self {
            subscribers: gauge!("broadcast_subscribers"),
            evictions: counter!("broadcast_evictions_total"),
            frames: counter!("broadcast_frames_total"),
            batch_messages: histogram!("broadcast_batch_messages"),
        }
    }

    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.set(count as f64);
    }

    pub fn eviction(&self) {
        self.evictions.increment(1);
    }

    pub fn frame_sent(&self, messages: usize) {
        self.frames.increment(1);
        self.batch_messages.record(messages as f64);
    }
}

impl Default for BroadcastMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistence metrics
///
/// * `archive_writes_total{kind}` - committed records
/// * `archive_retries_total` - retried write attempts
/// * `archive_failures_total` - records given up on
/// * `archive_dropped_total` - records dropped because the queue was full
/// * `archive_write_seconds` - time per committed write including retries
#[derive(Clone)]
pub struct ArchiveMetrics {
    snapshot_writes: Counter,
    health_writes: Counter,
    retries: Counter,
    failures: Counter,
    dropped: Counter,
    write_time: Histogram,
}

impl ArchiveMetrics {
    pub fn new() -> Self {
        Self {
            snapshot_writes: counter!("archive_writes_total", "kind" => "snapshot"),
            health_writes: counter!("archive_writes_total", "kind" => "health"),
            retries: counter!("archive_retries_total"),
            failures: counter!("archive_failures_total"),
            dropped: counter!("archive_dropped_total"),
            write_time: histogram!("archive_write_seconds"),
        }
    }

    pub fn snapshot_written(&self, elapsed: Duration) {
        self.snapshot_writes.increment(1);
        self.write_time.record(elapsed.as_secs_f64());
    }

    pub fn health_written(&self, elapsed: Duration) {
        self.health_writes.increment(1);
        self.write_time.record(elapsed.as_secs_f64());
    }

    pub fn retry(&self) {
        self.retries.increment(1);
    }

    pub fn failure(&self) {
        self.failures.increment(1);
    }

    pub fn dropped(&self) {
        self.dropped.increment(1);
    }
}

impl Default for ArchiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_without_recorder() {
        let ingest = IngestionMetrics::new();
        ingest.ticker();
        ingest.snapshot(true, Duration::from_micros(40), 3);

        let broadcast = BroadcastMetrics::default();
        broadcast.set_subscribers(2);
        broadcast.frame_sent(5);

        let archive = ArchiveMetrics::new();
        archive.retry();
        archive.snapshot_written(Duration::from_millis(2));
    }

    #[test]
    fn test_init_metrics_rejects_bad_address() {
        assert!(init_metrics("not an address", 9100).is_err());
    }
}
