//! Output seam between pipeline stages.
//!
//! Implementations must return without waiting on I/O or on a consumer:
//! the ingestion loop calls them inline after every recompute.

use std::sync::Arc;

use crate::health::HealthEvent;
use crate::snapshot::PortfolioSnapshot;

pub trait SnapshotSink: Send + Sync {
    fn publish_snapshot(&self, snapshot: Arc<PortfolioSnapshot>);

    fn publish_health(&self, event: HealthEvent);
}

/// Forwards every record to each inner sink in order
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn SnapshotSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl SnapshotSink for Fanout {
    fn publish_snapshot(&self, snapshot: Arc<PortfolioSnapshot>) {
        for sink in &self.sinks {
            sink.publish_snapshot(Arc::clone(&snapshot));
        }
    }

    fn publish_health(&self, event: HealthEvent) {
        for sink in &self.sinks {
            sink.publish_health(event.clone());
        }
    }
}
