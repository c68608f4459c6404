//! Service health report.
//!
//! One report type backs both the `/health` endpoint and the pushed
//! heartbeat, so the two never disagree.

use chrono::{DateTime, Utc};
use common::{FeedState, FeedStatusView, HealthEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::{to_timestamp, Heartbeat, HealthNotice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Feed streaming and data fresh
    Healthy,
    /// Reconnecting or data stale
    Degraded,
    /// Reconnect budget exhausted
    Down,
}

/// Fixed facts about the running service
#[derive(Debug, Clone)]
pub struct HealthContext {
    pub service: String,
    pub started_at: DateTime<Utc>,
    pub stale_after: Duration,
}

impl HealthContext {
    pub fn new(service: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            service: service.into(),
            started_at: Utc::now(),
            stale_after,
        }
    }

    /// Data is stale once the last inbound message is older than the
    /// threshold, or when nothing has arrived within it since startup.
    pub fn is_stale(&self, view: &FeedStatusView, now: DateTime<Utc>) -> bool {
        let threshold = self.stale_after.as_millis() as u64;
        match view.message_age_ms(now) {
            Some(age) => age > threshold,
            None => (now - self.started_at).num_milliseconds().max(0) as u64 > threshold,
        }
    }

    pub fn report(
        &self,
        view: FeedStatusView,
        subscribers: usize,
        last_event: Option<HealthEvent>,
        now: DateTime<Utc>,
    ) -> HealthReport {
        let stale = self.is_stale(&view, now);
        let status = match view.state {
            FeedState::Fatal => ServiceStatus::Down,
            FeedState::Streaming if !stale => ServiceStatus::Healthy,
            _ => ServiceStatus::Degraded,
        };

        HealthReport {
            status,
            service: self.service.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            stale,
            message_age_ms: view.message_age_ms(now),
            feed: view,
            subscribers,
            last_event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ServiceStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub feed: FeedStatusView,
    pub stale: bool,
    pub message_age_ms: Option<u64>,
    pub subscribers: usize,
    pub last_event: Option<HealthEvent>,
}

impl HealthReport {
    pub fn to_heartbeat(&self) -> Heartbeat {
        Heartbeat {
            timestamp: Some(to_timestamp(self.timestamp)),
            service: self.service.clone(),
            feed_state: self.feed.state.to_string(),
            reconnect_attempt: self.feed.reconnect_attempt,
            total_reconnects: self.feed.total_reconnects,
            stale: self.stale,
            message_age_ms: self.message_age_ms,
            last_sequence: self.feed.last_sequence,
            subscribers: u32::try_from(self.subscribers).unwrap_or(u32::MAX),
            uptime_seconds: self.uptime_seconds,
            last_event: self.last_event.as_ref().map(|event| HealthNotice {
                timestamp: Some(to_timestamp(event.timestamp)),
                severity: event.severity.to_string(),
                component: event.component.to_string(),
                message: event.message.clone(),
                reconnect_attempt: event.reconnect_attempt,
            }),
        }
    }
}
