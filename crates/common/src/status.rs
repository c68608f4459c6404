//! Shared feed status.
//!
//! Written only by the ingestion loop; read by the heartbeat monitor and the
//! HTTP health endpoint.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Connection state of the upstream feed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Fatal,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Disconnected => "disconnected",
            FeedState::Connecting => "connecting",
            FeedState::Subscribed => "subscribed",
            FeedState::Streaming => "streaming",
            FeedState::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy of the feed status at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedStatusView {
    pub state: FeedState,
    /// Attempt number of the reconnect in progress, 0 when healthy
    pub reconnect_attempt: u32,
    pub total_reconnects: u64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sequence: Option<u64>,
    pub streaming_since: Option<DateTime<Utc>>,
}

impl FeedStatusView {
    /// Milliseconds since the last inbound message
    pub fn message_age_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.last_message_at
            .map(|at| (now - at).num_milliseconds().max(0) as u64)
    }
}

#[derive(Debug, Default)]
pub struct FeedStatus {
    inner: RwLock<FeedStatusView>,
}

impl FeedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> FeedStatusView {
        self.inner.read().clone()
    }

    pub fn state(&self) -> FeedState {
        self.inner.read().state
    }

    pub fn set_state(&self, state: FeedState) {
        let mut inner = self.inner.write();
        if state == FeedState::Streaming && inner.state != FeedState::Streaming {
            inner.streaming_since = Some(Utc::now());
        } else if state != FeedState::Streaming {
            inner.streaming_since = None;
        }
        inner.state = state;
    }

    pub fn record_reconnect_attempt(&self, attempt: u32) {
        let mut inner = self.inner.write();
        inner.reconnect_attempt = attempt;
        inner.total_reconnects += 1;
    }

    pub fn reset_reconnect_attempt(&self) {
        self.inner.write().reconnect_attempt = 0;
    }

    pub fn record_message(&self, at: DateTime<Utc>) {
        self.inner.write().last_message_at = Some(at);
    }

    pub fn record_sequence(&self, sequence: u64) {
        self.inner.write().last_sequence = Some(sequence);
    }
}
