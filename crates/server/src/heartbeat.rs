//! Heartbeat monitor.
//!
//! Runs on its own timer, independent of data flow. Every tick it reads the
//! shared feed status, pushes a heartbeat to all subscribers and raises a
//! health event when the feed state changes or data turns stale or fresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Component, FeedState, FeedStatus, HealthEvent, SnapshotSink};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcaster::Broadcaster;
use crate::health::{HealthContext, HealthReport};

pub struct HealthMonitor {
    broadcaster: Broadcaster,
    status: Arc<FeedStatus>,
    context: HealthContext,
    interval: Duration,
    alerts: Option<Arc<dyn SnapshotSink>>,
    last_state: Option<FeedState>,
    was_stale: bool,
}

impl HealthMonitor {
    pub fn new(
        broadcaster: Broadcaster,
        status: Arc<FeedStatus>,
        context: HealthContext,
        interval: Duration,
    ) -> Self {
        Self {
            broadcaster,
            status,
            context,
            interval,
            alerts: None,
            last_state: None,
            was_stale: false,
        }
    }

    /// Where transition events go besides the broadcaster
    pub fn with_alerts(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    fn raise(&self, event: HealthEvent) {
        info!(severity = %event.severity, message = %event.message, "Health transition");
        self.broadcaster.publish_health(event.clone());
        if let Some(sink) = &self.alerts {
            sink.publish_health(event);
        }
    }

    /// One monitor cycle at `now`
    pub fn tick(&mut self, now: DateTime<Utc>) -> HealthReport {
        let view = self.status.view();

        if self.last_state != Some(view.state) {
            // The first observation only sets the baseline
            if self.last_state.is_some() {
                let message = format!("feed state is now {}", view.state);
                let event = match view.state {
                    FeedState::Streaming => HealthEvent::info(Component::HeartbeatMonitor, message),
                    FeedState::Fatal => HealthEvent::critical(Component::HeartbeatMonitor, message),
                    _ => HealthEvent::warning(Component::HeartbeatMonitor, message),
                };
                self.raise(event.with_reconnect_attempt(view.reconnect_attempt));
            }
            self.last_state = Some(view.state);
        }

        let stale = self.context.is_stale(&view, now);
        if stale != self.was_stale {
            let event = if stale {
                HealthEvent::warning(
                    Component::HeartbeatMonitor,
                    format!(
                        "feed data stale: no message for over {}s",
                        self.context.stale_after.as_secs()
                    ),
                )
            } else {
                HealthEvent::info(Component::HeartbeatMonitor, "feed data fresh again")
            };
            self.raise(event.with_reconnect_attempt(view.reconnect_attempt));
            self.was_stale = stale;
        }

        let report = self.context.report(
            view,
            self.broadcaster.subscriber_count(),
            self.broadcaster.last_event(),
            now,
        );
        self.broadcaster.publish_heartbeat(report.to_heartbeat());
        report
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Heartbeat monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick(Utc::now());
                    debug!(
                        status = ?report.status,
                        feed_state = %report.feed.state,
                        subscribers = report.subscribers,
                        "Heartbeat sent"
                    );
                }
            }
        }
        info!("Heartbeat monitor stopped");
    }
}
