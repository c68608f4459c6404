//! Ingestion loop.
//!
//! One task owns the [`PositionStore`] for the lifetime of the process. It
//! keeps a single feed session alive (connect, authenticate, subscribe,
//! stream), applies ticker and portfolio messages to the book, recomputes
//! risk inline and hands every snapshot to the output sink.
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Streaming
//!                     ^                          |
//!                     +------ transport error ---+
//! Connecting -> Fatal once the reconnect budget is spent
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    Component, FeedState, FeedStatus, HealthEvent, PortfolioSnapshot, SnapshotSink,
    SnapshotTrigger,
};
use observability::IngestionMetrics;
use portfolio::{aggregate, PortfolioChange, PortfolioUpdate, PositionStore, PositionUpdate};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AuthToken, Credentials};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::emitter::{sleep_until_opt, EmissionSchedule, SequenceGenerator};
use crate::error::IngestionError;
use crate::protocol::{self, FeedEvent, HeartbeatKind, Inbound, PendingRequest, RequestTracker, RpcError};
use crate::transport::{FeedConnection, FeedConnector};
use crate::Result;

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// Currencies whose option book is tracked
    pub currencies: Vec<String>,
    /// Tickers subscribed regardless of holdings
    pub instruments: Vec<String>,
    pub credentials: Option<Credentials>,
    pub ticker_interval: String,
    pub connect_timeout: Duration,
    /// Bound on each handshake request (auth, subscribe)
    pub subscribe_timeout: Duration,
    /// Exchange heartbeat interval; zero leaves it unset
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub snapshot_interval: Duration,
    pub coalesce_window: Duration,
    pub risk_free_rate: f64,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            currencies: vec!["ETH".to_string()],
            instruments: Vec::new(),
            credentials: None,
            ticker_interval: "100ms".to_string(),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            backoff: BackoffPolicy::default(),
            snapshot_interval: Duration::from_secs(60),
            coalesce_window: Duration::from_millis(100),
            risk_free_rate: 0.05,
        }
    }
}

/// Per-connection protocol state
struct Session {
    conn: Box<dyn FeedConnection>,
    tracker: RequestTracker,
    subscribed: BTreeSet<String>,
    token: Option<AuthToken>,
    refresh_at: Option<Instant>,
    last_frame: Instant,
}

impl Session {
    fn new(conn: Box<dyn FeedConnection>) -> Self {
        Self {
            conn,
            tracker: RequestTracker::new(),
            subscribed: BTreeSet::new(),
            token: None,
            refresh_at: None,
            last_frame: Instant::now(),
        }
    }

    fn authenticated(&self) -> bool {
        self.token.is_some()
    }

    fn set_token(&mut self, token: AuthToken) {
        self.refresh_at = Some(Instant::now() + token.refresh_after());
        self.token = Some(token);
    }

    async fn call(&mut self, request: PendingRequest, method: &str, params: &Value) -> Result<u64> {
        let id = self.tracker.register(request);
        let text = protocol::encode_request(id, method, params)?;
        self.conn.send(text).await?;
        Ok(id)
    }
}

/// The exchange's answer to one of our requests
struct Reply {
    id: u64,
    request: PendingRequest,
    outcome: std::result::Result<Value, RpcError>,
}

pub struct IngestionLoop {
    settings: IngestionSettings,
    connector: Arc<dyn FeedConnector>,
    sink: Arc<dyn SnapshotSink>,
    status: Arc<FeedStatus>,
    store: PositionStore,
    sequence: SequenceGenerator,
    schedule: EmissionSchedule,
    backoff: Backoff,
    session_id: Uuid,
    metrics: IngestionMetrics,
}

impl IngestionLoop {
    pub fn new(
        settings: IngestionSettings,
        connector: Arc<dyn FeedConnector>,
        sink: Arc<dyn SnapshotSink>,
        status: Arc<FeedStatus>,
    ) -> Self {
        let schedule = EmissionSchedule::new(
            settings.coalesce_window,
            settings.snapshot_interval,
            Instant::now(),
        );
        let backoff = Backoff::new(settings.backoff);
        Self {
            settings,
            connector,
            sink,
            status,
            store: PositionStore::new(),
            sequence: SequenceGenerator::default(),
            schedule,
            backoff,
            session_id: Uuid::new_v4(),
            metrics: IngestionMetrics::new(),
        }
    }

    /// Load positions known before the feed reports any
    pub fn with_positions(mut self, positions: Vec<PositionUpdate>) -> Result<Self> {
        self.store
            .apply_portfolio(&PortfolioUpdate::Delta { positions })
            .map_err(|e| IngestionError::InvalidSeed(e.to_string()))?;
        Ok(self)
    }

    /// Continue numbering after `last`, normally the archive's latest sequence
    pub fn with_sequence_start(mut self, last: u64) -> Self {
        self.sequence = SequenceGenerator::starting_after(last);
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    /// Stream until cancelled.
    ///
    /// Returns [`IngestionError::RetriesExhausted`] when the feed cannot be
    /// re-established within the reconnect budget.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            session_id = %self.session_id,
            currencies = ?self.settings.currencies,
            positions = self.store.len(),
            next_sequence = self.sequence.last() + 1,
            "Ingestion loop started"
        );

        self.schedule = EmissionSchedule::new(
            self.settings.coalesce_window,
            self.settings.snapshot_interval,
            Instant::now(),
        );
        if !self.store.is_empty() {
            self.book_changed();
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.status.set_state(FeedState::Connecting);

            let err = match self.run_session(&cancel).await {
                Ok(()) => break,
                Err(err) => err,
            };
            if cancel.is_cancelled() {
                break;
            }
            self.status.set_state(FeedState::Connecting);

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempt();
                self.status.set_state(FeedState::Fatal);
                error!(attempts, error = %err, "Feed reconnect budget exhausted");
                self.sink.publish_health(
                    HealthEvent::critical(
                        Component::Ingestion,
                        format!("feed unavailable after {} reconnect attempts: {}", attempts, err),
                    )
                    .with_reconnect_attempt(attempts),
                );
                return Err(IngestionError::RetriesExhausted { attempts });
            };

            let attempt = self.backoff.attempt();
            self.status.record_reconnect_attempt(attempt);
            self.metrics.reconnect();
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Feed session lost, reconnecting"
            );
            self.sink.publish_health(
                HealthEvent::warning(
                    Component::Ingestion,
                    format!("feed session lost: {}; reconnecting in {:?}", err, delay),
                )
                .with_reconnect_attempt(attempt),
            );

            if self.wait(delay, &cancel).await {
                break;
            }
        }

        self.status.set_state(FeedState::Disconnected);
        info!(last_sequence = self.sequence.last(), "Ingestion loop stopped");
        Ok(())
    }

    /// Backoff wait that keeps emitting due snapshots. Returns `true` when
    /// cancelled.
    async fn wait(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let until = Instant::now() + delay;
        loop {
            let change_deadline = self.schedule.change_deadline();
            let periodic_deadline = self.schedule.periodic_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return true,
                _ = tokio::time::sleep_until(until) => return false,
                _ = sleep_until_opt(change_deadline) => self.emit(SnapshotTrigger::Change),
                _ = tokio::time::sleep_until(periodic_deadline) => self.emit(SnapshotTrigger::Periodic),
            }
        }
    }

    async fn run_session(&mut self, cancel: &CancellationToken) -> Result<()> {
        let connect_timeout = self.settings.connect_timeout;
        let connector = Arc::clone(&self.connector);
        let connect = tokio::time::timeout(connect_timeout, connector.connect());
        tokio::pin!(connect);
        let conn = loop {
            let change_deadline = self.schedule.change_deadline();
            let periodic_deadline = self.schedule.periodic_deadline();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = &mut connect => {
                    break result.map_err(|_| IngestionError::timeout("connect", connect_timeout))??;
                }
                _ = sleep_until_opt(change_deadline) => self.emit(SnapshotTrigger::Change),
                _ = tokio::time::sleep_until(periodic_deadline) => self.emit(SnapshotTrigger::Periodic),
            }
        };

        let mut session = Session::new(conn);
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.drive(&mut session) => result,
        };
        session.conn.close().await;
        result
    }

    async fn drive(&mut self, session: &mut Session) -> Result<()> {
        self.handshake(session).await?;

        self.backoff.reset();
        self.status.reset_reconnect_attempt();
        self.status.set_state(FeedState::Streaming);
        info!(channels = session.subscribed.len(), "Feed streaming");
        self.sink.publish_health(HealthEvent::info(
            Component::Ingestion,
            format!("feed streaming on {} channels", session.subscribed.len()),
        ));

        self.stream(session).await
    }

    async fn handshake(&mut self, session: &mut Session) -> Result<()> {
        let timeout = self.settings.subscribe_timeout;

        if let Some(credentials) = &self.settings.credentials {
            let params = credentials.auth_params();
            let id = session
                .call(PendingRequest::Auth, protocol::AUTH, &params)
                .await?;
            let result = self.await_reply(session, id, "auth", timeout).await?;
            session.set_token(AuthToken::from_result(&result)?);
            debug!("Feed authenticated");
        }

        if !self.settings.heartbeat_interval.is_zero() {
            let params = protocol::heartbeat_params(self.settings.heartbeat_interval.as_secs());
            session
                .call(PendingRequest::SetHeartbeat, protocol::SET_HEARTBEAT, &params)
                .await?;
        }

        let channels = self.initial_channels(session.authenticated());
        if !channels.is_empty() {
            let id = self.subscribe(session, channels).await?;
            self.await_reply(session, id, "subscribe", timeout).await?;
        }
        self.status.set_state(FeedState::Subscribed);

        if session.authenticated() {
            for currency in &self.settings.currencies {
                session
                    .call(
                        PendingRequest::Positions {
                            currency: currency.clone(),
                        },
                        protocol::GET_POSITIONS,
                        &protocol::positions_params(currency),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    fn initial_channels(&self, authenticated: bool) -> Vec<String> {
        let interval = &self.settings.ticker_interval;
        let mut instruments: BTreeSet<&str> = self.store.instruments().collect();
        instruments.extend(self.settings.instruments.iter().map(String::as_str));

        let mut channels: Vec<String> = instruments
            .into_iter()
            .map(|instrument| protocol::ticker_channel(instrument, interval))
            .collect();
        if authenticated {
            channels.extend(
                self.settings
                    .currencies
                    .iter()
                    .map(|currency| protocol::portfolio_channel(currency, interval)),
            );
        }
        channels
    }

    async fn subscribe(&mut self, session: &mut Session, channels: Vec<String>) -> Result<u64> {
        let method = if session.authenticated() {
            protocol::PRIVATE_SUBSCRIBE
        } else {
            protocol::PUBLIC_SUBSCRIBE
        };
        let params = protocol::subscribe_params(&channels);
        session.subscribed.extend(channels.iter().cloned());
        debug!(count = channels.len(), "Subscribing");
        session
            .call(PendingRequest::Subscribe(channels), method, &params)
            .await
    }

    async fn unsubscribe(&mut self, session: &mut Session, channels: Vec<String>) -> Result<()> {
        let method = if session.authenticated() {
            protocol::PRIVATE_UNSUBSCRIBE
        } else {
            protocol::PUBLIC_UNSUBSCRIBE
        };
        let params = protocol::subscribe_params(&channels);
        for channel in &channels {
            session.subscribed.remove(channel);
        }
        debug!(count = channels.len(), "Unsubscribing");
        session
            .call(PendingRequest::Unsubscribe(channels), method, &params)
            .await?;
        Ok(())
    }

    /// Read frames until the reply to request `id` arrives. Snapshot
    /// deadlines keep firing while the exchange is slow to answer.
    async fn await_reply(
        &mut self,
        session: &mut Session,
        id: u64,
        stage: &'static str,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let change_deadline = self.schedule.change_deadline();
            let periodic_deadline = self.schedule.periodic_deadline();
            tokio::select! {
                frame = session.conn.recv() => {
                    let Some(text) = frame? else {
                        return Err(IngestionError::Closed);
                    };
                    session.last_frame = Instant::now();
                    if let Some(reply) = self.handle_frame(session, &text).await? {
                        if reply.id == id {
                            return reply.outcome.map_err(|e| IngestionError::Rpc {
                                method: reply.request.method(),
                                code: e.code,
                                message: e.message,
                            });
                        }
                        self.handle_reply(session, reply).await?;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Err(IngestionError::timeout(stage, timeout)),
                _ = sleep_until_opt(change_deadline) => self.emit(SnapshotTrigger::Change),
                _ = tokio::time::sleep_until(periodic_deadline) => self.emit(SnapshotTrigger::Periodic),
            }
        }
    }

    async fn stream(&mut self, session: &mut Session) -> Result<()> {
        let idle = self.settings.idle_timeout;
        loop {
            let idle_deadline = session.last_frame + idle;
            let change_deadline = self.schedule.change_deadline();
            let periodic_deadline = self.schedule.periodic_deadline();
            let refresh_deadline = session.refresh_at;

            tokio::select! {
                frame = session.conn.recv() => {
                    let Some(text) = frame? else {
                        return Err(IngestionError::Closed);
                    };
                    session.last_frame = Instant::now();
                    if let Some(reply) = self.handle_frame(session, &text).await? {
                        self.handle_reply(session, reply).await?;
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => return Err(IngestionError::Idle(idle)),
                _ = sleep_until_opt(change_deadline) => self.emit(SnapshotTrigger::Change),
                _ = tokio::time::sleep_until(periodic_deadline) => self.emit(SnapshotTrigger::Periodic),
                _ = sleep_until_opt(refresh_deadline) => self.refresh_token(session).await?,
            }
        }
    }

    async fn handle_frame(&mut self, session: &mut Session, text: &str) -> Result<Option<Reply>> {
        self.status.record_message(Utc::now());

        let inbound = match protocol::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.skip_message(&e.to_string());
                return Ok(None);
            }
        };

        match inbound {
            Inbound::Response { id, result } => Ok(take_reply(session, id, Ok(result))),
            Inbound::Error { id: Some(id), error } => Ok(take_reply(session, id, Err(error))),
            Inbound::Error { id: None, error } => {
                warn!(code = error.code, message = %error.message, "Unsolicited exchange error");
                Ok(None)
            }
            Inbound::Heartbeat(HeartbeatKind::TestRequest) => {
                session
                    .call(PendingRequest::Test, protocol::TEST, &json!({}))
                    .await?;
                Ok(None)
            }
            Inbound::Heartbeat(HeartbeatKind::Heartbeat) => Ok(None),
            Inbound::Notification { channel, data } => {
                match protocol::decode_notification(&channel, data) {
                    Ok(Some(event)) => self.apply_event(session, event).await?,
                    Ok(None) => debug!(%channel, "Notification ignored"),
                    Err(e) => self.skip_message(&format!("{}: {}", channel, e)),
                }
                Ok(None)
            }
        }
    }

    async fn handle_reply(&mut self, session: &mut Session, reply: Reply) -> Result<()> {
        match (reply.request, reply.outcome) {
            (PendingRequest::Refresh, Ok(result)) => match AuthToken::from_result(&result) {
                Ok(token) => {
                    debug!("Access token refreshed");
                    session.set_token(token);
                }
                Err(e) => self.refresh_failed(&e.to_string()),
            },
            (PendingRequest::Refresh, Err(e)) => self.refresh_failed(&e.message),
            (PendingRequest::Positions { currency }, Ok(result)) => {
                match protocol::decode_positions(&currency, result) {
                    Ok(update) => {
                        self.metrics.portfolio_update();
                        self.apply_portfolio(session, &update).await?;
                    }
                    Err(e) => self.skip_message(&format!("positions for {}: {}", currency, e)),
                }
            }
            (PendingRequest::Subscribe(channels), Err(e)) => {
                for channel in &channels {
                    session.subscribed.remove(channel);
                }
                self.request_rejected(protocol::PUBLIC_SUBSCRIBE, &e);
            }
            (request, Err(e)) => self.request_rejected(request.method(), &e),
            (_, Ok(_)) => {}
        }
        Ok(())
    }

    async fn refresh_token(&mut self, session: &mut Session) -> Result<()> {
        session.refresh_at = None;
        let Some(params) = session.token.as_ref().map(AuthToken::refresh_params) else {
            return Ok(());
        };
        session
            .call(PendingRequest::Refresh, protocol::AUTH, &params)
            .await?;
        Ok(())
    }

    async fn apply_event(&mut self, session: &mut Session, event: FeedEvent) -> Result<()> {
        match event {
            FeedEvent::Ticker(update) => {
                self.metrics.ticker();
                match self.store.apply_ticker(&update) {
                    Ok(true) => self.book_changed(),
                    Ok(false) => {}
                    Err(e) => self.skip_message(&e.to_string()),
                }
            }
            FeedEvent::Portfolio(update) => {
                self.metrics.portfolio_update();
                self.apply_portfolio(session, &update).await?;
            }
        }
        Ok(())
    }

    async fn apply_portfolio(&mut self, session: &mut Session, update: &PortfolioUpdate) -> Result<()> {
        match self.store.apply_portfolio(update) {
            Ok(change) if change.is_empty() => {}
            Ok(change) => {
                self.sync_subscriptions(session, &change).await?;
                self.book_changed();
            }
            Err(e) => self.skip_message(&e.to_string()),
        }
        Ok(())
    }

    /// Follow the book: subscribe to new legs, drop tickers for closed ones
    async fn sync_subscriptions(&mut self, session: &mut Session, change: &PortfolioChange) -> Result<()> {
        let interval = self.settings.ticker_interval.clone();

        let added: Vec<String> = change
            .added
            .iter()
            .map(|instrument| protocol::ticker_channel(instrument, &interval))
            .filter(|channel| !session.subscribed.contains(channel))
            .collect();
        let removed: Vec<String> = change
            .removed
            .iter()
            .filter(|instrument| !self.settings.instruments.contains(instrument))
            .map(|instrument| protocol::ticker_channel(instrument, &interval))
            .filter(|channel| session.subscribed.contains(channel))
            .collect();

        if !added.is_empty() {
            self.subscribe(session, added).await?;
        }
        if !removed.is_empty() {
            self.unsubscribe(session, removed).await?;
        }
        Ok(())
    }

    fn book_changed(&mut self) {
        if self.schedule.mark_dirty(Instant::now()) {
            self.emit(SnapshotTrigger::Change);
        }
    }

    fn emit(&mut self, trigger: SnapshotTrigger) {
        let started = std::time::Instant::now();
        let timestamp = Utc::now();
        let risk = aggregate(self.store.positions(), timestamp, self.settings.risk_free_rate);
        let sequence = self.sequence.next();

        match trigger {
            SnapshotTrigger::Change => self.schedule.change_emitted(),
            SnapshotTrigger::Periodic => self.schedule.periodic_emitted(Instant::now()),
        }

        let snapshot = Arc::new(PortfolioSnapshot {
            session_id: self.session_id,
            sequence,
            timestamp,
            trigger,
            positions: risk.positions,
            net: risk.net,
            excluded: risk.excluded,
        });

        self.status.record_sequence(sequence);
        self.metrics.snapshot(
            trigger == SnapshotTrigger::Periodic,
            started.elapsed(),
            self.store.len(),
        );
        debug!(
            sequence,
            ?trigger,
            legs = snapshot.positions.len(),
            excluded = snapshot.excluded.len(),
            "Snapshot emitted"
        );
        self.sink.publish_snapshot(snapshot);
    }

    fn skip_message(&self, detail: &str) {
        self.metrics.decode_error();
        warn!(detail, "Feed message skipped");
        self.sink.publish_health(HealthEvent::warning(
            Component::Ingestion,
            format!("message skipped: {}", detail),
        ));
    }

    fn refresh_failed(&self, detail: &str) {
        warn!(detail, "Token refresh failed");
        self.sink.publish_health(HealthEvent::warning(
            Component::Ingestion,
            format!("token refresh failed: {}", detail),
        ));
    }

    fn request_rejected(&self, method: &str, error: &RpcError) {
        warn!(method, code = error.code, message = %error.message, "Request rejected");
        self.sink.publish_health(HealthEvent::warning(
            Component::Ingestion,
            format!("{} rejected: {} {}", method, error.code, error.message),
        ));
    }
}

fn take_reply(
    session: &mut Session,
    id: u64,
    outcome: std::result::Result<Value, RpcError>,
) -> Option<Reply> {
    match session.tracker.resolve(id) {
        Some(request) => Some(Reply {
            id,
            request,
            outcome,
        }),
        None => {
            debug!(id, "Reply to unknown request");
            None
        }
    }
}
