//! HTTP query and pricing API.
//!
//! Read-only access to the archive and the live snapshot, plus stateless
//! pricing endpoints. Archive reads run on blocking threads against their own
//! read-only connections, and portfolio sweeps go through the shared
//! [`ScenarioPool`], so nothing here runs on the ingestion task.

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{FeedStatus, HealthEvent, PortfolioSnapshot, PricingInputs};
use parking_lot::RwLock;
use portfolio::{PortfolioError, PortfolioScenarioResult, ScenarioLeg, ScenarioPool};
use pricing::{PricingError, ScenarioGrid, ScenarioPoint, Valuation};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{ArchiveStats, SequenceGap, SnapshotArchive, StorageError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::broadcaster::Broadcaster;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::health::{HealthContext, HealthReport, ServiceStatus};
use crate::traits::Server;

pub const DEFAULT_QUERY_LIMIT: usize = 500;
pub const MAX_QUERY_LIMIT: usize = 5000;

#[derive(Clone)]
pub struct ApiState {
    pub health: HealthContext,
    pub status: Arc<FeedStatus>,
    pub broadcaster: Broadcaster,
    pub archive: Option<Arc<SnapshotArchive>>,
    pub scenarios: ScenarioPool,
    /// Upper bound on valuations for one pricing request
    pub max_valuations: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    fn archive_disabled() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "ARCHIVE_UNAVAILABLE",
            "Persistence is not configured",
        )
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                error: ErrorDetail {
                    code: self.code.to_string(),
                    message: self.message,
                    details: None,
                },
            }),
        )
            .into_response()
    }
}

impl From<PricingError> for ApiError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::NoConvergence(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "NO_CONVERGENCE", err.to_string())
            }
            PricingError::NonFinite => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "NON_FINITE", err.to_string())
            }
            _ => Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", err.to_string()),
        }
    }
}

impl From<PortfolioError> for ApiError {
    fn from(err: PortfolioError) -> Self {
        match err {
            PortfolioError::GridTooLarge { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "SCENARIO_TOO_LARGE", err.to_string())
            }
            PortfolioError::PoolClosed => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "POOL_CLOSED", err.to_string())
            }
            PortfolioError::Pricing(e) => e.into(),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        error!(%err, "Archive query failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "ARCHIVE_ERROR", err.to_string())
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Request / response models
// ---------------------------------------------------------------------------

/// Time range for archive queries. Bounds are RFC 3339; the default is the
/// last hour.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RangeQuery {
    fn resolve(&self, now: DateTime<Utc>) -> std::result::Result<(DateTime<Utc>, DateTime<Utc>, usize), ApiError> {
        let to = self.to.unwrap_or(now);
        let from = self.from.unwrap_or(to - ChronoDuration::hours(1));
        if from > to {
            return Err(ApiError::bad_request(format!(
                "from ({}) is after to ({})",
                from, to
            )));
        }
        let limit = self.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(ApiError::bad_request(format!(
                "limit must be between 1 and {}",
                MAX_QUERY_LIMIT
            )));
        }
        Ok((from, to, limit))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotsResponse {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub count: usize,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub gaps: Vec<SequenceGap>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthEventsResponse {
    pub count: usize,
    pub events: Vec<HealthEvent>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub inputs: Vec<PricingInputs>,
}

/// One element of a batch or sweep: a valuation or the reason there is none
#[derive(Debug, Serialize, Deserialize)]
pub struct ValuationOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valuation: Option<Valuation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<pricing::Result<Valuation>> for ValuationOutcome {
    fn from(result: pricing::Result<Valuation>) -> Self {
        match result {
            Ok(valuation) => Self {
                valuation: Some(valuation),
                error: None,
            },
            Err(e) => Self {
                valuation: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<ValuationOutcome>,
}

/// Shape of a scenario grid in a request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridSpec {
    SpotSweep { min: f64, max: f64, points: usize },
    VolSweep { min: f64, max: f64, points: usize },
    TimeDecay { horizon_days: f64, points: usize },
    Cartesian {
        #[serde(default = "no_shock")]
        spot_shocks: Vec<f64>,
        #[serde(default = "no_shock")]
        vol_shocks: Vec<f64>,
        #[serde(default = "no_shock")]
        elapsed_days: Vec<f64>,
    },
    Points { points: Vec<ScenarioPoint> },
}

fn no_shock() -> Vec<f64> {
    vec![0.0]
}

impl GridSpec {
    fn len(&self) -> usize {
        match self {
            GridSpec::SpotSweep { points, .. }
            | GridSpec::VolSweep { points, .. }
            | GridSpec::TimeDecay { points, .. } => *points,
            GridSpec::Cartesian {
                spot_shocks,
                vol_shocks,
                elapsed_days,
            } => spot_shocks
                .len()
                .saturating_mul(vol_shocks.len())
                .saturating_mul(elapsed_days.len()),
            GridSpec::Points { points } => points.len(),
        }
    }

    /// Build the grid, refusing before allocation when it has more than
    /// `max_points` points
    pub fn build(&self, max_points: usize) -> std::result::Result<ScenarioGrid, ApiError> {
        let points = self.len();
        if points > max_points {
            return Err(PortfolioError::GridTooLarge {
                points,
                max: max_points,
            }
            .into());
        }
        let grid = match self {
            GridSpec::SpotSweep { min, max, points } => ScenarioGrid::spot_sweep(*min, *max, *points)?,
            GridSpec::VolSweep { min, max, points } => ScenarioGrid::vol_sweep(*min, *max, *points)?,
            GridSpec::TimeDecay {
                horizon_days,
                points,
            } => ScenarioGrid::time_decay(*horizon_days, *points)?,
            GridSpec::Cartesian {
                spot_shocks,
                vol_shocks,
                elapsed_days,
            } => ScenarioGrid::cartesian(spot_shocks, vol_shocks, elapsed_days),
            GridSpec::Points { points } => ScenarioGrid::from_points(points.clone()),
        };
        Ok(grid)
    }
}

#[derive(Debug, Deserialize)]
pub struct ScenarioRequest {
    pub inputs: PricingInputs,
    pub grid: GridSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScenarioRow {
    pub point: ScenarioPoint,
    pub inputs: PricingInputs,
    #[serde(flatten)]
    pub outcome: ValuationOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScenarioResponse {
    pub rows: Vec<ScenarioRow>,
}

/// Implied volatility request. `inputs.volatility` is ignored.
#[derive(Debug, Deserialize)]
pub struct ImpliedVolRequest {
    pub market_price: f64,
    pub inputs: PricingInputs,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImpliedVolResponse {
    pub volatility: f64,
}

#[derive(Debug, Deserialize)]
pub struct PortfolioScenarioRequest {
    pub grid: GridSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PortfolioScenarioResponse {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub legs: usize,
    pub result: PortfolioScenarioResult,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn health_handler(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.report(
        state.status.view(),
        state.broadcaster.subscriber_count(),
        state.broadcaster.last_event(),
        Utc::now(),
    );
    let code = match report.status {
        ServiceStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}

fn archive(state: &ApiState) -> std::result::Result<Arc<SnapshotArchive>, ApiError> {
    state.archive.clone().ok_or_else(ApiError::archive_disabled)
}

/// Run a synchronous archive read on the blocking pool
async fn read_archive<T, F>(archive: Arc<SnapshotArchive>, read: F) -> std::result::Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SnapshotArchive) -> storage::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || read(&archive))
        .await
        .map_err(|e| ApiError::internal(format!("archive worker failed: {}", e)))?
        .map_err(ApiError::from)
}

pub async fn list_snapshots(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<SnapshotsResponse> {
    let (from, to, limit) = query.resolve(Utc::now())?;
    let archive = archive(&state)?;

    let (snapshots, gaps) = read_archive(archive, move |archive| {
        Ok((
            archive.snapshots_between(from, to, limit)?,
            archive.sequence_gaps(from, to)?,
        ))
    })
    .await?;

    Ok(Json(SnapshotsResponse {
        from,
        to,
        count: snapshots.len(),
        snapshots,
        gaps,
    }))
}

/// The live snapshot when one exists, otherwise the newest archived one
pub async fn latest_snapshot(State(state): State<Arc<ApiState>>) -> ApiResult<PortfolioSnapshot> {
    if let Some(live) = state.broadcaster.latest_snapshot() {
        return Ok(Json(live.as_ref().clone()));
    }
    let archive = archive(&state).map_err(|_| ApiError::not_found("No snapshot published yet"))?;
    read_archive(archive, |archive| archive.latest_snapshot())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No snapshot published yet"))
}

pub async fn list_health_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<HealthEventsResponse> {
    let (from, to, limit) = query.resolve(Utc::now())?;
    let archive = archive(&state)?;
    let events = read_archive(archive, move |archive| {
        archive.health_events_between(from, to, limit)
    })
    .await?;

    Ok(Json(HealthEventsResponse {
        count: events.len(),
        events,
    }))
}

pub async fn archive_stats(State(state): State<Arc<ApiState>>) -> ApiResult<ArchiveStats> {
    let archive = archive(&state)?;
    read_archive(archive, |archive| archive.statistics()).await.map(Json)
}

pub async fn evaluate(Json(inputs): Json<PricingInputs>) -> ApiResult<Valuation> {
    Ok(Json(pricing::evaluate(&inputs)?))
}

pub async fn evaluate_batch(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<BatchResponse> {
    if req.inputs.len() > state.max_valuations {
        return Err(PortfolioError::GridTooLarge {
            points: req.inputs.len(),
            max: state.max_valuations,
        }
        .into());
    }
    let results = pricing::evaluate_batch(&req.inputs)
        .into_iter()
        .map(ValuationOutcome::from)
        .collect();
    Ok(Json(BatchResponse { results }))
}

pub async fn evaluate_scenarios(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ScenarioRequest>,
) -> ApiResult<ScenarioResponse> {
    let grid = req.grid.build(state.max_valuations)?;
    let inputs = req.inputs;
    let outcomes = tokio::task::spawn_blocking(move || pricing::evaluate_scenarios(&inputs, &grid))
        .await
        .map_err(|e| ApiError::internal(format!("scenario worker failed: {}", e)))?;

    let rows = outcomes
        .into_iter()
        .map(|outcome| ScenarioRow {
            point: outcome.point,
            inputs: outcome.inputs,
            outcome: outcome.valuation.into(),
        })
        .collect();
    Ok(Json(ScenarioResponse { rows }))
}

pub async fn implied_volatility(Json(req): Json<ImpliedVolRequest>) -> ApiResult<ImpliedVolResponse> {
    let volatility = pricing::implied_volatility(req.market_price, &req.inputs)?;
    Ok(Json(ImpliedVolResponse { volatility }))
}

/// Sweep the latest live snapshot's priced legs on the scenario pool
pub async fn portfolio_scenarios(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PortfolioScenarioRequest>,
) -> ApiResult<PortfolioScenarioResponse> {
    let snapshot = state
        .broadcaster
        .latest_snapshot()
        .ok_or_else(|| ApiError::not_found("No live snapshot to sweep"))?;
    let legs: Vec<ScenarioLeg> = snapshot.positions.iter().map(ScenarioLeg::from_result).collect();
    let grid = req.grid.build(state.max_valuations)?;

    let leg_count = legs.len();
    let result = state.scenarios.run(legs, grid).await?;
    Ok(Json(PortfolioScenarioResponse {
        sequence: snapshot.sequence,
        timestamp: snapshot.timestamp,
        legs: leg_count,
        result,
    }))
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/snapshots", get(list_snapshots))
        .route("/api/v1/snapshots/latest", get(latest_snapshot))
        .route("/api/v1/health-events", get(list_health_events))
        .route("/api/v1/archive/stats", get(archive_stats))
        .route("/api/v1/pricing/evaluate", post(evaluate))
        .route("/api/v1/pricing/batch", post(evaluate_batch))
        .route("/api/v1/pricing/scenarios", post(evaluate_scenarios))
        .route("/api/v1/pricing/implied-vol", post(implied_volatility))
        .route("/api/v1/portfolio/scenarios", post(portfolio_scenarios))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiServer {
    config: ServerConfig,
    router: Router,
    running: Arc<AtomicBool>,
    bound_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: Arc<ApiState>, request_timeout: Duration) -> Self {
        let router = create_router(state)
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(request_timeout))
            .layer(CorsLayer::permissive());
        Self {
            config,
            router,
            running: Arc::new(AtomicBool::new(false)),
            bound_addr: Arc::new(RwLock::new(None)),
        }
    }

    fn bind_addr(&self) -> Result<SocketAddr> {
        self.config
            .api_addr()
            .ok_or_else(|| ServerError::ConfigError("API port not configured".into()))?
    }
}

#[async_trait]
impl Server for ApiServer {
    fn name(&self) -> &str {
        "api"
    }

    fn address(&self) -> Option<SocketAddr> {
        *self.bound_addr.read()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(&self, shutdown_token: CancellationToken) -> Result<()> {
        let addr = self.bind_addr()?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::bind(addr.to_string(), e))?;
        let local_addr = listener.local_addr()?;
        *self.bound_addr.write() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);
        info!(%local_addr, "HTTP API listening");

        let result = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
                info!("HTTP API received shutdown signal");
            })
            .await;

        self.running.store(false, Ordering::SeqCst);
        *self.bound_addr.write() = None;

        match result {
            Ok(()) => {
                info!("HTTP API shutdown complete");
                Ok(())
            }
            Err(e) => {
                warn!(%e, "HTTP API error");
                Err(ServerError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{leg, snapshot};
    use crate::traits::ServerExt;
    use assert_matches::assert_matches;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use common::{Component, FeedState, OptionType};
    use serde_json::{json, Value};
    use storage::ArchiveStore;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn state(archive: Option<Arc<SnapshotArchive>>) -> Arc<ApiState> {
        Arc::new(ApiState {
            health: HealthContext::new("greekstream", Duration::from_secs(120)),
            status: Arc::new(FeedStatus::new()),
            broadcaster: Broadcaster::new(8),
            archive,
            scenarios: ScenarioPool::new(2, 1000),
            max_valuations: 1000,
        })
    }

    fn archive() -> (tempfile::TempDir, Arc<SnapshotArchive>) {
        let dir = tempfile::tempdir().unwrap();
        let archive = SnapshotArchive::open(dir.path().join("greeks.db"), Duration::from_secs(1)).unwrap();
        (dir, Arc::new(archive))
    }

    async fn call(state: Arc<ApiState>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = create_router(state)
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn atm_call() -> Value {
        json!({
            "spot": 3000.0,
            "strike": 3000.0,
            "time_to_expiry": 0.25,
            "volatility": 0.6,
            "rate": 0.0,
            "option_type": "call"
        })
    }

    #[tokio::test]
    async fn test_health_reflects_feed_state() {
        let state = state(None);
        state.status.set_state(FeedState::Streaming);
        state.status.record_message(Utc::now());

        let (status, body) = call(state.clone(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "greekstream");

        state.status.set_state(FeedState::Fatal);
        let (status, body) = call(state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "down");
    }

    #[tokio::test]
    async fn test_snapshot_history_with_gaps() {
        let (_dir, archive) = archive();
        let session = Uuid::new_v4();
        for sequence in [1, 2, 5] {
            archive
                .append_snapshot(&snapshot(session, sequence, vec![leg("ETH-27DEC30-3000-C", "ETH", 1.0, 0.6)]))
                .unwrap();
        }

        let (status, body) = call(state(Some(archive)), Method::GET, "/api/v1/snapshots", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);
        assert_eq!(body["snapshots"][2]["sequence"], 5);
        assert_eq!(body["gaps"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_range_validation() {
        let (_dir, archive) = archive();
        let state = state(Some(archive));

        let uri = "/api/v1/snapshots?from=2030-01-02T00:00:00Z&to=2030-01-01T00:00:00Z";
        let (status, body) = call(state.clone(), Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");

        let (status, _) = call(state, Method::GET, "/api/v1/health-events?limit=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_archive_routes_without_persistence() {
        let (status, body) = call(state(None), Method::GET, "/api/v1/archive/stats", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "ARCHIVE_UNAVAILABLE");

        let (status, _) = call(state(None), Method::GET, "/api/v1/snapshots/latest", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_latest_prefers_live_snapshot() {
        let (_dir, archive) = archive();
        let session = Uuid::new_v4();
        archive.append_snapshot(&snapshot(session, 3, Vec::new())).unwrap();
        let state = state(Some(archive));

        let (_, body) = call(state.clone(), Method::GET, "/api/v1/snapshots/latest", None).await;
        assert_eq!(body["sequence"], 3);

        state.broadcaster.publish(Arc::new(snapshot(session, 4, Vec::new())));
        let (_, body) = call(state, Method::GET, "/api/v1/snapshots/latest", None).await;
        assert_eq!(body["sequence"], 4);
    }

    #[tokio::test]
    async fn test_health_events_and_stats() {
        let (_dir, archive) = archive();
        archive
            .append_health(&HealthEvent::warning(Component::Ingestion, "reconnecting"))
            .unwrap();
        let state = state(Some(archive));

        let (status, body) = call(state.clone(), Method::GET, "/api/v1/health-events", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["message"], "reconnecting");

        let (status, body) = call(state, Method::GET, "/api/v1/archive/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["health_event_count"], 1);
    }

    #[tokio::test]
    async fn test_evaluate_and_reject_bad_volatility() {
        let (status, body) = call(state(None), Method::POST, "/api/v1/pricing/evaluate", Some(atm_call())).await;
        assert_eq!(status, StatusCode::OK);
        let delta = body["greeks"]["delta"].as_f64().unwrap();
        assert!(delta > 0.5 && delta < 0.6);

        let mut bad = atm_call();
        bad["volatility"] = json!(0.0);
        let (status, body) = call(state(None), Method::POST, "/api/v1/pricing/evaluate", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_batch_reports_each_element() {
        let mut bad = atm_call();
        bad["spot"] = json!(-1.0);
        let request = json!({ "inputs": [atm_call(), bad] });

        let (status, body) = call(state(None), Method::POST, "/api/v1/pricing/batch", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert!(results[0]["valuation"].is_object());
        assert!(results[1]["error"].is_string());
    }

    #[tokio::test]
    async fn test_scenario_sweep_and_grid_limit() {
        let request = json!({
            "inputs": atm_call(),
            "grid": { "kind": "spot_sweep", "min": -0.1, "max": 0.1, "points": 5 }
        });
        let (status, body) = call(state(None), Method::POST, "/api/v1/pricing/scenarios", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 5);
        // The middle point is unshocked
        assert_eq!(rows[2]["inputs"]["spot"], 3000.0);

        let request = json!({
            "inputs": atm_call(),
            "grid": { "kind": "time_decay", "horizon_days": 30.0, "points": 5000 }
        });
        let (status, body) = call(state(None), Method::POST, "/api/v1/pricing/scenarios", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "SCENARIO_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_implied_vol_recovers_input() {
        let inputs = PricingInputs {
            spot: 3000.0,
            strike: 3200.0,
            time_to_expiry: 0.25,
            volatility: 0.55,
            rate: 0.0,
            option_type: OptionType::Call,
        };
        let price = pricing::evaluate(&inputs).unwrap().price;
        let request = json!({ "market_price": price, "inputs": inputs });

        let (status, body) = call(state(None), Method::POST, "/api/v1/pricing/implied-vol", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert!((body["volatility"].as_f64().unwrap() - 0.55).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_portfolio_sweep_uses_live_snapshot() {
        let state = state(None);
        let request = json!({ "grid": { "kind": "cartesian", "spot_shocks": [-0.05, 0.0, 0.05] } });

        let (status, _) = call(state.clone(), Method::POST, "/api/v1/portfolio/scenarios", Some(request.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.broadcaster.publish(Arc::new(snapshot(
            Uuid::new_v4(),
            7,
            vec![
                leg("ETH-27DEC30-3000-C", "ETH", 2.0, 0.6),
                leg("BTC-27DEC30-60000-P", "BTC", -1.0, 0.5),
            ],
        )));
        let (status, body) = call(state, Method::POST, "/api/v1/portfolio/scenarios", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sequence"], 7);
        assert_eq!(body["legs"], 2);
    }

    #[test]
    fn test_grid_spec_limits_before_building() {
        let spec = GridSpec::Cartesian {
            spot_shocks: vec![0.0; 100],
            vol_shocks: vec![0.0; 100],
            elapsed_days: vec![0.0; 100],
        };
        assert_matches!(spec.build(10_000), Err(ApiError { code: "SCENARIO_TOO_LARGE", .. }));

        let spec = GridSpec::SpotSweep {
            min: -0.2,
            max: 0.2,
            points: 9,
        };
        assert_eq!(spec.build(10_000).unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_api_server_shutdown() {
        let server = ApiServer::new(
            ServerConfig::new("127.0.0.1", 0, 0),
            state(None),
            Duration::from_secs(30),
        );
        assert_eq!(server.name(), "api");
        let probe = server.clone();
        let (handle, token) = server.spawn();
        while probe.address().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(result.is_ok(), "Server should shutdown within timeout");
    }
}
