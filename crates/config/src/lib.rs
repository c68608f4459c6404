//! GreekStream configuration
//!
//! A single YAML document describes the exchange feed, the pipeline and every
//! outer surface. `${VAR}` placeholders are substituted from the environment
//! before parsing, so credentials never need to live in the file itself.

pub mod defaults;
pub mod parser;
pub mod substitution;
pub mod validator;

pub use parser::{generate_default_config, load_config, parse_config, save_config};
pub use validator::{validate_config, ValidationError, ValidationReport};

use defaults::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GreekStreamConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

impl GreekStreamConfig {
    pub fn persistence(&self) -> PersistenceConfig {
        self.persistence.clone().unwrap_or_default()
    }

    pub fn api(&self) -> ApiConfig {
        self.api.clone().unwrap_or_default()
    }

    pub fn scenario(&self) -> ScenarioConfig {
        self.scenario.clone().unwrap_or_default()
    }

    pub fn observability(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            environment: default_environment(),
        }
    }
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    /// Exchange websocket endpoint (ws:// or wss://)
    #[serde(default = "default_feed_endpoint")]
    pub endpoint: String,

    /// Currencies whose option positions are streamed
    #[serde(default = "default_currencies")]
    pub currencies: Vec<String>,

    /// Instruments to subscribe to at startup in addition to held positions
    #[serde(default)]
    pub instruments: Vec<String>,

    /// Account credentials. Without them only public tickers are streamed and
    /// positions come from `pipeline.seed_positions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsConfig>,

    /// Ticker channel interval: `raw`, `100ms` or `agg2`
    #[serde(default = "default_ticker_interval")]
    pub ticker_interval: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,

    /// Interval requested from the exchange for its heartbeat probes
    #[serde(default = "default_feed_heartbeat_seconds")]
    pub heartbeat_interval_seconds: u64,

    /// A connection with no inbound frame for this long is considered dead
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl FeedConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: default_feed_endpoint(),
            currencies: default_currencies(),
            instruments: Vec::new(),
            credentials: None,
            ticker_interval: default_ticker_interval(),
            connect_timeout_ms: default_connect_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            heartbeat_interval_seconds: default_feed_heartbeat_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the feed is declared dead
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// A snapshot is emitted at least this often even without changes
    #[serde(default = "default_snapshot_interval_seconds")]
    pub snapshot_interval_seconds: u64,

    /// Changes arriving within this window collapse into one snapshot; 0
    /// emits one snapshot per change
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,

    /// Annualized continuously-compounded rate used for every position
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    #[serde(default)]
    pub seed_positions: Vec<SeedPosition>,
}

impl PipelineConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_seconds)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_seconds: default_snapshot_interval_seconds(),
            coalesce_window_ms: default_coalesce_window_ms(),
            risk_free_rate: default_risk_free_rate(),
            seed_positions: Vec::new(),
        }
    }
}

/// A position known before the feed reports any
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedPosition {
    pub instrument: String,
    /// Signed contract count, negative for short
    pub size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
}

// ============================================================================
// Outer surfaces
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcasterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_broadcaster_port")]
    pub port: u16,
    /// Maximum messages per outbound frame
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a partially filled frame waits for more messages
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// Per-subscriber outbound queue; a subscriber that fills it is evicted
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Heartbeats report the feed as stale once its last message is older
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,
}

impl BroadcasterConfig {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_broadcaster_port(),
            batch_size: default_batch_size(),
            flush_delay_ms: default_flush_delay_ms(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            queue_capacity: default_queue_capacity(),
            stale_after_seconds: default_stale_after_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_archive_path")]
    pub path: String,
    #[serde(default = "default_persistence_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_archive_queue_capacity")]
    pub queue_capacity: usize,
}

impl PersistenceConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_archive_path(),
            max_attempts: default_persistence_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            queue_capacity: default_archive_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_api_port(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioConfig {
    /// Scenario requests evaluated at the same time
    #[serde(default = "default_scenario_concurrency")]
    pub max_concurrent: usize,
    /// Upper bound on legs x grid points per request
    #[serde(default = "default_max_valuations")]
    pub max_valuations: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_scenario_concurrency(),
            max_valuations: default_max_valuations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; metrics are disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}
