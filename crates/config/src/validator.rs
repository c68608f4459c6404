use crate::*;
use common::InstrumentName;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

const TICKER_INTERVALS: [&str; 3] = ["raw", "100ms", "agg2"];

/// The exchange refuses heartbeat intervals shorter than this
const MIN_FEED_HEARTBEAT_SECONDS: u64 = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Feed endpoint '{url}': {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("At least one feed currency must be configured")]
    NoCurrencies,

    #[error("Invalid currency '{0}'. Must be upper-case letters, digits or '_'")]
    InvalidCurrency(String),

    #[error("Instrument '{name}': {message}")]
    InvalidInstrument { name: String, message: String },

    #[error("Invalid ticker interval: {0}. Must be one of: raw, 100ms, agg2")]
    InvalidTickerInterval(String),

    #[error("Credentials: {message}")]
    InvalidCredentials { message: String },

    #[error("Environment variable '{var}' is missing or invalid: {message}")]
    InvalidEnvVar { var: String, message: String },

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("{field}: {message}")]
    InvalidRange { field: String, message: String },

    #[error("Seed position '{instrument}': {message}")]
    InvalidSeedPosition { instrument: String, message: String },

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("Port {port} is used by both {first} and {second}")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &GreekStreamConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_feed(&config.feed, &mut report);
    validate_pipeline(&config.pipeline, &config.feed, &mut report);
    validate_broadcaster(&config.broadcaster, &mut report);
    validate_optional_sections(config, &mut report);
    validate_ports(config, &mut report);

    report
}

fn positive(value: u64, field: &str, report: &mut ValidationReport) {
    if value == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: field.to_string(),
        });
    }
}

fn validate_feed(feed: &FeedConfig, report: &mut ValidationReport) {
    match Url::parse(&feed.endpoint) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {
            if url.scheme() == "ws" {
                report.add_warning("feed.endpoint", "Unencrypted websocket endpoint");
            }
        }
        Ok(url) => report.add_error(ValidationError::InvalidEndpoint {
            url: feed.endpoint.clone(),
            message: format!("scheme must be ws or wss, got {}", url.scheme()),
        }),
        Err(e) => report.add_error(ValidationError::InvalidEndpoint {
            url: feed.endpoint.clone(),
            message: e.to_string(),
        }),
    }

    if feed.currencies.is_empty() {
        report.add_error(ValidationError::NoCurrencies);
    }
    for currency in &feed.currencies {
        let valid = !currency.is_empty()
            && currency
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            report.add_error(ValidationError::InvalidCurrency(currency.clone()));
        }
    }

    for name in &feed.instruments {
        if let Err(e) = InstrumentName::parse(name) {
            report.add_error(ValidationError::InvalidInstrument {
                name: name.clone(),
                message: e.to_string(),
            });
        }
    }

    if !TICKER_INTERVALS.contains(&feed.ticker_interval.as_str()) {
        report.add_error(ValidationError::InvalidTickerInterval(
            feed.ticker_interval.clone(),
        ));
    }

    match &feed.credentials {
        Some(credentials) => validate_credentials(credentials, report),
        None => report.add_warning(
            "feed.credentials",
            "No credentials configured; positions come from pipeline.seed_positions only",
        ),
    }

    positive(feed.connect_timeout_ms, "feed.connect_timeout_ms", report);
    positive(feed.subscribe_timeout_ms, "feed.subscribe_timeout_ms", report);

    if feed.heartbeat_interval_seconds < MIN_FEED_HEARTBEAT_SECONDS {
        report.add_error(ValidationError::InvalidRange {
            field: "feed.heartbeat_interval_seconds".to_string(),
            message: format!("must be at least {}", MIN_FEED_HEARTBEAT_SECONDS),
        });
    }
    if feed.idle_timeout_seconds <= feed.heartbeat_interval_seconds {
        report.add_error(ValidationError::InvalidRange {
            field: "feed.idle_timeout_seconds".to_string(),
            message: "must exceed feed.heartbeat_interval_seconds".to_string(),
        });
    }

    let reconnect = &feed.reconnect;
    positive(reconnect.base_delay_ms, "feed.reconnect.base_delay_ms", report);
    positive(u64::from(reconnect.max_attempts), "feed.reconnect.max_attempts", report);
    if reconnect.max_delay_ms < reconnect.base_delay_ms {
        report.add_error(ValidationError::InvalidRange {
            field: "feed.reconnect.max_delay_ms".to_string(),
            message: "must not be below feed.reconnect.base_delay_ms".to_string(),
        });
    }
}

fn validate_credentials(credentials: &CredentialsConfig, report: &mut ValidationReport) {
    for (field, value) in [
        ("client_id", &credentials.client_id),
        ("client_secret", &credentials.client_secret),
    ] {
        let unresolved = substitution::unresolved_env_vars(value);
        if !unresolved.is_empty() {
            for var in unresolved {
                report.add_error(ValidationError::InvalidEnvVar {
                    var,
                    message: format!("required by feed.credentials.{}", field),
                });
            }
        } else if value.trim().is_empty() {
            report.add_error(ValidationError::InvalidCredentials {
                message: format!("{} is empty", field),
            });
        }
    }
}

fn validate_pipeline(pipeline: &PipelineConfig, feed: &FeedConfig, report: &mut ValidationReport) {
    positive(
        pipeline.snapshot_interval_seconds,
        "pipeline.snapshot_interval_seconds",
        report,
    );

    if pipeline.coalesce_window_ms >= pipeline.snapshot_interval_seconds.saturating_mul(1000) {
        report.add_warning(
            "pipeline.coalesce_window_ms",
            "Coalesce window is not shorter than the snapshot interval",
        );
    }

    if !pipeline.risk_free_rate.is_finite() {
        report.add_error(ValidationError::InvalidRange {
            field: "pipeline.risk_free_rate".to_string(),
            message: "must be finite".to_string(),
        });
    } else if !(-0.05..=0.25).contains(&pipeline.risk_free_rate) {
        report.add_warning(
            "pipeline.risk_free_rate",
            "Rate outside [-0.05, 0.25]; expected a decimal, not a percentage",
        );
    }

    let mut seen = HashSet::new();
    for seed in &pipeline.seed_positions {
        let invalid = |message: String| ValidationError::InvalidSeedPosition {
            instrument: seed.instrument.clone(),
            message,
        };
        match InstrumentName::parse(&seed.instrument) {
            Ok(name) if !feed.currencies.contains(&name.currency) => {
                report.add_warning(
                    "pipeline.seed_positions",
                    &format!(
                        "{} settles in {}, which is not in feed.currencies",
                        seed.instrument, name.currency
                    ),
                );
            }
            Ok(_) => {}
            Err(e) => report.add_error(invalid(e.to_string())),
        }
        if !seed.size.is_finite() || seed.size == 0.0 {
            report.add_error(invalid("size must be finite and non-zero".to_string()));
        }
        if !seen.insert(seed.instrument.as_str()) {
            report.add_error(invalid("listed more than once".to_string()));
        }
    }
}

fn validate_broadcaster(broadcaster: &BroadcasterConfig, report: &mut ValidationReport) {
    positive(broadcaster.batch_size as u64, "broadcaster.batch_size", report);
    positive(broadcaster.queue_capacity as u64, "broadcaster.queue_capacity", report);
    positive(
        broadcaster.heartbeat_interval_seconds,
        "broadcaster.heartbeat_interval_seconds",
        report,
    );
    if broadcaster.stale_after_seconds < broadcaster.heartbeat_interval_seconds {
        report.add_warning(
            "broadcaster.stale_after_seconds",
            "Shorter than the heartbeat interval; every heartbeat may report stale",
        );
    }
}

fn validate_optional_sections(config: &GreekStreamConfig, report: &mut ValidationReport) {
    match &config.persistence {
        None => report.add_default("persistence.path", &defaults::default_archive_path()),
        Some(p) if !p.enabled => report.add_warning(
            "persistence.enabled",
            "Snapshots will not be archived; sequence numbers restart at 1",
        ),
        Some(p) => {
            if p.path.trim().is_empty() {
                report.add_error(ValidationError::InvalidRange {
                    field: "persistence.path".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
            positive(u64::from(p.max_attempts), "persistence.max_attempts", report);
            positive(p.queue_capacity as u64, "persistence.queue_capacity", report);
        }
    }

    match &config.api {
        None => report.add_default("api.port", &defaults::default_api_port().to_string()),
        Some(api) => positive(api.request_timeout_seconds, "api.request_timeout_seconds", report),
    }

    match &config.scenario {
        None => report.add_default(
            "scenario.max_valuations",
            &defaults::default_max_valuations().to_string(),
        ),
        Some(s) => {
            positive(s.max_concurrent as u64, "scenario.max_concurrent", report);
            positive(s.max_valuations as u64, "scenario.max_valuations", report);
        }
    }

    match &config.observability {
        None => report.add_default("observability.log_format", &defaults::default_log_format()),
        Some(o) => {
            if observability_format_unknown(&o.log_format) {
                report.add_error(ValidationError::InvalidLogFormat(o.log_format.clone()));
            }
        }
    }
}

fn observability_format_unknown(format: &str) -> bool {
    !matches!(
        format.to_lowercase().as_str(),
        "pretty" | "json" | "compact"
    )
}

fn validate_ports(config: &GreekStreamConfig, report: &mut ValidationReport) {
    let mut ports = vec![("broadcaster", config.broadcaster.port)];
    let api = config.api();
    if api.enabled {
        ports.push(("api", api.port));
    }
    if let Some(port) = config.observability().metrics_port {
        ports.push(("metrics", port));
    }

    for (i, (first, port)) in ports.iter().enumerate() {
        if *port == 0 {
            report.add_error(ValidationError::InvalidPositiveInteger {
                field: format!("{}.port", first),
            });
        }
        for (second, other) in &ports[i + 1..] {
            if port == other {
                report.add_error(ValidationError::PortConflict {
                    port: *port,
                    first: first.to_string(),
                    second: second.to_string(),
                });
            }
        }
    }
}
