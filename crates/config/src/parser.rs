use crate::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

#[instrument(skip(path))]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GreekStreamConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    debug!("Config file content length: {} bytes", content.len());
    parse_config(&content)
}

/// Substitute environment variables into `content` and parse it
pub fn parse_config(content: &str) -> Result<GreekStreamConfig> {
    let substituted = substitution::substitute_env_vars(content)?;
    debug!("Environment variable substitution completed");

    let config: GreekStreamConfig = serde_yaml::from_str(&substituted)
        .with_context(|| "Failed to parse YAML configuration")?;

    info!("Configuration loaded successfully");
    Ok(config)
}

#[instrument]
pub fn generate_default_config() -> GreekStreamConfig {
    GreekStreamConfig {
        service: ServiceConfig::default(),
        feed: FeedConfig {
            currencies: vec!["BTC".to_string(), "ETH".to_string()],
            credentials: Some(CredentialsConfig {
                client_id: "${DERIBIT_CLIENT_ID}".to_string(),
                client_secret: "${DERIBIT_CLIENT_SECRET}".to_string(),
            }),
            ..FeedConfig::default()
        },
        pipeline: PipelineConfig::default(),
        broadcaster: BroadcasterConfig::default(),
        persistence: Some(PersistenceConfig::default()),
        api: Some(ApiConfig::default()),
        scenario: Some(ScenarioConfig::default()),
        observability: Some(ObservabilityConfig {
            log_format: default_log_format(),
            metrics_port: Some(9100),
        }),
    }
}

#[instrument(skip(config))]
pub fn save_config<P: AsRef<Path> + std::fmt::Debug>(config: &GreekStreamConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    info!("Saving configuration to: {:?}", path);

    let yaml = serde_yaml::to_string(config)
        .with_context(|| "Failed to serialize configuration to YAML")?;

    fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Configuration saved successfully");
    Ok(())
}
