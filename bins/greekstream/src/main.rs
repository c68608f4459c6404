//! GreekStream CLI and service binary
//!
//! `start` wires the pipeline: feed -> ingestion -> (broadcaster, archive),
//! with the heartbeat monitor, push server and HTTP API alongside.
//! `validate` and `init` work on the configuration file only.

use anyhow::{Context, Result};
use cli::{Cli, Commands, LogFormatArg};
use common::{Fanout, FeedStatus, SnapshotSink};
use config::{
    generate_default_config, load_config, save_config, validate_config, GreekStreamConfig,
};
use ingestion::{BackoffPolicy, Credentials, IngestionError, IngestionLoop, IngestionSettings, WsConnector};
use observability::{init_logging, init_metrics, LogFormat};
use portfolio::{PositionUpdate, ScenarioPool};
use server::{
    join_with_timeout, ApiServer, ApiState, Broadcaster, CombinedServer, DeliverySettings,
    HealthContext, HealthMonitor, PushServer, Server, ServerConfig, ShutdownController,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{ArchiveWriter, RetryPolicy, SnapshotArchive};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start { config, log_format } => start_service(&config, log_format).await,
        Commands::Validate { config } => {
            init_logging("greekstream", LogFormat::Pretty)?;
            debug!(?config, "Executing 'validate' command");
            validate_command(&config)
        }
        Commands::Init { output } => {
            init_logging("greekstream", LogFormat::Pretty)?;
            debug!(?output, "Executing 'init' command");
            init_command(&output)
        }
    }
}

fn ingestion_settings(config: &GreekStreamConfig) -> IngestionSettings {
    let feed = &config.feed;
    IngestionSettings {
        currencies: feed.currencies.clone(),
        instruments: feed.instruments.clone(),
        credentials: feed
            .credentials
            .as_ref()
            .map(|c| Credentials::new(&c.client_id, &c.client_secret)),
        ticker_interval: feed.ticker_interval.clone(),
        connect_timeout: feed.connect_timeout(),
        subscribe_timeout: feed.subscribe_timeout(),
        heartbeat_interval: Duration::from_secs(feed.heartbeat_interval_seconds),
        idle_timeout: feed.idle_timeout(),
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(feed.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(feed.reconnect.max_delay_ms),
            max_attempts: feed.reconnect.max_attempts,
        },
        snapshot_interval: config.pipeline.snapshot_interval(),
        coalesce_window: config.pipeline.coalesce_window(),
        risk_free_rate: config.pipeline.risk_free_rate,
    }
}

fn seed_positions(config: &GreekStreamConfig) -> Vec<PositionUpdate> {
    config
        .pipeline
        .seed_positions
        .iter()
        .map(|seed| PositionUpdate {
            instrument: seed.instrument.clone(),
            size: seed.size,
            average_price: seed.average_price,
            underlying_price: None,
        })
        .collect()
}

async fn start_service(config_path: &Path, log_override: Option<LogFormatArg>) -> Result<()> {
    let config = load_config(config_path)?;

    let format = match log_override {
        Some(arg) => LogFormat::parse(arg.as_str()),
        None => LogFormat::parse(&config.observability().log_format),
    }
    .unwrap_or_default();
    init_logging(&config.service.name, format)?;
    info!(path = ?config_path, environment = %config.service.environment, "GreekStream starting...");

    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!(field = %warning.field, message = %warning.message, "Configuration warning");
    }
    if !report.is_valid() {
        error!(error_count = report.errors.len(), "Configuration validation failed");
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot start due to configuration errors");
    }

    if let Some(port) = config.observability().metrics_port {
        init_metrics(&config.broadcaster.host, port)?;
    }

    let shutdown = ShutdownController::with_signals();
    let status = Arc::new(FeedStatus::new());
    let bc = &config.broadcaster;
    let broadcaster = Broadcaster::new(bc.queue_capacity);

    // Persistence: opened first so the sequence can continue from the archive
    let persistence = config.persistence();
    let archive_cancel = CancellationToken::new();
    let (archive, archive_handle, archive_task, last_sequence) = if persistence.enabled {
        let archive = Arc::new(
            SnapshotArchive::open(&persistence.path, persistence.busy_timeout())
                .with_context(|| format!("Failed to open archive at {}", persistence.path))?,
        );
        let last_sequence = archive
            .latest_sequence()
            .context("Failed to read latest archived sequence")?
            .unwrap_or(0);
        let policy = RetryPolicy {
            max_attempts: persistence.max_attempts,
            base_delay: Duration::from_millis(persistence.base_backoff_ms),
            max_delay: Duration::from_millis(persistence.max_backoff_ms),
        };
        let (writer, handle) =
            ArchiveWriter::new(archive.clone(), policy, persistence.queue_capacity);
        let writer = writer.with_alerts(Arc::new(broadcaster.clone()));
        let task = tokio::spawn(writer.run(archive_cancel.clone()));
        info!(path = %persistence.path, last_sequence, "Archive opened");
        (Some(archive), Some(handle), Some(task), last_sequence)
    } else {
        warn!("Persistence disabled; snapshots will not be archived");
        (None, None, None, 0)
    };

    let alerts: Option<Arc<dyn SnapshotSink>> = archive_handle
        .clone()
        .map(|handle| Arc::new(handle) as Arc<dyn SnapshotSink>);
    if let Some(sink) = &alerts {
        broadcaster.set_alerts(sink.clone());
    }

    let mut sink = Fanout::new().with(Arc::new(broadcaster.clone()));
    if let Some(handle) = archive_handle {
        sink = sink.with(Arc::new(handle));
    }

    // Ingestion
    let ingestion = IngestionLoop::new(
        ingestion_settings(&config),
        Arc::new(WsConnector::new(&config.feed.endpoint)),
        Arc::new(sink),
        status.clone(),
    )
    .with_positions(seed_positions(&config))?
    .with_sequence_start(last_sequence);
    info!(session_id = %ingestion.session_id(), endpoint = %config.feed.endpoint, "Starting ingestion");
    let mut ingestion_task = tokio::spawn(ingestion.run(shutdown.child_token()));

    // Heartbeats
    let health = HealthContext::new(config.service.name.clone(), bc.stale_after());
    let mut monitor = HealthMonitor::new(
        broadcaster.clone(),
        status.clone(),
        health.clone(),
        bc.heartbeat_interval(),
    );
    if let Some(sink) = alerts {
        monitor = monitor.with_alerts(sink);
    }
    let monitor_task = tokio::spawn(monitor.run(shutdown.child_token()));

    // Push server and HTTP API
    let delivery = DeliverySettings {
        batch_size: bc.batch_size,
        flush_delay: bc.flush_delay(),
        queue_capacity: bc.queue_capacity,
        heartbeat_interval: bc.heartbeat_interval(),
        stale_after: bc.stale_after(),
    };
    let mut server_config = ServerConfig::push_only(bc.host.clone(), bc.port);
    let push = PushServer::new(server_config.clone(), delivery, broadcaster.clone());
    let mut servers = CombinedServer::new(config.service.name.clone()).with(Arc::new(push));

    let api = config.api();
    if api.enabled {
        server_config = server_config.with_api(api.host.clone(), api.port);
        let scenario = config.scenario();
        let state = Arc::new(ApiState {
            health,
            status: status.clone(),
            broadcaster: broadcaster.clone(),
            archive,
            scenarios: ScenarioPool::new(scenario.max_concurrent, scenario.max_valuations),
            max_valuations: scenario.max_valuations,
        });
        servers = servers.with(Arc::new(ApiServer::new(
            server_config,
            state,
            Duration::from_secs(api.request_timeout_seconds),
        )));
    }

    let servers_token = shutdown.child_token();
    let servers_task = tokio::spawn(async move {
        if let Err(e) = servers.run(servers_token).await {
            error!(%e, "Servers stopped with error");
        }
    });

    // Run until a signal arrives or ingestion gives up
    let finished_early = tokio::select! {
        _ = shutdown.wait() => None,
        joined = &mut ingestion_task => Some(joined),
    };
    let ingestion_result = match finished_early {
        Some(joined) => {
            shutdown.shutdown();
            joined
        }
        None => {
            info!("Shutting down");
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut ingestion_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Ingestion did not stop in time");
                    ingestion_task.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    let unfinished = join_with_timeout(
        vec![("servers", servers_task), ("heartbeat", monitor_task)],
        SHUTDOWN_TIMEOUT,
    )
    .await;
    if unfinished > 0 {
        warn!(unfinished, "Some tasks did not stop in time");
    }
    broadcaster.close_all();

    // The writer stops last so it can commit the final snapshots
    archive_cancel.cancel();
    if let Some(task) = archive_task {
        join_with_timeout(vec![("archive", task)], SHUTDOWN_TIMEOUT).await;
    }

    match ingestion_result {
        Ok(Ok(())) => {
            info!("GreekStream stopped");
            Ok(())
        }
        Ok(Err(e @ IngestionError::RetriesExhausted { .. })) => {
            error!(%e, "Feed could not be re-established");
            Err(e.into())
        }
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("Ingestion failed")),
        Err(e) => Err(anyhow::anyhow!("Ingestion task panicked: {}", e)),
    }
}

fn validate_command(config_path: &Path) -> Result<()> {
    info!(path = ?config_path, "Validating configuration");

    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Service: {} ({})", config.service.name, config.service.environment);
    println!("Feed: {}", config.feed.endpoint);
    println!("Currencies: {}", config.feed.currencies.join(", "));
    println!(
        "Mode: {}",
        if config.feed.credentials.is_some() {
            "authenticated"
        } else {
            "public tickers only"
        }
    );
    println!("Seed positions: {}", config.pipeline.seed_positions.len());
    println!("Push: {}:{}", config.broadcaster.host, config.broadcaster.port);
    let api = config.api();
    if api.enabled {
        println!("HTTP API: {}:{}", api.host, api.port);
    }
    let persistence = config.persistence();
    if persistence.enabled {
        println!("Archive: {}", persistence.path);
    }

    Ok(())
}

fn init_command(output_path: &Path) -> Result<()> {
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("Next steps:");
    println!("  1. Set DERIBIT_CLIENT_ID and DERIBIT_CLIENT_SECRET, or remove feed.credentials");
    println!("     and list pipeline.seed_positions to stream public tickers only");
    println!(
        "  2. Run 'greekstream validate --config {:?}' to check configuration",
        output_path
    );
    println!(
        "  3. Run 'greekstream start --config {:?}' to start streaming",
        output_path
    );

    Ok(())
}
