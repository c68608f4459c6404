//! Downstream surfaces for GreekStream
//!
//! This crate pushes portfolio snapshots and heartbeats to WebSocket
//! subscribers and serves the HTTP query and pricing API, with one lifecycle
//! and graceful shutdown for both.
//!
//! # Architecture
//!
//! The ingestion loop hands each snapshot to the [`Broadcaster`], which diffs
//! it against what every subscriber was last sent and enqueues the result on
//! that subscriber's bounded queue. A per-connection task in [`PushServer`]
//! batches the queue into binary frames. A subscriber whose queue overflows
//! is evicted; nobody else is slowed down.
//!
//! [`HealthMonitor`] runs on its own timer and pushes heartbeats even when
//! no data flows.
//!
//! All listeners implement [`Server`]. Shutdown is hierarchical through
//! `CancellationToken`: cancelling the parent cancels every listener and
//! then every connection, each of which flushes what it has before closing.
//!
//! # Modules
//!
//! - [`codec`] - Protobuf push messages, snapshot diffs, client-side rebuild
//! - [`broadcaster`] - Subscriber registry and fan-out
//! - [`batch`] - Size/delay batching of queued messages
//! - [`websocket`] - Push server
//! - [`heartbeat`] - Health monitor and heartbeats
//! - [`health`] - Health report shared by heartbeats and `/health`
//! - [`api`] - HTTP API
//! - [`shutdown`] - Signal handling and bounded joins

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod api;
pub mod batch;
pub mod broadcaster;
pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod shutdown;
pub mod traits;
pub mod websocket;

pub use api::{ApiServer, ApiState};
pub use broadcaster::{Broadcaster, SubscriberId, SubscriberInfo, Subscription};
pub use codec::{decode_batch, encode_batch, ClientView, PushBatch, PushEnvelope, SnapshotUpdate};
pub use config::{DeliverySettings, ServerConfig};
pub use error::{Result, ServerError};
pub use health::{HealthContext, HealthReport, ServiceStatus};
pub use heartbeat::HealthMonitor;
pub use shutdown::{join_with_timeout, ShutdownController};
pub use traits::{Server, ServerExt};
pub use websocket::{ClientMessage, PushServer};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs several listeners as one unit.
///
/// If any listener exits on its own the rest are cancelled, so the process
/// never keeps serving with a surface missing.
pub struct CombinedServer {
    name: String,
    servers: Vec<Arc<dyn Server>>,
    shutdown_timeout: Duration,
}

impl CombinedServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with(mut self, server: Arc<dyn Server>) -> Self {
        self.servers.push(server);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn servers(&self) -> &[Arc<dyn Server>] {
        &self.servers
    }
}

#[async_trait::async_trait]
impl Server for CombinedServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Option<std::net::SocketAddr> {
        self.servers.iter().find_map(|s| s.address())
    }

    fn is_running(&self) -> bool {
        self.servers.iter().any(|s| s.is_running())
    }

    async fn run(&self, shutdown_token: CancellationToken) -> Result<()> {
        if self.servers.is_empty() {
            warn!(server = %self.name, "No servers configured to start");
            return Ok(());
        }

        let mut handles: Vec<tokio::task::JoinHandle<Result<()>>> = self
            .servers
            .iter()
            .map(|server| {
                let server = Arc::clone(server);
                let token = shutdown_token.child_token();
                info!(server = server.name(), "Starting server");
                tokio::spawn(async move { server.run(token).await })
            })
            .collect();

        info!(server = %self.name, count = handles.len(), "All server components started");

        tokio::select! {
            _ = shutdown_token.cancelled() => {
                info!("Shutdown signal received");
            }
            result = wait_for_first_completion(&mut handles) => {
                match result {
                    Some(Ok(Ok(()))) => warn!("A server exited unexpectedly (but successfully)"),
                    Some(Ok(Err(e))) => error!(%e, "A server exited with error"),
                    Some(Err(e)) => error!(%e, "A server task panicked"),
                    None => {}
                }
                shutdown_token.cancel();
            }
        }

        info!("Waiting for all servers to shut down...");
        match tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                let errors: Vec<_> = results
                    .into_iter()
                    .filter_map(|r| match r {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(e) => Some(format!("Task panicked: {}", e)),
                    })
                    .collect();

                if errors.is_empty() {
                    info!(server = %self.name, "All servers shut down successfully");
                } else {
                    warn!(?errors, "Some servers had errors during shutdown");
                }
            }
            Err(_) => warn!("Timed out waiting for servers to shut down"),
        }

        info!(server = %self.name, "Combined server shutdown complete");
        Ok(())
    }
}

/// Wait for the first handle to complete
async fn wait_for_first_completion(
    handles: &mut [tokio::task::JoinHandle<Result<()>>],
) -> Option<std::result::Result<Result<()>, tokio::task::JoinError>> {
    if handles.is_empty() {
        return None;
    }

    let (result, _index, _remaining) =
        futures::future::select_all(handles.iter_mut().map(Box::pin)).await;

    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ServerExt;

    fn push_server() -> (CombinedServer, Arc<PushServer>) {
        let broadcaster = Broadcaster::new(16);
        let push = Arc::new(PushServer::new(
            ServerConfig::push_only("127.0.0.1", 0),
            DeliverySettings::default(),
            broadcaster,
        ));
        let combined = CombinedServer::new("greekstream").with(push.clone());
        (combined, push)
    }

    #[tokio::test]
    async fn test_combined_server_shutdown() {
        let (server, push) = push_server();
        let (handle, token) = server.spawn();

        while push.address().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), handle).await;
        assert!(result.is_ok(), "Server should shutdown within timeout");
        assert!(!push.is_running());
    }

    #[tokio::test]
    async fn test_failed_listener_stops_the_rest() {
        let (server, push) = push_server();
        // No push port: this listener fails with a config error at once
        let broken = Arc::new(PushServer::new(
            ServerConfig {
                push_port: None,
                ..ServerConfig::push_only("127.0.0.1", 0)
            },
            DeliverySettings::default(),
            Broadcaster::new(1),
        ));
        let server = server.with(broken);
        let (handle, token) = server.spawn();

        let result = tokio::time::timeout(Duration::from_secs(10), handle).await;
        assert!(result.is_ok(), "Remaining servers should be cancelled");
        assert!(token.is_cancelled());
        assert!(!push.is_running());
    }

    #[tokio::test]
    async fn test_sleep_until_none_never_fires() {
        let slept = tokio::time::timeout(Duration::from_millis(20), sleep_until_opt(None)).await;
        assert!(slept.is_err());
    }
}
