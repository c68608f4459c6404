//! Process shutdown coordination.
//!
//! One root [`CancellationToken`] is cancelled on Ctrl+C or SIGTERM. Each
//! component gets a child token, so cancelling the root stops everything
//! while a component can still be stopped on its own.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the root token on Ctrl+C, or SIGTERM on unix
    pub fn with_signals() -> Self {
        let controller = Self::new();
        let token = controller.token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            token.cancel();
        });
        controller
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(%e, "Failed to listen for Ctrl+C");
                    }
                }
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(%e, "Failed to install SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(%e, "Failed to listen for Ctrl+C");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to listen for Ctrl+C");
    }
}

/// Wait for `tasks` to finish, giving up after `timeout`.
/// Returns how many had not finished in time.
pub async fn join_with_timeout<T>(tasks: Vec<(&'static str, JoinHandle<T>)>, timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut unfinished = 0;
    for (name, task) in tasks {
        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(task = name, %e, "Task panicked during shutdown"),
            Err(_) => {
                warn!(task = name, "Task did not stop in time");
                unfinished += 1;
            }
        }
    }
    unfinished
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_children_follow_root() {
        let controller = ShutdownController::new();
        let ingestion = controller.child_token();
        let servers = controller.child_token();

        servers.cancel();
        assert!(!ingestion.is_cancelled());
        assert!(!controller.is_cancelled());

        controller.shutdown();
        assert!(ingestion.is_cancelled());
        controller.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_with_timeout_counts_stragglers() {
        let quick = tokio::spawn(async {});
        let stuck = tokio::spawn(std::future::pending::<()>());

        let unfinished = join_with_timeout(
            vec![("quick", quick), ("stuck", stuck)],
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(unfinished, 1);
    }
}
