//! Listener lifecycle trait
//!
//! The push server and the HTTP API both implement [`Server`], so they are
//! started, supervised and shut down the same way by [`crate::CombinedServer`].

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[async_trait]
pub trait Server: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Bound address while running. With port `0` this is where the
    /// ephemeral port can be read back.
    fn address(&self) -> Option<SocketAddr>;

    fn is_running(&self) -> bool;

    /// Bind, serve until `shutdown` is cancelled, then close open
    /// connections and return.
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}

pub trait ServerExt: Server + Sized {
    /// Run on a new task with a fresh shutdown token
    fn spawn(self) -> (tokio::task::JoinHandle<Result<()>>, CancellationToken) {
        let token = CancellationToken::new();
        let handle = self.spawn_with(token.clone());
        (handle, token)
    }

    /// Run on a new task, stopping when `token` is cancelled
    fn spawn_with(self, token: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(token).await })
    }
}

impl<T: Server + Sized> ServerExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Idle {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Server for Idle {
        fn name(&self) -> &str {
            "idle"
        }

        fn address(&self) -> Option<SocketAddr> {
            None
        }

        fn is_running(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }

        async fn run(&self, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_stops_on_cancel() {
        let stopped = Arc::new(AtomicBool::new(false));
        let (handle, token) = Idle {
            stopped: stopped.clone(),
        }
        .spawn();

        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
        assert!(stopped.load(Ordering::SeqCst));
    }
}
