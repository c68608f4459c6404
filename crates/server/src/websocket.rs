//! WebSocket push server.
//!
//! Each accepted connection registers with the [`Broadcaster`] and gets its
//! own delivery task, which batches from that subscriber's queue into binary
//! frames. Clients may send JSON text to acknowledge a sequence or request a
//! resync; every other inbound frame is ignored.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use observability::BroadcastMetrics;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batcher;
use crate::broadcaster::{Broadcaster, SubscriberId};
use crate::codec::{encode_batch, PushEnvelope};
use crate::config::{DeliverySettings, ServerConfig};
use crate::error::{Result, ServerError};
use crate::traits::Server;

/// Upper bound on the final flush and Close frame of one connection
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Messages a client may send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ack { sequence: u64 },
    Resync,
}

#[derive(Clone)]
pub struct PushServer {
    config: ServerConfig,
    delivery: DeliverySettings,
    broadcaster: Broadcaster,
    running: Arc<AtomicBool>,
    bound_addr: Arc<RwLock<Option<SocketAddr>>>,
    metrics: BroadcastMetrics,
}

impl PushServer {
    pub fn new(config: ServerConfig, delivery: DeliverySettings, broadcaster: Broadcaster) -> Self {
        Self {
            config,
            delivery,
            broadcaster,
            running: Arc::new(AtomicBool::new(false)),
            bound_addr: Arc::new(RwLock::new(None)),
            metrics: BroadcastMetrics::new(),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn bind_addr(&self) -> Result<SocketAddr> {
        self.config
            .push_addr()
            .ok_or_else(|| ServerError::ConfigError("push port not configured".into()))?
    }

    fn handle_client_text(&self, id: SubscriberId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Ack { sequence }) => {
                self.broadcaster.acknowledge(id, sequence);
            }
            Ok(ClientMessage::Resync) => {
                debug!(subscriber = id, "Client requested resync");
                self.broadcaster.request_resync(id);
            }
            Err(e) => debug!(subscriber = id, error = %e, "Ignoring unrecognised client message"),
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        conn_token: CancellationToken,
    ) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut subscription = self.broadcaster.register(peer_addr.to_string());
        let id = subscription.id;
        let mut batcher = Batcher::new(self.delivery.batch_size, self.delivery.flush_delay);

        loop {
            tokio::select! {
                _ = conn_token.cancelled() => {
                    // Best-effort flush of whatever is pending, bounded so a
                    // stalled peer cannot hold up shutdown
                    let pending = batcher.drain(&mut subscription.receiver);
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        if !pending.is_empty() {
                            self.send_batch(&mut ws_sender, pending).await?;
                        }
                        ws_sender.send(Message::Close(None)).await?;
                        Ok::<_, ServerError>(())
                    })
                    .await;
                    break;
                }

                _ = subscription.evicted.cancelled() => {
                    // An evicted peer is not reading; drop the socket without a Close
                    debug!(subscriber = id, "Dropping evicted subscriber");
                    break;
                }

                batch = batcher.next_batch(&mut subscription.receiver) => {
                    match batch {
                        Some(batch) => {
                            // The send itself can stall on a full socket, so it
                            // still yields to eviction and shutdown
                            tokio::select! {
                                sent = self.send_batch(&mut ws_sender, batch) => {
                                    if let Err(e) = sent {
                                        debug!(subscriber = id, error = %e, "Push send failed");
                                        break;
                                    }
                                }
                                _ = subscription.evicted.cancelled() => {
                                    debug!(subscriber = id, "Evicted while a send was blocked");
                                    break;
                                }
                                _ = conn_token.cancelled() => {
                                    debug!(subscriber = id, "Shutdown while a send was blocked");
                                    break;
                                }
                            }
                        }
                        None => {
                            // Registry dropped our queue after draining it
                            let _ = tokio::time::timeout(
                                CLOSE_TIMEOUT,
                                ws_sender.send(Message::Close(None)),
                            )
                            .await;
                            break;
                        }
                    }
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_client_text(id, &text),
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(subscriber = id, "Subscriber disconnected");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(subscriber = id, error = %e, "Subscriber transport error");
                            break;
                        }
                    }
                }
            }
        }

        self.broadcaster.unregister(id);
        Ok(())
    }

    async fn send_batch<S>(&self, sink: &mut S, batch: Vec<PushEnvelope>) -> Result<()>
    where
        S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let messages = batch.len();
        sink.send(Message::Binary(encode_batch(batch))).await?;
        self.metrics.frame_sent(messages);
        Ok(())
    }
}

#[async_trait]
impl Server for PushServer {
    fn name(&self) -> &str {
        "push"
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
        info!(%local_addr, "Push server listening");

        let mut connection_handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    info!("Push server received shutdown signal");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = self.clone();
                            let conn_token = shutdown_token.child_token();
                            connection_handles.push(tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr, conn_token).await {
                                    warn!(%peer_addr, %e, "Push connection failed");
                                }
                            }));
                            connection_handles.retain(|h| !h.is_finished());
                        }
                        Err(e) => error!(%e, "Failed to accept push connection"),
                    }
                }
            }
        }

        let open = connection_handles.len();
        if open > 0 {
            info!(open, "Flushing and closing push connections");
            let drained = tokio::time::timeout(
                Duration::from_secs(5),
                futures::future::join_all(connection_handles),
            )
            .await;
            if drained.is_err() {
                warn!("Timed out closing push connections");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        *self.bound_addr.write() = None;
        info!("Push server shutdown complete");
        Ok(())
    }
}
