//! Feed transport.
//!
//! The session logic only sees text frames through [`FeedConnection`], so it
//! runs unchanged over a real websocket ([`WsConnector`]) or an in-process
//! exchange ([`memory`]).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::IngestionError;
use crate::Result;

#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>>;
}

#[async_trait]
pub trait FeedConnection: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame, or `None` once the exchange has closed the connection
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self);
}

/// Websocket connector for a `ws://` or `wss://` endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>> {
        debug!(url = %self.url, "Connecting to feed");
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| IngestionError::Connect(e.to_string()))?;
        info!(url = %self.url, status = %response.status(), "Feed websocket connected");
        Ok(Box::new(WsConnection {
            stream,
            pending_pong: None,
        }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Pong owed to the exchange; cleared only once it has been written
    pending_pong: Option<Vec<u8>>,
}

impl WsConnection {
    async fn flush_pong(&mut self) -> Result<()> {
        if let Some(payload) = self.pending_pong.clone() {
            self.stream.send(Message::Pong(payload)).await?;
            self.pending_pong = None;
        }
        Ok(())
    }
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.flush_pong().await?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            self.flush_pong().await?;
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8(bytes)
                        .map_err(|_| IngestionError::protocol("binary frame is not UTF-8"))?;
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(payload))) => self.pending_pong = Some(payload),
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Feed closed by exchange");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Feed close handshake failed");
        }
    }
}

/// In-process exchange endpoint for replaying recorded sessions and driving
/// the session logic without a network.
pub mod memory {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    enum Pending {
        Accept(MemoryConnection),
        Refuse(String),
    }

    /// Connector side; each `connect` takes the next queued outcome
    pub struct MemoryConnector {
        queue: Mutex<mpsc::UnboundedReceiver<Pending>>,
    }

    /// Exchange side; queues what the next `connect` calls will see
    #[derive(Clone)]
    pub struct MemoryExchange {
        queue: mpsc::UnboundedSender<Pending>,
    }

    pub fn memory_feed() -> (MemoryExchange, MemoryConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryExchange { queue: tx },
            MemoryConnector {
                queue: Mutex::new(rx),
            },
        )
    }

    impl MemoryExchange {
        /// Accept the next connection attempt
        pub fn accept(&self) -> ExchangeSession {
            let (to_client, client_rx) = mpsc::unbounded_channel();
            let (client_tx, from_client) = mpsc::unbounded_channel();
            let _ = self.queue.send(Pending::Accept(MemoryConnection {
                inbound: client_rx,
                outbound: client_tx,
            }));
            ExchangeSession {
                to_client,
                from_client,
            }
        }

        /// Refuse the next connection attempt
        pub fn refuse(&self, reason: impl Into<String>) {
            let _ = self.queue.send(Pending::Refuse(reason.into()));
        }
    }

    #[async_trait]
    impl FeedConnector for MemoryConnector {
        async fn connect(&self) -> Result<Box<dyn FeedConnection>> {
            let next = self.queue.lock().try_recv();
            match next {
                Ok(Pending::Accept(conn)) => Ok(Box::new(conn)),
                Ok(Pending::Refuse(reason)) => Err(IngestionError::Connect(reason)),
                Err(_) => Err(IngestionError::Connect("connection refused".to_string())),
            }
        }
    }

    struct MemoryConnection {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl FeedConnection for MemoryConnection {
        async fn send(&mut self, text: String) -> Result<()> {
            self.outbound.send(text).map_err(|_| IngestionError::Closed)
        }

        async fn recv(&mut self) -> Result<Option<String>> {
            Ok(self.inbound.recv().await)
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }

    /// One accepted connection, seen from the exchange
    pub struct ExchangeSession {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl ExchangeSession {
        pub fn push(&self, text: impl Into<String>) {
            let _ = self.to_client.send(text.into());
        }

        pub fn push_json(&self, value: Value) {
            self.push(value.to_string());
        }

        pub fn respond(&self, id: u64, result: Value) {
            self.push_json(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
        }

        pub fn reject(&self, id: u64, code: i64, message: &str) {
            self.push_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            }));
        }

        pub fn notify(&self, channel: &str, data: Value) {
            self.push_json(json!({
                "jsonrpc": "2.0",
                "method": "subscription",
                "params": { "channel": channel, "data": data }
            }));
        }

        /// Next request sent by the client, or `None` once it disconnected
        pub async fn next_request(&mut self) -> Option<Value> {
            loop {
                let text = self.from_client.recv().await?;
                if let Ok(value) = serde_json::from_str(&text) {
                    return Some(value);
                }
            }
        }

        /// Skip requests until one for `method` arrives
        pub async fn expect(&mut self, method: &str) -> Option<Value> {
            loop {
                let request = self.next_request().await?;
                if request["method"] == method {
                    return Some(request);
                }
            }
        }
    }
}
