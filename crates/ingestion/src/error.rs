use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by exchange")]
    Closed,

    #[error("No message received for {0:?}")]
    Idle(Duration),

    #[error("Exchange rejected {method}: {code} {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid seed position: {0}")]
    InvalidSeed(String),

    #[error("Feed unavailable after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

impl IngestionError {
    pub fn timeout(stage: &'static str, after: Duration) -> Self {
        Self::Timeout { stage, after }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

impl From<serde_json::Error> for IngestionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for IngestionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
