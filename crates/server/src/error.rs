//! Server error types

use std::io;
use thiserror::Error;

/// Result type alias for server operations
///
/// The WebSocket error variant is large; these errors only occur on
/// connection setup and teardown.
#[allow(clippy::result_large_err)]
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address {address}: {source}")]
    BindError {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid server configuration: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Push frame could not be decoded: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A diff arrived for a baseline the client does not hold
    #[error("Update based on sequence {base} but view is at {held:?}; resync required")]
    BaselineMismatch { base: u64, held: Option<u64> },

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),
}

impl ServerError {
    /// Create a bind error from an address string and IO error
    pub fn bind(address: impl Into<String>, source: io::Error) -> Self {
        Self::BindError {
            address: address.into(),
            source,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedUpdate(msg.into())
    }
}
