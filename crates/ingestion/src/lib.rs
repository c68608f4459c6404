//! Exchange feed ingestion for GreekStream
//!
//! # Core Components
//!
//! - [`engine`] - The ingestion loop: session state machine, book updates and
//!   snapshot emission
//! - [`protocol`] - JSON-RPC framing, request tracking and message decoding
//! - [`transport`] - Websocket and in-process feed connections
//! - [`auth`] - Client-credentials authentication and token refresh
//! - [`backoff`] - Bounded exponential reconnect backoff
//! - [`emitter`] - Coalescing and periodic snapshot schedule, sequence numbers
//!
//! # Key Invariants
//!
//! - Snapshot sequence numbers strictly increase for the life of the process,
//!   across reconnects, continuing from the archive's latest sequence
//! - A malformed or invalid message is skipped without touching the book
//! - Output is handed off without waiting on any consumer

pub mod auth;
pub mod backoff;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;

pub use auth::{AuthToken, Credentials};
pub use backoff::{Backoff, BackoffPolicy};
pub use emitter::{EmissionSchedule, SequenceGenerator};
pub use engine::{IngestionLoop, IngestionSettings};
pub use error::IngestionError;
pub use transport::memory::{memory_feed, ExchangeSession, MemoryConnector, MemoryExchange};
pub use transport::{FeedConnection, FeedConnector, WsConnector};

pub type Result<T> = std::result::Result<T, IngestionError>;
