//! Common types and utilities for GreekStream
//!
//! This crate provides the domain types shared by every stage of the risk
//! pipeline, plus the seams through which stages hand data to each other.
//!
//! # Modules
//!
//! - [`error`] - Common error types
//! - [`types`] - Option/position primitives (OptionType, Side, Greeks, Position)
//! - [`instrument`] - Exchange instrument name parsing
//! - [`snapshot`] - Per-position results and portfolio snapshots
//! - [`health`] - Append-only service health events
//! - [`status`] - Shared feed status written by ingestion
//! - [`sink`] - Non-blocking output seam for snapshots and health events

pub mod error;
pub mod health;
pub mod instrument;
pub mod sink;
pub mod snapshot;
pub mod status;
pub mod types;

pub use error::{Error, Result};
pub use health::{Component, HealthEvent, Severity};
pub use instrument::InstrumentName;
pub use sink::{Fanout, SnapshotSink};
pub use snapshot::{
    ExcludedPosition, ExclusionReason, GreeksResult, NetGreeks, PortfolioSnapshot, SnapshotTrigger,
};
pub use status::{FeedState, FeedStatus, FeedStatusView};
pub use types::*;
