//! Observability infrastructure for GreekStream
//!
//! This crate provides:
//! - Structured logging via tracing
//! - Prometheus metrics
//! - Metric handles for each pipeline stage
//!
//! # Quick Start
//!
//! ```ignore
//! use observability::{init_logging, LogFormat};
//!
//! init_logging("greekstream", LogFormat::Pretty)?;
//!
//! // Optional Prometheus endpoint
//! observability::init_metrics("0.0.0.0", 9100)?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::{init_metrics, ArchiveMetrics, BroadcastMetrics, IngestionMetrics};
