//! Per-position risk results and the portfolio snapshots built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Greeks, PricingInputs};

/// Risk for one open leg, computed fresh from the position and pricing engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreeksResult {
    pub instrument: String,
    pub currency: String,
    pub signed_quantity: f64,
    /// Inputs the valuation was computed from
    pub inputs: PricingInputs,
    pub unit_price: f64,
    pub unit_greeks: Greeks,
    /// `unit_greeks` weighted by signed quantity
    pub position_greeks: Greeks,
    /// `unit_price` weighted by signed quantity
    pub position_value: f64,
}

/// Net sensitivities for one settlement currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetGreeks {
    pub currency: String,
    pub greeks: Greeks,
    pub value: f64,
    /// Number of legs that contributed
    pub legs: u32,
}

impl NetGreeks {
    pub fn empty(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            greeks: Greeks::ZERO,
            value: 0.0,
            legs: 0,
        }
    }
}

/// Why a leg was left out of aggregation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExclusionReason {
    Expired,
    MissingMarketData,
    InvalidInput(String),
    NonFinite,
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionReason::Expired => write!(f, "expired"),
            ExclusionReason::MissingMarketData => write!(f, "missing market data"),
            ExclusionReason::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            ExclusionReason::NonFinite => write!(f, "non-finite result"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedPosition {
    pub instrument: String,
    pub reason: ExclusionReason,
}

/// What caused a snapshot to be emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotTrigger {
    /// A ticker or portfolio message changed the book
    Change,
    /// Fixed-cadence snapshot
    Periodic,
}

/// Point-in-time portfolio risk.
///
/// Snapshots are immutable once built and shared as `Arc<PortfolioSnapshot>`.
/// `positions` is ordered by instrument and `net` by currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub session_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub trigger: SnapshotTrigger,
    pub positions: Vec<GreeksResult>,
    pub net: Vec<NetGreeks>,
    pub excluded: Vec<ExcludedPosition>,
}

impl PortfolioSnapshot {
    pub fn net_for(&self, currency: &str) -> Option<&NetGreeks> {
        self.net.iter().find(|n| n.currency == currency)
    }

    pub fn position(&self, instrument: &str) -> Option<&GreeksResult> {
        self.positions.iter().find(|p| p.instrument == instrument)
    }

    pub fn is_excluded(&self, instrument: &str) -> bool {
        self.excluded.iter().any(|e| e.instrument == instrument)
    }
}
