//! Portfolio state and risk aggregation for GreekStream
//!
//! # Core Components
//!
//! - [`store`] - Position Store, owned by the ingestion task
//! - [`aggregator`] - Per-leg Greeks and per-currency net Greeks
//! - [`scenario`] - Portfolio-level scenario sweeps and the bounded worker pool
//!
//! # Key Invariants
//!
//! - Only the owner of a [`PositionStore`] mutates it; everyone else sees copies
//! - Net Greeks are the exact sum of the per-leg weighted Greeks
//! - Expired legs and legs without usable inputs are excluded and flagged,
//!   never silently priced

pub mod aggregator;
pub mod error;
pub mod scenario;
pub mod store;

pub use aggregator::{aggregate, net_by_currency, pricing_inputs, RiskComputation};
pub use error::PortfolioError;
pub use scenario::{
    portfolio_scenarios, CurrencyScenario, PortfolioScenarioPoint, PortfolioScenarioResult,
    ScenarioLeg, ScenarioPool,
};
pub use store::{PortfolioChange, PortfolioUpdate, PositionStore, PositionUpdate, TickerUpdate};

pub type Result<T> = std::result::Result<T, PortfolioError>;
