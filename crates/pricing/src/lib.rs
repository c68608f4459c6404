//! Pricing Engine for GreekStream
//!
//! Closed-form Black-Scholes valuation with first and second order Greeks.
//! Everything in this crate is a pure function of its inputs.
//!
//! # Core Components
//!
//! - [`black_scholes`] - Scalar valuation, intrinsic value, implied volatility
//! - [`batch`] - Structure-of-arrays valuation of many legs at once
//! - [`scenario`] - Spot / volatility / time shock sweeps
//!
//! # Key Invariants
//!
//! - Inputs are validated, never clamped: non-positive volatility is an error
//! - Time to expiry of exactly zero yields intrinsic value and zero
//!   second-order Greeks
//! - The batched path is element-wise identical to the scalar path
//! - A zero shock reproduces the unshocked valuation exactly

pub mod batch;
pub mod black_scholes;
pub mod error;
pub mod scenario;

pub use batch::evaluate_batch;
pub use black_scholes::{evaluate, implied_volatility, intrinsic_value, norm_cdf, norm_pdf};
pub use common::{Greeks, OptionType, PricingInputs};
pub use error::PricingError;
pub use scenario::{evaluate_scenarios, ScenarioGrid, ScenarioOutcome, ScenarioPoint};

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, PricingError>;

/// Unit price and Greeks for one option
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    pub price: f64,
    pub greeks: Greeks,
}
