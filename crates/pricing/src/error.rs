//! Pricing error types

use thiserror::Error;

/// Errors that can occur while valuing an option
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    /// Volatility was zero, negative or not finite
    #[error("Invalid volatility: {0} (must be positive and finite)")]
    InvalidVolatility(f64),

    /// Any other input outside its domain
    #[error("Invalid {field}: {value}")]
    InvalidInput { field: &'static str, value: f64 },

    /// The model produced NaN or infinity
    #[error("Valuation produced a non-finite result")]
    NonFinite,

    /// Implied volatility search failed
    #[error("Implied volatility did not converge for price {0}")]
    NoConvergence(f64),

    /// Scenario grid could not be built
    #[error("Invalid scenario grid: {0}")]
    InvalidGrid(String),
}

impl PricingError {
    pub(crate) fn input(field: &'static str, value: f64) -> Self {
        Self::InvalidInput { field, value }
    }
}
