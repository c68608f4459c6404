//! Portfolio error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortfolioError {
    /// A ticker or portfolio message failed validation; nothing was applied
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Pricing error: {0}")]
    Pricing(#[from] pricing::PricingError),

    #[error("Scenario too large: {points} valuations exceeds limit of {max}")]
    GridTooLarge { points: usize, max: usize },

    #[error("Scenario pool is closed")]
    PoolClosed,

    #[error("Scenario worker failed: {0}")]
    Worker(String),
}

impl PortfolioError {
    pub fn invalid_update(msg: impl Into<String>) -> Self {
        Self::InvalidUpdate(msg.into())
    }
}
