//! Portfolio-level scenario analysis.
//!
//! Each leg is fully re-valued at every grid point and the weighted results
//! are summed per settlement currency. Sweeps run against a frozen copy of
//! the book on [`ScenarioPool`], never on the ingestion task.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{ExclusionReason, Greeks, GreeksResult, Position, PricingInputs};
use pricing::{evaluate_scenarios, ScenarioGrid, ScenarioPoint};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::aggregator::pricing_inputs;
use crate::error::PortfolioError;
use crate::Result;

/// A leg frozen for scenario analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioLeg {
    pub instrument: String,
    pub currency: String,
    pub signed_quantity: f64,
    pub inputs: PricingInputs,
}

impl ScenarioLeg {
    pub fn from_result(result: &GreeksResult) -> Self {
        Self {
            instrument: result.instrument.clone(),
            currency: result.currency.clone(),
            signed_quantity: result.signed_quantity,
            inputs: result.inputs,
        }
    }

    pub fn from_position(
        position: &Position,
        now: DateTime<Utc>,
        rate: f64,
    ) -> std::result::Result<Self, ExclusionReason> {
        Ok(Self {
            instrument: position.instrument.clone(),
            currency: position.currency.clone(),
            signed_quantity: position.signed_quantity(),
            inputs: pricing_inputs(position, now, rate)?,
        })
    }
}

/// Summed portfolio value and Greeks at one grid point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioScenarioPoint {
    pub point: ScenarioPoint,
    pub value: f64,
    /// `value` minus the unshocked value
    pub pnl: f64,
    pub greeks: Greeks,
    /// Legs that could not be valued at this point
    pub failed_legs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrencyScenario {
    pub currency: String,
    pub base_value: f64,
    pub points: Vec<PortfolioScenarioPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioScenarioResult {
    pub currencies: Vec<CurrencyScenario>,
}

impl PortfolioScenarioResult {
    pub fn currency(&self, currency: &str) -> Option<&CurrencyScenario> {
        self.currencies.iter().find(|c| c.currency == currency)
    }
}

/// Sweep every leg over `grid` and sum per currency and point.
pub fn portfolio_scenarios(legs: &[ScenarioLeg], grid: &ScenarioGrid) -> PortfolioScenarioResult {
    let mut by_currency: BTreeMap<&str, Vec<&ScenarioLeg>> = BTreeMap::new();
    for leg in legs {
        by_currency.entry(leg.currency.as_str()).or_default().push(leg);
    }

    let currencies = by_currency
        .into_iter()
        .map(|(currency, legs)| {
            let mut base_value = 0.0;
            for leg in &legs {
                if let Ok(valuation) = pricing::evaluate(&leg.inputs) {
                    base_value += valuation.price * leg.signed_quantity;
                }
            }

            let mut points: Vec<PortfolioScenarioPoint> = grid
                .points()
                .iter()
                .map(|point| PortfolioScenarioPoint {
                    point: *point,
                    value: 0.0,
                    pnl: 0.0,
                    greeks: Greeks::ZERO,
                    failed_legs: 0,
                })
                .collect();

            for leg in &legs {
                for (slot, outcome) in points.iter_mut().zip(evaluate_scenarios(&leg.inputs, grid)) {
                    match outcome.valuation {
                        Ok(valuation) => {
                            slot.value += valuation.price * leg.signed_quantity;
                            slot.greeks += valuation.greeks.scaled(leg.signed_quantity);
                        }
                        Err(_) => slot.failed_legs += 1,
                    }
                }
            }

            for slot in &mut points {
                slot.pnl = slot.value - base_value;
            }

            CurrencyScenario {
                currency: currency.to_string(),
                base_value,
                points,
            }
        })
        .collect();

    PortfolioScenarioResult { currencies }
}

/// Bounded pool for CPU-heavy sweeps.
///
/// At most `max_concurrent` sweeps run at once, each on a blocking thread.
/// Callers beyond that wait for a permit.
#[derive(Clone)]
pub struct ScenarioPool {
    permits: Arc<Semaphore>,
    max_valuations: usize,
}

impl ScenarioPool {
    pub fn new(max_concurrent: usize, max_valuations: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_valuations,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run(
        &self,
        legs: Vec<ScenarioLeg>,
        grid: ScenarioGrid,
    ) -> Result<PortfolioScenarioResult> {
        let valuations = legs.len().saturating_mul(grid.len());
        if valuations > self.max_valuations {
            return Err(PortfolioError::GridTooLarge {
                points: valuations,
                max: self.max_valuations,
            });
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PortfolioError::PoolClosed)?;

        debug!(legs = legs.len(), points = grid.len(), "Running scenario sweep");

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            portfolio_scenarios(&legs, &grid)
        })
        .await
        .map_err(|e| PortfolioError::Worker(e.to_string()))
    }

    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use common::OptionType;

    fn leg(instrument: &str, currency: &str, quantity: f64, strike: f64, option_type: OptionType) -> ScenarioLeg {
        ScenarioLeg {
            instrument: instrument.into(),
            currency: currency.into(),
            signed_quantity: quantity,
            inputs: PricingInputs {
                spot: 3000.0,
                strike,
                time_to_expiry: 0.1,
                volatility: 0.6,
                rate: 0.05,
                option_type,
            },
        }
    }

    fn straddle() -> Vec<ScenarioLeg> {
        vec![
            leg("ETH-C", "ETH", -2.0, 3000.0, OptionType::Call),
            leg("ETH-P", "ETH", -2.0, 3000.0, OptionType::Put),
        ]
    }

    #[test]
    fn test_zero_shock_point_matches_base() {
        let grid = ScenarioGrid::spot_sweep(-0.2, 0.2, 5).unwrap();
        let result = portfolio_scenarios(&straddle(), &grid);
        let eth = result.currency("ETH").unwrap();
        assert_eq!(eth.points.len(), 5);

        let base = &eth.points[2];
        assert_eq!(base.point, ScenarioPoint::BASE);
        assert_eq!(base.value, eth.base_value);
        assert_eq!(base.pnl, 0.0);
        assert_eq!(base.failed_legs, 0);
    }

    #[test]
    fn test_short_straddle_loses_on_large_moves() {
        let grid = ScenarioGrid::spot_sweep(-0.3, 0.3, 7).unwrap();
        let result = portfolio_scenarios(&straddle(), &grid);
        let eth = result.currency("ETH").unwrap();
        assert!(eth.points[0].pnl < 0.0);
        assert!(eth.points[6].pnl < 0.0);
        // short gamma everywhere
        assert!(eth.points.iter().all(|p| p.greeks.gamma < 0.0));
    }

    #[test]
    fn test_currencies_are_kept_apart() {
        let mut legs = straddle();
        legs.push(leg("BTC-C", "BTC", 1.0, 3000.0, OptionType::Call));
        let grid = ScenarioGrid::from_points(vec![ScenarioPoint::BASE]);
        let result = portfolio_scenarios(&legs, &grid);
        assert_eq!(result.currencies.len(), 2);
        assert_eq!(result.currencies[0].currency, "BTC");
        assert!(result.currency("BTC").unwrap().base_value > 0.0);
        assert!(result.currency("ETH").unwrap().base_value < 0.0);
    }

    #[test]
    fn test_failed_legs_counted_per_point() {
        let grid = ScenarioGrid::vol_sweep(-1.0, 0.0, 2).unwrap();
        let result = portfolio_scenarios(&straddle(), &grid);
        let eth = result.currency("ETH").unwrap();
        assert_eq!(eth.points[0].failed_legs, 2);
        assert_eq!(eth.points[1].failed_legs, 0);
    }

    #[tokio::test]
    async fn test_pool_runs_sweep() {
        let pool = ScenarioPool::new(2, 10_000);
        let grid = ScenarioGrid::spot_sweep(-0.5, 0.5, 51).unwrap();
        let expected = portfolio_scenarios(&straddle(), &grid);

        let result = pool.run(straddle(), grid).await.unwrap();
        assert_eq!(result, expected);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_pool_rejects_oversized_grid() {
        let pool = ScenarioPool::new(1, 10);
        let grid = ScenarioGrid::spot_sweep(-0.5, 0.5, 6).unwrap();
        assert_matches!(
            pool.run(straddle(), grid).await,
            Err(PortfolioError::GridTooLarge { points: 12, max: 10 })
        );
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = ScenarioPool::new(1, 100);
        pool.close();
        let grid = ScenarioGrid::from_points(vec![ScenarioPoint::BASE]);
        tokio_test::assert_err!(pool.run(straddle(), grid).await);
    }

    #[test]
    fn test_leg_from_result() {
        let result = GreeksResult {
            instrument: "ETH-C".into(),
            currency: "ETH".into(),
            signed_quantity: 3.0,
            inputs: straddle()[0].inputs,
            unit_price: 1.0,
            unit_greeks: Greeks::ZERO,
            position_greeks: Greeks::ZERO,
            position_value: 3.0,
        };
        let leg = ScenarioLeg::from_result(&result);
        assert_eq!(leg.signed_quantity, 3.0);
        assert_eq!(leg.inputs, result.inputs);
    }
}
