//! Scenario sweeps: re-value an option under shocked spot, volatility and
//! elapsed time.

use serde::{Deserialize, Serialize};

use crate::batch::evaluate_batch;
use crate::error::PricingError;
use crate::{PricingInputs, Result, Valuation};

const DAYS_PER_YEAR: f64 = 365.0;

/// One shock applied to a set of inputs.
///
/// Spot and volatility shocks are relative (`0.1` = +10%), elapsed time is
/// in years and shortens time to expiry, never below zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScenarioPoint {
    #[serde(default)]
    pub spot_shock: f64,
    #[serde(default)]
    pub vol_shock: f64,
    #[serde(default)]
    pub elapsed_years: f64,
}

impl ScenarioPoint {
    /// The unshocked point
    pub const BASE: ScenarioPoint = ScenarioPoint {
        spot_shock: 0.0,
        vol_shock: 0.0,
        elapsed_years: 0.0,
    };

    pub fn spot(shock: f64) -> Self {
        Self {
            spot_shock: shock,
            ..Self::BASE
        }
    }

    pub fn vol(shock: f64) -> Self {
        Self {
            vol_shock: shock,
            ..Self::BASE
        }
    }

    pub fn elapsed_days(days: f64) -> Self {
        Self {
            elapsed_years: days / DAYS_PER_YEAR,
            ..Self::BASE
        }
    }

    /// Shocked copy of `inputs`
    pub fn apply(&self, inputs: &PricingInputs) -> PricingInputs {
        PricingInputs {
            spot: inputs.spot * (1.0 + self.spot_shock),
            volatility: inputs.volatility * (1.0 + self.vol_shock),
            time_to_expiry: (inputs.time_to_expiry - self.elapsed_years).max(0.0),
            ..*inputs
        }
    }
}

/// An ordered set of scenario points
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScenarioGrid {
    points: Vec<ScenarioPoint>,
}

impl ScenarioGrid {
    pub fn from_points(points: Vec<ScenarioPoint>) -> Self {
        Self { points }
    }

    /// Evenly spaced relative spot shocks from `min` to `max` inclusive
    pub fn spot_sweep(min: f64, max: f64, points: usize) -> Result<Self> {
        Ok(Self::from_points(
            linspace(min, max, points)?
                .into_iter()
                .map(ScenarioPoint::spot)
                .collect(),
        ))
    }

    /// Evenly spaced relative volatility shocks from `min` to `max` inclusive
    pub fn vol_sweep(min: f64, max: f64, points: usize) -> Result<Self> {
        Ok(Self::from_points(
            linspace(min, max, points)?
                .into_iter()
                .map(ScenarioPoint::vol)
                .collect(),
        ))
    }

    /// Elapsed time from today out to `horizon_days`
    pub fn time_decay(horizon_days: f64, points: usize) -> Result<Self> {
        if horizon_days < 0.0 {
            return Err(PricingError::InvalidGrid(format!(
                "negative horizon {}",
                horizon_days
            )));
        }
        Ok(Self::from_points(
            linspace(0.0, horizon_days, points)?
                .into_iter()
                .map(ScenarioPoint::elapsed_days)
                .collect(),
        ))
    }

    /// Every combination of the given shocks (spot outermost)
    pub fn cartesian(spot_shocks: &[f64], vol_shocks: &[f64], elapsed_days: &[f64]) -> Self {
        let mut points =
            Vec::with_capacity(spot_shocks.len() * vol_shocks.len() * elapsed_days.len());
        for &spot_shock in spot_shocks {
            for &vol_shock in vol_shocks {
                for &days in elapsed_days {
                    points.push(ScenarioPoint {
                        spot_shock,
                        vol_shock,
                        elapsed_years: days / DAYS_PER_YEAR,
                    });
                }
            }
        }
        Self { points }
    }

    pub fn points(&self) -> &[ScenarioPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn linspace(min: f64, max: f64, points: usize) -> Result<Vec<f64>> {
    if points == 0 {
        return Err(PricingError::InvalidGrid("at least one point required".into()));
    }
    if !min.is_finite() || !max.is_finite() || min > max {
        return Err(PricingError::InvalidGrid(format!(
            "bad range [{}, {}]",
            min, max
        )));
    }
    if points == 1 {
        return Ok(vec![min]);
    }
    let span = max - min;
    let steps = (points - 1) as f64;
    Ok((0..points)
        .map(|i| min + span * i as f64 / steps)
        .collect())
}

/// Valuation at one grid point
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioOutcome {
    pub point: ScenarioPoint,
    /// The shocked inputs actually valued
    pub inputs: PricingInputs,
    pub valuation: Result<Valuation>,
}

/// Value `inputs` at every point of `grid`.
///
/// A point whose shocked inputs are invalid (for example volatility shocked
/// to zero) carries its own error; the rest of the sweep is unaffected.
pub fn evaluate_scenarios(inputs: &PricingInputs, grid: &ScenarioGrid) -> Vec<ScenarioOutcome> {
    let shocked: Vec<PricingInputs> = grid.points().iter().map(|p| p.apply(inputs)).collect();
    let valuations = evaluate_batch(&shocked);

    grid.points()
        .iter()
        .zip(shocked)
        .zip(valuations)
        .map(|((point, inputs), valuation)| ScenarioOutcome {
            point: *point,
            inputs,
            valuation,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::black_scholes::evaluate;
    use crate::OptionType;
    use assert_matches::assert_matches;

    fn call() -> PricingInputs {
        PricingInputs {
            spot: 3000.0,
            strike: 3100.0,
            time_to_expiry: 30.0 / 365.0,
            volatility: 0.65,
            rate: 0.05,
            option_type: OptionType::Call,
        }
    }

    #[test]
    fn test_zero_shock_reproduces_base_exactly() {
        let base = evaluate(&call()).unwrap();
        let grid = ScenarioGrid::cartesian(&[0.0], &[0.0], &[0.0]);
        let outcomes = evaluate_scenarios(&call(), &grid);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].inputs, call());
        assert_eq!(outcomes[0].valuation, Ok(base));
    }

    #[test]
    fn test_spot_sweep_is_monotone_for_call() {
        let grid = ScenarioGrid::spot_sweep(-0.5, 0.5, 11).unwrap();
        assert_eq!(grid.len(), 11);
        assert_eq!(grid.points()[5], ScenarioPoint::BASE);

        let outcomes = evaluate_scenarios(&call(), &grid);
        let prices: Vec<f64> = outcomes
            .iter()
            .map(|o| o.valuation.as_ref().unwrap().price)
            .collect();
        assert!(prices.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(outcomes[5].valuation, evaluate(&call()));
    }

    #[test]
    fn test_vol_shock_to_zero_fails_only_that_point() {
        let grid = ScenarioGrid::vol_sweep(-1.0, 0.0, 3).unwrap();
        let outcomes = evaluate_scenarios(&call(), &grid);
        assert_matches!(outcomes[0].valuation, Err(PricingError::InvalidVolatility(_)));
        assert!(outcomes[1].valuation.is_ok());
        assert_eq!(outcomes[2].valuation, evaluate(&call()));
    }

    #[test]
    fn test_time_decay_reaches_expiry() {
        let grid = ScenarioGrid::time_decay(45.0, 4).unwrap();
        let outcomes = evaluate_scenarios(&call(), &grid);
        let last = outcomes.last().unwrap();
        assert_eq!(last.inputs.time_to_expiry, 0.0);
        let v = last.valuation.as_ref().unwrap();
        assert_eq!(v.price, 0.0);
        assert_eq!(v.greeks.gamma, 0.0);
    }

    #[test]
    fn test_invalid_grids() {
        assert!(ScenarioGrid::spot_sweep(0.5, -0.5, 5).is_err());
        assert!(ScenarioGrid::spot_sweep(-0.5, 0.5, 0).is_err());
        assert!(ScenarioGrid::time_decay(-1.0, 5).is_err());
        assert_eq!(ScenarioGrid::vol_sweep(0.2, 0.2, 1).unwrap().len(), 1);
    }
}
