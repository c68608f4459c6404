//! Batched valuation.
//!
//! Inputs are split into columns, d1/d2 are computed in one pass over the
//! live legs, then each leg is finished with the same kernel the scalar path
//! uses. Results line up index-for-index with the inputs.

use crate::black_scholes::{check_finite, d1_d2, expiry_valuation, validate, valuation_from_d};
use crate::{PricingInputs, Result, Valuation};

/// Value many options at once. Element `i` of the output equals
/// `evaluate(&inputs[i])`.
pub fn evaluate_batch(inputs: &[PricingInputs]) -> Vec<Result<Valuation>> {
    let n = inputs.len();
    let mut out: Vec<Option<Result<Valuation>>> = Vec::with_capacity(n);

    // Legs that need the closed form, as indices into `inputs`.
    let mut live = Vec::with_capacity(n);
    for (i, input) in inputs.iter().enumerate() {
        match validate(input) {
            Err(err) => out.push(Some(Err(err))),
            Ok(()) if input.time_to_expiry == 0.0 => out.push(Some(Ok(expiry_valuation(input)))),
            Ok(()) => {
                out.push(None);
                live.push(i);
            }
        }
    }

    let spot: Vec<f64> = live.iter().map(|&i| inputs[i].spot).collect();
    let strike: Vec<f64> = live.iter().map(|&i| inputs[i].strike).collect();
    let time: Vec<f64> = live.iter().map(|&i| inputs[i].time_to_expiry).collect();
    let vol: Vec<f64> = live.iter().map(|&i| inputs[i].volatility).collect();
    let rate: Vec<f64> = live.iter().map(|&i| inputs[i].rate).collect();

    let d: Vec<(f64, f64)> = (0..live.len())
        .map(|j| d1_d2(spot[j], strike[j], time[j], vol[j], rate[j]))
        .collect();

    for (j, &i) in live.iter().enumerate() {
        let (d1, d2) = d[j];
        out[i] = Some(check_finite(valuation_from_d(&inputs[i], d1, d2)));
    }

    out.into_iter()
        .map(|slot| slot.unwrap_or(Err(crate::PricingError::NonFinite)))
        .collect()
}
