use std::f64::consts::PI;

use crate::error::PricingError;
use crate::{Greeks, OptionType, PricingInputs, Result, Valuation};

pub const MIN_VOL: f64 = 0.01;
pub const MAX_VOL: f64 = 5.0;

const IV_TOLERANCE: f64 = 1e-8;
const IV_MAX_ITERATIONS: usize = 100;

pub fn norm_pdf(x: f64) -> f64 {
    (1.0 / (2.0 * PI).sqrt()) * (-0.5 * x * x).exp()
}

/// Abramowitz-Stegun 26.2.17, absolute error below 7.5e-8.
pub fn norm_cdf(x: f64) -> f64 {
    let k = 1.0 / (1.0 + 0.2316419 * x.abs());
    let poly = k * (0.319381530
        + k * (-0.356563782 + k * (1.781477937 + k * (-1.821255978 + k * 1.330274429))));

    let approx = 1.0 - norm_pdf(x) * poly;

    if x >= 0.0 {
        approx
    } else {
        1.0 - approx
    }
}

pub fn intrinsic_value(spot: f64, strike: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

/// Reject inputs outside the model's domain.
pub(crate) fn validate(input: &PricingInputs) -> Result<()> {
    if !input.volatility.is_finite() || input.volatility <= 0.0 {
        return Err(PricingError::InvalidVolatility(input.volatility));
    }
    if !input.spot.is_finite() || input.spot <= 0.0 {
        return Err(PricingError::input("spot", input.spot));
    }
    if !input.strike.is_finite() || input.strike <= 0.0 {
        return Err(PricingError::input("strike", input.strike));
    }
    if !input.time_to_expiry.is_finite() || input.time_to_expiry < 0.0 {
        return Err(PricingError::input("time_to_expiry", input.time_to_expiry));
    }
    if !input.rate.is_finite() {
        return Err(PricingError::input("rate", input.rate));
    }
    Ok(())
}

#[inline]
pub(crate) fn d1_d2(spot: f64, strike: f64, time: f64, vol: f64, rate: f64) -> (f64, f64) {
    let vol_sqrt_t = vol * time.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * vol * vol) * time) / vol_sqrt_t;
    (d1, d1 - vol_sqrt_t)
}

/// Valuation at expiry: intrinsic value, digital delta, everything else zero.
pub(crate) fn expiry_valuation(input: &PricingInputs) -> Valuation {
    let price = intrinsic_value(input.spot, input.strike, input.option_type);
    let delta = match input.option_type {
        OptionType::Call if input.spot > input.strike => 1.0,
        OptionType::Put if input.spot < input.strike => -1.0,
        _ => 0.0,
    };
    Valuation {
        price,
        greeks: Greeks {
            delta,
            ..Greeks::ZERO
        },
    }
}

/// Closed-form price and Greeks for `time_to_expiry > 0` given d1/d2.
#[inline]
pub(crate) fn valuation_from_d(input: &PricingInputs, d1: f64, d2: f64) -> Valuation {
    let s = input.spot;
    let k = input.strike;
    let t = input.time_to_expiry;
    let v = input.volatility;
    let r = input.rate;

    let pdf = norm_pdf(d1);
    let sqrt_t = t.sqrt();
    let discount = (-r * t).exp();

    let (price, delta, theta, rho) = match input.option_type {
        OptionType::Call => {
            let nd1 = norm_cdf(d1);
            let nd2 = norm_cdf(d2);
            (
                s * nd1 - k * discount * nd2,
                nd1,
                -(s * pdf * v) / (2.0 * sqrt_t) - r * k * discount * nd2,
                k * t * discount * nd2,
            )
        }
        OptionType::Put => {
            let n_minus_d1 = norm_cdf(-d1);
            let n_minus_d2 = norm_cdf(-d2);
            (
                k * discount * n_minus_d2 - s * n_minus_d1,
                norm_cdf(d1) - 1.0,
                -(s * pdf * v) / (2.0 * sqrt_t) + r * k * discount * n_minus_d2,
                -k * t * discount * n_minus_d2,
            )
        }
    };

    let gamma = pdf / (s * v * sqrt_t);
    let vega = s * pdf * sqrt_t;
    let vanna = -pdf * d2 / v;
    let volga = vega * d1 * d2 / v;

    Valuation {
        price: price.max(0.0),
        greeks: Greeks {
            delta,
            gamma,
            theta,
            vega,
            rho,
            vanna,
            volga,
        },
    }
}

pub(crate) fn check_finite(valuation: Valuation) -> Result<Valuation> {
    if valuation.price.is_finite() && valuation.greeks.is_finite() {
        Ok(valuation)
    } else {
        Err(PricingError::NonFinite)
    }
}

/// Price and Greeks for one option.
///
/// Theta is per year, vega and volga per 1.0 of volatility, rho per 1.0 of
/// rate.
pub fn evaluate(input: &PricingInputs) -> Result<Valuation> {
    validate(input)?;
    if input.time_to_expiry == 0.0 {
        return Ok(expiry_valuation(input));
    }
    let (d1, d2) = d1_d2(
        input.spot,
        input.strike,
        input.time_to_expiry,
        input.volatility,
        input.rate,
    );
    check_finite(valuation_from_d(input, d1, d2))
}

/// Newton-Raphson implied volatility, bounded to `[MIN_VOL, MAX_VOL]`.
///
/// `input.volatility` is ignored.
pub fn implied_volatility(market_price: f64, input: &PricingInputs) -> Result<f64> {
    if !market_price.is_finite() || market_price <= 0.0 {
        return Err(PricingError::input("market_price", market_price));
    }
    if input.time_to_expiry <= 0.0 {
        return Err(PricingError::input("time_to_expiry", input.time_to_expiry));
    }

    let mut trial = PricingInputs {
        volatility: 0.3,
        ..*input
    };
    validate(&trial)?;

    for _ in 0..IV_MAX_ITERATIONS {
        let valuation = evaluate(&trial)?;
        let diff = valuation.price - market_price;

        if diff.abs() < IV_TOLERANCE * market_price.max(1.0) {
            return Ok(trial.volatility);
        }

        if valuation.greeks.vega.abs() < 1e-10 {
            break;
        }

        trial.volatility = (trial.volatility - diff / valuation.greeks.vega).clamp(MIN_VOL, MAX_VOL);
    }

    Err(PricingError::NoConvergence(market_price))
}
