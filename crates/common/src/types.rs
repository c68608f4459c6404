//! Option and position primitives shared by the pricing and portfolio stages.

use std::ops::{Add, AddAssign, Mul};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instrument::InstrumentName;

/// Seconds in the 365-day year used for time-to-expiry.
pub const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// Option type (Call or Put)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Single-letter code used in instrument names
    pub fn code(&self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionType::Call => write!(f, "call"),
            OptionType::Put => write!(f, "put"),
        }
    }
}

/// Position side (long or short)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// Side implied by a signed size. Zero maps to long.
    pub fn from_signed(size: f64) -> Self {
        if size < 0.0 {
            Side::Short
        } else {
            Side::Long
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Inputs for one Black-Scholes valuation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingInputs {
    /// Spot price of the underlying
    pub spot: f64,
    /// Strike price
    pub strike: f64,
    /// Time to expiry in years
    pub time_to_expiry: f64,
    /// Implied volatility as a decimal (0.65 = 65%)
    pub volatility: f64,
    /// Continuously compounded risk-free rate
    pub rate: f64,
    pub option_type: OptionType,
}

/// Option sensitivities.
///
/// Theta is per year and vega per 1.0 of volatility. Use
/// [`Greeks::theta_per_day`] and [`Greeks::vega_per_point`] for the
/// trader-facing units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    /// Delta: dV/dS
    pub delta: f64,
    /// Gamma: d2V/dS2
    pub gamma: f64,
    /// Theta: dV/dt
    pub theta: f64,
    /// Vega: dV/dsigma
    pub vega: f64,
    /// Rho: dV/dr
    pub rho: f64,
    /// Vanna: d2V/dS dsigma
    pub vanna: f64,
    /// Volga: d2V/dsigma2
    pub volga: f64,
}

impl Greeks {
    pub const ZERO: Greeks = Greeks {
        delta: 0.0,
        gamma: 0.0,
        theta: 0.0,
        vega: 0.0,
        rho: 0.0,
        vanna: 0.0,
        volga: 0.0,
    };

    /// Scale every sensitivity by a quantity
    pub fn scaled(&self, factor: f64) -> Greeks {
        Greeks {
            delta: self.delta * factor,
            gamma: self.gamma * factor,
            theta: self.theta * factor,
            vega: self.vega * factor,
            rho: self.rho * factor,
            vanna: self.vanna * factor,
            volga: self.volga * factor,
        }
    }

    /// Theta per calendar day
    pub fn theta_per_day(&self) -> f64 {
        self.theta / 365.0
    }

    /// Vega per one volatility point (1%)
    pub fn vega_per_point(&self) -> f64 {
        self.vega / 100.0
    }

    /// True if every field is finite
    pub fn is_finite(&self) -> bool {
        [
            self.delta, self.gamma, self.theta, self.vega, self.rho, self.vanna, self.volga,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

impl Add for Greeks {
    type Output = Greeks;

    fn add(mut self, rhs: Greeks) -> Greeks {
        self += rhs;
        self
    }
}

impl AddAssign for Greeks {
    fn add_assign(&mut self, rhs: Greeks) {
        self.delta += rhs.delta;
        self.gamma += rhs.gamma;
        self.theta += rhs.theta;
        self.vega += rhs.vega;
        self.rho += rhs.rho;
        self.vanna += rhs.vanna;
        self.volga += rhs.volga;
    }
}

impl Mul<f64> for Greeks {
    type Output = Greeks;

    fn mul(self, rhs: f64) -> Greeks {
        self.scaled(rhs)
    }
}

/// A held option leg.
///
/// Market fields (`underlying_price`, `implied_volatility`) stay `None` until
/// the first ticker for the instrument arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    /// Settlement currency
    pub currency: String,
    pub side: Side,
    /// Absolute size
    pub quantity: f64,
    pub strike: f64,
    pub expiry: DateTime<Utc>,
    pub option_type: OptionType,
    pub underlying_price: Option<f64>,
    /// Decimal implied volatility
    pub implied_volatility: Option<f64>,
    /// Average entry price, when the feed reports one
    pub average_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Build a leg from a parsed instrument name with no market data yet
    pub fn from_instrument(name: &InstrumentName, side: Side, quantity: f64) -> Self {
        Self {
            instrument: name.as_str().to_string(),
            currency: name.currency.clone(),
            side,
            quantity: quantity.abs(),
            strike: name.strike,
            expiry: name.expiry,
            option_type: name.option_type,
            underlying_price: None,
            implied_volatility: None,
            average_price: None,
            updated_at: Utc::now(),
        }
    }

    /// Quantity with the side's sign applied
    pub fn signed_quantity(&self) -> f64 {
        self.quantity * self.side.sign()
    }

    /// Years until expiry. Negative once expiry has passed.
    pub fn time_to_expiry(&self, now: DateTime<Utc>) -> f64 {
        let millis = (self.expiry - now).num_milliseconds();
        millis as f64 / 1000.0 / SECONDS_PER_YEAR
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// Entry cost (average price times signed quantity)
    pub fn cost_basis(&self) -> Option<f64> {
        self.average_price.map(|p| p * self.signed_quantity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn greeks(v: f64) -> Greeks {
        Greeks {
            delta: v,
            gamma: v,
            theta: v,
            vega: v,
            rho: v,
            vanna: v,
            volga: v,
        }
    }

    #[test]
    fn test_side_sign() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::from_signed(-3.0), Side::Short);
        assert_eq!(Side::from_signed(2.0), Side::Long);
    }

    #[test]
    fn test_greeks_arithmetic() {
        let mut total = Greeks::ZERO;
        total += greeks(1.5);
        total += greeks(1.5) * -1.0;
        assert_eq!(total, Greeks::ZERO);

        let sum = greeks(1.0) + greeks(2.0);
        assert_eq!(sum.vega, 3.0);
    }

    #[test]
    fn test_greeks_display_units() {
        let g = Greeks {
            theta: -365.0,
            vega: 250.0,
            ..Greeks::ZERO
        };
        assert_eq!(g.theta_per_day(), -1.0);
        assert_eq!(g.vega_per_point(), 2.5);
    }

    #[test]
    fn test_greeks_finite() {
        assert!(greeks(1.0).is_finite());
        let bad = Greeks {
            gamma: f64::NAN,
            ..Greeks::ZERO
        };
        assert!(!bad.is_finite());
    }

    #[test]
    fn test_position_time_to_expiry() {
        let name = InstrumentName::parse("ETH-27DEC24-3000-C").unwrap();
        let mut position = Position::from_instrument(&name, Side::Short, 2.0);
        assert_eq!(position.signed_quantity(), -2.0);

        let now = name.expiry - Duration::days(365);
        assert!((position.time_to_expiry(now) - 1.0).abs() < 1e-12);
        assert!(!position.is_expired(now));
        assert!(position.is_expired(name.expiry));

        position.average_price = Some(0.05);
        assert_eq!(position.cost_basis(), Some(-0.1));
    }
}
