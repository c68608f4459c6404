//! Portfolio Aggregator.
//!
//! Turns the current book into per-leg [`GreeksResult`]s and per-currency
//! [`NetGreeks`]. All legs are priced in one call to the batched engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{
    ExcludedPosition, ExclusionReason, GreeksResult, NetGreeks, Position, PricingInputs,
};
use pricing::PricingError;
use tracing::debug;

/// Output of one recompute
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskComputation {
    pub positions: Vec<GreeksResult>,
    pub net: Vec<NetGreeks>,
    pub excluded: Vec<ExcludedPosition>,
}

/// Pricing inputs for a leg as of `now`, or the reason it cannot be priced
pub fn pricing_inputs(
    position: &Position,
    now: DateTime<Utc>,
    rate: f64,
) -> Result<PricingInputs, ExclusionReason> {
    if position.is_expired(now) {
        return Err(ExclusionReason::Expired);
    }
    let (Some(spot), Some(volatility)) = (position.underlying_price, position.implied_volatility)
    else {
        return Err(ExclusionReason::MissingMarketData);
    };
    Ok(PricingInputs {
        spot,
        strike: position.strike,
        time_to_expiry: position.time_to_expiry(now).max(0.0),
        volatility,
        rate,
        option_type: position.option_type,
    })
}

fn exclusion_for(err: PricingError) -> ExclusionReason {
    match err {
        PricingError::NonFinite => ExclusionReason::NonFinite,
        other => ExclusionReason::InvalidInput(other.to_string()),
    }
}

/// Price every leg and sum per settlement currency.
///
/// Every currency present in the book gets a [`NetGreeks`] entry, even if all
/// of its legs were excluded.
pub fn aggregate<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    now: DateTime<Utc>,
    rate: f64,
) -> RiskComputation {
    let mut currencies: BTreeMap<String, NetGreeks> = BTreeMap::new();
    let mut priced: Vec<(&Position, PricingInputs)> = Vec::new();
    let mut excluded = Vec::new();

    for position in positions {
        currencies
            .entry(position.currency.clone())
            .or_insert_with(|| NetGreeks::empty(position.currency.clone()));

        match pricing_inputs(position, now, rate) {
            Ok(inputs) => priced.push((position, inputs)),
            Err(reason) => excluded.push(ExcludedPosition {
                instrument: position.instrument.clone(),
                reason,
            }),
        }
    }

    let inputs: Vec<PricingInputs> = priced.iter().map(|(_, inputs)| *inputs).collect();
    let valuations = pricing::evaluate_batch(&inputs);

    let mut results = Vec::with_capacity(priced.len());
    for ((position, inputs), valuation) in priced.into_iter().zip(valuations) {
        match valuation {
            Ok(valuation) => {
                let quantity = position.signed_quantity();
                results.push(GreeksResult {
                    instrument: position.instrument.clone(),
                    currency: position.currency.clone(),
                    signed_quantity: quantity,
                    inputs,
                    unit_price: valuation.price,
                    unit_greeks: valuation.greeks,
                    position_greeks: valuation.greeks.scaled(quantity),
                    position_value: valuation.price * quantity,
                });
            }
            Err(err) => excluded.push(ExcludedPosition {
                instrument: position.instrument.clone(),
                reason: exclusion_for(err),
            }),
        }
    }

    results.sort_by(|a, b| a.instrument.cmp(&b.instrument));
    excluded.sort_by(|a, b| a.instrument.cmp(&b.instrument));

    for result in &results {
        if let Some(net) = currencies.get_mut(&result.currency) {
            net.greeks += result.position_greeks;
            net.value += result.position_value;
            net.legs += 1;
        }
    }

    if !excluded.is_empty() {
        debug!(
            priced = results.len(),
            excluded = excluded.len(),
            "Legs excluded from aggregation"
        );
    }

    RiskComputation {
        positions: results,
        net: currencies.into_values().collect(),
        excluded,
    }
}

/// Sum weighted Greeks per currency, in the order the results are given.
pub fn net_by_currency(results: &[GreeksResult]) -> Vec<NetGreeks> {
    let mut currencies: BTreeMap<String, NetGreeks> = BTreeMap::new();
    for result in results {
        let net = currencies
            .entry(result.currency.clone())
            .or_insert_with(|| NetGreeks::empty(result.currency.clone()));
        net.greeks += result.position_greeks;
        net.value += result.position_value;
        net.legs += 1;
    }
    currencies.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{InstrumentName, Side};

    fn leg(name: &str, side: Side, quantity: f64, spot: f64, iv: f64) -> Position {
        let parsed = InstrumentName::parse(name).unwrap();
        let mut position = Position::from_instrument(&parsed, side, quantity);
        position.underlying_price = Some(spot);
        position.implied_volatility = Some(iv);
        position
    }

    fn now() -> DateTime<Utc> {
        InstrumentName::parse("ETH-27DEC30-3000-C").unwrap().expiry - Duration::days(90)
    }

    #[test]
    fn test_offsetting_calls_net_to_zero_delta() {
        let long = leg("ETH-27DEC30-3000-C", Side::Long, 1.0, 3050.0, 0.6);
        let mut short = long.clone();
        short.side = Side::Short;

        let computation = aggregate([&long, &short], now(), 0.05);
        let eth = &computation.net[0];
        assert_eq!(eth.legs, 2);
        assert_eq!(eth.greeks.delta, 0.0);
        assert_eq!(eth.greeks.gamma, 0.0);
        assert_eq!(eth.greeks.vega, 0.0);
        assert_eq!(eth.value, 0.0);
    }

    #[test]
    fn test_net_is_exact_sum_of_legs() {
        let legs = vec![
            leg("ETH-27DEC30-3000-C", Side::Long, 2.0, 3050.0, 0.6),
            leg("ETH-27DEC30-2500-P", Side::Short, 5.0, 3050.0, 0.72),
            leg("ETH-27DEC30-4000-C", Side::Short, 1.5, 3050.0, 0.55),
            leg("BTC-27DEC30-90000-C", Side::Long, 0.3, 88000.0, 0.5),
        ];
        let computation = aggregate(&legs, now(), 0.05);

        assert_eq!(computation.positions.len(), 4);
        assert!(computation.excluded.is_empty());
        assert_eq!(computation.net, net_by_currency(&computation.positions));

        let eth = computation.net.iter().find(|n| n.currency == "ETH").unwrap();
        let expected: f64 = computation
            .positions
            .iter()
            .filter(|p| p.currency == "ETH")
            .fold(0.0, |acc, p| acc + p.position_greeks.delta);
        assert_eq!(eth.greeks.delta, expected);
        assert_eq!(eth.legs, 3);
    }

    #[test]
    fn test_position_greeks_weighted_by_signed_quantity() {
        let legs = vec![leg("ETH-27DEC30-3000-C", Side::Short, 4.0, 3050.0, 0.6)];
        let computation = aggregate(&legs, now(), 0.05);
        let result = &computation.positions[0];
        assert_eq!(result.signed_quantity, -4.0);
        assert_eq!(result.position_greeks, result.unit_greeks.scaled(-4.0));
        assert_eq!(result.position_value, result.unit_price * -4.0);
        assert_eq!(result.inputs.rate, 0.05);
        assert!(result.inputs.time_to_expiry > 0.24 && result.inputs.time_to_expiry < 0.25);
    }

    #[test]
    fn test_exclusions_are_flagged() {
        let mut expired = leg("ETH-27DEC24-3000-C", Side::Long, 1.0, 3050.0, 0.6);
        expired.expiry = now() - Duration::hours(1);
        let mut no_data = leg("ETH-27DEC30-3200-C", Side::Long, 1.0, 3050.0, 0.6);
        no_data.implied_volatility = None;
        let zero_vol = leg("ETH-27DEC30-3400-C", Side::Long, 1.0, 3050.0, 0.0);
        let good = leg("ETH-27DEC30-3000-C", Side::Long, 1.0, 3050.0, 0.6);

        let computation = aggregate([&expired, &no_data, &zero_vol, &good], now(), 0.0);
        assert_eq!(computation.positions.len(), 1);
        assert_eq!(computation.excluded.len(), 3);

        let reason = |name: &str| {
            computation
                .excluded
                .iter()
                .find(|e| e.instrument == name)
                .map(|e| e.reason.clone())
                .unwrap()
        };
        assert_eq!(reason("ETH-27DEC24-3000-C"), ExclusionReason::Expired);
        assert_eq!(reason("ETH-27DEC30-3200-C"), ExclusionReason::MissingMarketData);
        assert!(matches!(
            reason("ETH-27DEC30-3400-C"),
            ExclusionReason::InvalidInput(_)
        ));

        let eth = &computation.net[0];
        assert_eq!(eth.legs, 1);
        assert_eq!(eth.greeks, computation.positions[0].position_greeks);
    }

    #[test]
    fn test_currency_with_only_excluded_legs_reports_empty_net() {
        let mut no_data = leg("BTC-27DEC30-90000-C", Side::Long, 1.0, 88000.0, 0.5);
        no_data.underlying_price = None;
        let computation = aggregate([&no_data], now(), 0.0);
        assert_eq!(computation.net, vec![NetGreeks::empty("BTC")]);
    }
}
