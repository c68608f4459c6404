//! Position Store.
//!
//! Holds the current book keyed by instrument. Every mutation validates the
//! whole message first and only then applies it, so a rejected message
//! leaves the store untouched.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use common::{InstrumentName, Position, Side};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PortfolioError;
use crate::Result;

/// Market data for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub instrument: String,
    pub underlying_price: Option<f64>,
    /// Decimal implied volatility
    pub implied_volatility: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// One leg as reported by the portfolio feed. `size` is signed; zero means
/// the leg is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub instrument: String,
    pub size: f64,
    pub average_price: Option<f64>,
    pub underlying_price: Option<f64>,
}

impl PositionUpdate {
    pub fn new(instrument: impl Into<String>, size: f64) -> Self {
        Self {
            instrument: instrument.into(),
            size,
            average_price: None,
            underlying_price: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortfolioUpdate {
    /// Changed legs only
    Delta { positions: Vec<PositionUpdate> },
    /// The complete book for one currency; unlisted legs are closed
    Snapshot {
        currency: String,
        positions: Vec<PositionUpdate>,
    },
}

/// Instruments touched by a portfolio update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortfolioChange {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl PortfolioChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionStore {
    positions: BTreeMap<String, Position>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load positions that do not come from the feed
    pub fn seed(&mut self, positions: impl IntoIterator<Item = Position>) {
        for position in positions {
            self.positions.insert(position.instrument.clone(), position);
        }
    }

    /// Patch spot and volatility of a held instrument.
    ///
    /// Returns `Ok(false)` for instruments not in the book or when nothing
    /// changed.
    pub fn apply_ticker(&mut self, update: &TickerUpdate) -> Result<bool> {
        if let Some(price) = update.underlying_price {
            if !price.is_finite() || price <= 0.0 {
                return Err(PortfolioError::invalid_update(format!(
                    "{}: underlying price {}",
                    update.instrument, price
                )));
            }
        }
        if let Some(iv) = update.implied_volatility {
            if !iv.is_finite() || iv < 0.0 {
                return Err(PortfolioError::invalid_update(format!(
                    "{}: implied volatility {}",
                    update.instrument, iv
                )));
            }
        }

        let Some(position) = self.positions.get_mut(&update.instrument) else {
            return Ok(false);
        };

        let mut changed = false;
        if update.underlying_price.is_some() && position.underlying_price != update.underlying_price
        {
            position.underlying_price = update.underlying_price;
            changed = true;
        }
        if update.implied_volatility.is_some()
            && position.implied_volatility != update.implied_volatility
        {
            position.implied_volatility = update.implied_volatility;
            changed = true;
        }
        if changed {
            position.updated_at = update.timestamp;
        }
        Ok(changed)
    }

    pub fn apply_portfolio(&mut self, update: &PortfolioUpdate) -> Result<PortfolioChange> {
        let entries = match update {
            PortfolioUpdate::Delta { positions } => positions,
            PortfolioUpdate::Snapshot { positions, .. } => positions,
        };

        let mut parsed = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.size.is_finite() {
                return Err(PortfolioError::invalid_update(format!(
                    "{}: size {}",
                    entry.instrument, entry.size
                )));
            }
            let name = InstrumentName::parse(&entry.instrument)
                .map_err(|e| PortfolioError::invalid_update(e.to_string()))?;
            if let PortfolioUpdate::Snapshot { currency, .. } = update {
                if &name.currency != currency {
                    return Err(PortfolioError::invalid_update(format!(
                        "{} does not settle in {}",
                        entry.instrument, currency
                    )));
                }
            }
            parsed.push((name, entry));
        }

        let mut change = PortfolioChange::default();

        if let PortfolioUpdate::Snapshot { currency, .. } = update {
            let listed: BTreeSet<&str> = entries
                .iter()
                .filter(|e| e.size != 0.0)
                .map(|e| e.instrument.as_str())
                .collect();
            let stale: Vec<String> = self
                .positions
                .values()
                .filter(|p| &p.currency == currency && !listed.contains(p.instrument.as_str()))
                .map(|p| p.instrument.clone())
                .collect();
            for instrument in stale {
                self.positions.remove(&instrument);
                change.removed.push(instrument);
            }
        }

        let now = Utc::now();
        for (name, entry) in parsed {
            if entry.size == 0.0 {
                if self.positions.remove(&entry.instrument).is_some() {
                    change.removed.push(entry.instrument.clone());
                }
                continue;
            }

            let side = Side::from_signed(entry.size);
            let quantity = entry.size.abs();

            match self.positions.get_mut(&entry.instrument) {
                Some(position) => {
                    let mut touched = false;
                    if position.side != side || position.quantity != quantity {
                        position.side = side;
                        position.quantity = quantity;
                        touched = true;
                    }
                    if entry.average_price.is_some() && position.average_price != entry.average_price
                    {
                        position.average_price = entry.average_price;
                        touched = true;
                    }
                    if position.underlying_price.is_none() && entry.underlying_price.is_some() {
                        position.underlying_price = entry.underlying_price;
                        touched = true;
                    }
                    if touched {
                        position.updated_at = now;
                        change.updated.push(entry.instrument.clone());
                    }
                }
                None => {
                    let mut position = Position::from_instrument(&name, side, quantity);
                    position.average_price = entry.average_price;
                    position.underlying_price = entry.underlying_price;
                    position.updated_at = now;
                    self.positions.insert(entry.instrument.clone(), position);
                    change.added.push(entry.instrument.clone());
                }
            }
        }

        if !change.is_empty() {
            debug!(
                added = change.added.len(),
                updated = change.updated.len(),
                removed = change.removed.len(),
                "Portfolio updated"
            );
        }
        Ok(change)
    }

    pub fn get(&self, instrument: &str) -> Option<&Position> {
        self.positions.get(instrument)
    }

    /// Legs in instrument order
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    pub fn currencies(&self) -> BTreeSet<String> {
        self.positions.values().map(|p| p.currency.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
