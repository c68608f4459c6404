//! Exchange instrument names.
//!
//! Option instruments are named `CCY-DMMMYY-STRIKE-C|P`, for example
//! `ETH-27DEC24-3000-C`. Fractional strikes use `d` as the decimal point
//! (`XRP_USDC-30JUN25-0d625-P`). Options settle at 08:00 UTC on the expiry
//! date.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::OptionType;

const SETTLEMENT_HOUR_UTC: u32 = 8;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// A parsed option instrument name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentName {
    raw: String,
    pub currency: String,
    pub expiry: DateTime<Utc>,
    pub strike: f64,
    pub option_type: OptionType,
}

impl InstrumentName {
    /// Parse an option instrument name
    pub fn parse(name: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() != 4 {
            return Err(Error::invalid_instrument(
                name,
                "expected CCY-DMMMYY-STRIKE-C|P",
            ));
        }

        let currency = parts[0];
        if currency.is_empty() {
            return Err(Error::invalid_instrument(name, "empty currency"));
        }

        let expiry = parse_expiry(parts[1]).ok_or_else(|| {
            Error::invalid_instrument(name, format!("bad expiry '{}'", parts[1]))
        })?;

        let strike: f64 = parts[2]
            .replace('d', ".")
            .parse()
            .map_err(|_| Error::invalid_instrument(name, format!("bad strike '{}'", parts[2])))?;
        if !strike.is_finite() || strike <= 0.0 {
            return Err(Error::invalid_instrument(name, "strike must be positive"));
        }

        let option_type = match parts[3] {
            "C" => OptionType::Call,
            "P" => OptionType::Put,
            other => {
                return Err(Error::invalid_instrument(
                    name,
                    format!("bad option type '{}'", other),
                ))
            }
        };

        Ok(Self {
            raw: name.to_string(),
            currency: settlement_currency(currency),
            expiry,
            strike,
            option_type,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for InstrumentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for InstrumentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Linear contracts (`XRP_USDC`) settle in the quote currency.
fn settlement_currency(prefix: &str) -> String {
    match prefix.split_once('_') {
        Some((_, quote)) if !quote.is_empty() => quote.to_string(),
        _ => prefix.to_string(),
    }
}

fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    if s.len() < 6 || s.len() > 7 || !s.is_ascii() {
        return None;
    }
    let (day, rest) = s.split_at(s.len() - 5);
    let (month, year) = rest.split_at(3);

    let day: u32 = day.parse().ok()?;
    let month = MONTHS.iter().position(|m| *m == month)? as u32 + 1;
    let year: i32 = year.parse().ok()?;

    let date = NaiveDate::from_ymd_opt(2000 + year, month, day)?;
    let settle = date.and_hms_opt(SETTLEMENT_HOUR_UTC, 0, 0)?;
    Some(Utc.from_utc_datetime(&settle))
}
