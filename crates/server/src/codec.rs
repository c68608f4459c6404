//! Binary push encoding.
//!
//! Every frame sent to a subscriber is one [`PushBatch`]. A snapshot travels
//! as a [`SnapshotUpdate`]: either full, or a diff against the snapshot the
//! subscriber was last sent (`base_sequence`). In a diff, a field that did
//! not change is omitted, a leg or currency that did not change is left out
//! entirely, and removed legs and currencies are listed by name.
//!
//! [`ClientView`] rebuilds the full snapshot from a stream of updates.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use common::{
    ExcludedPosition, ExclusionReason, Greeks, GreeksResult, NetGreeks, OptionType,
    PortfolioSnapshot, PricingInputs, SnapshotTrigger,
};
use prost::Message;
use uuid::Uuid;

use crate::error::{Result, ServerError};

/// One binary frame
#[derive(Clone, PartialEq, prost::Message)]
pub struct PushBatch {
    #[prost(message, repeated, tag = "1")]
    pub envelopes: Vec<PushEnvelope>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushEnvelope {
    #[prost(oneof = "push_envelope::Kind", tags = "1, 2")]
    pub kind: Option<push_envelope::Kind>,
}

pub mod push_envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Snapshot(super::SnapshotUpdate),
        #[prost(message, tag = "2")]
        Heartbeat(super::Heartbeat),
    }
}

impl PushEnvelope {
    pub fn snapshot(update: SnapshotUpdate) -> Self {
        Self {
            kind: Some(push_envelope::Kind::Snapshot(update)),
        }
    }

    pub fn heartbeat(heartbeat: Heartbeat) -> Self {
        Self {
            kind: Some(push_envelope::Kind::Heartbeat(heartbeat)),
        }
    }

    pub fn as_snapshot(&self) -> Option<&SnapshotUpdate> {
        match &self.kind {
            Some(push_envelope::Kind::Snapshot(update)) => Some(update),
            _ => None,
        }
    }

    pub fn as_heartbeat(&self) -> Option<&Heartbeat> {
        match &self.kind {
            Some(push_envelope::Kind::Heartbeat(heartbeat)) => Some(heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, prost::Enumeration)]
pub enum TriggerKind {
    Unspecified = 0,
    Change = 1,
    Periodic = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, prost::Enumeration)]
pub enum OptionKind {
    Unspecified = 0,
    Call = 1,
    Put = 2,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SnapshotUpdate {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
    /// Sequence this diff applies to; absent on a full update
    #[prost(uint64, optional, tag = "3")]
    pub base_sequence: Option<u64>,
    #[prost(message, optional, tag = "4")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(enumeration = "TriggerKind", tag = "5")]
    pub trigger: i32,
    #[prost(message, repeated, tag = "6")]
    pub positions: Vec<PositionDelta>,
    #[prost(string, repeated, tag = "7")]
    pub removed_positions: Vec<String>,
    #[prost(message, repeated, tag = "8")]
    pub net: Vec<NetGreeksDelta>,
    #[prost(string, repeated, tag = "9")]
    pub removed_currencies: Vec<String>,
    /// Whole exclusion list, present only when it changed
    #[prost(message, optional, tag = "10")]
    pub excluded: Option<ExclusionList>,
}

impl SnapshotUpdate {
    pub fn is_full(&self) -> bool {
        self.base_sequence.is_none()
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GreeksFields {
    #[prost(double, optional, tag = "1")]
    pub delta: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub gamma: Option<f64>,
    #[prost(double, optional, tag = "3")]
    pub theta: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub vega: Option<f64>,
    #[prost(double, optional, tag = "5")]
    pub rho: Option<f64>,
    #[prost(double, optional, tag = "6")]
    pub vanna: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub volga: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PositionDelta {
    #[prost(string, tag = "1")]
    pub instrument: String,
    #[prost(string, optional, tag = "2")]
    pub currency: Option<String>,
    #[prost(double, optional, tag = "3")]
    pub signed_quantity: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub spot: Option<f64>,
    #[prost(double, optional, tag = "5")]
    pub strike: Option<f64>,
    #[prost(double, optional, tag = "6")]
    pub time_to_expiry: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub volatility: Option<f64>,
    #[prost(double, optional, tag = "8")]
    pub rate: Option<f64>,
    #[prost(enumeration = "OptionKind", optional, tag = "9")]
    pub option_type: Option<i32>,
    #[prost(double, optional, tag = "10")]
    pub unit_price: Option<f64>,
    #[prost(message, optional, tag = "11")]
    pub unit_greeks: Option<GreeksFields>,
    #[prost(message, optional, tag = "12")]
    pub position_greeks: Option<GreeksFields>,
    #[prost(double, optional, tag = "13")]
    pub position_value: Option<f64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NetGreeksDelta {
    #[prost(string, tag = "1")]
    pub currency: String,
    #[prost(message, optional, tag = "2")]
    pub greeks: Option<GreeksFields>,
    #[prost(double, optional, tag = "3")]
    pub value: Option<f64>,
    #[prost(uint32, optional, tag = "4")]
    pub legs: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExclusionList {
    #[prost(message, repeated, tag = "1")]
    pub notices: Vec<ExclusionNotice>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExclusionNotice {
    #[prost(string, tag = "1")]
    pub instrument: String,
    #[prost(string, tag = "2")]
    pub kind: String,
    #[prost(string, optional, tag = "3")]
    pub detail: Option<String>,
}

/// Liveness message sent on a fixed cadence, independent of data traffic
#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    pub service: String,
    #[prost(string, tag = "3")]
    pub feed_state: String,
    #[prost(uint32, tag = "4")]
    pub reconnect_attempt: u32,
    #[prost(uint64, tag = "5")]
    pub total_reconnects: u64,
    #[prost(bool, tag = "6")]
    pub stale: bool,
    #[prost(uint64, optional, tag = "7")]
    pub message_age_ms: Option<u64>,
    #[prost(uint64, optional, tag = "8")]
    pub last_sequence: Option<u64>,
    #[prost(uint32, tag = "9")]
    pub subscribers: u32,
    #[prost(uint64, tag = "10")]
    pub uptime_seconds: u64,
    #[prost(message, optional, tag = "11")]
    pub last_event: Option<HealthNotice>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthNotice {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    pub severity: String,
    #[prost(string, tag = "3")]
    pub component: String,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(uint32, tag = "5")]
    pub reconnect_attempt: u32,
}

pub fn encode_batch(envelopes: Vec<PushEnvelope>) -> Vec<u8> {
    PushBatch { envelopes }.encode_to_vec()
}

pub fn decode_batch(bytes: &[u8]) -> Result<PushBatch> {
    Ok(PushBatch::decode(bytes)?)
}

pub fn to_timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

pub fn from_timestamp(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, u32::try_from(ts.nanos).ok()?)
        .single()
}

/// Bitwise comparison, so `-0.0` and NaN payloads count as changes too
fn changed(prev: f64, next: f64) -> Option<f64> {
    (prev.to_bits() != next.to_bits()).then_some(next)
}

fn greeks_fields(greeks: &Greeks) -> GreeksFields {
    GreeksFields {
        delta: Some(greeks.delta),
        gamma: Some(greeks.gamma),
        theta: Some(greeks.theta),
        vega: Some(greeks.vega),
        rho: Some(greeks.rho),
        vanna: Some(greeks.vanna),
        volga: Some(greeks.volga),
    }
}

fn greeks_diff(prev: &Greeks, next: &Greeks) -> Option<GreeksFields> {
    let fields = GreeksFields {
        delta: changed(prev.delta, next.delta),
        gamma: changed(prev.gamma, next.gamma),
        theta: changed(prev.theta, next.theta),
        vega: changed(prev.vega, next.vega),
        rho: changed(prev.rho, next.rho),
        vanna: changed(prev.vanna, next.vanna),
        volga: changed(prev.volga, next.volga),
    };
    (fields != GreeksFields::default()).then_some(fields)
}

fn option_kind(option_type: OptionType) -> OptionKind {
    match option_type {
        OptionType::Call => OptionKind::Call,
        OptionType::Put => OptionKind::Put,
    }
}

fn full_position(result: &GreeksResult) -> PositionDelta {
    PositionDelta {
        instrument: result.instrument.clone(),
        currency: Some(result.currency.clone()),
        signed_quantity: Some(result.signed_quantity),
        spot: Some(result.inputs.spot),
        strike: Some(result.inputs.strike),
        time_to_expiry: Some(result.inputs.time_to_expiry),
        volatility: Some(result.inputs.volatility),
        rate: Some(result.inputs.rate),
        option_type: Some(option_kind(result.inputs.option_type) as i32),
        unit_price: Some(result.unit_price),
        unit_greeks: Some(greeks_fields(&result.unit_greeks)),
        position_greeks: Some(greeks_fields(&result.position_greeks)),
        position_value: Some(result.position_value),
    }
}

fn position_diff(prev: &GreeksResult, next: &GreeksResult) -> Option<PositionDelta> {
    let delta = PositionDelta {
        instrument: next.instrument.clone(),
        currency: (prev.currency != next.currency).then(|| next.currency.clone()),
        signed_quantity: changed(prev.signed_quantity, next.signed_quantity),
        spot: changed(prev.inputs.spot, next.inputs.spot),
        strike: changed(prev.inputs.strike, next.inputs.strike),
        time_to_expiry: changed(prev.inputs.time_to_expiry, next.inputs.time_to_expiry),
        volatility: changed(prev.inputs.volatility, next.inputs.volatility),
        rate: changed(prev.inputs.rate, next.inputs.rate),
        option_type: (prev.inputs.option_type != next.inputs.option_type)
            .then(|| option_kind(next.inputs.option_type) as i32),
        unit_price: changed(prev.unit_price, next.unit_price),
        unit_greeks: greeks_diff(&prev.unit_greeks, &next.unit_greeks),
        position_greeks: greeks_diff(&prev.position_greeks, &next.position_greeks),
        position_value: changed(prev.position_value, next.position_value),
    };
    let untouched = PositionDelta {
        instrument: next.instrument.clone(),
        ..PositionDelta::default()
    };
    (delta != untouched).then_some(delta)
}

fn net_diff(prev: Option<&NetGreeks>, next: &NetGreeks) -> Option<NetGreeksDelta> {
    match prev {
        None => Some(NetGreeksDelta {
            currency: next.currency.clone(),
            greeks: Some(greeks_fields(&next.greeks)),
            value: Some(next.value),
            legs: Some(next.legs),
        }),
        Some(prev) => {
            let delta = NetGreeksDelta {
                currency: next.currency.clone(),
                greeks: greeks_diff(&prev.greeks, &next.greeks),
                value: changed(prev.value, next.value),
                legs: (prev.legs != next.legs).then_some(next.legs),
            };
            (delta.greeks.is_some() || delta.value.is_some() || delta.legs.is_some())
                .then_some(delta)
        }
    }
}

fn exclusion_notice(excluded: &ExcludedPosition) -> ExclusionNotice {
    let (kind, detail) = match &excluded.reason {
        ExclusionReason::Expired => ("expired", None),
        ExclusionReason::MissingMarketData => ("missing_market_data", None),
        ExclusionReason::InvalidInput(msg) => ("invalid_input", Some(msg.clone())),
        ExclusionReason::NonFinite => ("non_finite", None),
    };
    ExclusionNotice {
        instrument: excluded.instrument.clone(),
        kind: kind.to_string(),
        detail,
    }
}

fn exclusion_from_notice(notice: &ExclusionNotice) -> Result<ExcludedPosition> {
    let reason = match notice.kind.as_str() {
        "expired" => ExclusionReason::Expired,
        "missing_market_data" => ExclusionReason::MissingMarketData,
        "invalid_input" => ExclusionReason::InvalidInput(notice.detail.clone().unwrap_or_default()),
        "non_finite" => ExclusionReason::NonFinite,
        other => {
            return Err(ServerError::malformed(format!(
                "unknown exclusion kind '{}'",
                other
            )))
        }
    };
    Ok(ExcludedPosition {
        instrument: notice.instrument.clone(),
        reason,
    })
}

fn exclusion_list(excluded: &[ExcludedPosition]) -> ExclusionList {
    ExclusionList {
        notices: excluded.iter().map(exclusion_notice).collect(),
    }
}

/// Update carrying `next` in full
pub fn full_update(next: &PortfolioSnapshot) -> SnapshotUpdate {
    diff_snapshot(None, next)
}

/// Update taking a holder of `base` to `next`.
///
/// Falls back to a full update when there is no base or it belongs to
/// another session.
pub fn diff_snapshot(base: Option<&PortfolioSnapshot>, next: &PortfolioSnapshot) -> SnapshotUpdate {
    let base = base.filter(|b| b.session_id == next.session_id);
    let trigger = match next.trigger {
        SnapshotTrigger::Change => TriggerKind::Change,
        SnapshotTrigger::Periodic => TriggerKind::Periodic,
    };

    let mut update = SnapshotUpdate {
        session_id: next.session_id.to_string(),
        sequence: next.sequence,
        base_sequence: base.map(|b| b.sequence),
        timestamp: Some(to_timestamp(next.timestamp)),
        trigger: trigger as i32,
        ..SnapshotUpdate::default()
    };

    let Some(base) = base else {
        update.positions = next.positions.iter().map(full_position).collect();
        update.net = next.net.iter().filter_map(|n| net_diff(None, n)).collect();
        update.excluded = Some(exclusion_list(&next.excluded));
        return update;
    };

    let before: BTreeMap<&str, &GreeksResult> = base
        .positions
        .iter()
        .map(|p| (p.instrument.as_str(), p))
        .collect();
    for position in &next.positions {
        let delta = match before.get(position.instrument.as_str()) {
            Some(prev) => position_diff(prev, position),
            None => Some(full_position(position)),
        };
        update.positions.extend(delta);
    }
    update.removed_positions = base
        .positions
        .iter()
        .filter(|p| next.position(&p.instrument).is_none())
        .map(|p| p.instrument.clone())
        .collect();

    for net in &next.net {
        update.net.extend(net_diff(base.net_for(&net.currency), net));
    }
    update.removed_currencies = base
        .net
        .iter()
        .filter(|n| next.net_for(&n.currency).is_none())
        .map(|n| n.currency.clone())
        .collect();

    if base.excluded != next.excluded {
        update.excluded = Some(exclusion_list(&next.excluded));
    }
    update
}

fn patch_greeks(greeks: &mut Greeks, fields: &GreeksFields) {
    let slots = [
        (&mut greeks.delta, fields.delta),
        (&mut greeks.gamma, fields.gamma),
        (&mut greeks.theta, fields.theta),
        (&mut greeks.vega, fields.vega),
        (&mut greeks.rho, fields.rho),
        (&mut greeks.vanna, fields.vanna),
        (&mut greeks.volga, fields.volga),
    ];
    for (slot, value) in slots {
        if let Some(value) = value {
            *slot = value;
        }
    }
}

fn complete_greeks(fields: Option<&GreeksFields>, what: &str) -> Result<Greeks> {
    let fields = fields.ok_or_else(|| ServerError::malformed(format!("{} missing", what)))?;
    let require = |v: Option<f64>, name: &str| {
        v.ok_or_else(|| ServerError::malformed(format!("{}.{} missing", what, name)))
    };
    Ok(Greeks {
        delta: require(fields.delta, "delta")?,
        gamma: require(fields.gamma, "gamma")?,
        theta: require(fields.theta, "theta")?,
        vega: require(fields.vega, "vega")?,
        rho: require(fields.rho, "rho")?,
        vanna: require(fields.vanna, "vanna")?,
        volga: require(fields.volga, "volga")?,
    })
}

fn decode_option_type(raw: i32) -> Result<OptionType> {
    match OptionKind::try_from(raw) {
        Ok(OptionKind::Call) => Ok(OptionType::Call),
        Ok(OptionKind::Put) => Ok(OptionType::Put),
        _ => Err(ServerError::malformed(format!("option type {}", raw))),
    }
}

fn new_position(delta: &PositionDelta) -> Result<GreeksResult> {
    let require = |v: Option<f64>, name: &str| {
        v.ok_or_else(|| {
            ServerError::malformed(format!("new leg {} missing {}", delta.instrument, name))
        })
    };
    let option_type = delta
        .option_type
        .ok_or_else(|| ServerError::malformed(format!("new leg {} missing option type", delta.instrument)))
        .and_then(decode_option_type)?;

    Ok(GreeksResult {
        instrument: delta.instrument.clone(),
        currency: delta
            .currency
            .clone()
            .ok_or_else(|| ServerError::malformed(format!("new leg {} missing currency", delta.instrument)))?,
        signed_quantity: require(delta.signed_quantity, "signed quantity")?,
        inputs: PricingInputs {
            spot: require(delta.spot, "spot")?,
            strike: require(delta.strike, "strike")?,
            time_to_expiry: require(delta.time_to_expiry, "time to expiry")?,
            volatility: require(delta.volatility, "volatility")?,
            rate: require(delta.rate, "rate")?,
            option_type,
        },
        unit_price: require(delta.unit_price, "unit price")?,
        unit_greeks: complete_greeks(delta.unit_greeks.as_ref(), "unit greeks")?,
        position_greeks: complete_greeks(delta.position_greeks.as_ref(), "position greeks")?,
        position_value: require(delta.position_value, "position value")?,
    })
}

fn patch_position(position: &mut GreeksResult, delta: &PositionDelta) -> Result<()> {
    if let Some(currency) = &delta.currency {
        position.currency = currency.clone();
    }
    let slots = [
        (&mut position.signed_quantity, delta.signed_quantity),
        (&mut position.inputs.spot, delta.spot),
        (&mut position.inputs.strike, delta.strike),
        (&mut position.inputs.time_to_expiry, delta.time_to_expiry),
        (&mut position.inputs.volatility, delta.volatility),
        (&mut position.inputs.rate, delta.rate),
        (&mut position.unit_price, delta.unit_price),
        (&mut position.position_value, delta.position_value),
    ];
    for (slot, value) in slots {
        if let Some(value) = value {
            *slot = value;
        }
    }
    if let Some(raw) = delta.option_type {
        position.inputs.option_type = decode_option_type(raw)?;
    }
    if let Some(fields) = &delta.unit_greeks {
        patch_greeks(&mut position.unit_greeks, fields);
    }
    if let Some(fields) = &delta.position_greeks {
        patch_greeks(&mut position.position_greeks, fields);
    }
    Ok(())
}

fn apply_net(prev: Option<NetGreeks>, delta: &NetGreeksDelta) -> Result<NetGreeks> {
    match prev {
        Some(mut net) => {
            if let Some(fields) = &delta.greeks {
                patch_greeks(&mut net.greeks, fields);
            }
            if let Some(value) = delta.value {
                net.value = value;
            }
            if let Some(legs) = delta.legs {
                net.legs = legs;
            }
            Ok(net)
        }
        None => Ok(NetGreeks {
            currency: delta.currency.clone(),
            greeks: complete_greeks(delta.greeks.as_ref(), "net greeks")?,
            value: delta
                .value
                .ok_or_else(|| ServerError::malformed(format!("new net {} missing value", delta.currency)))?,
            legs: delta
                .legs
                .ok_or_else(|| ServerError::malformed(format!("new net {} missing legs", delta.currency)))?,
        }),
    }
}

/// Client-side reconstruction of the full snapshot from pushed updates
#[derive(Debug, Clone, Default)]
pub struct ClientView {
    current: Option<PortfolioSnapshot>,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<&PortfolioSnapshot> {
        self.current.as_ref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.current.as_ref().map(|s| s.sequence)
    }

    /// Apply one update. A diff whose base is not the held snapshot is
    /// rejected and leaves the view unchanged; the client should resync.
    pub fn apply(&mut self, update: &SnapshotUpdate) -> Result<&PortfolioSnapshot> {
        let session_id = Uuid::parse_str(&update.session_id)
            .map_err(|e| ServerError::malformed(format!("session id: {}", e)))?;
        let timestamp = update
            .timestamp
            .as_ref()
            .and_then(from_timestamp)
            .ok_or_else(|| ServerError::malformed("missing timestamp"))?;
        let trigger = match TriggerKind::try_from(update.trigger) {
            Ok(TriggerKind::Change) => SnapshotTrigger::Change,
            Ok(TriggerKind::Periodic) => SnapshotTrigger::Periodic,
            _ => return Err(ServerError::malformed(format!("trigger {}", update.trigger))),
        };

        let (mut positions, mut net, mut excluded) = match update.base_sequence {
            None => (BTreeMap::new(), BTreeMap::new(), Vec::new()),
            Some(base) => {
                let held = self
                    .current
                    .as_ref()
                    .filter(|s| s.sequence == base && s.session_id == session_id)
                    .ok_or(ServerError::BaselineMismatch {
                        base,
                        held: self.sequence(),
                    })?;
                (
                    held.positions
                        .iter()
                        .map(|p| (p.instrument.clone(), p.clone()))
                        .collect::<BTreeMap<_, _>>(),
                    held.net
                        .iter()
                        .map(|n| (n.currency.clone(), n.clone()))
                        .collect::<BTreeMap<_, _>>(),
                    held.excluded.clone(),
                )
            }
        };

        for instrument in &update.removed_positions {
            positions.remove(instrument);
        }
        for delta in &update.positions {
            match positions.get_mut(&delta.instrument) {
                Some(position) => patch_position(position, delta)?,
                None => {
                    positions.insert(delta.instrument.clone(), new_position(delta)?);
                }
            }
        }

        for currency in &update.removed_currencies {
            net.remove(currency);
        }
        for delta in &update.net {
            let next = apply_net(net.remove(&delta.currency), delta)?;
            net.insert(delta.currency.clone(), next);
        }

        if let Some(list) = &update.excluded {
            excluded = list
                .notices
                .iter()
                .map(exclusion_from_notice)
                .collect::<Result<Vec<_>>>()?;
        }

        let snapshot = PortfolioSnapshot {
            session_id,
            sequence: update.sequence,
            timestamp,
            trigger,
            positions: positions.into_values().collect(),
            net: net.into_values().collect(),
            excluded,
        };
        Ok(&*self.current.insert(snapshot))
    }
}
