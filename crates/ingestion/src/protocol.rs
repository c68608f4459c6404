//! Exchange wire protocol.
//!
//! The feed speaks JSON-RPC 2.0 over a websocket. Requests carry a
//! client-assigned id and their responses are matched back through a
//! [`RequestTracker`]. Channel notifications arrive as `subscription`
//! messages; the exchange probes liveness with `heartbeat` messages of type
//! `test_request`, which must be answered with `public/test`.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use portfolio::{PortfolioUpdate, PositionUpdate, TickerUpdate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::IngestionError;
use crate::Result;

pub const AUTH: &str = "public/auth";
pub const SET_HEARTBEAT: &str = "public/set_heartbeat";
pub const TEST: &str = "public/test";
pub const PUBLIC_SUBSCRIBE: &str = "public/subscribe";
pub const PRIVATE_SUBSCRIBE: &str = "private/subscribe";
pub const PUBLIC_UNSUBSCRIBE: &str = "public/unsubscribe";
pub const PRIVATE_UNSUBSCRIBE: &str = "private/unsubscribe";
pub const GET_POSITIONS: &str = "private/get_positions";

const TICKER_PREFIX: &str = "ticker.";
const PORTFOLIO_PREFIX: &str = "user.changes.";

pub fn ticker_channel(instrument: &str, interval: &str) -> String {
    format!("{}{}.{}", TICKER_PREFIX, instrument, interval)
}

pub fn portfolio_channel(currency: &str, interval: &str) -> String {
    format!("{}option.{}.{}", PORTFOLIO_PREFIX, currency, interval)
}

pub fn is_private_channel(channel: &str) -> bool {
    channel.starts_with("user.")
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<String> {
    Ok(serde_json::to_string(&RpcRequest {
        jsonrpc: "2.0",
        id,
        method,
        params,
    })?)
}

/// What an outstanding request was for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequest {
    Auth,
    Refresh,
    SetHeartbeat,
    Test,
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Positions { currency: String },
}

impl PendingRequest {
    pub fn method(&self) -> &'static str {
        match self {
            PendingRequest::Auth | PendingRequest::Refresh => AUTH,
            PendingRequest::SetHeartbeat => SET_HEARTBEAT,
            PendingRequest::Test => TEST,
            PendingRequest::Subscribe(_) => PUBLIC_SUBSCRIBE,
            PendingRequest::Unsubscribe(_) => PUBLIC_UNSUBSCRIBE,
            PendingRequest::Positions { .. } => GET_POSITIONS,
        }
    }
}

/// Assigns request ids and remembers what each one was for
#[derive(Debug, Default)]
pub struct RequestTracker {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, request: PendingRequest) -> u64 {
        self.next_id += 1;
        self.pending.insert(self.next_id, request);
        self.next_id
    }

    pub fn resolve(&mut self, id: u64) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatKind {
    /// The exchange expects a `public/test` call in reply
    TestRequest,
    Heartbeat,
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response { id: u64, result: Value },
    Error { id: Option<u64>, error: RpcError },
    Notification { channel: String, data: Value },
    Heartbeat(HeartbeatKind),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<u64>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionParams {
    channel: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct HeartbeatParams {
    #[serde(rename = "type")]
    kind: String,
}

pub fn decode(text: &str) -> Result<Inbound> {
    let raw: RawMessage = serde_json::from_str(text)?;

    if let Some(error) = raw.error {
        return Ok(Inbound::Error { id: raw.id, error });
    }
    if let Some(id) = raw.id {
        return Ok(Inbound::Response {
            id,
            result: raw.result.unwrap_or(Value::Null),
        });
    }

    let params = raw
        .params
        .ok_or_else(|| IngestionError::protocol("message without id or params"))?;
    match raw.method.as_deref() {
        Some("subscription") => {
            let params: SubscriptionParams = serde_json::from_value(params)?;
            Ok(Inbound::Notification {
                channel: params.channel,
                data: params.data,
            })
        }
        Some("heartbeat") => {
            let params: HeartbeatParams = serde_json::from_value(params)?;
            Ok(Inbound::Heartbeat(match params.kind.as_str() {
                "test_request" => HeartbeatKind::TestRequest,
                _ => HeartbeatKind::Heartbeat,
            }))
        }
        Some(other) => Err(IngestionError::protocol(format!("unknown method '{}'", other))),
        None => Err(IngestionError::protocol("notification without method")),
    }
}

/// Book-relevant content of a channel notification
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Ticker(TickerUpdate),
    Portfolio(PortfolioUpdate),
}

#[derive(Debug, Deserialize)]
struct TickerData {
    instrument_name: String,
    underlying_price: Option<f64>,
    index_price: Option<f64>,
    /// Percent
    mark_iv: Option<f64>,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct PositionData {
    instrument_name: String,
    size: f64,
    average_price: Option<f64>,
    index_price: Option<f64>,
    kind: Option<String>,
}

impl PositionData {
    fn is_option(&self) -> bool {
        self.kind.as_deref().map_or(true, |kind| kind == "option")
    }

    fn into_update(self) -> PositionUpdate {
        PositionUpdate {
            instrument: self.instrument_name,
            size: self.size,
            average_price: self.average_price,
            underlying_price: self.index_price,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangesData {
    #[serde(default)]
    positions: Vec<PositionData>,
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| IngestionError::protocol(format!("bad timestamp {}", millis)))
}

/// Decode a channel notification. Channels the book does not track yield
/// `Ok(None)`.
pub fn decode_notification(channel: &str, data: Value) -> Result<Option<FeedEvent>> {
    if channel.starts_with(TICKER_PREFIX) {
        let ticker: TickerData = serde_json::from_value(data)?;
        return Ok(Some(FeedEvent::Ticker(TickerUpdate {
            underlying_price: ticker.underlying_price.or(ticker.index_price),
            implied_volatility: ticker.mark_iv.map(|iv| iv / 100.0),
            timestamp: timestamp(ticker.timestamp)?,
            instrument: ticker.instrument_name,
        })));
    }

    if channel.starts_with(PORTFOLIO_PREFIX) {
        let changes: ChangesData = serde_json::from_value(data)?;
        let positions: Vec<PositionUpdate> = changes
            .positions
            .into_iter()
            .filter(PositionData::is_option)
            .map(PositionData::into_update)
            .collect();
        if positions.is_empty() {
            return Ok(None);
        }
        return Ok(Some(FeedEvent::Portfolio(PortfolioUpdate::Delta { positions })));
    }

    Ok(None)
}

/// Decode a `private/get_positions` result into a full book for `currency`
pub fn decode_positions(currency: &str, result: Value) -> Result<PortfolioUpdate> {
    let positions: Vec<PositionData> = serde_json::from_value(result)?;
    Ok(PortfolioUpdate::Snapshot {
        currency: currency.to_string(),
        positions: positions
            .into_iter()
            .filter(PositionData::is_option)
            .map(PositionData::into_update)
            .collect(),
    })
}

pub fn positions_params(currency: &str) -> Value {
    json!({ "currency": currency, "kind": "option" })
}

pub fn subscribe_params(channels: &[String]) -> Value {
    json!({ "channels": channels })
}

pub fn heartbeat_params(interval_seconds: u64) -> Value {
    json!({ "interval": interval_seconds })
}

/// Channels named in a subscribe or unsubscribe result
pub fn channel_list(result: &Value) -> Vec<String> {
    result
        .as_array()
        .map(|channels| {
            channels
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_request_encoding() {
        let text = encode_request(7, PUBLIC_SUBSCRIBE, &subscribe_params(&[
            ticker_channel("ETH-27DEC24-3000-C", "100ms"),
        ]))
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["params"]["channels"][0], "ticker.ETH-27DEC24-3000-C.100ms");
    }

    #[test]
    fn test_tracker_matches_ids() {
        let mut tracker = RequestTracker::new();
        let auth = tracker.register(PendingRequest::Auth);
        let positions = tracker.register(PendingRequest::Positions {
            currency: "ETH".into(),
        });
        assert_ne!(auth, positions);
        assert_eq!(tracker.len(), 2);

        assert_eq!(
            tracker.resolve(positions),
            Some(PendingRequest::Positions {
                currency: "ETH".into()
            })
        );
        assert_eq!(tracker.resolve(positions), None);
        assert_eq!(tracker.resolve(auth), Some(PendingRequest::Auth));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_decode_message_kinds() {
        assert_matches!(
            decode(r#"{"jsonrpc":"2.0","id":3,"result":["ticker.X.100ms"]}"#).unwrap(),
            Inbound::Response { id: 3, .. }
        );
        assert_matches!(
            decode(r#"{"jsonrpc":"2.0","id":4,"error":{"code":13009,"message":"unauthorized"}}"#)
                .unwrap(),
            Inbound::Error { id: Some(4), error } if error.code == 13009
        );
        assert_eq!(
            decode(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#)
                .unwrap(),
            Inbound::Heartbeat(HeartbeatKind::TestRequest)
        );
        assert_matches!(
            decode(r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"c","data":{}}}"#)
                .unwrap(),
            Inbound::Notification { channel, .. } if channel == "c"
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"jsonrpc":"2.0"}"#).is_err());
        assert!(decode(r#"{"jsonrpc":"2.0","method":"bogus","params":{}}"#).is_err());
    }

    #[test]
    fn test_ticker_iv_is_converted_from_percent() {
        let event = decode_notification(
            "ticker.ETH-27DEC24-3000-C.100ms",
            json!({
                "instrument_name": "ETH-27DEC24-3000-C",
                "underlying_price": 3012.5,
                "index_price": 3010.0,
                "mark_iv": 65.0,
                "timestamp": 1_700_000_000_000i64
            }),
        )
        .unwrap();

        assert_matches!(event, Some(FeedEvent::Ticker(t)) => {
            assert_eq!(t.underlying_price, Some(3012.5));
            assert_eq!(t.implied_volatility, Some(0.65));
            assert_eq!(t.timestamp.timestamp_millis(), 1_700_000_000_000);
        });
    }

    #[test]
    fn test_ticker_falls_back_to_index_price() {
        let event = decode_notification(
            "ticker.BTC-27DEC24-60000-P.raw",
            json!({"instrument_name": "BTC-27DEC24-60000-P", "index_price": 61000.0, "timestamp": 0}),
        )
        .unwrap();
        assert_matches!(event, Some(FeedEvent::Ticker(t)) if t.underlying_price == Some(61000.0));
    }

    #[test]
    fn test_malformed_ticker_is_an_error() {
        let result = decode_notification("ticker.X.100ms", json!({"mark_iv": "high"}));
        assert_matches!(result, Err(IngestionError::Protocol(_)));
    }

    #[test]
    fn test_user_changes_keep_only_options() {
        let event = decode_notification(
            "user.changes.option.ETH.100ms",
            json!({
                "trades": [],
                "orders": [],
                "positions": [
                    {"instrument_name": "ETH-27DEC24-3000-C", "size": -2.0, "average_price": 0.05, "kind": "option"},
                    {"instrument_name": "ETH-PERPETUAL", "size": 10.0, "kind": "future"}
                ]
            }),
        )
        .unwrap();

        assert_matches!(event, Some(FeedEvent::Portfolio(PortfolioUpdate::Delta { positions })) => {
            assert_eq!(positions.len(), 1);
            assert_eq!(positions[0].size, -2.0);
            assert_eq!(positions[0].average_price, Some(0.05));
        });

        let empty = decode_notification("user.changes.option.ETH.100ms", json!({"trades": []})).unwrap();
        assert_eq!(empty, None);
    }

    #[test]
    fn test_positions_result_is_a_currency_snapshot() {
        let update = decode_positions(
            "ETH",
            json!([{"instrument_name": "ETH-27DEC24-3000-C", "size": 1.0, "index_price": 3000.0}]),
        )
        .unwrap();
        assert_matches!(update, PortfolioUpdate::Snapshot { currency, positions } => {
            assert_eq!(currency, "ETH");
            assert_eq!(positions[0].underlying_price, Some(3000.0));
        });
    }

    #[test]
    fn test_channel_helpers() {
        assert_eq!(portfolio_channel("ETH", "raw"), "user.changes.option.ETH.raw");
        assert!(is_private_channel(&portfolio_channel("ETH", "raw")));
        assert!(!is_private_channel(&ticker_channel("X", "raw")));
        assert_eq!(
            channel_list(&json!(["a", "b", 3])),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(channel_list(&Value::Null).is_empty());
    }
}
