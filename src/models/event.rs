use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction of a trading signal or order leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Direction {
    pub fn invert(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A TradingView-style webhook signal, tagged with its receive time.
///
/// The original JSON is kept so the relay can re-emit it verbatim.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub symbol: String,
    pub stop_px: Option<f64>,
    pub intent: Option<String>,
    pub side: Option<String>,
    pub recv_ms: i64,
    pub raw: Value,
}

impl WebhookEvent {
    /// Parse a webhook payload. A missing/empty symbol makes the event
    /// malformed and it is dropped.
    pub fn parse(raw: Value, recv_ms: i64) -> Option<Self> {
        let symbol = raw.get("symbol")?.as_str()?.trim().to_string();
        if symbol.is_empty() {
            return None;
        }
        let stop_px = raw.get("stoppx").and_then(lenient_f64);
        let intent = raw
            .get("intent")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string());
        let side = raw
            .get("side")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string());
        Some(Self { symbol, stop_px, intent, side, recv_ms, raw })
    }

    /// Signal direction: intent first (ENTRY≡BUY, EXIT≡SELL), then side.
    /// PING and other non-signal intents yield None.
    pub fn direction(&self) -> Option<Direction> {
        if let Some(intent) = &self.intent {
            match intent.to_uppercase().as_str() {
                "BUY" | "ENTRY" => return Some(Direction::Buy),
                "SELL" | "EXIT" => return Some(Direction::Sell),
                _ => {}
            }
        }
        match self.side.as_deref().map(str::to_uppercase).as_deref() {
            Some("BUY") => Some(Direction::Buy),
            Some("SELL") => Some(Direction::Sell),
            _ => None,
        }
    }
}

/// A brokerage tick keyed by instrument token.
#[derive(Debug, Clone, Copy)]
pub struct BrokerTick {
    pub token: i64,
    pub last_price: f64,
    pub recv_ms: i64,
}

impl BrokerTick {
    pub fn parse(raw: &Value, recv_ms: i64) -> Option<Self> {
        let token = raw.get("instrument_token")?.as_i64()?;
        let last_price = raw.get("last_price")?.as_f64()?;
        Some(Self { token, last_price, recv_ms })
    }
}

/// A crypto exchange price update.
#[derive(Debug, Clone)]
pub struct ExchangePrice {
    pub symbol: String,
    pub price: f64,
    pub ts_ms: Option<i64>,
    pub recv_ms: i64,
}

impl ExchangePrice {
    /// `price` must be a JSON number; `timestamp` may be a number or a
    /// numeric string.
    pub fn parse(raw: &Value, recv_ms: i64) -> Option<Self> {
        let symbol = raw.get("symbol")?.as_str()?.trim().to_string();
        if symbol.is_empty() {
            return None;
        }
        let price = raw.get("price")?.as_f64()?;
        let ts_ms = raw.get("timestamp").and_then(lenient_f64).map(|v| v as i64);
        Some(Self { symbol, price, ts_ms, recv_ms })
    }
}

/// Numbers arrive both as JSON numbers and as numeric strings (TradingView
/// templates are inconsistent).
fn lenient_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
