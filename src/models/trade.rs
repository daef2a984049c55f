use serde::{Deserialize, Serialize};

use super::event::Direction;

/// An open paper or live position for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTrade {
    pub id: String,
    pub symbol: String,
    pub side: Direction,
    pub entry_price: f64,
    pub quantity: i64,
    pub lot: i64,
    pub time_ist: String,
}

/// One display row in a trade table. Exit rows reuse the open row's id
/// suffixed `-exit` and sit newest-first ahead of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: String,
    pub time_ist: String,
    pub symbol: String,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub cumulative_pnl: f64,
    pub quantity: i64,
}

/// Signed per-unit price move. Short synthetics (`*_SHORT`) profit when the
/// price falls; everything else when it rises.
pub fn pnl_delta(symbol: &str, entry_price: f64, ltp: f64) -> f64 {
    if symbol.ends_with("_SHORT") {
        entry_price - ltp
    } else {
        ltp - entry_price
    }
}
