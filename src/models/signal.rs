use serde::{Deserialize, Serialize};

use super::event::Direction;

/// Rows kept per mode × symbol (newest first).
pub const SIGNAL_ROWS_CAP: usize = 50;

/// Per-mode, per-symbol pattern counters and sticky flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalTracking {
    pub last_signal: Option<Direction>,
    pub sell_after_buy_count: u32,
    pub buy_after_sell_count: u32,
    pub alternate_signal: bool,
    pub buy_sell_sell: bool,
    pub sell_buy_buy: bool,
}

/// One accepted webhook as it appears in a mode's signal table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub time_ist: String,
    pub intent: Direction,
    pub stop_px: Option<f64>,
    pub alternate_signal: bool,
    pub buy_sell_sell: bool,
    pub sell_buy_buy: bool,
}
