use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::catalog::InstrumentCatalog;
use crate::models::event::Direction;

/// The five signal-table profiles. Every webhook fans out to all of them;
/// each keeps its own per-symbol tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterMode {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "broker6")]
    Broker6,
    #[serde(rename = "crypto")]
    Crypto,
    #[serde(rename = "crypto-long")]
    CryptoLong,
    #[serde(rename = "crypto-short")]
    CryptoShort,
}

impl FilterMode {
    pub const ALL: [FilterMode; 5] = [
        FilterMode::None,
        FilterMode::Broker6,
        FilterMode::Crypto,
        FilterMode::CryptoLong,
        FilterMode::CryptoShort,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FilterMode::None => "none",
            FilterMode::Broker6 => "broker6",
            FilterMode::Crypto => "crypto",
            FilterMode::CryptoLong => "crypto-long",
            FilterMode::CryptoShort => "crypto-short",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Canonicalize a webhook symbol to this mode's table key.
    pub fn map_symbol(self, raw: &str, catalog: &InstrumentCatalog) -> String {
        match self {
            FilterMode::Broker6 => {
                catalog.resolve_symbol(raw).unwrap_or_else(|| raw.to_string())
            }
            FilterMode::CryptoLong if matches!(raw, "BTCUSDT" | "BTCUSD") => {
                "BTCUSDT_LONG".to_string()
            }
            FilterMode::CryptoShort if matches!(raw, "BTCUSDT" | "BTCUSD") => {
                "BTCUSDT_SHORT".to_string()
            }
            _ => raw.to_string(),
        }
    }

    /// Direction filter: the long table takes only BUY, the short table
    /// only SELL.
    pub fn accepts_direction(self, direction: Direction) -> bool {
        match self {
            FilterMode::CryptoLong => direction == Direction::Buy,
            FilterMode::CryptoShort => direction == Direction::Sell,
            _ => true,
        }
    }
}

impl std::fmt::Display for FilterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Allow-sets derived from the catalog once at boot.
#[derive(Debug, Clone)]
pub struct ModeAllowSets {
    /// First six non-crypto canonical symbols; matched against the
    /// mode-mapped key.
    broker6: HashSet<String>,
    /// All crypto names (TradingView and broker); matched against the raw
    /// webhook symbol.
    crypto: HashSet<String>,
}

impl ModeAllowSets {
    pub fn from_catalog(catalog: &InstrumentCatalog) -> Self {
        Self {
            broker6: catalog.broker_top_n(6).into_iter().collect(),
            crypto: catalog.crypto_symbols(),
        }
    }

    pub fn crypto_names(&self) -> &HashSet<String> {
        &self.crypto
    }

    /// Whether a mode accepts this webhook symbol. `raw` is the wire
    /// symbol, `mapped` the mode-canonicalized key.
    pub fn allows(&self, mode: FilterMode, raw: &str, mapped: &str) -> bool {
        match mode {
            FilterMode::None => true,
            FilterMode::Broker6 => self.broker6.contains(mapped),
            FilterMode::Crypto | FilterMode::CryptoLong | FilterMode::CryptoShort => {
                self.crypto.contains(raw)
            }
        }
    }
}
