use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CatalogConfig;

/// One row of the instrument catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub tradingview: Option<String>,
    #[serde(default)]
    pub broker_symbol: Option<String>,
    #[serde(default)]
    pub token: Option<i64>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub lot: Option<i64>,
}

impl CatalogEntry {
    /// The crypto instrument is identified by its fixed names, not by
    /// exchange (older catalog documents leave `exchange` blank).
    pub fn is_crypto(&self) -> bool {
        self.tradingview.as_deref() == Some("BTCUSDT")
            || self.broker_symbol.as_deref() == Some("BTCUSD")
    }

    /// Canonical symbol: broker name when present, else TradingView name.
    pub fn canonical(&self) -> Option<&str> {
        self.broker_symbol.as_deref().or(self.tradingview.as_deref())
    }
}

/// Immutable instrument metadata, loaded once at boot.
///
/// Lookup is many-to-one: both the TradingView and the broker name of an
/// entry resolve to the same token, lot and exchange.
pub struct InstrumentCatalog {
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, usize>,
    by_token: HashMap<i64, usize>,
}

impl InstrumentCatalog {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_token = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            if let Some(tv) = &entry.tradingview {
                by_name.entry(tv.clone()).or_insert(idx);
            }
            if let Some(broker) = &entry.broker_symbol {
                by_name.entry(broker.clone()).or_insert(idx);
            }
            if let Some(token) = entry.token {
                by_token.entry(token).or_insert(idx);
            }
        }
        Self { entries, by_name, by_token }
    }

    pub fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    /// Load the catalog from the configured URL or file. Best-effort: any
    /// failure yields an empty catalog and the engine runs degraded.
    pub async fn load(cfg: &CatalogConfig) -> Self {
        let text = match &cfg.url {
            Some(url) => match fetch(url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Catalog fetch from {url} failed: {e} — starting empty");
                    return Self::empty();
                }
            },
            None => match tokio::fs::read_to_string(&cfg.path).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Catalog read from {} failed: {e} — starting empty", cfg.path);
                    return Self::empty();
                }
            },
        };

        match serde_json::from_str::<Vec<CatalogEntry>>(&text) {
            Ok(entries) => {
                info!("Instrument catalog loaded: {} entries", entries.len());
                Self::from_entries(entries)
            }
            Err(e) => {
                warn!("Catalog parse failed: {e} — starting empty");
                Self::empty()
            }
        }
    }

    fn entry_of(&self, raw: &str) -> Option<&CatalogEntry> {
        self.by_name.get(raw).map(|&idx| &self.entries[idx])
    }

    /// Canonical symbol for a TradingView or broker name.
    pub fn resolve_symbol(&self, raw: &str) -> Option<String> {
        self.entry_of(raw)?.canonical().map(str::to_string)
    }

    pub fn lot_of(&self, sym: &str) -> Option<i64> {
        self.entry_of(sym)?.lot
    }

    pub fn exchange_of(&self, sym: &str) -> Option<String> {
        self.entry_of(sym)?.exchange.clone()
    }

    pub fn token_of(&self, sym: &str) -> Option<i64> {
        self.entry_of(sym)?.token
    }

    pub fn symbol_of_token(&self, token: i64) -> Option<String> {
        self.by_token
            .get(&token)
            .and_then(|&idx| self.entries[idx].canonical())
            .map(str::to_string)
    }

    pub fn is_crypto_symbol(&self, sym: &str) -> bool {
        self.entry_of(sym).map(CatalogEntry::is_crypto).unwrap_or(false)
            || sym.starts_with("BTC")
    }

    /// First `n` non-crypto canonical symbols, catalog order. Feeds the
    /// broker6 mode's allow-set.
    pub fn broker_top_n(&self, n: usize) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.is_crypto())
            .filter_map(|e| e.canonical().map(str::to_string))
            .take(n)
            .collect()
    }

    /// Union of TradingView and broker names of all crypto entries;
    /// defaults to {BTCUSDT} when the catalog carries none.
    pub fn crypto_symbols(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for entry in self.entries.iter().filter(|e| e.is_crypto()) {
            if let Some(tv) = &entry.tradingview {
                names.insert(tv.clone());
            }
            if let Some(broker) = &entry.broker_symbol {
                names.insert(broker.clone());
            }
        }
        if names.is_empty() {
            names.insert("BTCUSDT".to_string());
        }
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn fetch(url: &str) -> Result<String, crate::error::EngineError> {
    let resp = reqwest::get(url).await?.error_for_status()?;
    Ok(resp.text().await?)
}

#[cfg(test)]
pub(crate) fn test_catalog() -> InstrumentCatalog {
    let entries = serde_json::from_value(serde_json::json!([
        {"tradingview": "NSE:INFY", "broker_symbol": "INFY", "token": 1, "exchange": "NSE", "lot": 1},
        {"tradingview": "NSE:TCS", "broker_symbol": "TCS", "token": 2, "exchange": "NSE", "lot": 1},
        {"tradingview": "BTCUSDT", "broker_symbol": "BTCUSD", "exchange": "crypto", "lot": 1},
        {"tradingview": "MCX:CRUDEOIL", "broker_symbol": "CRUDEOIL", "token": 4, "exchange": "MCX", "lot": 100},
        {"tradingview": "NSE:SBIN", "broker_symbol": "SBIN", "token": 5, "exchange": "NSE", "lot": 1},
        {"tradingview": "NSE:RELIANCE", "broker_symbol": "RELIANCE", "token": 6, "exchange": "NSE", "lot": 1},
        {"tradingview": "NSE:HDFCBANK", "broker_symbol": "HDFCBANK", "token": 7, "exchange": "NSE", "lot": 1},
        {"tradingview": "NSE:ICICIBANK", "broker_symbol": "ICICIBANK", "token": 8, "exchange": "NSE", "lot": 1}
    ]))
    .expect("test catalog entries");
    InstrumentCatalog::from_entries(entries)
}
