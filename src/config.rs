use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub catalog: CatalogConfig,
    pub broker: BrokerConfig,
    pub persistence: PersistenceConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Notional capital per symbol; paper quantity is ceil(capital / (lot * ltp)).
    pub capital: f64,
    /// Daily crypto reset time as "HH:MM" IST. None disables the reset task.
    pub crypto_reset_ist: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Local instrument catalog document.
    pub path: String,
    /// Optional remote catalog; takes precedence over `path` when set.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Order endpoint. None means dry-run: payloads are logged, not sent.
    pub order_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Webhooks are re-posted verbatim here when set.
    pub url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                capital: 100_000.0,
                crypto_reset_ist: Some("09:00".into()),
            },
            catalog: CatalogConfig {
                path: "instruments.json".into(),
                url: None,
            },
            broker: BrokerConfig {
                order_url: None,
                timeout_secs: 10,
            },
            persistence: PersistenceConfig {
                data_dir: "data".into(),
            },
            relay: RelayConfig { url: None },
        }
    }
}

impl Config {
    /// Load configuration from environment variables (.env file) with defaults.
    ///
    /// Optional env vars:
    ///   SAUDA_CAPITAL — notional capital per symbol (default: 100000)
    ///   SAUDA_CATALOG_PATH — instrument catalog file (default: instruments.json)
    ///   SAUDA_CATALOG_URL — fetch the catalog over HTTP instead
    ///   SAUDA_BROKER_ORDER_URL — broker order endpoint (unset = dry run)
    ///   SAUDA_DATA_DIR — persistence directory (default: data)
    ///   SAUDA_RELAY_URL — re-post accepted webhooks here
    ///   SAUDA_CRYPTO_RESET_IST — daily crypto reset "HH:MM" IST, "off" to disable
    ///   RUST_LOG — log filter (default: info)
    pub fn load_or_default() -> Self {
        let _ = dotenv::dotenv();

        let mut config = Self::default();

        if let Ok(capital) = std::env::var("SAUDA_CAPITAL") {
            if let Ok(val) = capital.parse::<f64>() {
                config.engine.capital = val;
            }
        }

        if let Ok(path) = std::env::var("SAUDA_CATALOG_PATH") {
            if !path.is_empty() {
                config.catalog.path = path;
            }
        }
        if let Ok(url) = std::env::var("SAUDA_CATALOG_URL") {
            if !url.is_empty() {
                config.catalog.url = Some(url);
            }
        }

        if let Ok(url) = std::env::var("SAUDA_BROKER_ORDER_URL") {
            if !url.is_empty() {
                config.broker.order_url = Some(url);
            }
        }

        if let Ok(dir) = std::env::var("SAUDA_DATA_DIR") {
            if !dir.is_empty() {
                config.persistence.data_dir = dir;
            }
        }

        if let Ok(url) = std::env::var("SAUDA_RELAY_URL") {
            if !url.is_empty() {
                config.relay.url = Some(url);
            }
        }

        if let Ok(at) = std::env::var("SAUDA_CRYPTO_RESET_IST") {
            config.engine.crypto_reset_ist = match at.trim() {
                "" | "off" | "none" => None,
                other => Some(other.to_string()),
            };
        }

        config
    }

    pub fn is_dry_run(&self) -> bool {
        self.broker.order_url.is_none()
    }

    /// Parsed daily reset time, if configured and well-formed.
    pub fn crypto_reset_hhmm(&self) -> Option<(u32, u32)> {
        let raw = self.engine.crypto_reset_ist.as_deref()?;
        let (hh, mm) = raw.split_once(':')?;
        let hh: u32 = hh.trim().parse().ok()?;
        let mm: u32 = mm.trim().parse().ok()?;
        (hh < 24 && mm < 60).then_some((hh, mm))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.engine.capital > 0.0,
            "SAUDA_CAPITAL must be positive, got {}",
            self.engine.capital
        );
        for (name, value) in [
            ("SAUDA_CATALOG_URL", &self.catalog.url),
            ("SAUDA_BROKER_ORDER_URL", &self.broker.order_url),
            ("SAUDA_RELAY_URL", &self.relay.url),
        ] {
            if let Some(u) = value {
                url::Url::parse(u).map_err(|e| anyhow::anyhow!("{name} is not a URL: {e}"))?;
            }
        }
        if self.engine.crypto_reset_ist.is_some() {
            anyhow::ensure!(
                self.crypto_reset_hhmm().is_some(),
                "SAUDA_CRYPTO_RESET_IST must be HH:MM, got {:?}",
                self.engine.crypto_reset_ist
            );
        }
        Ok(())
    }
}
