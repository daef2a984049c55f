use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::catalog::InstrumentCatalog;
use crate::config::BrokerConfig;
use crate::error::EngineError;
use crate::models::event::Direction;
use crate::trade::engine::{OrderCommand, OrderKind};

/// Outbound order payload. CLOSE orders invert the stored side; quantity,
/// product and validity follow the broker's intraday defaults.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub transaction_type: Direction,
    pub quantity: i64,
    pub product: &'static str,
    pub validity: &'static str,
    pub order_type: &'static str,
    pub side_offset: f64,
    pub dry_run: bool,
}

/// Posts live open/close orders to the broker endpoint. Failures are
/// logged and dropped; the trade engine's state is already committed and
/// is not rolled back.
pub struct BrokerSink {
    http: reqwest::Client,
    order_url: Option<String>,
    catalog: Arc<InstrumentCatalog>,
}

impl BrokerSink {
    pub fn new(cfg: &BrokerConfig, catalog: Arc<InstrumentCatalog>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()
            .expect("Failed to build HTTP client");
        Self { http, order_url: cfg.order_url.clone(), catalog }
    }

    /// Build the wire request for a command, or None when the instrument
    /// takes no outbound orders (crypto).
    pub fn request_for(&self, cmd: &OrderCommand) -> Option<OrderRequest> {
        let exchange = self.catalog.exchange_of(&cmd.symbol).unwrap_or_default();
        if self.catalog.is_crypto_symbol(&cmd.symbol) || exchange.eq_ignore_ascii_case("crypto") {
            return None;
        }

        let transaction_type = match cmd.kind {
            OrderKind::Open => cmd.side,
            OrderKind::Close => cmd.side.invert(),
        };
        Some(OrderRequest {
            symbol: cmd.symbol.clone(),
            exchange,
            transaction_type,
            quantity: cmd.quantity,
            product: "MIS",
            validity: "DAY",
            order_type: "LIMIT",
            side_offset: 0.5,
            dry_run: false,
        })
    }

    async fn submit(&self, cmd: OrderCommand) {
        let Some(request) = self.request_for(&cmd) else {
            debug!("{}: crypto instrument — no outbound order", cmd.symbol);
            return;
        };

        let Some(url) = &self.order_url else {
            info!(
                "[dry run] order {}: {}",
                cmd.id,
                serde_json::to_string(&request).unwrap_or_default()
            );
            return;
        };

        match self.http.post(url).json(&request).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(
                    "Order {} placed: {} {} x{}",
                    cmd.id, request.transaction_type, request.symbol, request.quantity
                );
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                error!("Order {} HTTP {status}: {body}", cmd.id);
            }
            Err(e) => {
                error!("Order {}: {}", cmd.id, EngineError::Broker(e));
            }
        }
    }

    pub fn spawn(
        self,
        mut orders: mpsc::Receiver<OrderCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = orders.recv() => match cmd {
                        Some(cmd) => self.submit(cmd).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Broker sink stopped");
        })
    }
}
