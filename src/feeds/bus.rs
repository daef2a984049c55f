use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::models::event::{BrokerTick, ExchangePrice, WebhookEvent};

/// Fan-out bus for the three inbound event streams: webhooks, broker ticks
/// and exchange prices. The socket clients that produce raw payloads live
/// outside the engine; they hand JSON to `publish_*_json` and every
/// subscribed runner receives the parsed event tagged with its receive
/// time.
pub struct EventBus {
    clock: Arc<dyn Clock>,
    webhook_tx: broadcast::Sender<WebhookEvent>,
    tick_tx: broadcast::Sender<BrokerTick>,
    price_tx: broadcast::Sender<ExchangePrice>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (webhook_tx, _) = broadcast::channel(1024);
        let (tick_tx, _) = broadcast::channel(4096);
        let (price_tx, _) = broadcast::channel(4096);
        Self { clock, webhook_tx, tick_tx, price_tx }
    }

    /// Parse and publish a webhook payload. Malformed payloads are dropped
    /// silently; returns whether the event went out.
    pub fn publish_webhook_json(&self, raw: Value) -> bool {
        match WebhookEvent::parse(raw, self.clock.now_ms()) {
            Some(ev) => {
                let _ = self.webhook_tx.send(ev);
                true
            }
            None => {
                debug!("{}", EngineError::MalformedInput { kind: "webhook" });
                false
            }
        }
    }

    pub fn publish_tick_json(&self, raw: &Value) -> bool {
        match BrokerTick::parse(raw, self.clock.now_ms()) {
            Some(tick) => {
                let _ = self.tick_tx.send(tick);
                true
            }
            None => {
                debug!("{}", EngineError::MalformedInput { kind: "tick" });
                false
            }
        }
    }

    pub fn publish_price_json(&self, raw: &Value) -> bool {
        match ExchangePrice::parse(raw, self.clock.now_ms()) {
            Some(price) => {
                let _ = self.price_tx.send(price);
                true
            }
            None => {
                debug!("{}", EngineError::MalformedInput { kind: "price" });
                false
            }
        }
    }

    pub fn subscribe_webhooks(&self) -> broadcast::Receiver<WebhookEvent> {
        self.webhook_tx.subscribe()
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<BrokerTick> {
        self.tick_tx.subscribe()
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<ExchangePrice> {
        self.price_tx.subscribe()
    }
}
