use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::InstrumentCatalog;
use crate::clock::Clock;
use crate::engine::store::FsmStore;
use crate::engine::transition::InstrumentFsm;
use crate::error::EngineError;
use crate::models::event::{BrokerTick, Direction, ExchangePrice, WebhookEvent};
use crate::models::fsm::FsmState;

/// Control message from the signal tracker: snap an idle machine's
/// threshold (broker-6 buy-sell-sell pattern).
#[derive(Debug, Clone)]
pub struct RearmCommand {
    pub symbol: String,
    pub threshold: f64,
}

/// Rate limit for the per-symbol "stuck" log (missing prerequisites or
/// lookup misses).
const STUCK_LOG_INTERVAL_MS: i64 = 10_000;

struct StuckLog {
    last: HashMap<String, i64>,
}

impl StuckLog {
    fn new() -> Self {
        Self { last: HashMap::new() }
    }

    /// True when this key may log again.
    fn allow(&mut self, key: &str, now_ms: i64) -> bool {
        match self.last.get(key) {
            Some(&at) if now_ms - at < STUCK_LOG_INTERVAL_MS => false,
            _ => {
                self.last.insert(key.to_string(), now_ms);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Broker runner
// ---------------------------------------------------------------------------

/// Drives one machine per broker instrument (keyed by token), consuming
/// webhooks and brokerage ticks. Repeat signals while in a position only
/// re-aim the threshold; entry direction follows the last signal.
pub struct BrokerRunner {
    catalog: Arc<InstrumentCatalog>,
    store: Arc<FsmStore>,
    clock: Arc<dyn Clock>,
    fsms: HashMap<i64, InstrumentFsm>,
    stuck: StuckLog,
}

impl BrokerRunner {
    pub fn new(
        catalog: Arc<InstrumentCatalog>,
        store: Arc<FsmStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { catalog, store, clock, fsms: HashMap::new(), stuck: StuckLog::new() }
    }

    pub async fn handle_webhook(&mut self, ev: &WebhookEvent) {
        let now = self.clock.now_ms();
        let Some(symbol) = self.catalog.resolve_symbol(&ev.symbol) else {
            if self.stuck.allow(&ev.symbol, now) {
                debug!("webhook dropped: {}", EngineError::LookupMiss(ev.symbol.clone()));
            }
            return;
        };
        let Some(token) = self.catalog.token_of(&symbol) else {
            return;
        };
        let Some(direction) = ev.direction() else {
            return;
        };

        let last_ltp = self.store.last_price(&symbol);
        let fsm = self.fsms.entry(token).or_default();
        let edge = fsm.apply_signal(direction, ev.stop_px, last_ltp, now, true);
        info!(
            "{symbol}: {direction} signal, threshold={:?} ({} -> {})",
            fsm.threshold, edge.from, edge.to
        );
        self.store.update_one(&symbol, fsm.snapshot()).await;
    }

    pub async fn handle_tick(&mut self, tick: &BrokerTick) {
        let now = self.clock.now_ms();
        let Some(symbol) = self.catalog.symbol_of_token(tick.token) else {
            if self.stuck.allow(&tick.token.to_string(), now) {
                debug!("tick dropped: {}", EngineError::LookupMiss(tick.token.to_string()));
            }
            return;
        };

        let fsm = self.fsms.entry(tick.token).or_default();
        if fsm.threshold.is_none() || fsm.last_signal_at_ms.is_none() {
            if fsm.state != FsmState::Nosignal && self.stuck.allow(&symbol, now) {
                let what = if fsm.threshold.is_none() { "threshold" } else { "signal time" };
                debug!(
                    "stuck: {}",
                    EngineError::MissingPrerequisite { symbol: symbol.clone(), what }
                );
            }
            // Still cache the price so SELL arming and the store memo see it.
            fsm.ltp = Some(tick.last_price);
            self.store.update_one(&symbol, fsm.snapshot()).await;
            return;
        }

        let entry_state = match fsm.last_direction {
            Some(Direction::Sell) => FsmState::SellPosition,
            _ => FsmState::BuyPosition,
        };
        let edges = fsm.apply_tick(tick.last_price, now, entry_state);
        for edge in &edges {
            info!("{symbol}: {} -> {} at {}", edge.from, edge.to, tick.last_price);
        }
        self.store.update_one(&symbol, fsm.snapshot()).await;
    }

    pub async fn handle_rearm(&mut self, cmd: &RearmCommand) {
        let Some(token) = self.catalog.token_of(&cmd.symbol) else {
            warn!("{}: rearm for unknown instrument ignored", cmd.symbol);
            return;
        };
        let now = self.clock.now_ms();
        let fsm = self.fsms.entry(token).or_default();
        let edge = fsm.rearm(cmd.threshold, now);
        info!(
            "{}: rearmed to threshold {} ({} -> {})",
            cmd.symbol, cmd.threshold, edge.from, edge.to
        );
        self.store.update_one(&cmd.symbol, fsm.snapshot()).await;
    }

    /// Drop machines for symbols starting with `prefix` (crypto reset).
    pub fn clear_prefix(&mut self, prefix: &str) {
        let catalog = &self.catalog;
        self.fsms.retain(|token, _| {
            catalog
                .symbol_of_token(*token)
                .map(|s| !s.starts_with(prefix))
                .unwrap_or(true)
        });
    }

    pub fn spawn(
        mut self,
        mut webhooks: broadcast::Receiver<WebhookEvent>,
        mut ticks: broadcast::Receiver<BrokerTick>,
        mut rearm_rx: mpsc::Receiver<RearmCommand>,
        mut crypto_reset: broadcast::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = webhooks.recv() => match ev {
                        Ok(ev) => self.handle_webhook(&ev).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broker runner lagged {n} webhooks");
                        }
                        Err(_) => break,
                    },
                    tick = ticks.recv() => match tick {
                        Ok(tick) => self.handle_tick(&tick).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broker runner lagged {n} ticks");
                        }
                        Err(_) => break,
                    },
                    cmd = rearm_rx.recv() => match cmd {
                        Some(cmd) => self.handle_rearm(&cmd).await,
                        None => break,
                    },
                    reset = crypto_reset.recv() => match reset {
                        Ok(()) => self.clear_prefix("BTC"),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Broker runner stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Crypto runners
// ---------------------------------------------------------------------------

/// Which synthetic crypto symbol a runner owns and which signals it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoKind {
    Combined,
    Long,
    Short,
}

impl CryptoKind {
    pub fn symbol(self) -> &'static str {
        match self {
            CryptoKind::Combined => "BTCUSDT",
            CryptoKind::Long => "BTCUSDT_LONG",
            CryptoKind::Short => "BTCUSDT_SHORT",
        }
    }

    pub fn accepts(self, direction: Direction) -> bool {
        match self {
            CryptoKind::Combined => true,
            CryptoKind::Long => direction == Direction::Buy,
            CryptoKind::Short => direction == Direction::Sell,
        }
    }

    fn entry_state(self, last_direction: Option<Direction>) -> FsmState {
        match self {
            CryptoKind::Long => FsmState::BuyPosition,
            CryptoKind::Short => FsmState::SellPosition,
            CryptoKind::Combined => match last_direction {
                Some(Direction::Sell) => FsmState::SellPosition,
                _ => FsmState::BuyPosition,
            },
        }
    }
}

/// Drives one synthetic crypto symbol from the exchange price stream. The
/// three kinds share that stream but write distinct store keys.
pub struct CryptoRunner {
    kind: CryptoKind,
    allow: HashSet<String>,
    store: Arc<FsmStore>,
    clock: Arc<dyn Clock>,
    fsm: InstrumentFsm,
    stuck: StuckLog,
}

impl CryptoRunner {
    pub fn new(
        kind: CryptoKind,
        allow: HashSet<String>,
        store: Arc<FsmStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { kind, allow, store, clock, fsm: InstrumentFsm::default(), stuck: StuckLog::new() }
    }

    pub async fn handle_webhook(&mut self, ev: &WebhookEvent) {
        if !self.allow.contains(&ev.symbol) {
            return;
        }
        let Some(direction) = ev.direction() else {
            return;
        };
        if !self.kind.accepts(direction) {
            return;
        }

        let now = self.clock.now_ms();
        let symbol = self.kind.symbol();
        let last_ltp = self.store.last_price(symbol);
        let edge = self.fsm.apply_signal(direction, ev.stop_px, last_ltp, now, false);
        info!(
            "{symbol}: {direction} signal, threshold={:?} ({} -> {})",
            self.fsm.threshold, edge.from, edge.to
        );
        self.store.update_one(symbol, self.fsm.snapshot()).await;
    }

    pub async fn handle_price(&mut self, price: &ExchangePrice) {
        if !self.allow.contains(&price.symbol) {
            return;
        }
        let now = self.clock.now_ms();
        let symbol = self.kind.symbol();

        if self.fsm.threshold.is_none() || self.fsm.last_signal_at_ms.is_none() {
            if self.fsm.state != FsmState::Nosignal && self.stuck.allow(symbol, now) {
                let what = if self.fsm.threshold.is_none() { "threshold" } else { "signal time" };
                debug!(
                    "stuck: {}",
                    EngineError::MissingPrerequisite { symbol: symbol.to_string(), what }
                );
            }
            self.fsm.ltp = Some(price.price);
            self.store.update_one(symbol, self.fsm.snapshot()).await;
            return;
        }

        let entry_state = self.kind.entry_state(self.fsm.last_direction);
        let edges = self.fsm.apply_tick(price.price, now, entry_state);
        for edge in &edges {
            info!("{symbol}: {} -> {} at {}", edge.from, edge.to, price.price);
        }
        self.store.update_one(symbol, self.fsm.snapshot()).await;
    }

    pub fn reset(&mut self) {
        self.fsm = InstrumentFsm::default();
    }

    pub fn spawn(
        mut self,
        mut webhooks: broadcast::Receiver<WebhookEvent>,
        mut prices: broadcast::Receiver<ExchangePrice>,
        mut crypto_reset: broadcast::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = webhooks.recv() => match ev {
                        Ok(ev) => self.handle_webhook(&ev).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{} runner lagged {n} webhooks", self.kind.symbol());
                        }
                        Err(_) => break,
                    },
                    price = prices.recv() => match price {
                        Ok(price) => self.handle_price(&price).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{} runner lagged {n} prices", self.kind.symbol());
                        }
                        Err(_) => break,
                    },
                    reset = crypto_reset.recv() => match reset {
                        Ok(()) => self.reset(),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("{} runner stopped", self.kind.symbol());
        })
    }
}
