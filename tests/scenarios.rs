//! End-to-end scenario tests for the decision engine.
//!
//! Wires real components (runners, shared store, signal tracker, trade
//! engine) with a manual clock and drives them through the documented
//! flows: long entry/exit, blocked re-arm at the minute boundary, short
//! entries, the live gate, and the broker-6 buy-sell-sell rearm loop.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use sauda::catalog::{CatalogEntry, InstrumentCatalog};
use sauda::clock::{Clock, ManualClock, MINUTE_MS};
use sauda::engine::runner::{BrokerRunner, CryptoKind, CryptoRunner, RearmCommand};
use sauda::engine::store::FsmStore;
use sauda::models::event::{BrokerTick, ExchangePrice, WebhookEvent};
use sauda::models::fsm::FsmState;
use sauda::signals::tracker::SignalTracker;
use sauda::trade::engine::{OrderCommand, OrderKind, TradeCommand, TradeEngine};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn catalog() -> Arc<InstrumentCatalog> {
    let entries: Vec<CatalogEntry> = serde_json::from_value(json!([
        {"tradingview": "NSE:INFY", "broker_symbol": "INFY", "token": 1, "exchange": "NSE", "lot": 1},
        {"tradingview": "NSE:TCS", "broker_symbol": "TCS", "token": 2, "exchange": "NSE", "lot": 1},
        {"tradingview": "BTCUSDT", "broker_symbol": "BTCUSD", "exchange": "crypto", "lot": 1}
    ]))
    .expect("catalog entries");
    Arc::new(InstrumentCatalog::from_entries(entries))
}

fn webhook(symbol: &str, intent: &str, stoppx: Option<f64>, at_ms: i64) -> WebhookEvent {
    let mut body = json!({"symbol": symbol, "intent": intent});
    if let Some(px) = stoppx {
        body["stoppx"] = json!(px);
    }
    WebhookEvent::parse(body, at_ms).expect("webhook parses")
}

fn price(symbol: &str, value: f64, at_ms: i64) -> ExchangePrice {
    ExchangePrice { symbol: symbol.into(), price: value, ts_ms: Some(at_ms), recv_ms: at_ms }
}

fn crypto_allow() -> HashSet<String> {
    ["BTCUSDT".to_string(), "BTCUSD".to_string()].into()
}

/// A wired long-runner + trade-engine pair over one shared store.
struct LongRig {
    clock: Arc<ManualClock>,
    store: Arc<FsmStore>,
    runner: CryptoRunner,
    engine: TradeEngine,
    orders: mpsc::Receiver<OrderCommand>,
}

impl LongRig {
    fn new(start_ms: i64) -> Self {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = FsmStore::new(clock.clone(), None);
        let runner = CryptoRunner::new(CryptoKind::Long, crypto_allow(), store.clone(), clock.clone());
        let (order_tx, orders) = mpsc::channel(64);
        let engine = TradeEngine::new(catalog(), clock.clone(), 100_000.0, order_tx, None);
        Self { clock, store, runner, engine, orders }
    }

    /// Push a price through the runner, then let the trade engine observe
    /// the updated store (the pub/sub hop, made synchronous for the test).
    async fn tick(&mut self, value: f64) {
        let now = self.clock.now_ms();
        self.runner.handle_price(&price("BTCUSDT", value, now)).await;
        self.engine.handle_fsm_map(self.store.snapshot().await).await;
    }

    async fn signal(&mut self, intent: &str, stoppx: Option<f64>) {
        let now = self.clock.now_ms();
        self.runner.handle_webhook(&webhook("BTCUSDT", intent, stoppx, now)).await;
        self.engine.handle_fsm_map(self.store.snapshot().await).await;
    }
}

// ---------------------------------------------------------------------------
// FSM + paper flow
// ---------------------------------------------------------------------------

/// Test: long entry then exit. BUY@100, 101 enters, 102 marks, 99 exits
/// with the realized loss accrued into the paper cumulative.
#[tokio::test]
async fn test_long_entry_then_exit() {
    let base = 100 * MINUTE_MS + 5_000;
    let mut rig = LongRig::new(base);

    rig.signal("BUY", Some(100.0)).await;
    assert_eq!(
        rig.store.get("BTCUSDT_LONG").await.unwrap().state,
        FsmState::NopositionSignal
    );

    rig.clock.advance(1_000);
    rig.tick(101.0).await;
    let snap = rig.store.get("BTCUSDT_LONG").await.unwrap();
    assert_eq!(snap.state, FsmState::BuyPosition);

    let book = &rig.engine.books()["BTCUSDT_LONG"];
    let paper = book.paper_open.as_ref().expect("paper opened on the entry edge");
    assert_eq!(paper.entry_price, 100.0);
    let qty = paper.quantity;
    assert_eq!(qty, (100_000.0_f64 / 101.0).ceil() as i64);

    rig.clock.advance(1_000);
    rig.tick(102.0).await;
    let book = &rig.engine.books()["BTCUSDT_LONG"];
    assert_eq!(book.paper_rows[0].unrealized_pnl, (102.0 - 100.0) * qty as f64);

    rig.clock.advance(1_000);
    rig.tick(99.0).await;
    let snap = rig.store.get("BTCUSDT_LONG").await.unwrap();
    assert_eq!(snap.state, FsmState::NopositionBlocked);
    let book = &rig.engine.books()["BTCUSDT_LONG"];
    assert!(book.paper_open.is_none());
    assert_eq!(book.paper_cumulative, (99.0 - 100.0) * qty as f64);
    assert!(book.paper_rows[0].id.ends_with("-exit"));
}

/// Test: a blocked symbol ignores mid-minute ticks and re-evaluates in
/// the first second of a later minute.
#[tokio::test]
async fn test_blocked_rearm_at_minute_boundary() {
    let base = 600 * MINUTE_MS; // 10:00:00 of some day
    let mut rig = LongRig::new(base + 10_000);

    rig.signal("BUY", Some(100.0)).await;
    rig.clock.set(base + 30_000); // 10:00:30
    rig.tick(99.0).await;
    assert_eq!(
        rig.store.get("BTCUSDT_LONG").await.unwrap().state,
        FsmState::NopositionBlocked
    );

    rig.clock.set(base + 45_000); // 10:00:45, same minute: no-op
    rig.tick(101.0).await;
    assert_eq!(
        rig.store.get("BTCUSDT_LONG").await.unwrap().state,
        FsmState::NopositionBlocked
    );

    rig.clock.set(base + MINUTE_MS); // 10:01:00: re-arm and enter
    rig.tick(101.0).await;
    assert_eq!(
        rig.store.get("BTCUSDT_LONG").await.unwrap().state,
        FsmState::BuyPosition
    );
}

/// Test: short runner. SELL arms at the last known price, enters on the
/// drop, blocks on the bounce.
#[tokio::test]
async fn test_short_runner_flow() {
    let base = 700 * MINUTE_MS + 5_000;
    let clock = Arc::new(ManualClock::new(base));
    let store = FsmStore::new(clock.clone(), None);
    let mut runner =
        CryptoRunner::new(CryptoKind::Short, crypto_allow(), store.clone(), clock.clone());

    runner.handle_price(&price("BTCUSDT", 100.0, base)).await;
    runner.handle_webhook(&webhook("BTCUSDT", "SELL", None, base)).await;
    let snap = store.get("BTCUSDT_SHORT").await.unwrap();
    assert_eq!(snap.state, FsmState::NopositionSignal);
    assert_eq!(snap.threshold, Some(100.0));

    clock.advance(1_000);
    runner.handle_price(&price("BTCUSDT", 99.0, base + 1_000)).await;
    assert_eq!(store.get("BTCUSDT_SHORT").await.unwrap().state, FsmState::SellPosition);

    clock.advance(1_000);
    runner.handle_price(&price("BTCUSDT", 101.0, base + 2_000)).await;
    assert_eq!(
        store.get("BTCUSDT_SHORT").await.unwrap().state,
        FsmState::NopositionBlocked
    );
}

// ---------------------------------------------------------------------------
// Live gate
// ---------------------------------------------------------------------------

/// Test: a live trade only ever exists under an open paper trade, and the
/// per-minute entry limit holds across the whole flow.
#[tokio::test]
async fn test_live_requires_paper_and_minute_limit() {
    let base = 800 * MINUTE_MS; // second 0
    let mut rig = LongRig::new(base);

    rig.signal("BUY", Some(100.0)).await;
    rig.tick(101.0).await; // enter + live open (second 0)

    let book = &rig.engine.books()["BTCUSDT_LONG"];
    assert!(book.paper_open.is_some());
    assert!(book.live_open.is_some());
    assert_eq!(rig.orders.try_recv().unwrap().kind, OrderKind::Open);

    // More ticks in the same minute: no further live opens.
    for i in 1..5 {
        rig.clock.set(base + i * 10_000);
        rig.tick(101.0 + i as f64).await;
        let book = &rig.engine.books()["BTCUSDT_LONG"];
        assert!(book.live_open.is_some() || book.paper_open.is_none());
        assert!(rig.orders.try_recv().is_err(), "no second OPEN in the same minute");
    }

    // Exit closes both books; live never outlives paper.
    rig.clock.set(base + 50_000);
    rig.tick(99.0).await;
    let book = &rig.engine.books()["BTCUSDT_LONG"];
    assert!(book.paper_open.is_none());
    assert!(book.live_open.is_none());
    assert_eq!(rig.orders.try_recv().unwrap().kind, OrderKind::Close);
}

/// Test: forced live close on a negative paper oracle applies the 50-unit
/// cost and blocks re-entry until the next minute.
#[tokio::test]
async fn test_live_force_close_blocks_until_next_minute() {
    let base = 900 * MINUTE_MS;
    let mut rig = LongRig::new(base);

    rig.signal("BUY", Some(100.0)).await;
    rig.tick(100.5).await; // live opens at 100.5
    rig.orders.try_recv().unwrap();
    let qty = rig.engine.books()["BTCUSDT_LONG"].paper_open.as_ref().unwrap().quantity;

    // Price falls through the threshold: the machine blocks, the paper
    // trade exits, and the live trade is force-closed with the 50 cost.
    rig.clock.set(base + 20_000);
    rig.tick(99.9).await;

    let book = &rig.engine.books()["BTCUSDT_LONG"];
    assert!(book.live_open.is_none(), "live force-closed");
    assert!(book.paper_open.is_none(), "paper exited on the block edge");
    let raw = (99.9 - 100.5) * qty as f64;
    assert!((book.live_cumulative - (raw - 50.0)).abs() < 1e-9);
    assert_eq!(book.live_blocked_until_ms, base + MINUTE_MS);
    assert_eq!(rig.orders.try_recv().unwrap().kind, OrderKind::Close);

    // A bounce later in the same minute changes nothing: the machine is
    // blocked until the boundary and live entry is blocked with it.
    rig.clock.set(base + 30_000);
    rig.tick(101.0).await;
    assert!(rig.engine.books()["BTCUSDT_LONG"].live_open.is_none());
    assert!(rig.orders.try_recv().is_err());

    // Next minute's second 0: the machine re-arms, re-enters, the paper
    // trade reopens, and the live gate admits a fresh open.
    rig.clock.set(base + MINUTE_MS);
    rig.tick(101.0).await;
    let book = &rig.engine.books()["BTCUSDT_LONG"];
    assert!(book.paper_open.is_some());
    assert!(book.live_open.is_some());
    assert_eq!(rig.orders.try_recv().unwrap().kind, OrderKind::Open);
}

// ---------------------------------------------------------------------------
// Broker-6 rearm loop
// ---------------------------------------------------------------------------

/// Test: broker-6 buy-sell-sell. The tracker's control messages snap the
/// threshold back to the last buy threshold and reset cumulative P&L.
#[tokio::test]
async fn test_broker6_buy_sell_sell_rearm() {
    let base = 1_000 * MINUTE_MS + 5_000;
    let clock = Arc::new(ManualClock::new(base));
    let store = FsmStore::new(clock.clone(), None);
    let catalog = catalog();
    let mut runner = BrokerRunner::new(catalog.clone(), store.clone(), clock.clone());

    let (rearm_tx, mut rearm_rx) = mpsc::channel::<RearmCommand>(16);
    let (trade_tx, mut trade_rx) = mpsc::channel::<TradeCommand>(16);
    let mut tracker = SignalTracker::new(
        catalog.clone(),
        store.clone(),
        clock.clone(),
        rearm_tx,
        trade_tx,
        None,
    );

    // Arm INFY at 100 and block it below the threshold.
    runner.handle_webhook(&webhook("NSE:INFY", "BUY", Some(100.0), base)).await;
    runner.handle_tick(&BrokerTick { token: 1, last_price: 95.0, recv_ms: base }).await;
    assert_eq!(store.get("INFY").await.unwrap().state, FsmState::NopositionBlocked);

    // BUY, SELL, SELL through the tracker.
    tracker.handle_webhook(&webhook("NSE:INFY", "BUY", Some(100.0), base)).await;
    tracker.handle_webhook(&webhook("NSE:INFY", "SELL", None, base + 1_000)).await;
    // The alternation resets cumulative P&L.
    assert!(matches!(
        trade_rx.try_recv().unwrap(),
        TradeCommand::ResetCumulative(ref s) if s == "INFY"
    ));
    tracker.handle_webhook(&webhook("NSE:INFY", "SELL", None, base + 2_000)).await;

    // The rearm control message reaches the runner.
    let rearm = rearm_rx.try_recv().expect("rearm emitted");
    assert_eq!(rearm.symbol, "INFY");
    assert_eq!(rearm.threshold, 100.0);
    runner.handle_rearm(&rearm).await;

    let snap = store.get("INFY").await.unwrap();
    assert_eq!(snap.state, FsmState::NopositionSignal);
    assert_eq!(snap.threshold, Some(100.0));

    assert!(matches!(
        trade_rx.try_recv().unwrap(),
        TradeCommand::ResetCumulative(ref s) if s == "INFY"
    ));

    // Crossing the snapped threshold enters a buy position.
    clock.advance(5_000);
    runner
        .handle_tick(&BrokerTick { token: 1, last_price: 100.5, recv_ms: base + 5_000 })
        .await;
    assert_eq!(store.get("INFY").await.unwrap().state, FsmState::BuyPosition);
}

// ---------------------------------------------------------------------------
// Crypto reset
// ---------------------------------------------------------------------------

/// Test: reset_crypto_state clears BTC* entries everywhere but leaves
/// broker symbols alone.
#[tokio::test]
async fn test_crypto_reset_scope() {
    let base = 1_100 * MINUTE_MS + 5_000;
    let clock = Arc::new(ManualClock::new(base));
    let store = FsmStore::new(clock.clone(), None);
    let catalog = catalog();

    let mut broker = BrokerRunner::new(catalog.clone(), store.clone(), clock.clone());
    let mut long =
        CryptoRunner::new(CryptoKind::Long, crypto_allow(), store.clone(), clock.clone());
    broker.handle_webhook(&webhook("NSE:INFY", "BUY", Some(100.0), base)).await;
    long.handle_webhook(&webhook("BTCUSDT", "BUY", Some(50.0), base)).await;

    let (order_tx, _orders) = mpsc::channel(16);
    let mut engine = TradeEngine::new(catalog.clone(), clock.clone(), 100_000.0, order_tx, None);
    long.handle_price(&price("BTCUSDT", 51.0, base)).await;
    engine.handle_fsm_map(store.snapshot().await).await;
    assert!(engine.books()["BTCUSDT_LONG"].paper_open.is_some());

    store.clear_prefix("BTC").await;
    engine.handle_command(TradeCommand::ResetCrypto).await;
    long.reset();

    let map = store.snapshot().await;
    assert!(!map.contains_key("BTCUSDT_LONG"));
    assert!(map.contains_key("INFY"));
    assert!(!engine.books().contains_key("BTCUSDT_LONG"));
}
