use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sauda::catalog::InstrumentCatalog;
use sauda::clock::{ms_until_ist_hhmm, Clock, WallClock};
use sauda::config::Config;
use sauda::engine::runner::{BrokerRunner, CryptoKind, CryptoRunner};
use sauda::engine::store::{FsmStore, FSM_DOC};
use sauda::execution::broker::BrokerSink;
use sauda::execution::relay::WebhookRelay;
use sauda::feeds::bus::EventBus;
use sauda::persistence::store::JsonStore;
use sauda::signals::tracker::{SignalTracker, TrackerCommand, SIGNAL_DOC};
use sauda::trade::engine::{TradeCommand, TradeEngine, TRADE_DOC};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("================================================");
    info!("  SAUDA — per-symbol trading decision engine");
    info!("================================================");

    let config = Config::load_or_default();
    if let Err(e) = config.validate() {
        error!("Config validation failed: {e}");
        info!("Continuing with defaults where possible...");
    }
    if config.is_dry_run() {
        warn!("DRY RUN — no broker order URL configured, orders are logged only");
    }
    info!(
        "Capital per symbol: {} | data dir: {}",
        config.engine.capital, config.persistence.data_dir
    );

    let clock: Arc<dyn Clock> = Arc::new(WallClock);

    // === Instrument catalog (read once) ===
    let catalog = Arc::new(InstrumentCatalog::load(&config.catalog).await);
    if catalog.is_empty() {
        warn!("Empty instrument catalog — running degraded (crypto only)");
    }

    // === Persistence ===
    let json_store = JsonStore::new(&config.persistence.data_dir);
    let fsm_writer = json_store.writer(FSM_DOC);
    let signal_writer = json_store.writer(SIGNAL_DOC);
    let trade_writer = json_store.writer(TRADE_DOC);

    // === Shared FSM store, restored from disk ===
    let store = FsmStore::new(clock.clone(), Some(fsm_writer.clone()));
    let restored = json_store.load_entries(FSM_DOC).await;
    if !restored.is_empty() {
        info!("Restored {} FSM snapshots", restored.len());
    }
    store.restore(restored).await;

    // === Event bus and control channels ===
    let bus = Arc::new(EventBus::new(clock.clone()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (crypto_reset_tx, _) = broadcast::channel::<()>(4);
    let (rearm_tx, rearm_rx) = mpsc::channel(64);
    let (tracker_cmd_tx, tracker_cmd_rx) = mpsc::channel(16);
    let (trade_cmd_tx, trade_cmd_rx) = mpsc::channel(64);
    let (order_tx, order_rx) = mpsc::channel(256);

    // === FSM runners ===
    BrokerRunner::new(catalog.clone(), store.clone(), clock.clone()).spawn(
        bus.subscribe_webhooks(),
        bus.subscribe_ticks(),
        rearm_rx,
        crypto_reset_tx.subscribe(),
        shutdown_tx.subscribe(),
    );
    let crypto_allow = catalog.crypto_symbols();
    for kind in [CryptoKind::Combined, CryptoKind::Long, CryptoKind::Short] {
        CryptoRunner::new(kind, crypto_allow.clone(), store.clone(), clock.clone()).spawn(
            bus.subscribe_webhooks(),
            bus.subscribe_prices(),
            crypto_reset_tx.subscribe(),
            shutdown_tx.subscribe(),
        );
    }
    info!("FSM runners launched (broker + crypto x3)");

    // === Signal tracker ===
    let mut tracker = SignalTracker::new(
        catalog.clone(),
        store.clone(),
        clock.clone(),
        rearm_tx,
        trade_cmd_tx.clone(),
        Some(signal_writer.clone()),
    );
    tracker.restore(json_store.load_entries(SIGNAL_DOC).await);
    tracker.spawn(
        bus.subscribe_webhooks(),
        tracker_cmd_rx,
        shutdown_tx.subscribe(),
    );

    // === Trade engine ===
    let mut trade_engine = TradeEngine::new(
        catalog.clone(),
        clock.clone(),
        config.engine.capital,
        order_tx,
        Some(trade_writer.clone()),
    );
    trade_engine.restore(json_store.load_entries(TRADE_DOC).await);
    trade_engine.spawn(store.subscribe(), trade_cmd_rx, shutdown_tx.subscribe());

    // === Broker sink ===
    BrokerSink::new(&config.broker, catalog.clone())
        .spawn(order_rx, shutdown_tx.subscribe());

    // === Webhook relay (optional) ===
    if let Some(url) = config.relay.url.clone() {
        WebhookRelay::new(url).spawn(bus.subscribe_webhooks(), shutdown_tx.subscribe());
        info!("Webhook relay enabled");
    }

    // === Daily crypto reset (optional) ===
    if let Some((hh, mm)) = config.crypto_reset_hhmm() {
        let reset_clock = clock.clone();
        let reset_store = store.clone();
        let reset_tracker = tracker_cmd_tx.clone();
        let reset_trade = trade_cmd_tx.clone();
        let reset_runners = crypto_reset_tx.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let wait = ms_until_ist_hhmm(reset_clock.now_ms(), hh, mm);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(wait as u64)) => {
                        info!("Daily crypto reset ({hh:02}:{mm:02} IST)");
                        let _ = reset_runners.send(());
                        reset_store.clear_prefix("BTC").await;
                        let _ = reset_tracker.send(TrackerCommand::ResetCrypto).await;
                        let _ = reset_trade.send(TradeCommand::ResetCrypto).await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        info!("Daily crypto reset scheduled at {hh:02}:{mm:02} IST");
    }

    // === Stdin ingest ===
    // The production socket clients live outside this process; locally the
    // same envelopes can be piped in as JSON lines:
    //   {"type":"webhook","data":{"symbol":"BTCUSDT","intent":"BUY","stoppx":64000}}
    //   {"type":"tick","data":{"instrument_token":1,"last_price":101.5}}
    //   {"type":"price","data":{"symbol":"BTCUSDT","price":64123.5,"timestamp":0}}
    {
        let ingest_bus = bus.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let Ok(envelope) = serde_json::from_str::<serde_json::Value>(line)
                            else {
                                warn!("Unparseable ingest line");
                                continue;
                            };
                            let kind = envelope.get("type").and_then(|v| v.as_str());
                            let data = envelope.get("data").cloned();
                            match (kind, data) {
                                (Some("webhook"), Some(data)) => {
                                    ingest_bus.publish_webhook_json(data);
                                }
                                (Some("tick"), Some(data)) => {
                                    ingest_bus.publish_tick_json(&data);
                                }
                                (Some("price"), Some(data)) => {
                                    ingest_bus.publish_price_json(&data);
                                }
                                _ => warn!("Unknown ingest envelope"),
                            }
                        }
                        Ok(None) => break, // stdin closed
                        Err(e) => {
                            warn!("Ingest read error: {e}");
                            break;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");
    let _ = shutdown_tx.send(());

    // Flush pending persistence before exiting.
    fsm_writer.flush().await;
    signal_writer.flush().await;
    trade_writer.flush().await;

    info!("SAUDA shutdown complete.");
    Ok(())
}
