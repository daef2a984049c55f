use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::InstrumentCatalog;
use crate::clock::{ist_time, Clock};
use crate::engine::runner::RearmCommand;
use crate::engine::store::FsmStore;
use crate::models::event::{Direction, WebhookEvent};
use crate::models::fsm::FsmState;
use crate::models::signal::{SignalRow, SignalTracking, SIGNAL_ROWS_CAP};
use crate::persistence::store::{to_entry_array, DocWriter};
use crate::signals::modes::{FilterMode, ModeAllowSets};
use crate::trade::engine::TradeCommand;

pub const SIGNAL_DOC: &str = "signal-v1";

/// Broker-6 keeps its direction counters in a side map instead of the
/// tracking struct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerCounts {
    pub sell_after_buy: u32,
    pub buy_after_sell: u32,
}

/// One mode's full signal table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeSignals {
    pub tracking: HashMap<String, SignalTracking>,
    pub rows: HashMap<String, Vec<SignalRow>>,
    /// Symbols in the order their first row arrived.
    pub symbols: Vec<String>,
    pub counts: HashMap<String, BrokerCounts>,
}

impl ModeSignals {
    fn retain_symbols(&mut self, keep: impl Fn(&str) -> bool) {
        self.tracking.retain(|s, _| keep(s));
        self.rows.retain(|s, _| keep(s));
        self.counts.retain(|s, _| keep(s));
        self.symbols.retain(|s| keep(s));
    }
}

/// Persisted shape: entry arrays instead of maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeSignalsDoc {
    pub tracking: Vec<(String, SignalTracking)>,
    pub rows: Vec<(String, Vec<SignalRow>)>,
    pub symbols: Vec<String>,
    pub counts: Vec<(String, BrokerCounts)>,
}

impl From<&ModeSignals> for ModeSignalsDoc {
    fn from(state: &ModeSignals) -> Self {
        let mut doc = ModeSignalsDoc {
            tracking: state.tracking.clone().into_iter().collect(),
            rows: state.rows.clone().into_iter().collect(),
            symbols: state.symbols.clone(),
            counts: state.counts.clone().into_iter().collect(),
        };
        doc.tracking.sort_by(|a, b| a.0.cmp(&b.0));
        doc.rows.sort_by(|a, b| a.0.cmp(&b.0));
        doc.counts.sort_by(|a, b| a.0.cmp(&b.0));
        doc
    }
}

impl From<ModeSignalsDoc> for ModeSignals {
    fn from(doc: ModeSignalsDoc) -> Self {
        ModeSignals {
            tracking: doc.tracking.into_iter().collect(),
            rows: doc.rows.into_iter().collect(),
            symbols: doc.symbols,
            counts: doc.counts.into_iter().collect(),
        }
    }
}

/// Control messages into the tracker.
#[derive(Debug, Clone)]
pub enum TrackerCommand {
    ClearSignals(FilterMode),
    ResetCrypto,
}

pub type SignalStates = HashMap<String, ModeSignals>;

/// Fans every webhook out to the five mode tables, maintaining pattern
/// counters and sticky flags. Broker-6's rearm and cumulative-reset side
/// effects leave as control messages; this component never writes FSM or
/// trade state directly.
pub struct SignalTracker {
    modes: HashMap<FilterMode, ModeSignals>,
    allow: ModeAllowSets,
    catalog: Arc<InstrumentCatalog>,
    store: Arc<FsmStore>,
    clock: Arc<dyn Clock>,
    rearm_tx: mpsc::Sender<RearmCommand>,
    trade_tx: mpsc::Sender<TradeCommand>,
    snapshot_tx: broadcast::Sender<SignalStates>,
    writer: Option<DocWriter>,
}

impl SignalTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<InstrumentCatalog>,
        store: Arc<FsmStore>,
        clock: Arc<dyn Clock>,
        rearm_tx: mpsc::Sender<RearmCommand>,
        trade_tx: mpsc::Sender<TradeCommand>,
        writer: Option<DocWriter>,
    ) -> Self {
        let (snapshot_tx, _) = broadcast::channel(128);
        Self {
            modes: HashMap::new(),
            allow: ModeAllowSets::from_catalog(&catalog),
            catalog,
            store,
            clock,
            rearm_tx,
            trade_tx,
            snapshot_tx,
            writer,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalStates> {
        self.snapshot_tx.subscribe()
    }

    pub fn restore(&mut self, entries: Vec<(String, ModeSignalsDoc)>) {
        for (name, doc) in entries {
            if let Some(mode) = FilterMode::from_name(&name) {
                self.modes.insert(mode, doc.into());
            }
        }
    }

    pub fn mode_state(&self, mode: FilterMode) -> Option<&ModeSignals> {
        self.modes.get(&mode)
    }

    /// Update every mode for one webhook, then publish once so downstream
    /// consumers never observe a partially fanned-out signal.
    pub async fn handle_webhook(&mut self, ev: &WebhookEvent) {
        let mut commands = Vec::new();
        let mut touched = false;
        for mode in FilterMode::ALL {
            touched |= self.apply_mode(mode, ev, &mut commands).await;
        }

        for cmd in commands {
            match cmd {
                OutCommand::Rearm(cmd) => {
                    if self.rearm_tx.send(cmd).await.is_err() {
                        warn!("Broker runner gone — rearm dropped");
                    }
                }
                OutCommand::Trade(cmd) => {
                    if self.trade_tx.send(cmd).await.is_err() {
                        warn!("Trade engine gone — command dropped");
                    }
                }
            }
        }

        if touched {
            self.publish();
        }
    }

    pub fn handle_command(&mut self, cmd: TrackerCommand) {
        match cmd {
            TrackerCommand::ClearSignals(mode) => {
                self.modes.insert(mode, ModeSignals::default());
                info!("Signal table cleared: {mode}");
            }
            TrackerCommand::ResetCrypto => {
                for state in self.modes.values_mut() {
                    state.retain_symbols(|s| !s.starts_with("BTC"));
                }
                info!("Crypto signal state reset");
            }
        }
        self.publish();
    }

    async fn apply_mode(
        &mut self,
        mode: FilterMode,
        ev: &WebhookEvent,
        commands: &mut Vec<OutCommand>,
    ) -> bool {
        let raw = ev.symbol.as_str();
        let mapped = mode.map_symbol(raw, &self.catalog);
        if !self.allow.allows(mode, raw, &mapped) {
            return false;
        }
        let Some(direction) = ev.direction() else {
            return false;
        };
        if !mode.accepts_direction(direction) {
            return false;
        }

        // FSM context for the pattern flags, keyed by the mode's symbol.
        let snap = self.store.get(&mapped).await.unwrap_or_default();
        let ltp = snap.ltp.or_else(|| self.store.last_price(&mapped));

        let state = self.modes.entry(mode).or_default();
        let tracking = state.tracking.entry(mapped.clone()).or_default();
        let prev = tracking.last_signal;
        let alternated = prev.is_some() && prev != Some(direction);

        if mode == FilterMode::Broker6 {
            tracking.alternate_signal = alternated;
            if alternated {
                tracking.buy_sell_sell = false;
                tracking.sell_buy_buy = false;
                commands.push(OutCommand::Trade(TradeCommand::ResetCumulative(mapped.clone())));
            }

            let counts = state.counts.entry(mapped.clone()).or_default();
            update_counters(
                prev,
                direction,
                &mut counts.sell_after_buy,
                &mut counts.buy_after_sell,
            );

            if direction == Direction::Sell && counts.sell_after_buy >= 2 {
                tracking.buy_sell_sell = true;
                // An idle machine under its last buy threshold snaps back
                // to it; the flag clears once the rearm goes out.
                let idle = !snap.state.in_position();
                if let (true, Some(ltp), Some(buy_threshold)) =
                    (idle, ltp, snap.last_buy_threshold)
                {
                    if ltp < buy_threshold {
                        commands.push(OutCommand::Rearm(RearmCommand {
                            symbol: mapped.clone(),
                            threshold: buy_threshold,
                        }));
                        commands.push(OutCommand::Trade(TradeCommand::ResetCumulative(
                            mapped.clone(),
                        )));
                        tracking.buy_sell_sell = false;
                        info!("{mapped}: buy-sell-sell rearm at {buy_threshold}");
                    }
                }
            }
        } else {
            update_counters(
                prev,
                direction,
                &mut tracking.sell_after_buy_count,
                &mut tracking.buy_after_sell_count,
            );
            if alternated {
                tracking.alternate_signal = true;
            }
            if direction == Direction::Sell
                && tracking.sell_after_buy_count >= 2
                && snap.state == FsmState::NopositionSignal
            {
                if let (Some(ltp), Some(buy_threshold)) = (ltp, snap.last_buy_threshold) {
                    if ltp < buy_threshold {
                        tracking.buy_sell_sell = true;
                    }
                }
            }
            if direction == Direction::Buy
                && tracking.buy_after_sell_count >= 2
                && snap.state == FsmState::NopositionSignal
            {
                if let (Some(ltp), Some(sell_threshold)) = (ltp, snap.last_sell_threshold) {
                    if ltp < sell_threshold {
                        tracking.sell_buy_buy = true;
                    }
                }
            }
        }
        tracking.last_signal = Some(direction);

        let row = SignalRow {
            time_ist: ist_time(ev.recv_ms),
            intent: direction,
            stop_px: ev.stop_px,
            alternate_signal: tracking.alternate_signal,
            buy_sell_sell: tracking.buy_sell_sell,
            sell_buy_buy: tracking.sell_buy_buy,
        };
        let rows = state.rows.entry(mapped.clone()).or_default();
        rows.insert(0, row);
        rows.truncate(SIGNAL_ROWS_CAP);
        if !state.symbols.contains(&mapped) {
            state.symbols.push(mapped);
        }
        true
    }

    fn publish(&self) {
        let states: SignalStates = self
            .modes
            .iter()
            .map(|(mode, state)| (mode.name().to_string(), state.clone()))
            .collect();
        let _ = self.snapshot_tx.send(states);

        if let Some(writer) = &self.writer {
            let entries: Vec<(String, ModeSignalsDoc)> = self
                .modes
                .iter()
                .map(|(mode, state)| (mode.name().to_string(), ModeSignalsDoc::from(state)))
                .collect();
            writer.queue(to_entry_array(entries));
        }
    }

    pub fn spawn(
        mut self,
        mut webhooks: broadcast::Receiver<WebhookEvent>,
        mut commands: mpsc::Receiver<TrackerCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = webhooks.recv() => match ev {
                        Ok(ev) => self.handle_webhook(&ev).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Signal tracker lagged {n} webhooks");
                        }
                        Err(_) => break,
                    },
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Signal tracker stopped");
        })
    }
}

enum OutCommand {
    Rearm(RearmCommand),
    Trade(TradeCommand),
}

/// Counter rule: each signal resets the opposite counter and bumps its own
/// when the prior signal was the complementary direction (or a streak is
/// already running).
fn update_counters(
    prev: Option<Direction>,
    direction: Direction,
    sell_after_buy: &mut u32,
    buy_after_sell: &mut u32,
) {
    match direction {
        Direction::Buy => {
            *sell_after_buy = 0;
            if prev == Some(Direction::Sell) || *buy_after_sell > 0 {
                *buy_after_sell += 1;
            }
        }
        Direction::Sell => {
            *buy_after_sell = 0;
            if prev == Some(Direction::Buy) || *sell_after_buy > 0 {
                *sell_after_buy += 1;
            }
        }
    }
}
