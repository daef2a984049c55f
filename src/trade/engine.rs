use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::InstrumentCatalog;
use crate::clock::{ist_time, minute_index, next_minute_start, second_of_minute, Clock};
use crate::engine::store::FsmMap;
use crate::models::event::Direction;
use crate::models::fsm::{FsmSnapshot, FsmState};
use crate::models::trade::{pnl_delta, OpenTrade, TradeRow};
use crate::persistence::store::{to_entry_array, DocWriter};

pub const TRADE_DOC: &str = "trade-v1";

/// Flat cost charged once per live exit, and pre-subtracted from the live
/// unrealized P&L shown while open.
pub const LIVE_EXIT_COST: f64 = 50.0;

/// Control messages into the trade engine.
#[derive(Debug, Clone)]
pub enum TradeCommand {
    /// Zero the paper cumulative P&L for one symbol (broker-6 alternation
    /// and buy-sell-sell rearm).
    ResetCumulative(String),
    /// Drop all state for `BTC*` symbols.
    ResetCrypto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Open,
    Close,
}

/// An order the broker sink should place.
#[derive(Debug, Clone)]
pub struct OrderCommand {
    pub id: Uuid,
    pub symbol: String,
    pub side: Direction,
    pub quantity: i64,
    pub kind: OrderKind,
}

/// Everything the engine tracks for one symbol. Paper and live books are
/// disjoint; a live trade only ever exists under an open paper trade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolBook {
    pub paper_open: Option<OpenTrade>,
    pub live_open: Option<OpenTrade>,
    pub paper_cumulative: f64,
    pub live_cumulative: f64,
    pub paper_rows: Vec<TradeRow>,
    pub live_rows: Vec<TradeRow>,
    /// No live entry before this instant (set by force-close).
    pub live_blocked_until_ms: i64,
    /// Minute of the most recent live entry; at most one per minute.
    pub last_live_minute: Option<i64>,
    pub next_trade_seq: u64,
    #[serde(skip)]
    last_pnl_log_minute: Option<i64>,
}

pub type TradeBooks = HashMap<String, SymbolBook>;

/// Paper-trade bookkeeper and live-trade gate, driven by FSM snapshot
/// diffs. Paper positions open and close on the machine's position edges;
/// live positions ride along only while the paper book says the symbol is
/// making money.
pub struct TradeEngine {
    catalog: Arc<InstrumentCatalog>,
    clock: Arc<dyn Clock>,
    capital: f64,
    prev: FsmMap,
    books: TradeBooks,
    order_tx: mpsc::Sender<OrderCommand>,
    snapshot_tx: broadcast::Sender<TradeBooks>,
    writer: Option<DocWriter>,
}

impl TradeEngine {
    pub fn new(
        catalog: Arc<InstrumentCatalog>,
        clock: Arc<dyn Clock>,
        capital: f64,
        order_tx: mpsc::Sender<OrderCommand>,
        writer: Option<DocWriter>,
    ) -> Self {
        let (snapshot_tx, _) = broadcast::channel(256);
        Self {
            catalog,
            clock,
            capital,
            prev: HashMap::new(),
            books: HashMap::new(),
            order_tx,
            snapshot_tx,
            writer,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeBooks> {
        self.snapshot_tx.subscribe()
    }

    pub fn restore(&mut self, entries: Vec<(String, SymbolBook)>) {
        self.books = entries.into_iter().collect();
    }

    pub fn books(&self) -> &TradeBooks {
        &self.books
    }

    /// Process one published FSM mapping: act on every symbol whose
    /// snapshot changed since the previous one.
    pub async fn handle_fsm_map(&mut self, map: FsmMap) {
        let mut acted = false;
        for (symbol, snap) in &map {
            if self.prev.get(symbol) == Some(snap) {
                continue;
            }
            let prev = self.prev.get(symbol).cloned().unwrap_or_default();
            acted |= self.on_snapshot(symbol.clone(), &prev, snap).await;
        }
        self.prev = map;
        if acted {
            self.publish();
        }
    }

    pub async fn handle_command(&mut self, cmd: TradeCommand) {
        match cmd {
            TradeCommand::ResetCumulative(symbol) => {
                if let Some(book) = self.books.get_mut(&symbol) {
                    book.paper_cumulative = 0.0;
                    info!("{symbol}: paper cumulative P&L reset");
                    self.publish();
                }
            }
            TradeCommand::ResetCrypto => {
                self.books.retain(|symbol, _| !symbol.starts_with("BTC"));
                self.prev.retain(|symbol, _| !symbol.starts_with("BTC"));
                info!("Crypto trade state reset");
                self.publish();
            }
        }
    }

    /// React to one symbol's snapshot change. Returns whether any book
    /// mutated.
    async fn on_snapshot(&mut self, symbol: String, prev: &FsmSnapshot, cur: &FsmSnapshot) -> bool {
        let Some(ltp) = cur.ltp else {
            return false;
        };
        if ltp <= 0.0 {
            return false;
        }

        let was_in_position = prev.state.in_position();
        let is_in_position = cur.state.in_position();
        let entering = !was_in_position && is_in_position;
        let exiting = was_in_position && !is_in_position;
        let now = self.clock.now_ms();

        let lot = self.catalog.lot_of(&symbol).unwrap_or(1).max(1);
        let mut acted = false;

        if entering {
            let capital = self.capital;
            let book = self.books.entry(symbol.clone()).or_default();
            if book.paper_open.is_none() {
                let entry_price = cur.threshold.unwrap_or(ltp);
                let quantity = quantity_for(capital, lot, ltp);
                let side = if cur.state == FsmState::SellPosition {
                    Direction::Sell
                } else {
                    Direction::Buy
                };
                book.next_trade_seq += 1;
                let id = format!("{symbol}-{}", book.next_trade_seq);
                let trade = OpenTrade {
                    id: id.clone(),
                    symbol: symbol.clone(),
                    side,
                    entry_price,
                    quantity,
                    lot,
                    time_ist: ist_time(now),
                };
                book.paper_rows.insert(
                    0,
                    TradeRow {
                        id,
                        time_ist: ist_time(now),
                        symbol: symbol.clone(),
                        entry_price,
                        current_price: ltp,
                        unrealized_pnl: 0.0,
                        cumulative_pnl: book.paper_cumulative,
                        quantity,
                    },
                );
                info!("{symbol}: paper {side} OPEN entry={entry_price} qty={quantity} lot={lot}");
                book.paper_open = Some(trade);
                acted = true;
            }
        }

        if is_in_position {
            let paper = self.books.get(&symbol).and_then(|b| b.paper_open.clone());
            if let Some(paper) = paper {
                let paper_unrealized = pnl_delta(&symbol, paper.entry_price, ltp)
                    * paper.quantity as f64
                    * paper.lot as f64;
                let live_open = {
                    let book = self.books.entry(symbol.clone()).or_default();
                    update_row(&mut book.paper_rows, &paper.id, ltp, paper_unrealized);
                    book.live_open.is_some()
                };
                acted = true;

                if live_open {
                    self.ride_live(&symbol, ltp, now, paper_unrealized).await;
                } else {
                    self.maybe_open_live(&symbol, ltp, now, entering, paper_unrealized, &paper)
                        .await;
                }

                // End-of-minute paper P&L line, once per symbol per minute.
                let minute = minute_index(now);
                if let Some(book) = self.books.get_mut(&symbol) {
                    if second_of_minute(now) >= 59 && book.last_pnl_log_minute != Some(minute) {
                        book.last_pnl_log_minute = Some(minute);
                        info!(
                            "{symbol}: minute P&L paper={paper_unrealized:.2} ltp={ltp} entry={} qty={} lot={}",
                            paper.entry_price, paper.quantity, paper.lot
                        );
                    }
                }
            }
        }

        if exiting {
            let mut close_live = false;
            if let Some(book) = self.books.get_mut(&symbol) {
                if let Some(paper) = book.paper_open.take() {
                    let realized = pnl_delta(&symbol, paper.entry_price, ltp)
                        * paper.quantity as f64
                        * paper.lot as f64;
                    book.paper_cumulative += realized;
                    book.paper_rows.insert(
                        0,
                        TradeRow {
                            id: format!("{}-exit", paper.id),
                            time_ist: ist_time(now),
                            symbol: symbol.clone(),
                            entry_price: paper.entry_price,
                            current_price: ltp,
                            unrealized_pnl: realized,
                            cumulative_pnl: book.paper_cumulative,
                            quantity: paper.quantity,
                        },
                    );
                    info!(
                        "{symbol}: paper EXIT realized={realized:.2} cumulative={:.2}",
                        book.paper_cumulative
                    );
                    acted = true;
                    close_live = book.live_open.is_some();
                }
            }
            if close_live {
                self.force_close_live(&symbol, ltp, now, "paper exit").await;
            }
        }

        acted
    }

    /// Live trade is open: refresh its displayed P&L and force-close the
    /// moment the paper oracle goes negative.
    async fn ride_live(&mut self, symbol: &str, ltp: f64, now: i64, paper_unrealized: f64) {
        let Some(book) = self.books.get_mut(symbol) else { return };
        let Some(live) = book.live_open.clone() else { return };

        let raw = pnl_delta(symbol, live.entry_price, ltp) * live.quantity as f64
            * live.lot as f64;
        update_row(&mut book.live_rows, &live.id, ltp, raw - LIVE_EXIT_COST);

        if paper_unrealized + book.paper_cumulative < 0.0 {
            self.force_close_live(symbol, ltp, now, "paper oracle negative").await;
        }
    }

    /// Live entry gate: not blocked, combined paper P&L non-negative, at an
    /// entry edge or a minute boundary, at most one open per minute.
    async fn maybe_open_live(
        &mut self,
        symbol: &str,
        ltp: f64,
        now: i64,
        entering: bool,
        paper_unrealized: f64,
        paper: &OpenTrade,
    ) {
        let Some(book) = self.books.get_mut(symbol) else { return };

        let combined = paper_unrealized + book.paper_cumulative;
        let minute = minute_index(now);
        let allowed = book.live_blocked_until_ms <= now && combined >= 0.0;
        if !allowed {
            return;
        }
        if !(entering || second_of_minute(now) == 0) {
            return;
        }
        if book.last_live_minute == Some(minute) {
            return;
        }

        book.next_trade_seq += 1;
        let id = format!("{symbol}-{}-live", book.next_trade_seq);
        let live = OpenTrade {
            id: id.clone(),
            symbol: symbol.to_string(),
            side: paper.side,
            entry_price: ltp,
            quantity: paper.quantity,
            lot: paper.lot,
            time_ist: ist_time(now),
        };
        book.live_rows.insert(
            0,
            TradeRow {
                id,
                time_ist: ist_time(now),
                symbol: symbol.to_string(),
                entry_price: ltp,
                current_price: ltp,
                unrealized_pnl: -LIVE_EXIT_COST,
                cumulative_pnl: book.live_cumulative,
                quantity: live.quantity,
            },
        );
        book.last_live_minute = Some(minute);
        info!(
            "{symbol}: live {} OPEN entry={ltp} qty={} combined={combined:.2}",
            live.side, live.quantity
        );
        let order = OrderCommand {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: live.side,
            quantity: live.quantity,
            kind: OrderKind::Open,
        };
        book.live_open = Some(live);
        self.emit_order(order).await;
    }

    /// Close the live trade now: realize its raw P&L minus the fixed exit
    /// cost, and block re-entry until the next minute starts.
    async fn force_close_live(&mut self, symbol: &str, ltp: f64, now: i64, reason: &str) {
        let Some(book) = self.books.get_mut(symbol) else { return };
        let Some(live) = book.live_open.take() else { return };

        let raw = pnl_delta(symbol, live.entry_price, ltp) * live.quantity as f64
            * live.lot as f64;
        book.live_cumulative += raw - LIVE_EXIT_COST;
        book.live_rows.insert(
            0,
            TradeRow {
                id: format!("{}-exit", live.id),
                time_ist: ist_time(now),
                symbol: symbol.to_string(),
                entry_price: live.entry_price,
                current_price: ltp,
                unrealized_pnl: raw - LIVE_EXIT_COST,
                cumulative_pnl: book.live_cumulative,
                quantity: live.quantity,
            },
        );
        book.live_blocked_until_ms = next_minute_start(now);
        warn!(
            "{symbol}: live CLOSE ({reason}) realized={:.2} cumulative={:.2}",
            raw - LIVE_EXIT_COST,
            book.live_cumulative
        );
        self.emit_order(OrderCommand {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: live.side,
            quantity: live.quantity,
            kind: OrderKind::Close,
        })
        .await;
    }

    async fn emit_order(&self, order: OrderCommand) {
        if self.order_tx.send(order).await.is_err() {
            warn!("Broker sink gone — order dropped");
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.books.clone());
        if let Some(writer) = &self.writer {
            writer.queue(to_entry_array(self.books.clone()));
        }
    }

    pub fn spawn(
        mut self,
        mut updates: broadcast::Receiver<FsmMap>,
        mut commands: mpsc::Receiver<TradeCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    map = updates.recv() => match map {
                        Ok(map) => self.handle_fsm_map(map).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Trade engine lagged {n} snapshot updates");
                        }
                        Err(_) => break,
                    },
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Trade engine stopped");
        })
    }
}

/// ceil(capital / (lot * ltp)), computed once at paper entry.
fn quantity_for(capital: f64, lot: i64, ltp: f64) -> i64 {
    (capital / (lot as f64 * ltp)).ceil() as i64
}

fn update_row(rows: &mut [TradeRow], id: &str, current_price: f64, unrealized: f64) {
    if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
        row.current_price = current_price;
        row.unrealized_pnl = unrealized;
    }
}
