use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::models::fsm::FsmSnapshot;
use crate::persistence::store::{to_entry_array, DocWriter};

pub type FsmMap = HashMap<String, FsmSnapshot>;

/// Non-state field changes (usually just the cached LTP moving) are logged
/// at most this often per symbol.
const FIELD_LOG_THROTTLE_MS: i64 = 1_500;

pub const FSM_DOC: &str = "fsm-v1";

/// Process-wide `symbol → FsmSnapshot` mapping with pub/sub fan-out.
///
/// Each symbol has exactly one writing runner; writes serialize through
/// `update`. Every effective change re-broadcasts the whole mapping, which
/// is what the trade engine diffs against. The store also remembers the
/// last non-null price and threshold per symbol for readers that need them
/// before the next snapshot (SELL arming, signal-flag checks).
pub struct FsmStore {
    snapshots: RwLock<FsmMap>,
    last_price: DashMap<String, f64>,
    last_threshold: DashMap<String, f64>,
    update_tx: broadcast::Sender<FsmMap>,
    writer: Option<DocWriter>,
    last_field_log: DashMap<String, i64>,
    clock: Arc<dyn Clock>,
}

impl FsmStore {
    pub fn new(clock: Arc<dyn Clock>, writer: Option<DocWriter>) -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(512);
        Arc::new(Self {
            snapshots: RwLock::new(HashMap::new()),
            last_price: DashMap::new(),
            last_threshold: DashMap::new(),
            update_tx,
            writer,
            last_field_log: DashMap::new(),
            clock,
        })
    }

    /// Populate from a persisted document at boot. Quiet: no broadcast, no
    /// write-back.
    pub async fn restore(&self, entries: Vec<(String, FsmSnapshot)>) {
        let mut map = self.snapshots.write().await;
        for (symbol, snap) in entries {
            if let Some(ltp) = snap.ltp {
                self.last_price.insert(symbol.clone(), ltp);
            }
            if let Some(threshold) = snap.threshold {
                self.last_threshold.insert(symbol.clone(), threshold);
            }
            map.insert(symbol, snap);
        }
    }

    pub async fn update_one(&self, symbol: &str, snap: FsmSnapshot) {
        let mut partial = HashMap::new();
        partial.insert(symbol.to_string(), snap);
        self.update(partial).await;
    }

    /// Merge a partial mapping. Memoizes non-null price/threshold values,
    /// logs per-symbol changes, and emits + persists iff anything changed.
    pub async fn update(&self, partial: FsmMap) {
        let mut changed = false;
        {
            let mut map = self.snapshots.write().await;
            for (symbol, snap) in partial {
                if let Some(ltp) = snap.ltp {
                    self.last_price.insert(symbol.clone(), ltp);
                }
                if let Some(threshold) = snap.threshold {
                    self.last_threshold.insert(symbol.clone(), threshold);
                }

                let prev = map.get(&symbol).cloned();
                if prev.as_ref() != Some(&snap) {
                    self.log_change(&symbol, prev.as_ref(), &snap);
                    map.insert(symbol, snap);
                    changed = true;
                }
            }
        }
        if changed {
            self.emit_and_persist().await;
        }
    }

    fn log_change(&self, symbol: &str, prev: Option<&FsmSnapshot>, next: &FsmSnapshot) {
        let state_changed = prev.map(|p| p.state) != Some(next.state);
        let threshold_changed = prev.map(|p| p.threshold) != Some(next.threshold);
        if state_changed || threshold_changed {
            let from = prev.map(|p| p.state.as_str()).unwrap_or("-");
            info!(
                "{symbol}: {from} -> {} threshold={:?} ltp={:?}",
                next.state, next.threshold, next.ltp
            );
            return;
        }

        let now = self.clock.now_ms();
        let mut last = self.last_field_log.entry(symbol.to_string()).or_insert(i64::MIN);
        if now - *last >= FIELD_LOG_THROTTLE_MS {
            *last = now;
            debug!("{symbol}: {} ltp={:?}", next.state, next.ltp);
        }
    }

    pub async fn snapshot(&self) -> FsmMap {
        self.snapshots.read().await.clone()
    }

    pub async fn get(&self, symbol: &str) -> Option<FsmSnapshot> {
        self.snapshots.read().await.get(symbol).cloned()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_price.get(symbol).map(|v| *v)
    }

    pub fn last_threshold(&self, symbol: &str) -> Option<f64> {
        self.last_threshold.get(symbol).map(|v| *v)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FsmMap> {
        self.update_tx.subscribe()
    }

    /// Reset the given symbols back to empty machines.
    pub async fn clear(&self, symbols: &[String]) {
        let mut changed = false;
        {
            let mut map = self.snapshots.write().await;
            for symbol in symbols {
                if map.remove(symbol).is_some() {
                    self.last_price.remove(symbol);
                    self.last_threshold.remove(symbol);
                    info!("{symbol}: snapshot cleared");
                    changed = true;
                }
            }
        }
        if changed {
            self.emit_and_persist().await;
        }
    }

    pub async fn clear_all(&self) {
        let symbols: Vec<String> = self.snapshots.read().await.keys().cloned().collect();
        self.clear(&symbols).await;
    }

    /// Reset every symbol starting with `prefix` (crypto reset clears the
    /// `BTC*` family).
    pub async fn clear_prefix(&self, prefix: &str) {
        let symbols: Vec<String> = self
            .snapshots
            .read()
            .await
            .keys()
            .filter(|s| s.starts_with(prefix))
            .cloned()
            .collect();
        self.clear(&symbols).await;
    }

    async fn emit_and_persist(&self) {
        let map = self.snapshots.read().await.clone();
        if let Some(writer) = &self.writer {
            writer.queue(to_entry_array(map.clone()));
        }
        let _ = self.update_tx.send(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::fsm::FsmState;

    fn snap(state: FsmState, ltp: Option<f64>, threshold: Option<f64>) -> FsmSnapshot {
        FsmSnapshot { state, ltp, threshold, ..Default::default() }
    }

    #[tokio::test]
    async fn test_update_emits_only_on_change() {
        let store = FsmStore::new(Arc::new(ManualClock::new(0)), None);
        let mut rx = store.subscribe();

        let s = snap(FsmState::NopositionSignal, Some(100.0), Some(99.0));
        store.update_one("INFY", s.clone()).await;
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        // Identical snapshot: no emission.
        store.update_one("INFY", s).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memos_survive_null_fields() {
        let store = FsmStore::new(Arc::new(ManualClock::new(0)), None);
        store
            .update_one("INFY", snap(FsmState::NopositionSignal, Some(101.5), Some(100.0)))
            .await;
        store.update_one("INFY", snap(FsmState::Nosignal, None, None)).await;
        // Memos keep the last non-null values.
        assert_eq!(store.last_price("INFY"), Some(101.5));
        assert_eq!(store.last_threshold("INFY"), Some(100.0));
    }

    #[tokio::test]
    async fn test_clear_prefix() {
        let store = FsmStore::new(Arc::new(ManualClock::new(0)), None);
        store
            .update_one("BTCUSDT_LONG", snap(FsmState::BuyPosition, Some(1.0), Some(1.0)))
            .await;
        store.update_one("INFY", snap(FsmState::Nosignal, Some(2.0), None)).await;

        store.clear_prefix("BTC").await;
        let map = store.snapshot().await;
        assert!(!map.contains_key("BTCUSDT_LONG"));
        assert!(map.contains_key("INFY"));
        assert_eq!(store.last_price("BTCUSDT_LONG"), None);
    }
}
