//! The per-instrument transition algebra shared by every runner.
//!
//! Pure reducers: each function takes (state, event inputs) and mutates one
//! `InstrumentFsm` in place, returning the observed edges. Runners own the
//! machines and decide which entry state an armed symbol moves into; the
//! algebra itself is identical across broker and crypto feeds.

use serde::{Deserialize, Serialize};

use crate::clock::{minute_index, second_of_minute};
use crate::models::event::Direction;
use crate::models::fsm::{FsmSnapshot, FsmState};

/// Internal per-symbol machine. The published subset is [`FsmSnapshot`];
/// the check/signal timestamps stay private to the owning runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentFsm {
    pub state: FsmState,
    pub ltp: Option<f64>,
    pub threshold: Option<f64>,
    pub last_buy_threshold: Option<f64>,
    pub last_sell_threshold: Option<f64>,
    pub last_direction: Option<Direction>,
    pub last_signal_at_ms: Option<i64>,
    pub last_checked_at_ms: Option<i64>,
    pub last_blocked_at_ms: Option<i64>,
}

/// One observed state edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: FsmState,
    pub to: FsmState,
}

impl InstrumentFsm {
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            state: self.state,
            ltp: self.ltp,
            threshold: self.threshold,
            last_buy_threshold: self.last_buy_threshold,
            last_sell_threshold: self.last_sell_threshold,
            last_blocked_at_ms: self.last_blocked_at_ms,
        }
    }

    /// Signal transition. BUY arms at the webhook's stop price; SELL arms
    /// at the last known LTP (which may still be unknown, in which case
    /// tick transitions stay no-ops until a price arrives).
    ///
    /// `retain_position` is the broker runner's behaviour: a repeat signal
    /// while in a position only re-aims the threshold, it does not exit.
    pub fn apply_signal(
        &mut self,
        direction: Direction,
        stop_px: Option<f64>,
        last_known_ltp: Option<f64>,
        now_ms: i64,
        retain_position: bool,
    ) -> Edge {
        let from = self.state;

        match direction {
            Direction::Buy => {
                self.threshold = stop_px;
                if stop_px.is_some() {
                    self.last_buy_threshold = stop_px;
                }
            }
            Direction::Sell => {
                let arm_at = last_known_ltp.or(self.ltp);
                self.threshold = arm_at;
                if arm_at.is_some() {
                    self.last_sell_threshold = arm_at;
                }
            }
        }
        self.last_direction = Some(direction);
        self.last_signal_at_ms = Some(now_ms);

        if !(retain_position && from.in_position()) {
            self.state = FsmState::NopositionSignal;
            self.last_checked_at_ms = None;
            self.last_blocked_at_ms = None;
        }

        Edge { from, to: self.state }
    }

    /// Tick transition. Returns the edges taken: usually zero or one, two
    /// when a blocked symbol re-arms and re-evaluates in the same step.
    pub fn apply_tick(&mut self, ltp: f64, now_ms: i64, entry_state: FsmState) -> Vec<Edge> {
        self.ltp = Some(ltp);

        let (Some(threshold), Some(_signal_at)) = (self.threshold, self.last_signal_at_ms) else {
            return Vec::new();
        };

        let mut edges = Vec::new();
        match self.state {
            FsmState::Nosignal => {}
            FsmState::BuyPosition => {
                if ltp < threshold {
                    self.block(now_ms, FsmState::BuyPosition, &mut edges);
                }
            }
            FsmState::SellPosition => {
                if ltp > threshold {
                    self.block(now_ms, FsmState::SellPosition, &mut edges);
                }
            }
            FsmState::NopositionSignal => {
                self.evaluate_armed(ltp, threshold, now_ms, entry_state, &mut edges);
            }
            FsmState::NopositionBlocked => {
                let Some(blocked_at) = self.last_blocked_at_ms else {
                    return edges;
                };
                // Re-evaluation happens only in the first second of a
                // minute strictly after the block minute.
                if second_of_minute(now_ms) == 0 && minute_index(now_ms) > minute_index(blocked_at)
                {
                    edges.push(Edge {
                        from: FsmState::NopositionBlocked,
                        to: FsmState::NopositionSignal,
                    });
                    self.state = FsmState::NopositionSignal;
                    self.last_blocked_at_ms = None;
                    self.last_checked_at_ms = None;
                    self.evaluate_armed(ltp, threshold, now_ms, entry_state, &mut edges);
                }
            }
        }
        edges
    }

    /// Re-arm an idle machine at an explicit threshold (the broker-6
    /// buy-sell-sell pattern snapping back to the last buy threshold).
    pub fn rearm(&mut self, threshold: f64, now_ms: i64) -> Edge {
        let from = self.state;
        self.threshold = Some(threshold);
        self.state = FsmState::NopositionSignal;
        self.last_signal_at_ms = Some(now_ms);
        self.last_checked_at_ms = None;
        self.last_blocked_at_ms = None;
        Edge { from, to: self.state }
    }

    fn evaluate_armed(
        &mut self,
        ltp: f64,
        threshold: f64,
        now_ms: i64,
        entry_state: FsmState,
        edges: &mut Vec<Edge>,
    ) {
        // One evaluation per signal: a later tick in the same armed window
        // is a no-op.
        if let (Some(checked), Some(signal_at)) = (self.last_checked_at_ms, self.last_signal_at_ms)
        {
            if checked >= signal_at {
                return;
            }
        }
        self.last_checked_at_ms = Some(now_ms);

        // Entry is a threshold cross in the position's direction: longs
        // above, shorts below. The hold conditions mirror this.
        let entered = match entry_state {
            FsmState::SellPosition => ltp < threshold,
            _ => ltp > threshold,
        };

        let from = self.state;
        if entered {
            self.state = entry_state;
        } else {
            self.state = FsmState::NopositionBlocked;
            self.last_blocked_at_ms = Some(now_ms);
        }
        edges.push(Edge { from, to: self.state });
    }

    fn block(&mut self, now_ms: i64, from: FsmState, edges: &mut Vec<Edge>) {
        self.state = FsmState::NopositionBlocked;
        self.last_blocked_at_ms = Some(now_ms);
        edges.push(Edge { from, to: FsmState::NopositionBlocked });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MINUTE_MS;

    fn armed_buy(threshold: f64, at_ms: i64) -> InstrumentFsm {
        let mut fsm = InstrumentFsm::default();
        fsm.apply_signal(Direction::Buy, Some(threshold), None, at_ms, false);
        fsm
    }

    #[test]
    fn test_buy_signal_arms_at_stop_price() {
        let fsm = armed_buy(100.0, 1_000);
        assert_eq!(fsm.state, FsmState::NopositionSignal);
        assert_eq!(fsm.threshold, Some(100.0));
        assert_eq!(fsm.last_buy_threshold, Some(100.0));
        assert_eq!(fsm.last_signal_at_ms, Some(1_000));
        assert_eq!(fsm.last_checked_at_ms, None);
    }

    #[test]
    fn test_sell_signal_arms_at_last_ltp() {
        let mut fsm = InstrumentFsm::default();
        fsm.ltp = Some(100.0);
        fsm.apply_signal(Direction::Sell, None, None, 1_000, false);
        assert_eq!(fsm.threshold, Some(100.0));
        assert_eq!(fsm.last_sell_threshold, Some(100.0));
    }

    #[test]
    fn test_sell_signal_without_ltp_recorded_but_inert() {
        let mut fsm = InstrumentFsm::default();
        fsm.apply_signal(Direction::Sell, None, None, 1_000, false);
        assert_eq!(fsm.state, FsmState::NopositionSignal);
        assert_eq!(fsm.threshold, None);
        // Tick is a no-op (beyond caching the price) until a threshold exists.
        let edges = fsm.apply_tick(99.0, 2_000, FsmState::SellPosition);
        assert!(edges.is_empty());
        assert_eq!(fsm.state, FsmState::NopositionSignal);
        assert_eq!(fsm.ltp, Some(99.0));
    }

    #[test]
    fn test_armed_entry_and_block() {
        let mut fsm = armed_buy(100.0, 1_000);
        let edges = fsm.apply_tick(101.0, 2_000, FsmState::BuyPosition);
        assert_eq!(
            edges,
            vec![Edge { from: FsmState::NopositionSignal, to: FsmState::BuyPosition }]
        );

        let mut fsm = armed_buy(100.0, 1_000);
        let edges = fsm.apply_tick(99.0, 2_000, FsmState::BuyPosition);
        assert_eq!(
            edges,
            vec![Edge { from: FsmState::NopositionSignal, to: FsmState::NopositionBlocked }]
        );
        assert_eq!(fsm.last_blocked_at_ms, Some(2_000));
    }

    #[test]
    fn test_armed_evaluates_once_per_signal() {
        let mut fsm = armed_buy(100.0, 1_000);
        fsm.apply_tick(99.0, 2_000, FsmState::BuyPosition);
        assert_eq!(fsm.state, FsmState::NopositionBlocked);

        // A fresh signal clears the checked marker and re-arms.
        fsm.apply_signal(Direction::Buy, Some(100.0), None, 3_000, false);
        assert_eq!(fsm.state, FsmState::NopositionSignal);
        let edges = fsm.apply_tick(101.0, 4_000, FsmState::BuyPosition);
        assert_eq!(edges.len(), 1);
        assert_eq!(fsm.state, FsmState::BuyPosition);
    }

    #[test]
    fn test_position_holds_and_blocks() {
        let mut fsm = armed_buy(100.0, 1_000);
        fsm.apply_tick(101.0, 2_000, FsmState::BuyPosition);

        // At or above threshold: hold.
        assert!(fsm.apply_tick(100.0, 3_000, FsmState::BuyPosition).is_empty());
        assert_eq!(fsm.state, FsmState::BuyPosition);

        // Below threshold: blocked.
        let edges = fsm.apply_tick(99.9, 4_000, FsmState::BuyPosition);
        assert_eq!(edges.len(), 1);
        assert_eq!(fsm.state, FsmState::NopositionBlocked);
    }

    #[test]
    fn test_short_position_holds_and_blocks() {
        let mut fsm = InstrumentFsm::default();
        fsm.ltp = Some(100.0);
        fsm.apply_signal(Direction::Sell, None, None, 1_000, false);
        fsm.apply_tick(99.0, 2_000, FsmState::SellPosition);
        assert_eq!(fsm.state, FsmState::SellPosition);

        assert!(fsm.apply_tick(100.0, 3_000, FsmState::SellPosition).is_empty());
        let edges = fsm.apply_tick(101.0, 4_000, FsmState::SellPosition);
        assert_eq!(edges.len(), 1);
        assert_eq!(fsm.state, FsmState::NopositionBlocked);
    }

    #[test]
    fn test_blocked_rearms_only_at_next_minute_boundary() {
        let base = 1_000 * MINUTE_MS; // minute boundary
        let mut fsm = armed_buy(100.0, base + 10_000);
        fsm.apply_tick(99.0, base + 30_000, FsmState::BuyPosition);
        assert_eq!(fsm.state, FsmState::NopositionBlocked);

        // Later in the same minute: no-op.
        assert!(fsm.apply_tick(101.0, base + 45_000, FsmState::BuyPosition).is_empty());
        assert_eq!(fsm.state, FsmState::NopositionBlocked);

        // Second 30 of the next minute: still not the first second.
        assert!(fsm
            .apply_tick(101.0, base + MINUTE_MS + 30_000, FsmState::BuyPosition)
            .is_empty());

        // First second of the next minute: re-arm then enter, two edges.
        let edges = fsm.apply_tick(101.0, base + 2 * MINUTE_MS, FsmState::BuyPosition);
        assert_eq!(
            edges,
            vec![
                Edge { from: FsmState::NopositionBlocked, to: FsmState::NopositionSignal },
                Edge { from: FsmState::NopositionSignal, to: FsmState::BuyPosition },
            ]
        );
        assert_eq!(fsm.state, FsmState::BuyPosition);
    }

    #[test]
    fn test_blocked_rearm_can_reblock_with_new_minute() {
        let base = 2_000 * MINUTE_MS;
        let mut fsm = armed_buy(100.0, base + 5_000);
        fsm.apply_tick(99.0, base + 10_000, FsmState::BuyPosition);

        // Next minute boundary, price still under threshold: block again,
        // stamped with the new minute.
        let edges = fsm.apply_tick(99.5, base + MINUTE_MS, FsmState::BuyPosition);
        assert_eq!(edges.len(), 2);
        assert_eq!(fsm.state, FsmState::NopositionBlocked);
        assert_eq!(fsm.last_blocked_at_ms, Some(base + MINUTE_MS));
    }

    #[test]
    fn test_retain_position_keeps_state_on_repeat_signal() {
        let mut fsm = armed_buy(100.0, 1_000);
        fsm.apply_tick(101.0, 2_000, FsmState::BuyPosition);
        assert_eq!(fsm.state, FsmState::BuyPosition);

        let edge = fsm.apply_signal(Direction::Buy, Some(102.0), None, 3_000, true);
        assert_eq!(edge.from, FsmState::BuyPosition);
        assert_eq!(edge.to, FsmState::BuyPosition);
        assert_eq!(fsm.threshold, Some(102.0));
        assert_eq!(fsm.last_buy_threshold, Some(102.0));

        // Without retention the same signal re-arms.
        let edge = fsm.apply_signal(Direction::Buy, Some(103.0), None, 4_000, false);
        assert_eq!(edge.to, FsmState::NopositionSignal);
    }

    #[test]
    fn test_invariant_armed_states_have_threshold_and_signal_time() {
        let mut fsm = armed_buy(100.0, 1_000);
        for (ltp, at) in [(101.0, 2_000), (99.0, 3_000)] {
            fsm.apply_tick(ltp, at, FsmState::BuyPosition);
            if fsm.state != FsmState::Nosignal {
                assert!(fsm.threshold.is_some());
                assert!(fsm.last_signal_at_ms.is_some());
            }
            if fsm.state == FsmState::NopositionBlocked {
                assert!(fsm.last_blocked_at_ms.is_some());
            }
            if let (Some(checked), Some(signal)) = (fsm.last_checked_at_ms, fsm.last_signal_at_ms)
            {
                assert!(checked >= signal);
            }
        }
    }

    #[test]
    fn test_rearm_snaps_threshold() {
        let mut fsm = armed_buy(100.0, 1_000);
        fsm.apply_tick(95.0, 2_000, FsmState::BuyPosition);
        assert_eq!(fsm.state, FsmState::NopositionBlocked);

        fsm.rearm(100.0, 3_000);
        assert_eq!(fsm.state, FsmState::NopositionSignal);
        assert_eq!(fsm.threshold, Some(100.0));
        assert_eq!(fsm.last_blocked_at_ms, None);

        // Crossing the snapped threshold enters a position.
        let edges = fsm.apply_tick(100.5, 4_000, FsmState::BuyPosition);
        assert_eq!(edges.len(), 1);
        assert_eq!(fsm.state, FsmState::BuyPosition);
    }
}
