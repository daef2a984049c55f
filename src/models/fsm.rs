use serde::{Deserialize, Serialize};

/// Position state of one instrument's decision machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsmState {
    #[default]
    #[serde(rename = "NOSIGNAL")]
    Nosignal,
    #[serde(rename = "NOPOSITION_SIGNAL")]
    NopositionSignal,
    #[serde(rename = "BUYPOSITION")]
    BuyPosition,
    #[serde(rename = "SELLPOSITION")]
    SellPosition,
    #[serde(rename = "NOPOSITION_BLOCKED")]
    NopositionBlocked,
}

impl FsmState {
    pub fn in_position(self) -> bool {
        matches!(self, FsmState::BuyPosition | FsmState::SellPosition)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Nosignal => "NOSIGNAL",
            FsmState::NopositionSignal => "NOPOSITION_SIGNAL",
            FsmState::BuyPosition => "BUYPOSITION",
            FsmState::SellPosition => "SELLPOSITION",
            FsmState::NopositionBlocked => "NOPOSITION_BLOCKED",
        }
    }
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published per-symbol snapshot. This is what the shared store maps
/// symbols to and what downstream consumers diff against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsmSnapshot {
    pub state: FsmState,
    pub ltp: Option<f64>,
    pub threshold: Option<f64>,
    pub last_buy_threshold: Option<f64>,
    pub last_sell_threshold: Option<f64>,
    pub last_blocked_at_ms: Option<i64>,
}
