use thiserror::Error;

/// Engine failure taxonomy. Malformed wire events are dropped at the parse
/// boundary and never become errors; these variants cover the conditions
/// that reach logs or callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed {kind} event")]
    MalformedInput { kind: &'static str },

    #[error("{symbol}: {what} not set yet — tick ignored")]
    MissingPrerequisite { symbol: String, what: &'static str },

    #[error("unknown instrument {0}")]
    LookupMiss(String),

    #[error("broker request failed: {0}")]
    Broker(#[from] reqwest::Error),

    #[error("persistence failed: {0}")]
    Persistence(#[from] std::io::Error),
}
