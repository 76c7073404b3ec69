use crate::portfolio::PositionId;

/// Domain-specific error types for the hedging engine.
/// Per-contract and per-position failures are recoverable: the lifecycle
/// engine turns them into run annotations. Only `Config` aborts a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HedgeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("allocation exceeded: requested {requested:.4} > max {max:.4}")]
    AllocationExceeded { requested: f64, max: f64 },

    #[error("insufficient cash: needed {needed:.2}, available {available:.2}")]
    InsufficientCash { needed: f64, available: f64 },

    #[error("position {0} is closed")]
    PositionClosed(PositionId),

    #[error("unknown position {0}")]
    UnknownPosition(PositionId),

    #[error("strategy skipped: {0}")]
    StrategySkipped(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("comparison cancelled")]
    Cancelled,
}

impl HedgeError {
    /// Whether a lifecycle run may continue after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HedgeError::Config(_) | HedgeError::Cancelled)
    }

    /// Short machine-friendly kind, used in run annotations.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NumericalInstability(_) => "numerical_instability",
            Self::AllocationExceeded { .. } => "allocation_exceeded",
            Self::InsufficientCash { .. } => "insufficient_cash",
            Self::PositionClosed(_) => "position_closed",
            Self::UnknownPosition(_) => "unknown_position",
            Self::StrategySkipped(_) => "strategy_skipped",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for HedgeError {
    fn from(e: serde_json::Error) -> Self {
        HedgeError::Config(e.to_string())
    }
}

impl From<std::io::Error> for HedgeError {
    fn from(e: std::io::Error) -> Self {
        HedgeError::Config(e.to_string())
    }
}

pub type HedgeResult<T> = Result<T, HedgeError>;
