//! Typed failures of ledger operations.

use rust_decimal::Decimal;
use serde::Serialize;

/// Failure of an engine operation.
///
/// Everything except [`EngineError::Persistence`] is detected before any
/// record changes, or rolls back everything it touched.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid trade quantity: {0}")]
    InvalidQuantity(String),

    #[error("no valid market price available for {instrument}")]
    PriceUnavailable { instrument: String },

    #[error("insufficient USD balance: margin required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("no open position in {instrument} to close")]
    NoPosition { instrument: String },

    #[error("ledger storage failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// Stable response category for an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    BadRequest,
    PriceUnavailable,
    InsufficientFunds,
    NoPosition,
    Storage,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Validation(_) | EngineError::InvalidQuantity(_) => {
                ErrorCategory::BadRequest
            }
            EngineError::PriceUnavailable { .. } => ErrorCategory::PriceUnavailable,
            EngineError::InsufficientBalance { .. } => ErrorCategory::InsufficientFunds,
            EngineError::NoPosition { .. } => ErrorCategory::NoPosition,
            EngineError::Persistence(_) => ErrorCategory::Storage,
        }
    }

    /// Only storage failures may succeed when retried unchanged.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Storage
    }
}
