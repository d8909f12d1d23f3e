//! The single synthetic USD cash account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Currency of the only cash account.
pub const BALANCE_CURRENCY: &str = "USD";

/// Cash balance. Exactly one row exists once the ledger is initialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub currency: String,
    pub amount: Decimal,
    pub last_updated: DateTime<Utc>,
}
