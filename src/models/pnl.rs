//! Realized P&L log entries, written once per close.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Crystallized result of flattening a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealizedPnlEntry {
    pub id: i64,
    pub coin: String,

    /// Direction of the position before it was closed
    pub initial_direction: Direction,

    pub total_quantity_closed: Decimal,
    pub avg_entry_price: Decimal,
    pub avg_exit_price: Decimal,

    /// Signed profit (positive) or loss (negative) in USD
    pub realized_pnl: Decimal,

    pub closed_at: DateTime<Utc>,
}

impl RealizedPnlEntry {
    pub fn is_win(&self) -> bool {
        self.realized_pnl > Decimal::ZERO
    }

    /// Return on the entry notional.
    pub fn return_pct(&self) -> Decimal {
        let entry_notional = self.total_quantity_closed * self.avg_entry_price;
        if entry_notional.is_zero() {
            return Decimal::ZERO;
        }
        self.realized_pnl / entry_notional
    }
}
