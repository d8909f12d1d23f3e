//! Per-instrument holding: signed quantity, average entry cost, leverage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::Side;

/// Residual quantities below this magnitude count as flat.
pub const DUST_THRESHOLD: Decimal = dec!(0.00000001);

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// Order side that flattens a position in this direction.
    pub fn closing_side(&self) -> Side {
        match self {
            Direction::Long => Side::Sell,
            Direction::Short => Side::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Current holding in one instrument.
///
/// Rows are never deleted: a closed position stays as a zero-quantity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub id: i64,

    /// Instrument id, unique per holding
    pub coin: String,

    /// Signed quantity: positive long, negative short, zero flat
    pub quantity: Decimal,

    /// Weighted average entry price (meaningless when flat)
    pub avg_cost: Decimal,

    /// Leverage recorded when the position was last opened or increased
    pub open_leverage: Decimal,

    pub last_updated: DateTime<Utc>,
}

impl Holding {
    /// True when the quantity is within the dust threshold of zero.
    pub fn is_flat(&self) -> bool {
        is_dust(self.quantity)
    }

    /// Direction of an open position, `None` when flat.
    pub fn direction(&self) -> Option<Direction> {
        direction_of(self.quantity)
    }

    /// Unrealized P&L at the given mark price, `None` if not representable.
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Option<Decimal> {
        if self.is_flat() {
            return Some(Decimal::ZERO);
        }
        (mark_price - self.avg_cost).checked_mul(self.quantity)
    }
}

pub fn is_dust(quantity: Decimal) -> bool {
    quantity.abs() < DUST_THRESHOLD
}

pub fn direction_of(quantity: Decimal) -> Option<Direction> {
    if is_dust(quantity) {
        None
    } else if quantity.is_sign_positive() {
        Some(Direction::Long)
    } else {
        Some(Direction::Short)
    }
}
