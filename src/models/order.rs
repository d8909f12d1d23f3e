//! Order and trade records: the append-only execution audit trail.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order or fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("invalid side '{}', expected BUY or SELL", other)),
        }
    }
}

/// Order lifecycle state. Market orders fill immediately and in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Completed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(OrderStatus::Completed),
            other => Err(format!("unknown order status '{}'", other)),
        }
    }
}

/// Accepted market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,

    /// Instrument id, e.g. "BTC-USDT-SWAP"
    pub coin: String,

    pub order_type: Side,

    /// Unsigned quantity executed
    pub quantity: Decimal,

    /// Execution price
    pub price: Decimal,

    pub status: OrderStatus,

    pub completed_at: DateTime<Utc>,
}

/// Fill record linked one-to-one with an [`Order`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: i64,
    pub order_id: i64,
    pub coin: String,
    pub trade_type: Side,
    pub quantity: Decimal,
    pub price: Decimal,

    /// Notional value of the fill in USD (quantity * price)
    pub total_amount: Decimal,

    pub trade_time: DateTime<Utc>,
}
