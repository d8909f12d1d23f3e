//! Pure accounting rules: sizing, margin, cost basis and realized P&L.
//!
//! Nothing here touches storage. The engine feeds these functions the rows it
//! read inside a transaction and writes back whatever they return.

use rust_decimal::Decimal;

use super::EngineError;
use crate::models::{direction_of, is_dust, parse_decimal, Direction, Side, SizeMode};

/// Quantity and USD notional of a single fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeSizing {
    pub quantity: Decimal,
    pub notional: Decimal,
}

/// Holding fields the update rule reads and writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoldingState {
    pub quantity: Decimal,
    pub avg_cost: Decimal,
    pub open_leverage: Decimal,
}

/// Which branch of the holding update rule applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldingChange {
    /// No row existed before
    Opened,
    /// Flat or same-direction position grew
    Increased,
    /// Magnitude shrank, direction kept
    Reduced,
    /// Quantity landed within dust of zero
    Flattened,
    /// Crossed zero in a single update
    Flipped,
}

/// Interpret a raw price from a lookup as a usable market price.
pub fn parse_market_price(instrument: &str, raw: Option<&str>) -> Result<Decimal, EngineError> {
    raw.and_then(parse_decimal)
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| EngineError::PriceUnavailable {
            instrument: instrument.to_string(),
        })
}

/// Convert a request value into quantity and notional at `price`.
pub fn size_trade(
    mode: SizeMode,
    value: Decimal,
    price: Decimal,
) -> Result<TradeSizing, EngineError> {
    let sizing = match mode {
        SizeMode::NominalValue => TradeSizing {
            quantity: value.checked_div(price).ok_or_else(|| {
                EngineError::InvalidQuantity(format!("{} / {} is not representable", value, price))
            })?,
            notional: value,
        },
        SizeMode::Quantity => TradeSizing {
            quantity: value,
            notional: value.checked_mul(price).ok_or_else(|| {
                EngineError::InvalidQuantity(format!("{} * {} overflows", value, price))
            })?,
        },
    };

    // A dust fill would flatten on arrival and strand its margin.
    if sizing.quantity <= Decimal::ZERO || is_dust(sizing.quantity) {
        return Err(EngineError::InvalidQuantity(format!(
            "{} {} at {} yields quantity {}",
            value, mode, price, sizing.quantity
        )));
    }

    Ok(sizing)
}

/// Leverage applied when opening: the requested value if at least 1x.
pub fn effective_open_leverage(requested: Option<Decimal>) -> Decimal {
    match requested {
        Some(l) if l >= Decimal::ONE => l,
        _ => Decimal::ONE,
    }
}

/// Leverage applied when closing: the requested value if positive.
pub fn effective_close_leverage(requested: Option<Decimal>) -> Decimal {
    match requested {
        Some(l) if l > Decimal::ZERO => l,
        _ => Decimal::ONE,
    }
}

/// Cash reserved against `notional` at `leverage`.
pub fn margin_required(notional: Decimal, leverage: Decimal) -> Result<Decimal, EngineError> {
    notional.checked_div(leverage).ok_or_else(|| {
        EngineError::InvalidQuantity(format!(
            "margin {} / {} is not representable",
            notional, leverage
        ))
    })
}

/// Balance after crediting `amount`, failing instead of overflowing.
pub fn credit_balance(balance: Decimal, amount: Decimal) -> Result<Decimal, EngineError> {
    balance.checked_add(amount).ok_or_else(|| {
        EngineError::InvalidQuantity(format!("balance {} + {} overflows", balance, amount))
    })
}

/// Signed quantity change for a fill on `side`.
pub fn signed_delta(side: Side, quantity: Decimal) -> Decimal {
    side.sign() * quantity
}

/// Apply a quantity change at `trade_price` to an existing holding (or none).
///
/// `candidate_leverage` is adopted on opens, increases and flips; closing
/// passes `None` so the recorded leverage is kept. Fails with
/// `InvalidQuantity` when the new quantity or cost basis is not representable.
pub fn apply_holding_change(
    existing: Option<&HoldingState>,
    quantity_change: Decimal,
    trade_price: Decimal,
    candidate_leverage: Option<Decimal>,
) -> Result<(HoldingState, HoldingChange), EngineError> {
    let old = match existing {
        None => {
            return Ok((
                HoldingState {
                    quantity: quantity_change,
                    avg_cost: trade_price,
                    open_leverage: candidate_leverage.unwrap_or(Decimal::ONE),
                },
                HoldingChange::Opened,
            ))
        }
        Some(old) => old,
    };

    let overflow = || {
        EngineError::InvalidQuantity(format!(
            "holding {} changed by {} overflows",
            old.quantity, quantity_change
        ))
    };
    let new_quantity = old.quantity.checked_add(quantity_change).ok_or_else(overflow)?;

    if is_dust(new_quantity) {
        return Ok((
            HoldingState {
                quantity: Decimal::ZERO,
                avg_cost: Decimal::ZERO,
                open_leverage: old.open_leverage,
            },
            HoldingChange::Flattened,
        ));
    }

    let increasing = (old.quantity.is_zero() && !quantity_change.is_zero())
        || (old.quantity > Decimal::ZERO && quantity_change > Decimal::ZERO)
        || (old.quantity < Decimal::ZERO && quantity_change < Decimal::ZERO);

    if increasing {
        let held_cost = old.avg_cost.checked_mul(old.quantity).ok_or_else(overflow)?;
        let added_cost = trade_price.checked_mul(quantity_change).ok_or_else(overflow)?;
        let avg_cost = held_cost
            .checked_add(added_cost)
            .and_then(|total| total.checked_div(new_quantity))
            .ok_or_else(overflow)?;
        return Ok((
            HoldingState {
                quantity: new_quantity,
                avg_cost,
                open_leverage: candidate_leverage.unwrap_or(old.open_leverage),
            },
            HoldingChange::Increased,
        ));
    }

    let flipped = direction_of(old.quantity) != direction_of(new_quantity);
    if flipped {
        // The prior cost basis belongs to the side that was just closed out.
        return Ok((
            HoldingState {
                quantity: new_quantity,
                avg_cost: trade_price,
                open_leverage: candidate_leverage.unwrap_or(old.open_leverage),
            },
            HoldingChange::Flipped,
        ));
    }

    Ok((
        HoldingState {
            quantity: new_quantity,
            avg_cost: old.avg_cost,
            open_leverage: old.open_leverage,
        },
        HoldingChange::Reduced,
    ))
}

/// Everything a full close books, derived from the holding and exit price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseFigures {
    pub direction: Direction,
    pub closing_side: Side,
    /// Unsigned quantity closed
    pub quantity: Decimal,
    /// Signed change that flattens the holding
    pub quantity_change: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Exit notional, quantity * exit price
    pub notional: Decimal,
    /// Entry notional, quantity * average cost
    pub nominal_at_entry: Decimal,
    pub realized_pnl: Decimal,
    pub leverage: Decimal,
    pub margin_to_return: Decimal,
}

impl CloseFigures {
    /// Compute close figures; `Ok(None)` when the holding is flat.
    pub fn compute(
        holding: &HoldingState,
        exit_price: Decimal,
        requested_leverage: Option<Decimal>,
    ) -> Result<Option<Self>, EngineError> {
        let direction = match direction_of(holding.quantity) {
            Some(d) => d,
            None => return Ok(None),
        };

        let quantity = holding.quantity.abs();
        let entry_price = holding.avg_cost;
        let overflow = || EngineError::InvalidQuantity(format!("closing {} overflows", quantity));

        let notional = quantity.checked_mul(exit_price).ok_or_else(overflow)?;
        let nominal_at_entry = quantity.checked_mul(entry_price).ok_or_else(overflow)?;
        let price_move = match direction {
            Direction::Long => exit_price - entry_price,
            Direction::Short => entry_price - exit_price,
        };
        let realized_pnl = price_move.checked_mul(quantity).ok_or_else(overflow)?;

        let leverage = effective_close_leverage(requested_leverage);
        let margin_to_return = margin_required(nominal_at_entry, leverage)?;

        Ok(Some(Self {
            direction,
            closing_side: direction.closing_side(),
            quantity,
            quantity_change: -holding.quantity,
            entry_price,
            exit_price,
            notional,
            nominal_at_entry,
            realized_pnl,
            leverage,
            margin_to_return,
        }))
    }

    /// Cash credited back on close: released margin plus realized result.
    pub fn balance_credit(&self) -> Result<Decimal, EngineError> {
        self.margin_to_return
            .checked_add(self.realized_pnl)
            .ok_or_else(|| {
                EngineError::InvalidQuantity(format!(
                    "credit {} + {} overflows",
                    self.margin_to_return, self.realized_pnl
                ))
            })
    }
}
