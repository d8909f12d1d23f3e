//! Ledger engine: open/increase and close as single atomic transactions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::math::{
    apply_holding_change, credit_balance, effective_open_leverage, margin_required,
    parse_market_price, signed_delta, size_trade, CloseFigures, HoldingChange, HoldingState,
    TradeSizing,
};
use super::EngineError;
use crate::db::{Database, LedgerTx};
use crate::market::PriceLookup;
use crate::models::{CloseRequest, Direction, Holding, OpenRequest, Side};

/// Result of a successful open/increase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenReceipt {
    pub order_id: i64,
    pub coin: String,
    pub side: Side,
    pub quantity_traded: Decimal,
    pub price: Decimal,
    #[serde(rename = "totalUSD")]
    pub total_usd: Decimal,
    pub leverage_used: Decimal,
    pub margin_reserved: Decimal,
    pub balance_after: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// Result of a successful close.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseReceipt {
    pub order_id: i64,
    pub coin: String,
    pub closed_side: Side,
    pub direction: Direction,
    pub quantity_closed: Decimal,
    pub price: Decimal,
    #[serde(rename = "totalUSD")]
    pub total_usd: Decimal,
    pub avg_entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub margin_released: Decimal,
    pub balance_after: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// Figures of an open that passed every check not needing the ledger.
#[derive(Debug, Clone, Copy)]
struct OpenPlan {
    price: Decimal,
    sizing: TradeSizing,
    leverage: Decimal,
    margin: Decimal,
}

/// Accounting engine over a [`Database`].
#[derive(Clone)]
pub struct LedgerEngine {
    db: Database,
}

impl LedgerEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Open a position or add to it at the current price in `prices`.
    pub async fn open_or_increase<P>(
        &self,
        request: &OpenRequest,
        prices: &P,
    ) -> Result<OpenReceipt, EngineError>
    where
        P: PriceLookup + ?Sized,
    {
        let span = info_span!(
            "open",
            op_id = %Uuid::new_v4(),
            coin = %request.instrument,
            side = %request.side
        );

        async {
            let raw = prices.latest_price(&request.instrument);
            let price = parse_market_price(&request.instrument, raw.as_deref())?;
            let sizing = size_trade(request.size_mode, request.value, price)?;
            let leverage = effective_open_leverage(request.leverage);
            let margin = margin_required(sizing.notional, leverage)?;

            let plan = OpenPlan {
                price,
                sizing,
                leverage,
                margin,
            };
            debug!(?plan, "Open planned");

            let mut tx = self.db.begin().await?;
            match apply_open(&mut tx, request, &plan).await {
                Ok(receipt) => {
                    tx.commit().await?;
                    info!(
                        order_id = receipt.order_id,
                        quantity = %receipt.quantity_traded,
                        price = %receipt.price,
                        margin = %receipt.margin_reserved,
                        balance = %receipt.balance_after,
                        "Position opened"
                    );
                    Ok(receipt)
                }
                Err(e) => {
                    abandon(tx, &e).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fully close the position in an instrument at the current price.
    pub async fn close<P>(
        &self,
        request: &CloseRequest,
        prices: &P,
    ) -> Result<CloseReceipt, EngineError>
    where
        P: PriceLookup + ?Sized,
    {
        let span = info_span!(
            "close",
            op_id = %Uuid::new_v4(),
            coin = %request.instrument
        );

        async {
            let raw = prices.latest_price(&request.instrument);
            let price = parse_market_price(&request.instrument, raw.as_deref())?;

            let mut tx = self.db.begin().await?;
            match apply_close(&mut tx, request, price).await {
                Ok(receipt) => {
                    tx.commit().await?;
                    info!(
                        order_id = receipt.order_id,
                        direction = %receipt.direction,
                        quantity = %receipt.quantity_closed,
                        price = %receipt.price,
                        pnl = %receipt.realized_pnl,
                        balance = %receipt.balance_after,
                        "Position closed"
                    );
                    Ok(receipt)
                }
                Err(e) => {
                    abandon(tx, &e).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn apply_open(
    tx: &mut LedgerTx,
    request: &OpenRequest,
    plan: &OpenPlan,
) -> Result<OpenReceipt, EngineError> {
    let balance = tx.read_balance().await?;
    if balance < plan.margin {
        return Err(EngineError::InsufficientBalance {
            required: plan.margin,
            available: balance,
        });
    }
    let balance_after = balance - plan.margin;
    tx.write_balance(balance_after).await?;

    let existing = tx.read_holding(&request.instrument).await?;
    let (next, change) = apply_holding_change(
        existing.as_ref().map(holding_state).as_ref(),
        signed_delta(request.side, plan.sizing.quantity),
        plan.price,
        Some(plan.leverage),
    )?;
    if change == HoldingChange::Flipped {
        warn!(quantity = %next.quantity, "Open crossed zero, cost basis reset to trade price");
    }
    tx.upsert_holding(
        &request.instrument,
        next.quantity,
        next.avg_cost,
        next.open_leverage,
    )
    .await?;

    let order_id = tx
        .insert_order(
            &request.instrument,
            request.side,
            plan.sizing.quantity,
            plan.price,
        )
        .await?;
    tx.insert_trade(
        order_id,
        &request.instrument,
        request.side,
        plan.sizing.quantity,
        plan.price,
        plan.sizing.notional,
    )
    .await?;

    Ok(OpenReceipt {
        order_id,
        coin: request.instrument.clone(),
        side: request.side,
        quantity_traded: plan.sizing.quantity,
        price: plan.price,
        total_usd: plan.sizing.notional,
        leverage_used: plan.leverage,
        margin_reserved: plan.margin,
        balance_after,
        executed_at: Utc::now(),
    })
}

async fn apply_close(
    tx: &mut LedgerTx,
    request: &CloseRequest,
    price: Decimal,
) -> Result<CloseReceipt, EngineError> {
    let no_position = || EngineError::NoPosition {
        instrument: request.instrument.clone(),
    };

    let holding = tx
        .read_holding(&request.instrument)
        .await?
        .ok_or_else(no_position)?;
    let state = holding_state(&holding);
    let fig = CloseFigures::compute(&state, price, request.leverage)?.ok_or_else(no_position)?;

    let balance = tx.read_balance().await?;
    let balance_after = credit_balance(balance, fig.balance_credit()?)?;
    tx.write_balance(balance_after).await?;

    let (next, _) = apply_holding_change(Some(&state), fig.quantity_change, price, None)?;
    tx.upsert_holding(
        &request.instrument,
        next.quantity,
        next.avg_cost,
        next.open_leverage,
    )
    .await?;

    let order_id = tx
        .insert_order(&request.instrument, fig.closing_side, fig.quantity, price)
        .await?;
    tx.insert_trade(
        order_id,
        &request.instrument,
        fig.closing_side,
        fig.quantity,
        price,
        fig.notional,
    )
    .await?;
    tx.insert_realized_pnl(
        &request.instrument,
        fig.direction,
        fig.quantity,
        fig.entry_price,
        fig.exit_price,
        fig.realized_pnl,
    )
    .await?;

    Ok(CloseReceipt {
        order_id,
        coin: request.instrument.clone(),
        closed_side: fig.closing_side,
        direction: fig.direction,
        quantity_closed: fig.quantity,
        price,
        total_usd: fig.notional,
        avg_entry_price: fig.entry_price,
        realized_pnl: fig.realized_pnl,
        margin_released: fig.margin_to_return,
        balance_after,
        executed_at: Utc::now(),
    })
}

fn holding_state(holding: &Holding) -> HoldingState {
    HoldingState {
        quantity: holding.quantity,
        avg_cost: holding.avg_cost,
        open_leverage: holding.open_leverage,
    }
}

/// Roll back after a failed operation. The original error is what the caller sees.
async fn abandon(tx: LedgerTx, cause: &EngineError) {
    match tx.rollback().await {
        Ok(()) => debug!(error = %cause, "Transaction rolled back"),
        Err(e) => warn!(error = %e, cause = %cause, "Rollback failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::PriceSnapshot;
    use crate::models::SizeMode;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    const BTC: &str = "BTC-USDT-SWAP";

    async fn engine(balance: Decimal) -> LedgerEngine {
        LedgerEngine::new(Database::in_memory(balance).await.unwrap())
    }

    fn open(side: Side, mode: SizeMode, value: Decimal, leverage: Option<Decimal>) -> OpenRequest {
        OpenRequest {
            instrument: BTC.to_string(),
            side,
            size_mode: mode,
            value,
            leverage,
        }
    }

    fn close(leverage: Option<Decimal>) -> CloseRequest {
        CloseRequest {
            instrument: BTC.to_string(),
            leverage,
        }
    }

    fn price(p: &str) -> PriceSnapshot {
        PriceSnapshot::single(BTC, p)
    }

    async fn balance(engine: &LedgerEngine) -> Decimal {
        engine.database().balance().await.unwrap().amount
    }

    #[tokio::test]
    async fn test_scenario_open_increase_close() {
        let engine = engine(dec!(10000)).await;

        let buy = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(10)));
        let r1 = assert_ok!(engine.open_or_increase(&buy, &price("60000")).await);
        assert_eq!(r1.margin_reserved, dec!(6000));
        assert_eq!(r1.balance_after, dec!(4000));
        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert_eq!((h.quantity, h.avg_cost, h.open_leverage), (dec!(1), dec!(60000), dec!(10)));

        let add = open(Side::Buy, SizeMode::Quantity, dec!(0.5), Some(dec!(10)));
        let r2 = assert_ok!(engine.open_or_increase(&add, &price("62000")).await);
        assert_eq!(r2.margin_reserved, dec!(3100));
        assert_eq!(balance(&engine).await, dec!(900));
        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert_eq!(h.quantity, dec!(1.5));
        assert_eq!(h.avg_cost.round_dp(2), dec!(60666.67));

        let r3 = assert_ok!(engine.close(&close(Some(dec!(10))), &price("65000")).await);
        assert_eq!(r3.direction, Direction::Long);
        assert_eq!(r3.closed_side, Side::Sell);
        assert_eq!(r3.realized_pnl.round_dp(4), dec!(6500));
        assert_eq!(r3.margin_released.round_dp(4), dec!(9100));
        assert_eq!(balance(&engine).await.round_dp(4), dec!(16500));

        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert!(h.is_flat());
        assert_eq!(h.open_leverage, dec!(10));

        let counts = engine.database().record_counts().await.unwrap();
        assert_eq!((counts.orders, counts.trades, counts.realized), (3, 3, 1));
    }

    #[tokio::test]
    async fn test_round_trip_restores_balance() {
        let engine = engine(dec!(10000)).await;

        let buy = open(Side::Buy, SizeMode::NominalValue, dec!(3000), Some(dec!(3)));
        engine.open_or_increase(&buy, &price("60000")).await.unwrap();
        assert_eq!(balance(&engine).await, dec!(9000));

        let receipt = engine.close(&close(Some(dec!(3))), &price("60000")).await.unwrap();
        assert_eq!(receipt.realized_pnl, Decimal::ZERO);
        assert_eq!(balance(&engine).await, dec!(10000));
    }

    #[tokio::test]
    async fn test_short_open_and_close() {
        let engine = engine(dec!(1000)).await;

        let sell = open(Side::Sell, SizeMode::Quantity, dec!(2), Some(dec!(4)));
        let opened = engine.open_or_increase(&sell, &price("100")).await.unwrap();
        assert_eq!(opened.margin_reserved, dec!(50));
        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert_eq!(h.quantity, dec!(-2));

        let closed = engine.close(&close(Some(dec!(4))), &price("80")).await.unwrap();
        assert_eq!(closed.direction, Direction::Short);
        assert_eq!(closed.closed_side, Side::Buy);
        assert_eq!(closed.realized_pnl, dec!(40));
        assert_eq!(balance(&engine).await, dec!(1040));

        let log = engine.database().pnl_history(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].initial_direction, Direction::Short);
        assert_eq!(log[0].avg_exit_price, dec!(80));
    }

    #[tokio::test]
    async fn test_close_without_position_leaves_ledger_untouched() {
        let engine = engine(dec!(500)).await;

        let err = assert_err!(engine.close(&close(None), &price("100")).await);
        assert!(matches!(err, EngineError::NoPosition { .. }));

        // A flattened row also counts as no position
        engine
            .open_or_increase(&open(Side::Sell, SizeMode::Quantity, dec!(1), None), &price("100"))
            .await
            .unwrap();
        engine.close(&close(None), &price("100")).await.unwrap();
        let before = engine.database().record_counts().await.unwrap();
        let balance_before = balance(&engine).await;

        let err = assert_err!(engine.close(&close(None), &price("100")).await);
        assert!(matches!(err, EngineError::NoPosition { .. }));
        assert_eq!(engine.database().record_counts().await.unwrap(), before);
        assert_eq!(balance(&engine).await, balance_before);
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_ledger_untouched() {
        let engine = engine(dec!(100)).await;

        let buy = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(2)));
        let err = assert_err!(engine.open_or_increase(&buy, &price("500")).await);
        match err {
            EngineError::InsufficientBalance { required, available } => {
                assert_eq!(required, dec!(250));
                assert_eq!(available, dec!(100));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(balance(&engine).await, dec!(100));
        assert!(engine.database().holding(BTC).await.unwrap().is_none());
        assert_eq!(engine.database().record_counts().await.unwrap().orders, 0);
    }

    #[tokio::test]
    async fn test_missing_or_bad_price() {
        let engine = engine(dec!(100)).await;
        let empty: HashMap<String, String> = HashMap::new();

        let buy = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(1)));
        let err = assert_err!(engine.open_or_increase(&buy, &empty).await);
        assert!(matches!(err, EngineError::PriceUnavailable { .. }));

        let err = assert_err!(engine.close(&close(None), &price("-3")).await);
        assert!(matches!(err, EngineError::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_calls_create_two_entries() {
        let engine = engine(dec!(1000)).await;
        let req = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(10)));

        let a = engine.open_or_increase(&req, &price("100")).await.unwrap();
        let b = engine.open_or_increase(&req, &price("100")).await.unwrap();

        assert_ne!(a.order_id, b.order_id);
        assert_eq!(engine.database().record_counts().await.unwrap().orders, 2);
        assert_eq!(engine.database().holding(BTC).await.unwrap().unwrap().quantity, dec!(2));
        assert_eq!(balance(&engine).await, dec!(980));
    }

    #[tokio::test]
    async fn test_open_past_zero_flips_position() {
        let engine = engine(dec!(10000)).await;

        let buy = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(5)));
        engine.open_or_increase(&buy, &price("100")).await.unwrap();
        let sell = open(Side::Sell, SizeMode::Quantity, dec!(3), Some(dec!(2)));
        engine.open_or_increase(&sell, &price("90")).await.unwrap();

        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert_eq!(h.quantity, dec!(-2));
        assert_eq!(h.avg_cost, dec!(90));
        assert_eq!(h.open_leverage, dec!(2));
    }

    #[tokio::test]
    async fn test_storage_failure_rolls_back_everything() {
        let engine = engine(dec!(10000)).await;
        let buy = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(10)));
        engine.open_or_increase(&buy, &price("100")).await.unwrap();

        sqlx::query("DROP TABLE realized_pnl_log")
            .execute(engine.database().pool())
            .await
            .unwrap();

        let err = assert_err!(engine.close(&close(Some(dec!(10))), &price("120")).await);
        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(err.is_retryable());

        // Balance, holding and audit rows are exactly as before the close
        assert_eq!(balance(&engine).await, dec!(9990));
        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert_eq!(h.quantity, dec!(1));
        assert_eq!(engine.database().order_history(10).await.unwrap().len(), 1);
        assert_eq!(engine.database().trade_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_on_open_rolls_back() {
        let engine = engine(dec!(10000)).await;
        let buy = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(10)));
        engine.open_or_increase(&buy, &price("100")).await.unwrap();

        sqlx::query("DROP TABLE trades")
            .execute(engine.database().pool())
            .await
            .unwrap();

        let err = assert_err!(engine.open_or_increase(&buy, &price("120")).await);
        assert!(matches!(err, EngineError::Persistence(_)));

        // Balance, holding and order written before the failed trade insert are gone
        assert_eq!(balance(&engine).await, dec!(9990));
        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert_eq!((h.quantity, h.avg_cost), (dec!(1), dec!(100)));
        assert_eq!(engine.database().order_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overflowing_increase_is_rejected_and_rolled_back() {
        let engine = engine(dec!(100)).await;
        let big = Decimal::from_i128_with_scale(50_000_000_000_000_000_000_000_000_000, 0);
        let buy = open(Side::Buy, SizeMode::Quantity, big, Some(big / dec!(5)));

        let first = assert_ok!(engine.open_or_increase(&buy, &price("1")).await);
        assert_eq!(first.margin_reserved, dec!(5));

        let err = assert_err!(engine.open_or_increase(&buy, &price("1")).await);
        assert!(matches!(err, EngineError::InvalidQuantity(_)));
        assert_eq!(balance(&engine).await, dec!(95));
        assert_eq!(engine.database().holding(BTC).await.unwrap().unwrap().quantity, big);
        assert_eq!(engine.database().record_counts().await.unwrap().orders, 1);
    }

    #[tokio::test]
    async fn test_dust_open_is_rejected() {
        let engine = engine(dec!(100)).await;
        let buy = open(Side::Buy, SizeMode::Quantity, dec!(0.000000001), None);

        let err = assert_err!(engine.open_or_increase(&buy, &price("100")).await);
        assert!(matches!(err, EngineError::InvalidQuantity(_)));
        assert_eq!(balance(&engine).await, dec!(100));
        assert!(engine.database().holding(BTC).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_never_overspend() {
        // Balance covers 10 of the 30 opens at 100 margin each
        let engine = engine(dec!(1000)).await;
        let buy = open(Side::Buy, SizeMode::Quantity, dec!(1), Some(dec!(1)));

        let tasks: Vec<_> = (0..30)
            .map(|_| {
                let engine = engine.clone();
                let buy = buy.clone();
                tokio::spawn(async move { engine.open_or_increase(&buy, &price("100")).await })
            })
            .collect();

        let mut filled = 0;
        for result in futures::future::join_all(tasks).await {
            match result.unwrap() {
                Ok(_) => filled += 1,
                Err(e) => assert!(matches!(e, EngineError::InsufficientBalance { .. })),
            }
        }

        assert_eq!(filled, 10);
        assert_eq!(balance(&engine).await, Decimal::ZERO);
        let h = engine.database().holding(BTC).await.unwrap().unwrap();
        assert_eq!(h.quantity, dec!(10));
        assert_eq!(engine.database().record_counts().await.unwrap().orders, 10);
    }
}
