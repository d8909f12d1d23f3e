//! SQLite ledger store.
//!
//! Holds the five ledger record kinds:
//! - the single USD balance row
//! - one holding per instrument
//! - orders and their linked trades
//! - the realized P&L log
//!
//! Decimals are stored as canonical TEXT so no precision is lost to REAL.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::models::{
    Balance, Direction, Holding, Order, OrderStatus, RealizedPnlEntry, Side, Trade,
    BALANCE_CURRENCY,
};

/// Database connection pool for the ledger.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Number of audit rows in each append-only table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordCounts {
    pub orders: i64,
    pub trades: i64,
    pub realized: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    currency: String,
    amount: String,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct HoldingRow {
    id: i64,
    coin: String,
    quantity: String,
    avg_cost: String,
    open_leverage: String,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: i64,
    coin: String,
    order_type: String,
    quantity: String,
    price: String,
    status: String,
    completed_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct TradeRow {
    id: i64,
    order_id: i64,
    coin: String,
    trade_type: String,
    quantity: String,
    price: String,
    total_amount: String,
    trade_time: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct PnlRow {
    id: i64,
    coin: String,
    initial_direction: String,
    total_quantity_closed: String,
    avg_entry_price: String,
    avg_exit_price: String,
    realized_pnl: String,
    closed_at: DateTime<Utc>,
}

impl Database {
    /// Connect, migrate, and seed the balance row if it does not exist yet.
    pub async fn new(database_url: &str, initial_balance: Decimal) -> Result<Self> {
        // SQLite has a single writer. Holding the only connection for the
        // whole transaction serializes read-modify-write sequences.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.seed_balance(initial_balance).await?;

        Ok(db)
    }

    /// Private in-memory ledger.
    pub async fn in_memory(initial_balance: Decimal) -> Result<Self> {
        Self::new("sqlite::memory:", initial_balance).await
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balance (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                currency TEXT NOT NULL DEFAULT 'USD',
                amount TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS holdings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                coin TEXT NOT NULL UNIQUE,
                quantity TEXT NOT NULL,
                avg_cost TEXT NOT NULL,
                open_leverage TEXT NOT NULL DEFAULT '1',
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                coin TEXT NOT NULL,
                order_type TEXT NOT NULL CHECK (order_type IN ('BUY', 'SELL')),
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                status TEXT NOT NULL,
                completed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id INTEGER NOT NULL UNIQUE,
                coin TEXT NOT NULL,
                trade_type TEXT NOT NULL CHECK (trade_type IN ('BUY', 'SELL')),
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                total_amount TEXT NOT NULL,
                trade_time TEXT NOT NULL,
                FOREIGN KEY (order_id) REFERENCES orders(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS realized_pnl_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                coin TEXT NOT NULL,
                initial_direction TEXT NOT NULL CHECK (initial_direction IN ('LONG', 'SHORT')),
                total_quantity_closed TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL,
                avg_exit_price TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_coin ON trades(coin)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_realized_pnl_coin ON realized_pnl_log(coin)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Create the balance row on first start. An existing balance is kept.
    async fn seed_balance(&self, initial_balance: Decimal) -> Result<()> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO balance (id, currency, amount, last_updated) VALUES (1, ?, ?, ?)",
        )
        .bind(BALANCE_CURRENCY)
        .bind(initial_balance.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to seed balance")?;

        if result.rows_affected() > 0 {
            info!(amount = %initial_balance, "Seeded USD balance");
        }

        Ok(())
    }

    /// Open a ledger transaction.
    pub async fn begin(&self) -> Result<LedgerTx, sqlx::Error> {
        let tx = self.pool.begin().await?;
        debug!("Ledger transaction opened");
        Ok(LedgerTx { tx })
    }

    // ==================== Reads ====================

    /// Current cash balance.
    pub async fn balance(&self) -> Result<Balance> {
        let row = sqlx::query_as::<_, BalanceRow>(
            "SELECT currency, amount, last_updated FROM balance WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .context("Balance not initialized")?;

        Ok(Balance {
            currency: row.currency,
            amount: decimal("amount", &row.amount)?,
            last_updated: row.last_updated,
        })
    }

    /// Holding row for an instrument, including zeroed rows.
    pub async fn holding(&self, coin: &str) -> Result<Option<Holding>> {
        let row = sqlx::query_as::<_, HoldingRow>("SELECT * FROM holdings WHERE coin = ?")
            .bind(coin)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch holding")?;

        Ok(row.map(Holding::try_from).transpose()?)
    }

    /// All non-flat holdings ordered by instrument.
    pub async fn open_holdings(&self) -> Result<Vec<Holding>> {
        let rows = sqlx::query_as::<_, HoldingRow>("SELECT * FROM holdings ORDER BY coin")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch holdings")?;

        let mut holdings = Vec::with_capacity(rows.len());
        for row in rows {
            let holding = Holding::try_from(row)?;
            if !holding.is_flat() {
                holdings.push(holding);
            }
        }
        Ok(holdings)
    }

    /// Most recent orders first.
    pub async fn order_history(&self, limit: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch order history")?;

        rows.into_iter()
            .map(|r| Order::try_from(r).map_err(Into::into))
            .collect()
    }

    /// Most recent trades first.
    pub async fn trade_history(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>("SELECT * FROM trades ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch trade history")?;

        rows.into_iter()
            .map(|r| Trade::try_from(r).map_err(Into::into))
            .collect()
    }

    /// Most recent realized P&L entries first.
    pub async fn pnl_history(&self, limit: i64) -> Result<Vec<RealizedPnlEntry>> {
        let rows = sqlx::query_as::<_, PnlRow>(
            "SELECT * FROM realized_pnl_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch realized P&L history")?;

        rows.into_iter()
            .map(|r| RealizedPnlEntry::try_from(r).map_err(Into::into))
            .collect()
    }

    /// Row counts of the append-only tables.
    pub async fn record_counts(&self) -> Result<RecordCounts> {
        let (orders,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
            .fetch_one(&self.pool)
            .await?;
        let (trades,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;
        let (realized,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM realized_pnl_log")
            .fetch_one(&self.pool)
            .await?;

        Ok(RecordCounts {
            orders,
            trades,
            realized,
        })
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// One atomic unit of ledger work.
///
/// Every read and write goes through the same transaction. Dropping a
/// `LedgerTx` without calling [`LedgerTx::commit`] discards its writes, but
/// callers should end it explicitly with [`LedgerTx::rollback`].
pub struct LedgerTx {
    tx: Transaction<'static, Sqlite>,
}

impl LedgerTx {
    pub async fn read_balance(&mut self) -> Result<Decimal, sqlx::Error> {
        let (amount,): (String,) = sqlx::query_as("SELECT amount FROM balance WHERE id = 1")
            .fetch_one(&mut *self.tx)
            .await?;
        decimal("amount", &amount)
    }

    pub async fn write_balance(&mut self, amount: Decimal) -> Result<(), sqlx::Error> {
        let result = sqlx::query("UPDATE balance SET amount = ?, last_updated = ? WHERE id = 1")
            .bind(amount.to_string())
            .bind(Utc::now())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() != 1 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    pub async fn read_holding(&mut self, coin: &str) -> Result<Option<Holding>, sqlx::Error> {
        let row = sqlx::query_as::<_, HoldingRow>("SELECT * FROM holdings WHERE coin = ?")
            .bind(coin)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Holding::try_from).transpose()
    }

    /// Insert the holding, or overwrite quantity, cost and leverage in place.
    pub async fn upsert_holding(
        &mut self,
        coin: &str,
        quantity: Decimal,
        avg_cost: Decimal,
        open_leverage: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO holdings (coin, quantity, avg_cost, open_leverage, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(coin) DO UPDATE SET
                quantity = excluded.quantity,
                avg_cost = excluded.avg_cost,
                open_leverage = excluded.open_leverage,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(coin)
        .bind(quantity.to_string())
        .bind(avg_cost.to_string())
        .bind(open_leverage.to_string())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    /// Record a completed order, returning its id.
    pub async fn insert_order(
        &mut self,
        coin: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (coin, order_type, quantity, price, status, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(coin)
        .bind(side.as_str())
        .bind(quantity.to_string())
        .bind(price.to_string())
        .bind(OrderStatus::Completed.as_str())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Record the fill of `order_id`, returning the trade id.
    pub async fn insert_trade(
        &mut self,
        order_id: i64,
        coin: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        total_amount: Decimal,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (order_id, coin, trade_type, quantity, price, total_amount, trade_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order_id)
        .bind(coin)
        .bind(side.as_str())
        .bind(quantity.to_string())
        .bind(price.to_string())
        .bind(total_amount.to_string())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Append a realized P&L entry, returning its id.
    pub async fn insert_realized_pnl(
        &mut self,
        coin: &str,
        direction: Direction,
        quantity: Decimal,
        avg_entry_price: Decimal,
        avg_exit_price: Decimal,
        realized_pnl: Decimal,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO realized_pnl_log (
                coin, initial_direction, total_quantity_closed,
                avg_entry_price, avg_exit_price, realized_pnl, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(coin)
        .bind(direction.as_str())
        .bind(quantity.to_string())
        .bind(avg_entry_price.to_string())
        .bind(avg_exit_price.to_string())
        .bind(realized_pnl.to_string())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

// ==================== Row decoding ====================

fn decimal(column: &str, text: &str) -> Result<Decimal, sqlx::Error> {
    Decimal::from_str(text).map_err(|e| {
        sqlx::Error::Decode(format!("column {}: invalid decimal '{}': {}", column, text, e).into())
    })
}

fn parsed<T: FromStr<Err = String>>(text: &str) -> Result<T, sqlx::Error> {
    text.parse::<T>().map_err(|e| sqlx::Error::Decode(e.into()))
}

impl TryFrom<HoldingRow> for Holding {
    type Error = sqlx::Error;

    fn try_from(row: HoldingRow) -> Result<Self, Self::Error> {
        Ok(Holding {
            id: row.id,
            quantity: decimal("quantity", &row.quantity)?,
            avg_cost: decimal("avg_cost", &row.avg_cost)?,
            open_leverage: decimal("open_leverage", &row.open_leverage)?,
            coin: row.coin,
            last_updated: row.last_updated,
        })
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = sqlx::Error;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            order_type: parsed(&row.order_type)?,
            quantity: decimal("quantity", &row.quantity)?,
            price: decimal("price", &row.price)?,
            status: parsed(&row.status)?,
            coin: row.coin,
            completed_at: row.completed_at,
        })
    }
}

impl TryFrom<TradeRow> for Trade {
    type Error = sqlx::Error;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        Ok(Trade {
            id: row.id,
            order_id: row.order_id,
            trade_type: parsed(&row.trade_type)?,
            quantity: decimal("quantity", &row.quantity)?,
            price: decimal("price", &row.price)?,
            total_amount: decimal("total_amount", &row.total_amount)?,
            coin: row.coin,
            trade_time: row.trade_time,
        })
    }
}

impl TryFrom<PnlRow> for RealizedPnlEntry {
    type Error = sqlx::Error;

    fn try_from(row: PnlRow) -> Result<Self, Self::Error> {
        Ok(RealizedPnlEntry {
            id: row.id,
            initial_direction: parsed(&row.initial_direction)?,
            total_quantity_closed: decimal("total_quantity_closed", &row.total_quantity_closed)?,
            avg_entry_price: decimal("avg_entry_price", &row.avg_entry_price)?,
            avg_exit_price: decimal("avg_exit_price", &row.avg_exit_price)?,
            realized_pnl: decimal("realized_pnl", &row.realized_pnl)?,
            coin: row.coin,
            closed_at: row.closed_at,
        })
    }
}
