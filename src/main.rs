//! Paper-trading margin ledger
//!
//! Opens and closes leveraged crypto positions at live OKX mark prices and
//! books every change to balance, holdings, orders, trades and realized P&L
//! in one SQLite transaction.

mod config;
mod db;
mod ledger;
mod market;
mod models;
mod server;

use std::net::SocketAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::AppConfig;
use crate::db::Database;
use crate::ledger::{LedgerEngine, PnlSummary};
use crate::market::{OkxClient, PriceSnapshot};
use crate::models::{
    normalize_instrument, CloseOrderForm, CloseRequest, OpenOrderForm, OpenRequest,
};

/// Paper-trading margin ledger CLI.
#[derive(Parser)]
#[command(name = "papermargin")]
#[command(about = "Simulated leveraged trading against live mark prices", long_about = None)]
struct Cli {
    /// Database URL (overrides PAPER_MARGIN_DATABASE_URL)
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the USD balance
    Balance,

    /// List open positions
    Holdings,

    /// Fetch the current mark price of an instrument
    Price {
        /// Instrument id, e.g. BTC-USDT-SWAP
        coin: String,
    },

    /// Open or increase a position at market
    Open {
        /// Instrument id, e.g. BTC-USDT-SWAP
        coin: String,

        /// BUY or SELL
        side: String,

        /// QUANTITY or NOMINAL_VALUE
        size_by: String,

        /// Quantity or USD notional, depending on size-by
        value: String,

        /// Leverage (required for BUY, at least 1)
        #[arg(long)]
        leverage: Option<String>,

        /// Fill at this price instead of the live mark price
        #[arg(long)]
        price: Option<String>,
    },

    /// Close the whole position in an instrument at market
    Close {
        /// Instrument id, e.g. BTC-USDT-SWAP
        coin: String,

        /// Leverage used to release margin (defaults to 1)
        #[arg(long)]
        leverage: Option<String>,

        /// Fill at this price instead of the live mark price
        #[arg(long)]
        price: Option<String>,
    },

    /// Show recent orders
    Orders {
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Show recent trades
    Trades {
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Show realized P&L history
    Pnl {
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,

        /// Print summary statistics instead of the log
        #[arg(long)]
        summary: bool,
    },

    /// Show current configuration
    Config,

    /// Run the HTTP API and price relay
    Serve {
        /// Listen address (overrides PAPER_MARGIN_LISTEN)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = AppConfig::from_env()?;
    if let Some(url) = cli.database {
        config.database_url = url;
    }

    // Initialize ledger
    let db = Database::new(&config.database_url, config.initial_balance).await?;
    let engine = LedgerEngine::new(db.clone());
    let okx = OkxClient::with_base_url(config.okx_rest_url.clone(), config.http_timeout())?;

    match cli.command {
        Commands::Balance => {
            let balance = db.balance().await?;
            let counts = db.record_counts().await?;

            println!("\n=== Balance ===\n");
            println!("  {}:            {}", balance.currency, balance.amount.round_dp(2));
            println!("  Updated:        {}", balance.last_updated.format("%Y-%m-%d %H:%M:%S"));
            println!("  Orders:         {}", counts.orders);
            println!("  Closed:         {}", counts.realized);
        }

        Commands::Holdings => {
            let holdings = db.open_holdings().await?;

            if holdings.is_empty() {
                println!("No open positions. Use 'papermargin open' to open one.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<6} {:>16} {:>14} {:>6}",
                "COIN", "DIR", "QUANTITY", "AVG COST", "LEV"
            );
            println!("{}", "-".repeat(66));

            for h in holdings {
                let direction = h.direction().map(|d| d.as_str()).unwrap_or("-");
                println!(
                    "{:<20} {:<6} {:>16} {:>14} {:>6}",
                    truncate(&h.coin, 20),
                    direction,
                    h.quantity.round_dp(8),
                    h.avg_cost.round_dp(4),
                    format!("{}x", h.open_leverage.normalize())
                );
            }
        }

        Commands::Price { coin } => {
            let coin = normalize_instrument(&coin);
            let price = okx.mark_price(&coin).await?;
            println!("{} mark price: {}", coin, price);
        }

        Commands::Open {
            coin,
            side,
            size_by,
            value,
            leverage,
            price,
        } => {
            let form =
                OpenOrderForm::from_args(&coin, &side, &size_by, &value, leverage.as_deref());
            let request = OpenRequest::try_from(form)?;
            let prices = price_snapshot(&okx, &request.instrument, price).await;

            let r = engine.open_or_increase(&request, &prices).await?;

            println!("\n=== Order #{} Filled ===\n", r.order_id);
            println!("  Coin:           {}", r.coin);
            println!("  Side:           {}", r.side);
            println!("  Quantity:       {}", r.quantity_traded.round_dp(8));
            println!("  Price:          {}", r.price);
            println!("  Notional:       ${}", r.total_usd.round_dp(2));
            println!("  Leverage:       {}x", r.leverage_used.normalize());
            println!("  Margin:         ${}", r.margin_reserved.round_dp(2));
            println!("  Balance:        ${}", r.balance_after.round_dp(2));
        }

        Commands::Close {
            coin,
            leverage,
            price,
        } => {
            let form = CloseOrderForm::from_args(&coin, leverage.as_deref());
            let request = CloseRequest::try_from(form)?;
            let prices = price_snapshot(&okx, &request.instrument, price).await;

            let r = engine.close(&request, &prices).await?;

            println!("\n=== Position Closed (order #{}) ===\n", r.order_id);
            println!("  Coin:           {}", r.coin);
            println!("  Direction:      {}", r.direction);
            println!("  Side:           {}", r.closed_side);
            println!("  Quantity:       {}", r.quantity_closed.round_dp(8));
            println!("  Entry:          {}", r.avg_entry_price.round_dp(4));
            println!("  Exit:           {}", r.price);
            println!("  Realized P&L:   ${}", r.realized_pnl.round_dp(2));
            println!("  Margin Back:    ${}", r.margin_released.round_dp(2));
            println!("  Balance:        ${}", r.balance_after.round_dp(2));
        }

        Commands::Orders { limit } => {
            let orders = db.order_history(limit).await?;

            println!(
                "\n{:>6} {:<20} {:<5} {:>16} {:>14} {:<20}",
                "ID", "COIN", "SIDE", "QUANTITY", "PRICE", "TIME"
            );
            println!("{}", "-".repeat(86));

            for o in orders {
                println!(
                    "{:>6} {:<20} {:<5} {:>16} {:>14} {:<20}",
                    o.id,
                    truncate(&o.coin, 20),
                    o.order_type,
                    o.quantity.round_dp(8),
                    o.price,
                    o.completed_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::Trades { limit } => {
            let trades = db.trade_history(limit).await?;

            println!(
                "\n{:>6} {:>6} {:<20} {:<5} {:>16} {:>14} {:>14}",
                "ID", "ORDER", "COIN", "SIDE", "QUANTITY", "PRICE", "TOTAL"
            );
            println!("{}", "-".repeat(88));

            for t in trades {
                println!(
                    "{:>6} {:>6} {:<20} {:<5} {:>16} {:>14} {:>14}",
                    t.id,
                    t.order_id,
                    truncate(&t.coin, 20),
                    t.trade_type,
                    t.quantity.round_dp(8),
                    t.price,
                    t.total_amount.round_dp(2)
                );
            }
        }

        Commands::Pnl { limit, summary } => {
            if summary {
                let entries = db.pnl_history(i64::MAX).await?;
                print_summary(&PnlSummary::from_entries(&entries));
                return Ok(());
            }

            let entries = db.pnl_history(limit).await?;
            if entries.is_empty() {
                println!("No closed positions yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<6} {:>14} {:>14} {:>14} {:>12}",
                "COIN", "DIR", "QUANTITY", "ENTRY", "EXIT", "P&L"
            );
            println!("{}", "-".repeat(85));

            for e in entries {
                println!(
                    "{:<20} {:<6} {:>14} {:>14} {:>14} {:>12}",
                    truncate(&e.coin, 20),
                    e.initial_direction,
                    e.total_quantity_closed.round_dp(8),
                    e.avg_entry_price.round_dp(4),
                    e.avg_exit_price.round_dp(4),
                    e.realized_pnl.round_dp(2)
                );
            }
        }

        Commands::Serve { listen } => {
            if let Some(addr) = listen {
                config.listen = addr;
            }
            info!(database = %config.database_url, "Starting server");
            server::serve(&config, engine).await?;
        }

        Commands::Config => print_config(&config),
    }

    Ok(())
}

/// Price snapshot for a one-off CLI operation.
///
/// A failed lookup yields an empty snapshot so the engine reports the
/// missing price itself.
async fn price_snapshot(okx: &OkxClient, instrument: &str, price: Option<String>) -> PriceSnapshot {
    if let Some(price) = price {
        return PriceSnapshot::single(instrument, price);
    }

    match okx.mark_price(instrument).await {
        Ok(price) => PriceSnapshot::single(instrument, price),
        Err(e) => {
            warn!(coin = %instrument, error = %e, "Could not fetch mark price");
            PriceSnapshot::default()
        }
    }
}

fn print_config(config: &AppConfig) {
    println!("\n=== Configuration ===\n");
    println!("Ledger:");
    println!("  Database:             {}", config.database_url);
    println!("  Initial Balance:      ${}", config.initial_balance);

    println!("\nServer:");
    println!("  Listen:               {}", config.listen);

    println!("\nMarket Data:");
    println!("  OKX REST:             {}", config.okx_rest_url);
    println!("  OKX WebSocket:        {}", config.okx_ws_url);
    println!("  HTTP Timeout:         {}s", config.http_timeout_secs);
}

fn print_summary(s: &PnlSummary) {
    println!("\n=== Realized P&L Summary ===\n");
    println!("  Closed Positions:     {}", s.closed_positions);
    println!("  Winners / Losers:     {} / {}", s.winners, s.losers);
    println!("  Win Rate:             {:.1}%", s.win_rate * 100.0);
    println!("  Total P&L:            ${}", s.total_pnl.round_dp(2));
    println!("  Best:                 ${}", s.best.round_dp(2));
    println!("  Worst:                ${}", s.worst.round_dp(2));
    println!("  Max Drawdown:         ${}", s.max_drawdown.round_dp(2));
    println!("  Mean P&L:             ${:.2}", s.mean_pnl);
    println!("  Std Dev:              ${:.2}", s.std_dev_pnl);
    println!("  Mean Return:          {:.2}%", s.mean_return * 100.0);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("BTC-USDT-SWAP", 20), "BTC-USDT-SWAP");
        assert_eq!(truncate("ABCDEFGHIJKLMNOPQRSTUVWXYZ", 20), "ABCDEFGHIJKLMNOPQ...");

        let wide = "ÄÄÄÄÄÄÄÄÄÄÄÄ-USDT-SWAP";
        let cut = truncate(wide, 20);
        assert_eq!(cut.chars().count(), 20);
        assert!(cut.starts_with("ÄÄÄÄÄÄÄÄÄÄÄÄ-USDT"));
        assert_eq!(truncate("ÄÄÄÄÄÄÄÄÄÄÄ", 20), "ÄÄÄÄÄÄÄÄÄÄÄ");
    }
}
