//! Application configuration.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::market::OKX_PUBLIC_WS;
use crate::models::parse_decimal;

/// Runtime settings for the ledger, the API server and the price sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// sqlx SQLite connection URL
    pub database_url: String,

    /// USD balance seeded into a fresh ledger
    pub initial_balance: Decimal,

    /// Address the HTTP/WebSocket server binds to
    pub listen: SocketAddr,

    /// OKX REST base URL
    pub okx_rest_url: String,

    /// OKX public WebSocket URL
    pub okx_ws_url: String,

    /// Timeout for a single REST request, in seconds
    pub http_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./papermargin.db?mode=rwc".to_string(),
            initial_balance: dec!(10000),
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            okx_rest_url: "https://www.okx.com".to_string(),
            okx_ws_url: OKX_PUBLIC_WS.to_string(),
            http_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Load from environment variables, falling back to defaults:
    /// - PAPER_MARGIN_DATABASE_URL
    /// - PAPER_MARGIN_INITIAL_BALANCE
    /// - PAPER_MARGIN_LISTEN
    /// - OKX_REST_URL
    /// - OKX_WS_URL
    /// - PAPER_MARGIN_HTTP_TIMEOUT_SECS
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("PAPER_MARGIN_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(raw) = lookup("PAPER_MARGIN_INITIAL_BALANCE") {
            let amount = parse_decimal(&raw)
                .with_context(|| format!("Invalid PAPER_MARGIN_INITIAL_BALANCE: {}", raw))?;
            anyhow::ensure!(
                amount >= Decimal::ZERO,
                "PAPER_MARGIN_INITIAL_BALANCE must not be negative"
            );
            config.initial_balance = amount;
        }
        if let Some(raw) = lookup("PAPER_MARGIN_LISTEN") {
            config.listen = raw.parse().context("Invalid PAPER_MARGIN_LISTEN")?;
        }
        if let Some(url) = lookup("OKX_REST_URL") {
            config.okx_rest_url = url;
        }
        if let Some(url) = lookup("OKX_WS_URL") {
            config.okx_ws_url = url;
        }
        if let Some(raw) = lookup("PAPER_MARGIN_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = raw
                .parse()
                .context("Invalid PAPER_MARGIN_HTTP_TIMEOUT_SECS")?;
        }

        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
