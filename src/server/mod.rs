//! HTTP API and downstream price relay.

mod relay;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::ledger::LedgerEngine;
use crate::market::{MarkPriceFeed, PriceBook};

pub use routes::build_router;

/// State shared by every handler.
pub struct AppState {
    pub engine: LedgerEngine,
    pub feed: MarkPriceFeed,
}

impl AppState {
    pub fn new(engine: LedgerEngine, feed: MarkPriceFeed) -> Self {
        Self { engine, feed }
    }

    pub fn book(&self) -> &PriceBook {
        self.feed.book()
    }
}

/// Connect the upstream feed and serve until Ctrl-C.
pub async fn serve(config: &AppConfig, engine: LedgerEngine) -> Result<()> {
    let feed = MarkPriceFeed::spawn(config.okx_ws_url.clone(), PriceBook::new());
    let state = Arc::new(AppState::new(engine, feed));

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(addr = %config.listen, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server crashed")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
