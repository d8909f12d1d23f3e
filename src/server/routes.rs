//! Router and request handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use super::{relay, AppState};
use crate::ledger::math::parse_market_price;
use crate::ledger::{EngineError, ErrorCategory, PnlSummary};
use crate::market::{PriceLookup, PriceSnapshot};
use crate::models::{
    normalize_instrument, CloseOrderForm, CloseRequest, Holding, OpenOrderForm, OpenRequest,
};

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

/// Build the application router. Middleware layers are attached by the caller.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/price/:coin", get(price))
        .route("/api/balance", get(balance))
        .route("/api/holdings", get(holdings))
        .route("/api/orders/market", post(open_market))
        .route("/api/positions/close/market", post(close_market))
        .route("/api/orders/history", get(order_history))
        .route("/api/trades/history", get(trade_history))
        .route("/api/pnl/history", get(pnl_history))
        .route("/api/pnl/summary", get(pnl_summary))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ==================== Errors ====================

/// Error body: `{error, category, retryable}`.
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Engine(EngineError::Validation(e.body_text()))
    }
}

fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCategory::PriceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::NoPosition => StatusCode::CONFLICT,
        ErrorCategory::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(e) => {
                let category = e.category();
                if category == ErrorCategory::Storage {
                    error!(error = %e, "Ledger operation failed");
                } else {
                    warn!(error = %e, "Request rejected");
                }
                (
                    status_for(category),
                    json!({
                        "error": e.to_string(),
                        "category": category,
                        "retryable": e.is_retryable(),
                    }),
                )
            }
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                json!({ "error": message, "category": "NOT_FOUND", "retryable": false }),
            ),
            ApiError::Internal(e) => {
                error!(error = %e, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": format!("{:#}", e),
                        "category": ErrorCategory::Storage,
                        "retryable": true,
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ==================== Market ====================

async fn price(State(st): State<Arc<AppState>>, Path(coin): Path<String>) -> ApiResult<Response> {
    let coin = normalize_instrument(&coin);
    match st.book().get(&coin).await {
        Some(price) => Ok(Json(json!({ "coin": coin, "price": price })).into_response()),
        None => Err(ApiError::NotFound(format!("no price available for {}", coin))),
    }
}

async fn ws_upgrade(State(st): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let feed = st.feed.clone();
    ws.on_upgrade(move |socket| relay::run(socket, feed))
}

/// One consistent view of the book for a single request.
async fn price_snapshot(st: &AppState) -> PriceSnapshot {
    let snapshot = st.book().snapshot().await;
    if snapshot.is_empty() {
        warn!("Price book is empty, market orders cannot be priced");
    }
    debug!(prices = snapshot.len(), taken_at = ?snapshot.taken_at(), "Price snapshot taken");
    snapshot
}

// ==================== Ledger ====================

async fn balance(State(st): State<Arc<AppState>>) -> ApiResult<Response> {
    let balance = st.engine.database().balance().await?;
    Ok(Json(balance).into_response())
}

/// Open holding marked against the live book.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkedHolding {
    #[serde(flatten)]
    holding: Holding,
    mark_price: Option<Decimal>,
    unrealized_pnl: Option<Decimal>,
}

async fn holdings(State(st): State<Arc<AppState>>) -> ApiResult<Response> {
    let holdings = st.engine.database().open_holdings().await?;
    let prices = price_snapshot(&st).await;

    let marked: Vec<MarkedHolding> = holdings
        .into_iter()
        .map(|holding| {
            let raw = prices.latest_price(&holding.coin);
            let mark_price = parse_market_price(&holding.coin, raw.as_deref()).ok();
            let unrealized_pnl = mark_price.and_then(|p| holding.unrealized_pnl(p));
            MarkedHolding {
                holding,
                mark_price,
                unrealized_pnl,
            }
        })
        .collect();
    Ok(Json(marked).into_response())
}

async fn open_market(
    State(st): State<Arc<AppState>>,
    body: Result<Json<OpenOrderForm>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(form) = body?;
    let request = OpenRequest::try_from(form)?;
    let prices = price_snapshot(&st).await;

    let receipt = st.engine.open_or_increase(&request, &prices).await?;
    Ok((StatusCode::CREATED, Json(receipt)).into_response())
}

async fn close_market(
    State(st): State<Arc<AppState>>,
    body: Result<Json<CloseOrderForm>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(form) = body?;
    let request = CloseRequest::try_from(form)?;
    let prices = price_snapshot(&st).await;

    let receipt = st.engine.close(&request, &prices).await?;
    Ok(Json(receipt).into_response())
}

// ==================== History ====================

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

impl HistoryQuery {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

async fn order_history(
    State(st): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let orders = st.engine.database().order_history(q.limit()).await?;
    Ok(Json(orders).into_response())
}

async fn trade_history(
    State(st): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let trades = st.engine.database().trade_history(q.limit()).await?;
    Ok(Json(trades).into_response())
}

async fn pnl_history(
    State(st): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let entries = st.engine.database().pnl_history(q.limit()).await?;
    Ok(Json(entries).into_response())
}

async fn pnl_summary(State(st): State<Arc<AppState>>) -> ApiResult<Response> {
    let entries = st.engine.database().pnl_history(i64::MAX).await?;
    Ok(Json(PnlSummary::from_entries(&entries)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ledger::LedgerEngine;
    use crate::market::{MarkPriceFeed, PriceBook};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn make_state() -> Arc<AppState> {
        let db = Database::in_memory(dec!(10000)).await.unwrap();
        let feed = MarkPriceFeed::offline(PriceBook::new());
        feed.book().update("BTC-USDT-SWAP", "60000").await;
        Arc::new(AppState::new(LedgerEngine::new(db), feed))
    }

    async fn call(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, Value) {
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn decimal(v: &Value) -> Decimal {
        v.as_str().unwrap().parse().unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_price_lookup() {
        let state = make_state().await;

        let (status, json) = call(&state, get("/api/price/btc-usdt-swap")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["price"], "60000");

        let (status, _) = call(&state, get("/api/price/ETH-USDT-SWAP")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_open_then_close_over_http() {
        let state = make_state().await;

        let (status, json) = call(
            &state,
            post(
                "/api/orders/market",
                json!({
                    "coin": "BTC-USDT-SWAP",
                    "side": "BUY",
                    "sizeBy": "QUANTITY",
                    "value": "1",
                    "leverage": 10
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["side"], "BUY");
        assert_eq!(decimal(&json["totalUSD"]), dec!(60000));
        assert_eq!(decimal(&json["leverageUsed"]), dec!(10));

        state.book().update("BTC-USDT-SWAP", "61000").await;
        let (_, holdings) = call(&state, get("/api/holdings")).await;
        assert_eq!(holdings.as_array().unwrap().len(), 1);
        assert_eq!(holdings[0]["coin"], "BTC-USDT-SWAP");
        assert_eq!(decimal(&holdings[0]["markPrice"]), dec!(61000));
        assert_eq!(decimal(&holdings[0]["unrealizedPnl"]), dec!(1000));

        let (status, json) = call(
            &state,
            post("/api/positions/close/market", json!({"coin": "BTC-USDT-SWAP", "leverage": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["closedSide"], "SELL");
        assert_eq!(decimal(&json["realizedPnl"]), dec!(1000));

        let (_, balance) = call(&state, get("/api/balance")).await;
        assert_eq!(decimal(&balance["amount"]), dec!(11000));

        let (_, trades) = call(&state, get("/api/trades/history?limit=1")).await;
        assert_eq!(trades.as_array().unwrap().len(), 1);
        assert_eq!(trades[0]["tradeType"], "SELL");

        let (_, summary) = call(&state, get("/api/pnl/summary")).await;
        assert_eq!(summary["closedPositions"], 1);
        assert_eq!(summary["winners"], 1);
    }

    #[tokio::test]
    async fn test_error_categories_map_to_statuses() {
        let state = make_state().await;

        let open = |coin: &str, side: &str, leverage: Option<u32>| {
            let mut body = json!({"coin": coin, "side": side, "sizeBy": "QUANTITY", "value": 1});
            if let Some(leverage) = leverage {
                body["leverage"] = json!(leverage);
            }
            post("/api/orders/market", body)
        };

        let (status, json) = call(&state, open("BTC-USDT-SWAP", "BUY", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["category"], "BAD_REQUEST");
        assert_eq!(json["retryable"], false);

        let (status, json) = call(&state, open("ETH-USDT-SWAP", "SELL", None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["category"], "PRICE_UNAVAILABLE");

        let (status, json) = call(&state, open("BTC-USDT-SWAP", "BUY", Some(1))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["category"], "INSUFFICIENT_FUNDS");

        let (status, json) = call(
            &state,
            post("/api/positions/close/market", json!({"coin": "BTC-USDT-SWAP"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["category"], "NO_POSITION");
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let state = make_state().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/orders/market")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, json) = call(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["category"], "BAD_REQUEST");
    }

    #[test]
    fn test_history_limit_is_clamped() {
        assert_eq!(HistoryQuery::default().limit(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(HistoryQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(HistoryQuery { limit: Some(10_000) }.limit(), MAX_HISTORY_LIMIT);
    }
}
