//! Downstream WebSocket relay of upstream mark price pushes.
//!
//! Clients send `{"op": "subscribe" | "unsubscribe", "instId": ".."}` and
//! receive the upstream frames for their instruments verbatim.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::market::MarkPriceFeed;
use crate::models::normalize_instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    op: String,
    inst_id: String,
}

/// Serve one downstream client until it disconnects.
pub async fn run(socket: WebSocket, feed: MarkPriceFeed) {
    let client_id = Uuid::new_v4();
    info!(client = %client_id, "Relay client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut updates = feed.updates();
    let mut subscribed: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_message(&text, &feed, &mut subscribed).await;
                    if sender.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = %client_id, error = %e, "Relay client errored");
                    break;
                }
            },
            update = updates.recv() => match update {
                Ok(update) if subscribed.contains(&update.inst_id) => {
                    if sender.send(Message::Text(update.raw)).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(client = %client_id, skipped, "Relay client lagging, prices skipped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    for inst_id in subscribed {
        feed.unsubscribe(&inst_id).await;
    }
    let upstream = feed.subscribed().await.len();
    info!(
        client = %client_id,
        upstream,
        "Relay client disconnected"
    );
}

/// Apply one client message and return the reply frame.
async fn handle_client_message(
    text: &str,
    feed: &MarkPriceFeed,
    subscribed: &mut HashSet<String>,
) -> String {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return json!({ "error": "invalid message format" }).to_string(),
    };

    let inst_id = normalize_instrument(&msg.inst_id);
    if inst_id.is_empty() {
        return json!({ "error": "instId is required" }).to_string();
    }

    match msg.op.as_str() {
        "subscribe" => {
            if subscribed.insert(inst_id.clone()) {
                feed.subscribe(&inst_id).await;
            }
        }
        "unsubscribe" => {
            if subscribed.remove(&inst_id) {
                feed.unsubscribe(&inst_id).await;
            }
        }
        other => return json!({ "error": format!("unknown op '{}'", other) }).to_string(),
    }

    json!({ "event": msg.op, "instId": inst_id }).to_string()
}
