//! Live mark prices from the OKX public WebSocket.
//!
//! One upstream connection is shared by every downstream subscriber.
//! Subscriptions are counted per instrument: the upstream sees a single
//! `subscribe` for the first interested client and an `unsubscribe` when the
//! last one leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::PriceBook;

pub const OKX_PUBLIC_WS: &str = "wss://ws.okx.com:8443/ws/v5/public";
const MARK_PRICE_CHANNEL: &str = "mark-price";
const PING_INTERVAL: Duration = Duration::from_secs(20);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const EVENT_BUFFER: usize = 1024;

/// One mark price push from upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkPriceUpdate {
    pub inst_id: String,
    pub mark_px: String,
    /// Upstream frame, forwarded verbatim to downstream clients
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UpstreamCommand {
    Subscribe(String),
    Unsubscribe(String),
}

impl UpstreamCommand {
    fn to_message(&self) -> String {
        let (op, inst_id) = match self {
            UpstreamCommand::Subscribe(i) => ("subscribe", i),
            UpstreamCommand::Unsubscribe(i) => ("unsubscribe", i),
        };
        subscription_message(op, inst_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushArg {
    channel: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushData {
    inst_id: String,
    mark_px: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamFrame {
    event: Option<String>,
    msg: Option<String>,
    arg: Option<PushArg>,
    #[serde(default)]
    data: Vec<PushData>,
}

/// Handle to the shared upstream feed.
#[derive(Clone)]
pub struct MarkPriceFeed {
    book: PriceBook,
    refcounts: Arc<Mutex<HashMap<String, usize>>>,
    commands: mpsc::UnboundedSender<UpstreamCommand>,
    events: broadcast::Sender<MarkPriceUpdate>,
}

impl MarkPriceFeed {
    /// Start the upstream connection task against `url`.
    ///
    /// The task runs until every handle has been dropped.
    pub fn spawn(url: String, book: PriceBook) -> Self {
        let (feed, commands) = Self::detached(book);

        let upstream = Upstream {
            url,
            book: feed.book.clone(),
            refcounts: feed.refcounts.clone(),
            events: feed.events.clone(),
        };
        tokio::spawn(upstream.run(commands));

        feed
    }

    fn detached(book: PriceBook) -> (Self, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let feed = Self {
            book,
            refcounts: Arc::new(Mutex::new(HashMap::new())),
            commands,
            events,
        };
        (feed, rx)
    }

    /// Feed with no upstream connection. Subscriptions are still counted.
    #[cfg(test)]
    pub(crate) fn offline(book: PriceBook) -> Self {
        Self::detached(book).0
    }

    pub fn book(&self) -> &PriceBook {
        &self.book
    }

    /// Receiver for every upstream price push.
    pub fn updates(&self) -> broadcast::Receiver<MarkPriceUpdate> {
        self.events.subscribe()
    }

    /// Register interest in `inst_id`. Returns true if it was the first.
    pub async fn subscribe(&self, inst_id: &str) -> bool {
        let mut refcounts = self.refcounts.lock().await;
        let count = refcounts.entry(inst_id.to_string()).or_insert(0);
        *count += 1;

        let first = *count == 1;
        if first {
            info!(inst_id = %inst_id, "Subscribing upstream");
            let _ = self
                .commands
                .send(UpstreamCommand::Subscribe(inst_id.to_string()));
        }
        first
    }

    /// Drop one interest in `inst_id`. Returns true if it was the last.
    pub async fn unsubscribe(&self, inst_id: &str) -> bool {
        let mut refcounts = self.refcounts.lock().await;
        let remaining = match refcounts.get_mut(inst_id) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return false,
        };

        let last = remaining == 0;
        if last {
            refcounts.remove(inst_id);
            info!(inst_id = %inst_id, "Unsubscribing upstream");
            let _ = self
                .commands
                .send(UpstreamCommand::Unsubscribe(inst_id.to_string()));
            self.book.remove(inst_id).await;
        }
        last
    }

    /// Instruments with at least one subscriber.
    pub async fn subscribed(&self) -> Vec<String> {
        let mut list: Vec<String> = self.refcounts.lock().await.keys().cloned().collect();
        list.sort();
        list
    }
}

enum SessionEnd {
    /// Every feed handle was dropped
    Shutdown,
    /// Upstream closed the connection
    Disconnected,
}

struct Upstream {
    url: String,
    book: PriceBook,
    refcounts: Arc<Mutex<HashMap<String, usize>>>,
    events: broadcast::Sender<MarkPriceUpdate>,
}

impl Upstream {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<UpstreamCommand>) {
        let mut backoff = ExponentialBackoff {
            max_interval: MAX_RECONNECT_DELAY,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            // The refcount map is the source of truth; queued commands are stale.
            loop {
                match commands.try_recv() {
                    Ok(_) => continue,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }

            match self.session(&mut commands, &mut backoff).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("Mark price feed stopped");
                    return;
                }
                Ok(SessionEnd::Disconnected) => warn!("Upstream closed the connection"),
                Err(e) => warn!(error = %e, "Upstream connection failed"),
            }

            self.drop_prices().await;

            let wait = backoff.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);
            info!(retry_in = ?wait, "Reconnecting upstream");
            tokio::time::sleep(wait).await;
        }
    }

    async fn session(
        &self,
        commands: &mut mpsc::UnboundedReceiver<UpstreamCommand>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<SessionEnd> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .context("Failed to connect to upstream WebSocket")?;
        info!(url = %self.url, "Upstream connected");
        backoff.reset();

        let (mut write, mut read) = ws.split();

        let live: Vec<String> = self.refcounts.lock().await.keys().cloned().collect();
        for inst_id in &live {
            write
                .send(Message::Text(subscription_message("subscribe", inst_id)))
                .await
                .context("Failed to resend subscription")?;
        }
        if !live.is_empty() {
            debug!(count = live.len(), "Resubscribed live instruments");
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        write.send(Message::Text(cmd.to_message())).await?;
                        debug!(?cmd, "Sent upstream command");
                    }
                    None => {
                        let _ = write.close().await;
                        return Ok(SessionEnd::Shutdown);
                    }
                },
                _ = ping.tick() => {
                    write.send(Message::Text("ping".to_string())).await?;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        for update in parse_frame(text) {
            self.book.update(&update.inst_id, update.mark_px.clone()).await;
            // No receivers is fine
            let _ = self.events.send(update);
        }
    }

    async fn drop_prices(&self) {
        let live: Vec<String> = self.refcounts.lock().await.keys().cloned().collect();
        for inst_id in live {
            self.book.remove(&inst_id).await;
        }
    }
}

/// OKX subscribe/unsubscribe frame for the mark price channel.
pub fn subscription_message(op: &str, inst_id: &str) -> String {
    json!({
        "op": op,
        "args": [{ "channel": MARK_PRICE_CHANNEL, "instId": inst_id }]
    })
    .to_string()
}

/// Extract mark price updates from an upstream text frame.
fn parse_frame(text: &str) -> Vec<MarkPriceUpdate> {
    if text == "pong" {
        return Vec::new();
    }

    let frame: UpstreamFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable upstream frame");
            return Vec::new();
        }
    };

    if let Some(event) = frame.event.as_deref() {
        match event {
            "error" => warn!(msg = ?frame.msg, "Upstream error event"),
            other => debug!(event = %other, "Upstream event"),
        }
        return Vec::new();
    }

    match frame.arg {
        Some(arg) if arg.channel == MARK_PRICE_CHANNEL => frame
            .data
            .into_iter()
            .map(|d| MarkPriceUpdate {
                inst_id: d.inst_id,
                mark_px: d.mark_px,
                raw: text.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH: &str = r#"{"arg":{"channel":"mark-price","instId":"BTC-USDT-SWAP"},"data":[{"instType":"SWAP","instId":"BTC-USDT-SWAP","markPx":"60100.2","ts":"1700000000000"}]}"#;

    #[test]
    fn test_parse_frame_push() {
        let updates = parse_frame(PUSH);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].inst_id, "BTC-USDT-SWAP");
        assert_eq!(updates[0].mark_px, "60100.2");
        assert_eq!(updates[0].raw, PUSH);
    }

    #[test]
    fn test_parse_frame_ignores_events_and_noise() {
        assert!(parse_frame("pong").is_empty());
        assert!(parse_frame("not json").is_empty());
        assert!(parse_frame(
            r#"{"event":"subscribe","arg":{"channel":"mark-price","instId":"BTC-USDT-SWAP"}}"#
        )
        .is_empty());
        let tickers = r#"{"arg":{"channel":"tickers"},"data":[{"instId":"X","markPx":"1"}]}"#;
        assert!(parse_frame(tickers).is_empty());
    }

    #[test]
    fn test_subscription_message_shape() {
        let msg: serde_json::Value =
            serde_json::from_str(&subscription_message("subscribe", "ETH-USDT-SWAP")).unwrap();
        assert_eq!(msg["op"], "subscribe");
        assert_eq!(msg["args"][0]["channel"], "mark-price");
        assert_eq!(msg["args"][0]["instId"], "ETH-USDT-SWAP");
    }

    #[tokio::test]
    async fn test_refcounted_subscriptions() {
        let (feed, mut commands) = MarkPriceFeed::detached(PriceBook::new());

        assert!(feed.subscribe("BTC-USDT-SWAP").await);
        assert!(!feed.subscribe("BTC-USDT-SWAP").await);
        assert_eq!(
            commands.try_recv().unwrap(),
            UpstreamCommand::Subscribe("BTC-USDT-SWAP".into())
        );
        assert!(commands.try_recv().is_err());

        feed.book().update("BTC-USDT-SWAP", "1").await;
        assert!(!feed.unsubscribe("BTC-USDT-SWAP").await);
        assert!(feed.book().get("BTC-USDT-SWAP").await.is_some());
        assert!(feed.unsubscribe("BTC-USDT-SWAP").await);
        assert_eq!(
            commands.try_recv().unwrap(),
            UpstreamCommand::Unsubscribe("BTC-USDT-SWAP".into())
        );
        assert!(feed.book().get("BTC-USDT-SWAP").await.is_none());
        assert!(feed.subscribed().await.is_empty());

        // Unknown instruments are a no-op
        assert!(!feed.unsubscribe("ETH-USDT-SWAP").await);
    }

    #[tokio::test]
    async fn test_push_updates_book_and_broadcasts() {
        let (feed, _commands) = MarkPriceFeed::detached(PriceBook::new());
        let mut rx = feed.updates();
        let upstream = Upstream {
            url: OKX_PUBLIC_WS.to_string(),
            book: feed.book.clone(),
            refcounts: feed.refcounts.clone(),
            events: feed.events.clone(),
        };

        upstream.handle_text(PUSH).await;

        assert_eq!(feed.book().get("BTC-USDT-SWAP").await.as_deref(), Some("60100.2"));
        assert_eq!(rx.recv().await.unwrap().mark_px, "60100.2");

        feed.subscribe("BTC-USDT-SWAP").await;
        upstream.drop_prices().await;
        assert!(feed.book().get("BTC-USDT-SWAP").await.is_none());
    }
}
