//! OKX public REST client for one-off mark price lookups.

use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(15);

/// Client for OKX public market data (no authentication).
#[derive(Clone)]
pub struct OkxClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OkxEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkPriceData {
    inst_id: String,
    mark_px: String,
}

impl OkxClient {
    /// Create a client against `base_url`, e.g. `https://www.okx.com`.
    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Current mark price of `inst_id` as the raw string OKX reports.
    ///
    /// Transport errors and 5xx/429 responses are retried with exponential
    /// backoff; anything else fails immediately.
    pub async fn mark_price(&self, inst_id: &str) -> Result<String> {
        let url = format!(
            "{}/api/v5/public/mark-price?instType={}&instId={}",
            self.base_url,
            instrument_type(inst_id),
            inst_id
        );
        debug!(url = %url, "Fetching mark price");

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(MAX_RETRY_ELAPSED),
            ..Default::default()
        };

        let client = &self.client;
        let url = url.as_str();
        let body = backoff::future::retry_notify(
            policy,
            || async move {
                let response = client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(anyhow::Error::new(e)))?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    let err = anyhow::anyhow!("Mark price request failed: {} - {}", status, text);
                    return Err(if is_transient(status) {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    });
                }

                response
                    .text()
                    .await
                    .map_err(|e| backoff::Error::transient(anyhow::Error::new(e)))
            },
            |err, wait: Duration| {
                warn!(error = %err, retry_in = ?wait, "Mark price request failed, retrying");
            },
        )
        .await?;

        parse_mark_price(inst_id, &body)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// OKX `instType` for an instrument id.
pub fn instrument_type(inst_id: &str) -> &'static str {
    let last = inst_id.rsplit('-').next().unwrap_or_default();
    if last == "SWAP" {
        "SWAP"
    } else if last.len() == 6 && last.chars().all(|c| c.is_ascii_digit()) {
        "FUTURES"
    } else {
        "MARGIN"
    }
}

fn parse_mark_price(inst_id: &str, body: &str) -> Result<String> {
    let envelope: OkxEnvelope<MarkPriceData> =
        serde_json::from_str(body).context("Failed to parse mark price response")?;

    if envelope.code != "0" {
        anyhow::bail!("OKX error {}: {}", envelope.code, envelope.msg);
    }

    envelope
        .data
        .into_iter()
        .find(|d| d.inst_id == inst_id)
        .map(|d| d.mark_px)
        .with_context(|| format!("No mark price returned for {}", inst_id))
}
