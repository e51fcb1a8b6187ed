//! Client for the external wallet API that settles payments.
//!
//! Transactions are decoded into the strongly-typed `TransactionRecord`. A
//! payload that does not match the schema is treated as "no such transaction"
//! so a misbehaving upstream degrades to "not payable yet".

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::store::model::{AccountEntry, TransactionRecord};

pub const DEFAULT_GATEWAY_URL: &str = "https://www.bitgo.com";
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway timed out")]
    Timeout,

    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),

    #[error("invalid payment gateway url: {0}")]
    InvalidUrl(String),

    #[error("unexpected payment gateway response: {0}")]
    BadResponse(String),
}

impl GatewayError {
    fn from_request(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

pub struct GatewayConfig {
    pub base_url: String,
    pub wallet: String,
    /// Bearer token for the wallet API.
    pub access_token: Zeroizing<String>,
    pub timeout: Duration,
}

// ── Wire format ──────────────────────────────────────────────────────────────
//
// Transaction payloads are strict: any field outside this schema makes the
// transaction unknown. A wallet API that grows fields needs them added here.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireTransaction {
    id: String,
    /// ISO-8601 UTC with milliseconds, e.g. `2026-05-01T10:00:00.000Z`.
    date: String,
    outputs: Vec<WireOutput>,
    entries: Vec<WireEntry>,
    pending: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WireOutput {
    account: String,
    value: i64,
    is_mine: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEntry {
    account: String,
    value: i64,
}

#[derive(Debug, Deserialize)]
struct WireAddress {
    address: String,
}

impl TryFrom<WireTransaction> for TransactionRecord {
    type Error = chrono::ParseError;

    fn try_from(wire: WireTransaction) -> Result<Self, Self::Error> {
        let date = DateTime::parse_from_rfc3339(&wire.date)?.with_timezone(&Utc);

        let flagged = wire.outputs.into_iter().map(|o| AccountEntry {
            account_id: o.account,
            value: o.value,
            is_own_account: o.is_mine,
        });
        let unflagged = wire.entries.into_iter().map(|e| AccountEntry {
            account_id: e.account,
            value: e.value,
            is_own_account: false,
        });

        Ok(Self {
            id: wire.id,
            date,
            entries: flagged.chain(unflagged).collect(),
            pending: wire.pending,
            bound_token_id: None,
        })
    }
}

/// Decode a gateway transaction body. The error string is for logs only.
fn decode_transaction(body: &[u8]) -> Result<TransactionRecord, String> {
    let wire: WireTransaction = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    TransactionRecord::try_from(wire).map_err(|e| format!("bad date: {e}"))
}

// ── Client ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: Url,
    wallet: String,
    access_token: Arc<Zeroizing<String>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let base_url =
            Url::parse(&config.base_url).map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(config.base_url));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            wallet: config.wallet,
            access_token: Arc::new(config.access_token),
        })
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    /// `{base}/api/v1/wallet/{wallet}/{tail...}` with every segment escaped.
    fn wallet_url(&self, tail: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| GatewayError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "v1", "wallet", self.wallet.as_str()])
            .extend(tail);
        Ok(url)
    }

    /// Fetch one transaction of our wallet. `Ok(None)` when the response is
    /// not a transaction (unknown id, error payload, schema mismatch).
    pub async fn fetch(&self, tx_id: &str) -> Result<Option<TransactionRecord>, GatewayError> {
        let url = self.wallet_url(&["tx", tx_id])?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(self.access_token.as_str())
            .send()
            .await
            .map_err(GatewayError::from_request)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(GatewayError::from_request)?;
        debug!(tx = %tx_id, %status, bytes = body.len(), "gateway transaction response");

        match decode_transaction(&body) {
            Ok(record) => Ok(Some(record)),
            Err(reason) => {
                warn!(tx = %tx_id, %status, %reason, "gateway response is not a transaction");
                Ok(None)
            }
        }
    }

    /// Ask the wallet for a fresh receive address.
    pub async fn new_address(&self) -> Result<String, GatewayError> {
        let url = self.wallet_url(&["address", "0"])?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.access_token.as_str())
            .send()
            .await
            .map_err(GatewayError::from_request)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::BadResponse(format!("status {status}")));
        }
        let body: WireAddress = resp
            .json()
            .await
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;
        Ok(body.address)
    }
}
