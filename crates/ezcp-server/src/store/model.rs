use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored in redb as bincode-encoded bytes, keyed by token id.
/// All optional fields are absent at mint time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    /// Unix timestamp (seconds) when the token was minted.
    pub created: i64,
    /// Unix timestamp (seconds) of the last successful upload.
    pub uploaded_at: Option<i64>,
    /// Size in bytes of the last successful upload.
    pub uploaded_length: Option<u64>,
    /// Only ever set on permanent tokens; ephemeral tokens are deleted instead.
    pub downloaded_at: Option<i64>,
    pub permanent: bool,
    /// Payment transaction a permanent token was minted against.
    pub creator_transaction_id: Option<String>,
}

impl TokenRecord {
    /// A fresh single-use token.
    pub fn ephemeral(id: &str, created: i64) -> Self {
        Self {
            id: id.to_owned(),
            created,
            uploaded_at: None,
            uploaded_length: None,
            downloaded_at: None,
            permanent: false,
            creator_transaction_id: None,
        }
    }

    /// A fresh durable token bound to the paying transaction.
    pub fn durable(id: &str, created: i64, transaction_id: &str) -> Self {
        Self {
            permanent: true,
            creator_transaction_id: Some(transaction_id.to_owned()),
            ..Self::ephemeral(id, created)
        }
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded_at.is_some()
    }

    /// Upload precondition: never uploaded, or permanent (re-uploads overwrite).
    pub fn accepts_upload(&self) -> bool {
        !self.is_uploaded() || self.permanent
    }

    /// True for ephemeral tokens minted before `cutoff` and never uploaded.
    pub fn is_stale(&self, cutoff: i64) -> bool {
        !self.permanent && !self.is_uploaded() && self.created < cutoff
    }
}

/// One credited or debited account in a payment transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub account_id: String,
    /// Value in the smallest payment unit.
    pub value: i64,
    pub is_own_account: bool,
}

/// Cached payment transaction. Written once, then only read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    pub entries: Vec<AccountEntry>,
    pub pending: bool,
    /// Durable token minted against this transaction, once there is one.
    pub bound_token_id: Option<String>,
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_inherits_empty_lifecycle_fields() {
        let t = TokenRecord::durable("abcdef", 10, "tx1");
        assert!(t.permanent);
        assert_eq!(t.creator_transaction_id.as_deref(), Some("tx1"));
        assert!(t.uploaded_at.is_none());
        assert!(t.downloaded_at.is_none());
    }

    #[test]
    fn upload_precondition() {
        let mut eph = TokenRecord::ephemeral("abcdef", 10);
        assert!(eph.accepts_upload());
        eph.uploaded_at = Some(11);
        assert!(!eph.accepts_upload());

        let mut dur = TokenRecord::durable("abcdef", 10, "tx1");
        dur.uploaded_at = Some(11);
        assert!(dur.accepts_upload());
    }

    #[test]
    fn stale_only_for_unused_ephemeral() {
        let eph = TokenRecord::ephemeral("abcdef", 10);
        assert!(eph.is_stale(11));
        assert!(!eph.is_stale(10));

        let dur = TokenRecord::durable("abcdef", 10, "tx1");
        assert!(!dur.is_stale(11));

        let mut up = TokenRecord::ephemeral("abcdef", 10);
        up.uploaded_at = Some(10);
        assert!(!up.is_stale(11));
    }
}
