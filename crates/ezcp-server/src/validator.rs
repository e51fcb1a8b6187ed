//! Payment acceptance policy for durable tokens.
//!
//! A transaction qualifies when it credits our wallet with at least the
//! minimum amount, is no longer pending (or has been pending longer than the
//! grace period), and is younger than one subscription lifetime.

use chrono::{DateTime, Duration, Months, Utc};
use thiserror::Error;

use crate::store::model::{AccountEntry, TransactionRecord};

/// Smallest payment units per display unit (satoshi per BTC).
pub const UNITS_PER_COIN: u64 = 100_000_000;

/// Default minimum accepted payment, in display units.
pub const DEFAULT_MINIMUM_AMOUNT: f64 = 0.01;

/// How long an unconfirmed transaction is distrusted after its date.
pub const PENDING_GRACE_HOURS: i64 = 24;

/// How long a paid subscription lasts from the transaction date.
pub const SUBSCRIPTION_MONTHS: u32 = 12;

/// Why a transaction was rejected. The display strings go to clients as-is.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("our wallet was not a recipient of the transaction")]
    NotRecipient,

    #[error("transaction is pending confirmation, retry after {retry_after}")]
    PendingValidation { retry_after: DateTime<Utc> },

    #[error("subscription has expired")]
    Expired,

    #[error("transaction amount wasn't enough: got {received}, need {required}")]
    InsufficientAmount { received: f64, required: f64 },
}

impl ValidationError {
    /// When waiting can turn the rejection into an acceptance. Only a
    /// pending transaction can.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::PendingValidation { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// Wallet identity used when the gateway does not flag our own entries.
    pub own_account: String,
    /// Minimum accepted payment, in display units.
    pub minimum_amount: f64,
}

impl PaymentPolicy {
    pub fn new(own_account: impl Into<String>, minimum_amount: f64) -> Self {
        Self {
            own_account: own_account.into(),
            minimum_amount,
        }
    }

    /// Apply the policy to `tx` as of `now`.
    ///
    /// Checks run recipient, amount, pending, expiry. An underpaid transaction
    /// never becomes acceptable, so it is rejected before the pending check
    /// would tell the client to come back later.
    pub fn check(&self, tx: &TransactionRecord, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let entry = self.own_entry(tx).ok_or(ValidationError::NotRecipient)?;

        let received = to_display_units(entry.value);
        if received < self.minimum_amount {
            return Err(ValidationError::InsufficientAmount {
                received,
                required: self.minimum_amount,
            });
        }

        let trusted_from = tx.date + Duration::hours(PENDING_GRACE_HOURS);
        if tx.pending && now < trusted_from {
            return Err(ValidationError::PendingValidation {
                retry_after: trusted_from,
            });
        }

        if subscription_end(tx.date) < now {
            return Err(ValidationError::Expired);
        }

        Ok(())
    }

    /// The entry crediting our wallet: the flagged one if the gateway flags
    /// entries at all, otherwise the one matching our account id.
    pub fn own_entry<'a>(&self, tx: &'a TransactionRecord) -> Option<&'a AccountEntry> {
        tx.entries
            .iter()
            .find(|e| e.is_own_account)
            .or_else(|| tx.entries.iter().find(|e| e.account_id == self.own_account))
    }
}

/// Convert a value in smallest units to display units.
pub fn to_display_units(value: i64) -> f64 {
    value as f64 / UNITS_PER_COIN as f64
}

/// End of the subscription window opened by a payment dated `date`.
pub fn subscription_end(date: DateTime<Utc>) -> DateTime<Utc> {
    date.checked_add_months(Months::new(SUBSCRIPTION_MONTHS))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const WALLET: &str = "2NwalletAddr";

    fn policy() -> PaymentPolicy {
        PaymentPolicy::new(WALLET, DEFAULT_MINIMUM_AMOUNT)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
    }

    fn tx(value: i64, pending: bool, flagged: bool) -> TransactionRecord {
        TransactionRecord {
            id: "tx".into(),
            date: t0(),
            entries: vec![
                AccountEntry {
                    account_id: "someone-else".into(),
                    value: -value,
                    is_own_account: false,
                },
                AccountEntry {
                    account_id: WALLET.into(),
                    value,
                    is_own_account: flagged,
                },
            ],
            pending,
            bound_token_id: None,
        }
    }

    #[test]
    fn sufficient_confirmed_payment_is_valid() {
        let now = t0() + Duration::hours(1);
        assert_eq!(policy().check(&tx(1_000_000, false, true), now), Ok(()));
    }

    #[test]
    fn unflagged_entries_fall_back_to_account_id() {
        let now = t0() + Duration::hours(1);
        assert_eq!(policy().check(&tx(1_000_000, false, false), now), Ok(()));
    }

    #[test]
    fn missing_recipient() {
        let mut t = tx(1_000_000, false, false);
        t.entries.retain(|e| e.account_id != WALLET);
        assert_eq!(policy().check(&t, t0()), Err(ValidationError::NotRecipient));
    }

    #[test]
    fn flagged_entries_ignore_account_id_match() {
        let mut t = tx(1_000_000, false, false);
        t.entries[0].is_own_account = true;
        // The flagged entry is a debit, so it is underpaid rather than matched by id.
        assert!(matches!(
            policy().check(&t, t0()),
            Err(ValidationError::InsufficientAmount { .. })
        ));
    }

    #[test]
    fn pending_within_grace_then_valid_after() {
        let t = tx(1_000_000, true, true);
        let before = t0() + Duration::hours(23);
        let err = policy().check(&t, before).unwrap_err();
        assert_eq!(
            err,
            ValidationError::PendingValidation {
                retry_after: t0() + Duration::hours(24)
            }
        );
        assert_eq!(err.retry_after(), Some(t0() + Duration::hours(24)));

        let after = t0() + Duration::hours(25);
        assert_eq!(policy().check(&t, after), Ok(()));
    }

    #[test]
    fn insufficient_regardless_of_pending_or_age() {
        // 0.005 against a 0.01 threshold.
        for pending in [false, true] {
            for age in [Duration::hours(1), Duration::days(400)] {
                let err = policy()
                    .check(&tx(500_000, pending, true), t0() + age)
                    .unwrap_err();
                assert!(matches!(err, ValidationError::InsufficientAmount { .. }));
                assert_eq!(err.retry_after(), None);
            }
        }
    }

    #[test]
    fn exact_minimum_is_accepted() {
        let now = t0() + Duration::hours(1);
        assert_eq!(policy().check(&tx(1_000_000, false, true), now), Ok(()));
        assert!(policy().check(&tx(999_999, false, true), now).is_err());
    }

    #[test]
    fn older_than_a_year_is_expired() {
        let now = t0() + Duration::days(366);
        assert_eq!(
            policy().check(&tx(5_000_000, false, true), now),
            Err(ValidationError::Expired)
        );
        // Pending no longer matters once the grace period is long gone.
        assert_eq!(
            policy().check(&tx(5_000_000, true, true), now),
            Err(ValidationError::Expired)
        );
    }

    #[test]
    fn subscription_is_one_calendar_year() {
        assert_eq!(
            subscription_end(t0()),
            Utc.with_ymd_and_hms(2027, 5, 1, 10, 0, 0).unwrap()
        );
        let t = tx(1_000_000, false, true);
        assert_eq!(policy().check(&t, subscription_end(t0())), Ok(()));
    }
}
