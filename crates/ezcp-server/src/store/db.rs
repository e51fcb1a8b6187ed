use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::model::TokenRecord;

pub(crate) const TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("tokens");

/// Token store failures. Everything redb reports is `Unavailable`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token id already exists: {0}")]
    DuplicateId(String),

    #[error("token not found: {0}")]
    NotFound(String),

    #[error("transaction already cached: {0}")]
    AlreadyCached(String),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] redb::Error),

    #[error("corrupt record: {0}")]
    Codec(String),
}

macro_rules! unavailable_from {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(e: $err) -> Self {
                    Self::Unavailable(e.into())
                }
            }
        )*
    };
}

unavailable_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl StoreError {
    /// True when the database itself is broken rather than one request.
    /// redb keeps failing with `PreviousIo` after any I/O error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(
                redb::Error::Io(_)
                    | redb::Error::PreviousIo
                    | redb::Error::Corrupted(_)
                    | redb::Error::LockPoisoned(_)
            )
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What `consume` did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    /// Ephemeral token: the record is gone.
    Deleted,
    /// Permanent token: `downloaded_at` was stamped, the record stays.
    Stamped,
    NotFound,
}

/// Thread-safe handle to the redb store.
///
/// redb admits one write transaction at a time, so every test-then-insert below
/// runs inside a single write transaction and is linearizable per key.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(TOKENS)?;
        write_txn.open_table(super::transactions::TRANSACTIONS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a new token. Fails with `DuplicateId` if the id is taken.
    pub fn create_token(&self, record: &TokenRecord) -> StoreResult<()> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(TOKENS)?;
            if table.get(record.id.as_str())?.is_some() {
                false
            } else {
                table.insert(record.id.as_str(), bytes.as_slice())?;
                true
            }
        };
        if !inserted {
            write_txn.abort()?;
            return Err(StoreError::DuplicateId(record.id.clone()));
        }
        write_txn.commit()?;

        debug!(token = %record.id, permanent = record.permanent, "created token");
        Ok(())
    }

    /// True if the token exists and, when `require_not_uploaded` is set,
    /// has not been uploaded yet.
    pub fn exists(&self, id: &str, require_not_uploaded: bool) -> StoreResult<bool> {
        Ok(match self.get(id)? {
            Some(token) => !require_not_uploaded || !token.is_uploaded(),
            None => false,
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<TokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|bytes| decode(&bytes)).transpose()
    }

    /// Record a completed upload. Repeated calls overwrite the previous values.
    pub fn mark_uploaded(&self, id: &str, length: u64, at: i64) -> StoreResult<()> {
        self.update(id, |token| {
            token.uploaded_at = Some(at);
            token.uploaded_length = Some(length);
        })
    }

    /// Finish a download: delete an ephemeral record, stamp a permanent one.
    pub fn consume(&self, id: &str, at: i64) -> StoreResult<Consumed> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(TOKENS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => Consumed::NotFound,
                Some(bytes) => {
                    let mut token: TokenRecord = decode(&bytes)?;
                    if token.permanent {
                        token.downloaded_at = Some(at);
                        let updated = encode(&token)?;
                        table.insert(id, updated.as_slice())?;
                        Consumed::Stamped
                    } else {
                        table.remove(id)?;
                        Consumed::Deleted
                    }
                }
            }
        };
        write_txn.commit()?;
        debug!(token = %id, ?outcome, "consumed token");
        Ok(outcome)
    }

    /// Delete a token record outright. Returns true if it existed.
    pub fn delete_token(&self, id: &str) -> StoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(TOKENS)?;
            let existed = table.remove(id)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    pub fn count_tokens(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;
        Ok(table.len()?)
    }

    /// Remove ephemeral tokens created more than `max_age_secs` before `now`
    /// that were never uploaded. Returns the removed ids.
    pub fn sweep_expired(&self, max_age_secs: i64, now: i64) -> StoreResult<Vec<String>> {
        let cutoff = now - max_age_secs;

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TOKENS)?;
            let mut stale = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let token: TokenRecord = decode(v.value())?;
                if token.is_stale(cutoff) {
                    stale.push(k.value().to_owned());
                }
            }
            for id in &stale {
                table.remove(id.as_str())?;
            }
            stale
        };
        write_txn.commit()?;

        if !removed.is_empty() {
            info!(removed = removed.len(), "swept unused tokens");
        }
        Ok(removed)
    }

    /// Read-modify-write of one token inside a single write transaction.
    fn update(&self, id: &str, apply: impl FnOnce(&mut TokenRecord)) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        let found = {
            let mut table = write_txn.open_table(TOKENS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.get(id)?.map(|guard| guard.value().to_vec());
            match raw_bytes {
                None => false,
                Some(bytes) => {
                    let mut token: TokenRecord = decode(&bytes)?;
                    apply(&mut token);
                    let updated = encode(&token)?;
                    table.insert(id, updated.as_slice())?;
                    true
                }
            }
        };
        if !found {
            write_txn.abort()?;
            return Err(StoreError::NotFound(id.to_owned()));
        }
        write_txn.commit()?;
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(record: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(record)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::model::unix_now;
    use tempfile::tempdir;

    pub(crate) fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path).unwrap();
        (store, dir)
    }

    #[test]
    fn fresh_token_exists_until_uploaded() {
        let (s, _dir) = make_store();
        s.create_token(&TokenRecord::ephemeral("abcdef01", unix_now()))
            .unwrap();
        assert!(s.exists("abcdef01", false).unwrap());
        assert!(s.exists("abcdef01", true).unwrap());

        s.mark_uploaded("abcdef01", 12, unix_now()).unwrap();
        assert!(s.exists("abcdef01", false).unwrap());
        assert!(!s.exists("abcdef01", true).unwrap());
    }

    #[test]
    fn duplicate_id_rejected() {
        let (s, _dir) = make_store();
        s.create_token(&TokenRecord::ephemeral("dup00001", 1)).unwrap();
        let err = s
            .create_token(&TokenRecord::durable("dup00001", 2, "tx"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "dup00001"));
        // The first row is untouched.
        assert!(!s.get("dup00001").unwrap().unwrap().permanent);
    }

    #[test]
    fn concurrent_creates_have_one_winner() {
        let (s, _dir) = make_store();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.create_token(&TokenRecord::ephemeral("race0001", 1)))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn mark_uploaded_overwrites() {
        let (s, _dir) = make_store();
        s.create_token(&TokenRecord::durable("perm0001", 1, "tx")).unwrap();
        s.mark_uploaded("perm0001", 10, 100).unwrap();
        s.mark_uploaded("perm0001", 20, 200).unwrap();
        let t = s.get("perm0001").unwrap().unwrap();
        assert_eq!(t.uploaded_length, Some(20));
        assert_eq!(t.uploaded_at, Some(200));
    }

    #[test]
    fn mark_uploaded_unknown_token() {
        let (s, _dir) = make_store();
        assert!(matches!(
            s.mark_uploaded("nope0001", 1, 1),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn consume_deletes_ephemeral() {
        let (s, _dir) = make_store();
        s.create_token(&TokenRecord::ephemeral("once0001", 1)).unwrap();
        assert_eq!(s.consume("once0001", 5).unwrap(), Consumed::Deleted);
        assert!(s.get("once0001").unwrap().is_none());
        assert_eq!(s.consume("once0001", 6).unwrap(), Consumed::NotFound);
    }

    #[test]
    fn consume_stamps_permanent() {
        let (s, _dir) = make_store();
        s.create_token(&TokenRecord::durable("perm0002", 1, "tx")).unwrap();
        assert_eq!(s.consume("perm0002", 5).unwrap(), Consumed::Stamped);
        assert_eq!(s.consume("perm0002", 9).unwrap(), Consumed::Stamped);
        let t = s.get("perm0002").unwrap().unwrap();
        assert_eq!(t.downloaded_at, Some(9));
    }

    #[test]
    fn sweep_removes_only_stale_unused_ephemeral() {
        let (s, _dir) = make_store();
        s.create_token(&TokenRecord::ephemeral("old00001", 1_000)).unwrap();
        s.create_token(&TokenRecord::ephemeral("new00001", 9_500)).unwrap();
        s.create_token(&TokenRecord::durable("perm0003", 1_000, "tx")).unwrap();
        s.create_token(&TokenRecord::ephemeral("used0001", 1_000)).unwrap();
        s.mark_uploaded("used0001", 3, 1_001).unwrap();

        let removed = s.sweep_expired(1_000, 10_000).unwrap();
        assert_eq!(removed, vec!["old00001".to_string()]);
        assert!(s.get("new00001").unwrap().is_some());
        assert!(s.get("perm0003").unwrap().is_some());
        assert!(s.get("used0001").unwrap().is_some());

        assert!(s.sweep_expired(1_000, 10_000).unwrap().is_empty());
    }

    #[test]
    fn delete_token_reports_presence() {
        let (s, _dir) = make_store();
        s.create_token(&TokenRecord::ephemeral("gone0001", 1)).unwrap();
        assert!(s.delete_token("gone0001").unwrap());
        assert!(!s.delete_token("gone0001").unwrap());
        assert_eq!(s.count_tokens().unwrap(), 0);
    }

    #[test]
    fn only_storage_failures_are_fatal() {
        let io = StoreError::from(redb::StorageError::Io(std::io::Error::other("disk gone")));
        assert!(io.is_fatal());
        assert!(StoreError::Unavailable(redb::Error::PreviousIo).is_fatal());

        assert!(!StoreError::DuplicateId("x".into()).is_fatal());
        assert!(!StoreError::AlreadyCached("x".into()).is_fatal());
        assert!(!StoreError::Codec("bad".into()).is_fatal());
        assert!(!StoreError::Unavailable(redb::Error::TableDoesNotExist("t".into())).is_fatal());
    }
}
