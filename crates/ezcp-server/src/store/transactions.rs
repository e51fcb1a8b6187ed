//! Write-once cache of payment transactions fetched from the gateway.

use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use super::db::{decode, encode, Store, StoreError, StoreResult};
use super::model::TransactionRecord;

pub(crate) const TRANSACTIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("transactions");

impl Store {
    /// Load a cached transaction, if any.
    pub fn load_transaction(&self, id: &str) -> StoreResult<Option<TransactionRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.map(|bytes| decode(&bytes)).transpose()
    }

    /// Cache a transaction. Insert-only: a second store for the same id
    /// fails with `AlreadyCached` and leaves the first record in place.
    pub fn store_transaction(&self, record: &TransactionRecord) -> StoreResult<()> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(TRANSACTIONS)?;
            if table.get(record.id.as_str())?.is_some() {
                false
            } else {
                table.insert(record.id.as_str(), bytes.as_slice())?;
                true
            }
        };
        if !inserted {
            write_txn.abort()?;
            return Err(StoreError::AlreadyCached(record.id.clone()));
        }
        write_txn.commit()?;

        debug!(tx = %record.id, token = ?record.bound_token_id, "cached transaction");
        Ok(())
    }

    /// Number of cached transactions.
    pub fn count_transactions(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSACTIONS)?;
        Ok(table.len()?)
    }
}
