//! Token id minting.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::store::model::{unix_now, TokenRecord};
use crate::store::{Store, StoreError};

/// Fresh ids tried before a duplicate is reported to the caller.
const MAX_ID_ATTEMPTS: usize = 3;

/// Derive an unpredictable token id (64 hex chars).
///
/// The digest covers wall-clock seconds, the sub-second nanos, 64 random bits
/// and a caller-supplied nonce such as the client's user agent.
pub fn new_id(nonce: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let salt = rand::thread_rng().next_u64();

    let mut hasher = Sha256::new();
    hasher.update(now.as_secs().to_be_bytes());
    hasher.update(now.subsec_nanos().to_be_bytes());
    hasher.update(salt.to_be_bytes());
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// Insert an ephemeral token under `id`.
pub fn create_ephemeral(store: &Store, id: &str) -> Result<(), StoreError> {
    store.create_token(&TokenRecord::ephemeral(id, unix_now()))
}

/// Insert a durable token under `id`, bound to `transaction_id`.
pub fn create_durable(store: &Store, id: &str, transaction_id: &str) -> Result<(), StoreError> {
    store.create_token(&TokenRecord::durable(id, unix_now(), transaction_id))
}

/// Mint a new id and insert it with `create`, drawing a fresh id whenever the
/// store reports a duplicate.
pub fn issue<F>(store: &Store, nonce: &str, create: F) -> Result<String, StoreError>
where
    F: Fn(&Store, &str) -> Result<(), StoreError>,
{
    let mut attempt = 1;
    loop {
        let id = new_id(nonce);
        match create(store, &id) {
            Ok(()) => return Ok(id),
            Err(StoreError::DuplicateId(_)) if attempt < MAX_ID_ATTEMPTS => {
                warn!(attempt, "token id collision, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
