//! Token lifecycle: issue, upload, download and durable mint.
//!
//! Ephemeral tokens are read once. Their record and blob are removed only
//! after every byte of the blob has been handed to the client; a download
//! that breaks off early leaves both in place so it can be retried.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::error::TransferError;
use crate::gateway::GatewayClient;
use crate::issuer;
use crate::locks::{TokenGuard, TokenLocks};
use crate::metrics::{Event, MetricsSink};
use crate::store::model::{unix_now, TokenRecord, TransactionRecord};
use crate::store::{BlobStore, ByteStream, Consumed, Store, StoreError, StoreHealth};
use crate::validator::PaymentPolicy;

pub const DEFAULT_MAX_EPHEMERAL_BYTES: u64 = 1 << 30;
pub const DEFAULT_MAX_DURABLE_BYTES: u64 = 8 << 30;

/// Largest accepted upload per token kind, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub ephemeral: u64,
    pub durable: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            ephemeral: DEFAULT_MAX_EPHEMERAL_BYTES,
            durable: DEFAULT_MAX_DURABLE_BYTES,
        }
    }
}

impl UploadLimits {
    fn for_token(&self, token: &TokenRecord) -> u64 {
        if token.permanent {
            self.durable
        } else {
            self.ephemeral
        }
    }
}

/// Outcome of a durable mint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Minted {
    /// The transaction already had a token.
    Existing(String),
    Created(String),
}

impl Minted {
    pub fn token(&self) -> &str {
        match self {
            Self::Existing(t) | Self::Created(t) => t,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// An open download. Dropping `body` before its end leaves the token intact.
pub struct Download {
    pub length: u64,
    pub body: ByteStream,
}

/// Orchestrates the token store, blob storage and payment gateway.
#[derive(Clone)]
pub struct Transfers {
    store: Store,
    blobs: BlobStore,
    gateway: GatewayClient,
    policy: PaymentPolicy,
    limits: UploadLimits,
    locks: TokenLocks,
    health: StoreHealth,
    metrics: Arc<dyn MetricsSink>,
}

impl Transfers {
    pub fn new(
        store: Store,
        blobs: BlobStore,
        gateway: GatewayClient,
        policy: PaymentPolicy,
        limits: UploadLimits,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            blobs,
            gateway,
            policy,
            limits,
            locks: TokenLocks::new(),
            health: StoreHealth::new(),
            metrics,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Fires once the token store has failed for good.
    pub fn health(&self) -> &StoreHealth {
        &self.health
    }

    /// Mint a fresh ephemeral token.
    pub fn issue_token(&self, nonce: &str) -> Result<String, TransferError> {
        let id = issuer::issue(&self.store, nonce, issuer::create_ephemeral)
            .map_err(|e| self.checked(e.into()))?;
        self.metrics.record_event(Event::TokenIssued, 1);
        info!(token = %id, "issued token");
        Ok(id)
    }

    /// Store `body` as the contents of token `id`.
    ///
    /// Ephemeral tokens accept one upload; durable tokens accept any number,
    /// each replacing the last. The token is marked uploaded only after the
    /// blob is fully on disk, and the record always describes the blob that
    /// won the rename.
    #[instrument(skip(self, body))]
    pub async fn upload<S, E>(&self, id: &str, body: S) -> Result<u64, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        self.try_upload(id, body).await.map_err(|e| self.checked(e))
    }

    /// Open token `id` for download.
    ///
    /// Concurrent downloads of one ephemeral token are serialised; the
    /// second sees the token gone once the first completes.
    #[instrument(skip(self))]
    pub async fn download(&self, id: &str) -> Result<Download, TransferError> {
        self.try_download(id).await.map_err(|e| self.checked(e))
    }

    /// Length of the uploaded blob for `id`, without opening it for download.
    pub async fn inspect(&self, id: &str) -> Result<u64, TransferError> {
        self.try_inspect(id).await.map_err(|e| self.checked(e))
    }

    async fn try_inspect(&self, id: &str) -> Result<u64, TransferError> {
        let token = self.store.get(id)?.ok_or(TransferError::NotFound)?;
        if !token.is_uploaded() {
            return Err(TransferError::NotUploaded);
        }
        Ok(self.blobs.size(id).await?)
    }

    async fn try_upload<S, E>(&self, id: &str, body: S) -> Result<u64, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let (token, _guard) = self.lock(id).await?;
        if !token.accepts_upload() {
            return Err(TransferError::AlreadyUploaded);
        }

        let written = self
            .blobs
            .write(id, body, self.limits.for_token(&token))
            .await?;

        match self.store.mark_uploaded(id, written, unix_now()) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                // Swept while the body was in flight.
                self.discard_blob(id).await;
                return Err(TransferError::NotFound);
            }
            Err(e) => return Err(e.into()),
        }

        self.metrics.record_event(Event::Uploaded, 1);
        info!(token = %id, bytes = written, permanent = token.permanent, "upload complete");
        Ok(written)
    }

    async fn try_download(&self, id: &str) -> Result<Download, TransferError> {
        let token = self.store.get(id)?.ok_or(TransferError::NotFound)?;
        // Durable blobs are replaced by rename, so readers need no lock.
        let (token, guard) = if token.permanent {
            (token, None)
        } else {
            let (token, guard) = self.lock(id).await?;
            (token, Some(guard))
        };
        if !token.is_uploaded() {
            return Err(TransferError::NotUploaded);
        }

        // The open file fixes the length even if a re-upload renames over it.
        let blob = self.blobs.read(id).await?;
        let length = blob.length;
        let completion = Completion {
            transfers: self.clone(),
            id: id.to_owned(),
            expected: length,
            sent: 0,
            armed: true,
            guard,
        };

        let body = async_stream::stream! {
            let mut completion = completion;
            let mut blob = blob.body;
            while let Some(chunk) = blob.next().await {
                match chunk {
                    Ok(bytes) => {
                        completion.sent += bytes.len() as u64;
                        yield Ok(bytes);
                    }
                    Err(e) => {
                        completion.disarm();
                        warn!(token = %completion.id, error = %e, "download interrupted");
                        yield Err(e);
                        return;
                    }
                }
            }
            completion.finish().await;
        };

        debug!(token = %id, length, "download started");
        Ok(Download {
            length,
            body: Box::pin(body),
        })
    }

    /// Return the durable token paid for by transaction `tx_id`, minting it
    /// on first use. At most one token is ever bound to a transaction.
    #[instrument(skip(self, nonce))]
    pub async fn mint_durable(&self, tx_id: &str, nonce: &str) -> Result<Minted, TransferError> {
        self.try_mint_durable(tx_id, nonce)
            .await
            .map_err(|e| self.checked(e))
    }

    async fn try_mint_durable(&self, tx_id: &str, nonce: &str) -> Result<Minted, TransferError> {
        if let Some(cached) = self.store.load_transaction(tx_id)? {
            return self.reuse(cached);
        }

        let mut record = self
            .gateway
            .fetch(tx_id)
            .await?
            .ok_or(TransferError::TransactionNotFound)?;
        // Rejected transactions stay uncached so a matured one can be retried.
        self.check_payment(&record)?;

        let token = issuer::issue(&self.store, nonce, |store, id| {
            issuer::create_durable(store, id, tx_id)
        })?;
        record.bound_token_id = Some(token.clone());

        match self.store.store_transaction(&record) {
            Ok(()) => {
                self.metrics.record_event(Event::DurableMinted, 1);
                info!(tx = %tx_id, token = %token, "minted durable token");
                Ok(Minted::Created(token))
            }
            Err(StoreError::AlreadyCached(_)) => {
                // Lost a race with a concurrent mint for the same transaction.
                self.store.delete_token(&token)?;
                let cached = self
                    .store
                    .load_transaction(tx_id)?
                    .ok_or(TransferError::TransactionNotFound)?;
                self.reuse(cached)
            }
            Err(e) => {
                if let Err(cleanup) = self.store.delete_token(&token) {
                    warn!(token = %token, error = %cleanup, "failed to remove unbound token");
                }
                Err(e.into())
            }
        }
    }

    /// Ask the payment gateway for a fresh receive address.
    pub async fn new_address(&self) -> Result<String, TransferError> {
        Ok(self.gateway.new_address().await?)
    }

    /// Remove unused ephemeral tokens older than `max_age`.
    pub async fn sweep(&self, max_age: Duration) -> Result<Vec<String>, TransferError> {
        let removed = sweep_unused(&self.store, &self.blobs, max_age)
            .await
            .map_err(|e| self.checked(e))?;
        self.metrics.record_event(Event::Swept, removed.len() as u64);
        Ok(removed)
    }

    /// Run `sweep` every `interval` until the returned handle is aborted.
    pub fn spawn_sweep(self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(max_age).await {
                    warn!(error = %e, "background sweep error");
                }
            }
        })
    }

    fn reuse(&self, cached: TransactionRecord) -> Result<Minted, TransferError> {
        // A once-valid payment can have expired since it was cached.
        self.check_payment(&cached)?;
        let token = cached
            .bound_token_id
            .ok_or_else(|| TransferError::Unbound(cached.id.clone()))?;
        self.metrics.record_event(Event::DurableReused, 1);
        debug!(tx = %cached.id, token = %token, "reusing durable token");
        Ok(Minted::Existing(token))
    }

    fn check_payment(&self, record: &TransactionRecord) -> Result<(), TransferError> {
        self.policy.check(record, Utc::now()).map_err(|reason| {
            self.metrics.record_event(Event::PaymentRejected, 1);
            info!(tx = %record.id, %reason, "payment rejected");
            TransferError::Validation(reason)
        })
    }

    /// Take the per-token lock and read the record under it.
    async fn lock(&self, id: &str) -> Result<(TokenRecord, TokenGuard), TransferError> {
        let guard = self.locks.acquire(id).await;
        let token = self.store.get(id)?.ok_or(TransferError::NotFound)?;
        Ok((token, guard))
    }

    /// Pass `err` through, latching a fatal store failure on the way.
    fn checked(&self, err: TransferError) -> TransferError {
        if let TransferError::Store(e) = &err {
            self.health.observe(e);
        }
        err
    }

    async fn finish_download(&self, id: &str) {
        self.metrics.record_event(Event::Downloaded, 1);
        match self.store.consume(id, unix_now()) {
            Ok(Consumed::Deleted) => {
                self.discard_blob(id).await;
                info!(token = %id, "token consumed");
            }
            Ok(Consumed::Stamped) => debug!(token = %id, "durable token downloaded"),
            Ok(Consumed::NotFound) => warn!(token = %id, "token vanished during download"),
            Err(e) => {
                error!(token = %id, error = %e, "failed to consume token");
                self.health.observe(&e);
            }
        }
    }

    async fn discard_blob(&self, id: &str) {
        if let Err(e) = self.blobs.delete(id).await {
            warn!(token = %id, error = %e, "failed to delete blob");
        }
    }
}

/// Remove unused ephemeral tokens older than `max_age`, along with any blob
/// left at their path. Returns the removed ids.
pub async fn sweep_unused(
    store: &Store,
    blobs: &BlobStore,
    max_age: Duration,
) -> Result<Vec<String>, TransferError> {
    let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    let removed = store.sweep_expired(max_age_secs, unix_now())?;
    for id in &removed {
        if let Err(e) = blobs.delete(id).await {
            warn!(token = %id, error = %e, "failed to delete swept blob");
        }
    }
    Ok(removed)
}

/// Consumes the token once every byte of the blob has been handed out.
///
/// Normally this runs when the body stream reaches its end. A server that
/// stops polling after the advertised length drops the body instead, in
/// which case the drop hook finishes the download in the background.
struct Completion {
    transfers: Transfers,
    id: String,
    expected: u64,
    sent: u64,
    armed: bool,
    guard: Option<TokenGuard>,
}

impl Completion {
    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn finish(mut self) {
        self.armed = false;
        self.transfers.finish_download(&self.id).await;
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.armed || self.sent < self.expected {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(token = %self.id, "no runtime to finish download");
            return;
        };
        let transfers = self.transfers.clone();
        let id = std::mem::take(&mut self.id);
        let guard = self.guard.take();
        handle.spawn(async move {
            transfers.finish_download(&id).await;
            drop(guard);
        });
    }
}
