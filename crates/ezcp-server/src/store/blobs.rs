//! Sharded filesystem storage for uploaded file contents.
//!
//! A token id `abcdef...` lives at `<root>/abc/de/abcdef...`, which bounds the
//! fan-out of any single directory.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::RngCore;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Chunk size for streaming reads (64 KiB).
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Characters of the id used for the first and second shard levels.
const SHARD_1: usize = 3;
const SHARD_2: usize = 2;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob id: {0:?}")]
    InvalidId(String),

    #[error("upload exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("upload body interrupted: {0}")]
    Body(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BlobResult<T> = std::result::Result<T, BlobError>;

/// A boxed stream of blob contents.
pub type ByteStream = Pin<Box<dyn Stream<Item = BlobResult<Bytes>> + Send>>;

/// A blob opened for reading. `length` is taken from the open file, so it
/// matches `body` even if the blob is replaced meanwhile.
pub struct OpenBlob {
    pub length: u64,
    pub body: ByteStream,
}

/// Content bytes keyed by token id.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create the root directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> BlobResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Derive the sharded path for `id`. Only ASCII alphanumeric ids of at
    /// least five characters are accepted, so the path can never leave `root`.
    pub fn path_for(&self, id: &str) -> BlobResult<PathBuf> {
        if id.len() < SHARD_1 + SHARD_2 || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(BlobError::InvalidId(id.to_owned()));
        }
        Ok(self
            .root
            .join(&id[..SHARD_1])
            .join(&id[SHARD_1..SHARD_1 + SHARD_2])
            .join(id))
    }

    /// Stream `body` into the blob for `id`, replacing any previous blob.
    ///
    /// Data is spooled to a temporary file in the shard directory and renamed
    /// into place only after the whole body has been written and synced, so a
    /// failure never leaves a partial blob at the derived path.
    #[instrument(skip(self, body))]
    pub async fn write<S, E>(&self, id: &str, body: S, limit: u64) -> BlobResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let path = self.path_for(id)?;
        let shard = path
            .parent()
            .ok_or_else(|| BlobError::InvalidId(id.to_owned()))?;
        fs::create_dir_all(shard).await?;

        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let temp_path = shard.join(format!(".{id}.{}.tmp", hex::encode(suffix)));

        let written = match spool(&temp_path, body, limit).await {
            Ok(n) => n,
            Err(e) => {
                discard(&temp_path).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&temp_path, &path).await {
            discard(&temp_path).await;
            return Err(e.into());
        }

        debug!(blob = %id, bytes = written, "stored blob");
        Ok(written)
    }

    /// Open the blob for `id` as a chunked stream.
    #[instrument(skip(self))]
    pub async fn read(&self, id: &str) -> BlobResult<OpenBlob> {
        let path = self.path_for(id)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, id))?;
        let length = file.metadata().await?.len();

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(OpenBlob {
            length,
            body: Box::pin(stream),
        })
    }

    /// Size in bytes of the blob for `id`.
    pub async fn size(&self, id: &str) -> BlobResult<u64> {
        let path = self.path_for(id)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(e, id))?;
        Ok(meta.len())
    }

    /// Remove the blob for `id`. Absence is not an error.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> BlobResult<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(blob = %id, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, id: &str) -> BlobResult<bool> {
        let path = self.path_for(id)?;
        Ok(fs::try_exists(&path).await?)
    }
}

fn not_found_or_io(e: std::io::Error, id: &str) -> BlobError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BlobError::NotFound(id.to_owned())
    } else {
        BlobError::Io(e)
    }
}

async fn spool<S, E>(temp_path: &Path, body: S, limit: u64) -> BlobResult<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut file = fs::File::create(temp_path).await?;
    let mut written: u64 = 0;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| BlobError::Body(e.to_string()))?;
        written += chunk.len() as u64;
        if written > limit {
            return Err(BlobError::TooLarge { limit });
        }
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;
    Ok(written)
}

async fn discard(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %temp_path.display(), error = %e, "failed to remove temp blob");
        }
    }
}
