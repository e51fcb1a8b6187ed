pub mod blobs;
pub mod db;
pub mod health;
pub mod model;
pub mod transactions;

pub use blobs::{BlobError, BlobStore, ByteStream, OpenBlob};
pub use db::{Consumed, Store, StoreError};
pub use health::StoreHealth;
pub use model::{AccountEntry, TokenRecord, TransactionRecord};
