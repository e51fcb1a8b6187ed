use std::sync::Arc;

pub mod error;
pub mod gateway;
pub mod handlers;
pub mod issuer;
pub mod locks;
pub mod metrics;
pub mod server;
pub mod store;
pub mod transfer;
pub mod validator;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub transfers: transfer::Transfers,
    /// Request and lifecycle counters, also held by `transfers`.
    pub metrics: Arc<dyn metrics::MetricsSink>,
}

pub use error::TransferError;
pub use server::{build_router, purge, resolve_data_dir, run, ServerConfig};
