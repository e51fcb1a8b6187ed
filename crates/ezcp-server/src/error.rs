use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::store::{BlobError, StoreError};
use crate::validator::ValidationError;

/// Everything a transfer operation can fail with.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("token not found")]
    NotFound,

    #[error("token already uploaded")]
    AlreadyUploaded,

    #[error("token not uploaded")]
    NotUploaded,

    #[error("transaction not found")]
    TransactionNotFound,

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("upload exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("transaction {0} is cached without a token")]
    Unbound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(BlobError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<BlobError> for TransferError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound(_) | BlobError::InvalidId(_) => Self::NotFound,
            BlobError::TooLarge { limit } => Self::TooLarge { limit },
            other => Self::Blob(other),
        }
    }
}

impl TransferError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound | Self::AlreadyUploaded => StatusCode::NOT_FOUND,
            Self::NotUploaded => StatusCode::BAD_REQUEST,
            Self::TransactionNotFound | Self::Validation(_) => StatusCode::UNAUTHORIZED,
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unbound(_) | Self::Store(_) | Self::Blob(_) | Self::Gateway(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
            return (status, "internal server error").into_response();
        }
        let retry_after = match &self {
            Self::Validation(reason) => reason.retry_after(),
            _ => None,
        };
        let mut resp = (status, self.to_string()).into_response();
        if let Some(at) = retry_after {
            let secs = (at - Utc::now()).num_seconds().max(1);
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}
