use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{error::TransferError, AppState};

// ── Nonce extraction ─────────────────────────────────────────────────────────

/// Client-identifying input mixed into new token ids: the user agent and the
/// first `X-Forwarded-For` hop.
fn request_nonce(headers: &HeaderMap) -> String {
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .unwrap_or("");
    format!("{agent}|{forwarded}")
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Ephemeral tokens ─────────────────────────────────────────────────────────

pub async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, TransferError> {
    let id = state.transfers.issue_token(&request_nonce(&headers))?;
    Ok((StatusCode::CREATED, id).into_response())
}

pub async fn upload(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Body,
) -> Result<StatusCode, TransferError> {
    state
        .transfers
        .upload(&token, body.into_data_stream())
        .await?;
    Ok(StatusCode::CREATED)
}

/// HEAD reports the length without opening the download, so it never
/// consumes a one-shot token.
pub async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
    method: Method,
) -> Result<Response, TransferError> {
    let (length, body) = if method == Method::HEAD {
        (state.transfers.inspect(&token).await?, Body::empty())
    } else {
        let download = state.transfers.download(&token).await?;
        (download.length, Body::from_stream(download.body))
    };

    let mut resp = body.into_response();
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    Ok(resp)
}

// ── Durable tokens ───────────────────────────────────────────────────────────

/// 201 with a newly minted token, 200 with the one already bound to `tx`.
pub async fn durable_token(
    State(state): State<AppState>,
    Path(tx): Path<String>,
    headers: HeaderMap,
) -> Result<Response, TransferError> {
    let minted = state
        .transfers
        .mint_durable(&tx, &request_nonce(&headers))
        .await?;
    let status = if minted.is_new() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, minted.token().to_owned()).into_response())
}

pub async fn new_address(State(state): State<AppState>) -> Result<String, TransferError> {
    state.transfers.new_address().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_uses_agent_and_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8.4"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(request_nonce(&headers), "curl/8.4|203.0.113.7");
        assert_eq!(request_nonce(&HeaderMap::new()), "|");
    }
}
