//! # POST /getBatchSignedUrls

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use signurl_types::{BatchSignedUrlRequest, BatchSignedUrlResponse};

use super::parse_body;
use crate::config::GatewayState;
use crate::error::GatewayError;

/// POST /getBatchSignedUrls — 複数ファイルの署名付きURLを一括発行。
///
/// 個々のファイルの失敗は `errors` に入り、リクエスト自体は成功する。
pub async fn handle_batch_signed_urls(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<BatchSignedUrlRequest>, JsonRejection>,
) -> Result<Json<BatchSignedUrlResponse>, GatewayError> {
    let body = parse_body(body)?;
    let response = state
        .batch
        .issue_batch(body.files, body.batch_size)
        .await
        .map_err(|e| e.redact(state.is_production()))?;
    Ok(Json(response))
}
