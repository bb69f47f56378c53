//! # GET /getSignedUrl
//!
//! 署名付きダウンロードURLの発行。2層キャッシュを経由し、
//! 期限切れ間近のエントリは再発行する。

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use signurl_types::{FileQuery, SignedUrlResponse};

use crate::config::GatewayState;
use crate::error::GatewayError;

/// `file` クエリを必須項目として取り出す。
pub(crate) fn require_file(file: Option<String>) -> Result<String, GatewayError> {
    file.filter(|f| !f.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("File parameter is required".to_string()))
}

/// GET /getSignedUrl — 署名付きダウンロードURL発行。
pub async fn handle_signed_url(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<FileQuery>,
) -> Result<Json<SignedUrlResponse>, GatewayError> {
    let file = require_file(query.file)?;
    let issued = state
        .issuer
        .issue(&file)
        .await
        .map_err(|e| e.redact(state.is_production()))?;
    Ok(Json(issued.into_response()))
}
