//! # POST /getUploadUrl
//!
//! 署名付きアップロードURL（PUT）の発行。
//! 音声ファイルにはキャッシュ・再生用のメタデータを付与する。

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use signurl_types::{UploadUrlRequest, UploadUrlResponse};

use super::parse_body;
use crate::config::GatewayState;
use crate::error::GatewayError;
use crate::issuer::format_timestamp;

/// POST /getUploadUrl — 署名付きアップロードURL発行。
pub async fn handle_upload_url(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> Result<Json<UploadUrlResponse>, GatewayError> {
    let body = parse_body(body)?;
    let file = body
        .file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("File parameter is required".to_string()))?;

    let grant = state
        .issuer
        .issue_upload(&file, body.content_type.as_deref())
        .await
        .map_err(|e| e.redact(state.is_production()))?;

    Ok(Json(UploadUrlResponse {
        success: true,
        signed_url: grant.url,
        file: grant.file_path,
        content_type: grant.content_type,
        metadata: grant.metadata,
        expires_in: grant.expires_in,
        expires_at: format_timestamp(grant.expires_at),
    }))
}
