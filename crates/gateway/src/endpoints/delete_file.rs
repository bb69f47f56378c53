//! # DELETE /deleteFile

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use signurl_types::{DeleteFileResponse, FileRequest};

use super::parse_body;
use crate::config::GatewayState;
use crate::error::GatewayError;
use crate::issuer::format_timestamp;

/// DELETE /deleteFile — オブジェクト削除とキャッシュ無効化。
pub async fn handle_delete_file(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<FileRequest>, JsonRejection>,
) -> Result<Json<DeleteFileResponse>, GatewayError> {
    let body = parse_body(body)?;
    let file = body
        .file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("File parameter is required".to_string()))?;

    let file = state
        .issuer
        .delete(&file)
        .await
        .map_err(|e| e.redact(state.is_production()))?;

    Ok(Json(DeleteFileResponse {
        success: true,
        message: "File deleted successfully".to_string(),
        file,
        deleted_at: format_timestamp(Utc::now()),
        cache_invalidated: true,
    }))
}
