//! # GET /getIOSAudioUrl
//!
//! AVPlayer向けの音声URL。`inline` 表示とRange再生に必要なヘッダーを
//! 署名に含め、クライアントが期待できるヘッダーを併せて返す。

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use signurl_types::{FileQuery, IosAudioUrlResponse};

use super::signed_url::require_file;
use crate::config::GatewayState;
use crate::error::GatewayError;
use crate::issuer::ios_audio_headers;

/// GET /getIOSAudioUrl — iOS向け音声URL発行。
pub async fn handle_ios_audio_url(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<FileQuery>,
) -> Result<Json<IosAudioUrlResponse>, GatewayError> {
    let file = require_file(query.file)?;
    let issued = state
        .issuer
        .issue_ios_audio(&file)
        .await
        .map_err(|e| e.redact(state.is_production()))?;

    let headers = ios_audio_headers(&issued.record.content_type);
    Ok(Json(IosAudioUrlResponse {
        url: issued.into_response(),
        platform: "ios-optimized".to_string(),
        headers,
    }))
}
