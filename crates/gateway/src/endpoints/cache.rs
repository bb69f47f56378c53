//! # キャッシュ管理エンドポイント
//!
//! - `POST /invalidate-cache` — 1ファイル分のキャッシュ無効化
//! - `GET /cache-stats` — 統計と設定
//! - `POST /clear-cache` — パターン一致または全削除

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use signurl_types::{
    CacheConfigView, CacheStatsResponse, ClearCacheRequest, ClearCacheResponse, FileRequest,
    InvalidateCacheResponse,
};

use super::parse_body;
use crate::config::GatewayState;
use crate::error::GatewayError;
use crate::issuer::format_timestamp;

/// POST /invalidate-cache — ダウンロードURLのキャッシュを無効化する。
pub async fn handle_invalidate_cache(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<FileRequest>, JsonRejection>,
) -> Result<Json<InvalidateCacheResponse>, GatewayError> {
    let body = parse_body(body)?;
    let file = body
        .file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("File parameter is required".to_string()))?;

    let (file, cache_key) = state.issuer.invalidate(&file).await?;

    Ok(Json(InvalidateCacheResponse {
        success: true,
        message: "Cache invalidated successfully".to_string(),
        file,
        cache_key: cache_key.to_string(),
        invalidated_at: format_timestamp(Utc::now()),
    }))
}

/// GET /cache-stats — キャッシュ統計。
pub async fn handle_cache_stats(
    State(state): State<Arc<GatewayState>>,
) -> Json<CacheStatsResponse> {
    let settings = &state.config.cache;
    Json(CacheStatsResponse {
        success: true,
        cache: state.cache.stats(),
        config: CacheConfigView {
            cache_ttl: settings.ttl_secs,
            max_cache_keys: settings.max_keys,
            check_period: settings.check_period_secs,
        },
        timestamp: format_timestamp(Utc::now()),
    })
}

/// POST /clear-cache — キャッシュ削除。`pattern` 指定時は部分一致するキーのみ。
pub async fn handle_clear_cache(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<ClearCacheRequest>, JsonRejection>,
) -> Result<Json<ClearCacheResponse>, GatewayError> {
    let body = parse_body(body)?;
    let pattern = body.pattern.filter(|p| !p.is_empty());

    let cleared = state.cache.clear(pattern.as_deref()).await;
    tracing::info!(pattern = ?pattern, cleared, "キャッシュを削除");

    let response = match pattern {
        Some(pattern) => ClearCacheResponse {
            success: true,
            message: format!("Cleared {cleared} cache entries matching pattern: {pattern}"),
            cleared_keys: Some(cleared),
        },
        None => ClearCacheResponse {
            success: true,
            message: "All cache cleared".to_string(),
            cleared_keys: None,
        },
    };
    Ok(Json(response))
}
