//! # GET /health

use axum::Json;
use chrono::Utc;
use signurl_types::HealthResponse;

use crate::issuer::format_timestamp;

/// GET /health — ヘルスチェック。依存サービスには問い合わせない。
pub async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
        timestamp: format_timestamp(Utc::now()),
        service: "R2 Signed URL Service".to_string(),
        version: "1.0.0".to_string(),
    })
}
