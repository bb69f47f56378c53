//! # Gatewayエンドポイント
//!
//! - `GET /getSignedUrl`, `GET /getIOSAudioUrl` — 署名付きURL発行
//! - `POST /getBatchSignedUrls` — バッチ発行
//! - `POST /getUploadUrl` — アップロードURL発行
//! - `DELETE /deleteFile` — ファイル削除
//! - `POST /invalidate-cache`, `GET /cache-stats`, `POST /clear-cache` — キャッシュ管理
//! - `GET /health` — ヘルスチェック
//! - `POST /auth/send-otp`, `POST /auth/verify-otp`, `GET /auth/status` — OTP認証

pub mod auth;
pub mod batch;
pub mod cache;
pub mod delete_file;
pub mod health;
pub mod ios_audio;
pub mod signed_url;
pub mod upload_url;


pub use auth::{handle_auth_status, handle_send_otp, handle_verify_otp};
pub use batch::handle_batch_signed_urls;
pub use cache::{handle_cache_stats, handle_clear_cache, handle_invalidate_cache};
pub use delete_file::handle_delete_file;
pub use health::handle_health;
pub use ios_audio::handle_ios_audio_url;
pub use signed_url::handle_signed_url;
pub use upload_url::handle_upload_url;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;
use signurl_types::EndpointNotFoundResponse;

use crate::error::GatewayError;

/// 公開しているエンドポイントの一覧（404応答に含める）。
pub const AVAILABLE_ENDPOINTS: &[&str] = &[
    "GET /health",
    "GET /getSignedUrl?file=<filename>",
    "GET /getIOSAudioUrl?file=<filename>",
    "POST /getBatchSignedUrls",
    "POST /getUploadUrl",
    "DELETE /deleteFile",
    "POST /invalidate-cache",
    "GET /cache-stats",
    "POST /clear-cache",
    "POST /auth/send-otp",
    "POST /auth/verify-otp",
    "GET /auth/status",
];

/// JSONボディを取り出す。
///
/// `Content-Type` がない・ボディが空の場合は空のリクエストとして扱い、
/// 各エンドポイントの必須項目チェックに任せる。
pub(crate) fn parse_body<T: Default>(
    body: Result<Json<T>, JsonRejection>,
) -> Result<T, GatewayError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(rejection) => Err(GatewayError::BadRequest(rejection.body_text())),
    }
}

/// 未定義パスへのフォールバック。
pub async fn handle_not_found() -> (StatusCode, Json<EndpointNotFoundResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(EndpointNotFoundResponse {
            success: false,
            error: "Endpoint not found".to_string(),
            available_endpoints: AVAILABLE_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
        }),
    )
}
