//! # Signurl Gateway
//!
//! オブジェクトストレージ（Cloudflare R2 / Appwrite）の前段に置く署名付きURL発行サービス。
//!
//! ## 役割
//! - 署名付きダウンロードURL・アップロードURLの発行
//! - 発行済みURLの2層キャッシュ（Redis + インメモリ）
//! - 大量ファイルのバッチ発行
//! - ファイル削除とキャッシュ管理
//! - 電話番号のOTP認証（レート制限付き）
//!
//! エンドポイント一覧は `endpoints` を参照。

mod batch;
mod cache;
mod config;
mod endpoints;
mod error;
mod issuer;
mod otp;
mod ratelimit;
mod storage;

#[cfg(test)]
mod test_helpers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::batch::BatchIssuer;
use crate::cache::{CacheTier, MemoryTier, RedisTier, UrlCache};
use crate::config::{GatewayConfig, GatewayState, StorageBackend};
use crate::endpoints::{
    handle_auth_status, handle_batch_signed_urls, handle_cache_stats, handle_clear_cache,
    handle_delete_file, handle_health, handle_invalidate_cache, handle_ios_audio_url,
    handle_not_found, handle_send_otp, handle_signed_url, handle_upload_url, handle_verify_otp,
};
use crate::issuer::SignedUrlIssuer;
use crate::otp::AuthService;
use crate::ratelimit::{rate_limit_middleware, RateLimiters};
use crate::storage::ObjectStorage;

/// リクエストボディの上限
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// レート制限の古いキーを破棄する間隔
const RATE_LIMIT_PRUNE_PERIOD: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// ルーター
// ---------------------------------------------------------------------------

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    if origin == "*" {
        return layer.allow_origin(Any);
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(value),
        Err(e) => {
            tracing::warn!(origin = %origin, error = %e, "CORS_ORIGINが不正です。全オリジンを許可します");
            layer.allow_origin(Any)
        }
    }
}

/// Gatewayのルーターを構築する。OTPの送信・検証にはそれぞれのレート制限を掛ける。
fn build_router(state: Arc<GatewayState>, limiters: RateLimiters) -> Router {
    let send_otp = Router::new()
        .route("/auth/send-otp", post(handle_send_otp))
        .route_layer(axum::middleware::from_fn_with_state(
            limiters.send,
            rate_limit_middleware,
        ));
    let verify_otp = Router::new()
        .route("/auth/verify-otp", post(handle_verify_otp))
        .route_layer(axum::middleware::from_fn_with_state(
            limiters.verify,
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .route("/getSignedUrl", get(handle_signed_url))
        .route("/getIOSAudioUrl", get(handle_ios_audio_url))
        .route("/getBatchSignedUrls", post(handle_batch_signed_urls))
        .route("/getUploadUrl", post(handle_upload_url))
        .route("/deleteFile", delete(handle_delete_file))
        .route("/invalidate-cache", post(handle_invalidate_cache))
        .route("/cache-stats", get(handle_cache_stats))
        .route("/clear-cache", post(handle_clear_cache))
        .route("/auth/status", get(handle_auth_status))
        .merge(send_otp)
        .merge(verify_otp)
        .fallback(handle_not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(cors_layer(&state.config.cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// 起動処理
// ---------------------------------------------------------------------------

/// 設定されたバックエンドのストレージを構築する。
fn build_storage(
    backend: StorageBackend,
    http_client: reqwest::Client,
) -> anyhow::Result<Arc<dyn ObjectStorage>> {
    match backend {
        #[cfg(feature = "vendor-r2")]
        StorageBackend::R2 => Ok(Arc::new(storage::R2Storage::from_env()?)),
        #[cfg(feature = "vendor-appwrite")]
        StorageBackend::Appwrite => Ok(Arc::new(storage::AppwriteStorage::from_env(
            http_client,
        )?)),
        #[allow(unreachable_patterns)]
        other => {
            let _ = http_client;
            anyhow::bail!("ストレージバックエンド {other:?} はこのビルドで無効です")
        }
    }
}

/// Redisに接続できればリモート層として返す。失敗時はインメモリ層のみで動く。
async fn connect_remote_tier(redis_url: Option<&str>) -> Option<Arc<dyn CacheTier>> {
    let Some(url) = redis_url else {
        tracing::info!("REDIS_URLが未設定のため、インメモリキャッシュのみを使用します");
        return None;
    };
    match RedisTier::connect(url).await {
        Ok(tier) => {
            tracing::info!("Redisキャッシュに接続しました");
            Some(Arc::new(tier))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redisに接続できません。インメモリキャッシュのみを使用します");
            None
        }
    }
}

/// SIGINT / SIGTERM を待つ。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+Cハンドラの登録に失敗");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERMハンドラの登録に失敗");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("シャットダウンを開始します");
}

// ---------------------------------------------------------------------------
// エントリポイント
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!(".envの読み込みに失敗: {e}");
        }
    }
    tracing_subscriber::fmt::init();

    let config = GatewayConfig::from_env();
    let http_client = reqwest::Client::new();

    let storage = build_storage(config.storage_backend, http_client.clone())?;
    tracing::info!(backend = ?config.storage_backend, bucket = %storage.bucket(), "ストレージを初期化");

    // URLキャッシュ（Redis → インメモリ）
    let memory = Arc::new(MemoryTier::new(config.cache.max_keys));
    let remote = connect_remote_tier(config.cache.redis_url.as_deref()).await;
    let cache = Arc::new(UrlCache::new(memory.clone(), remote));
    let sweep_period = Duration::from_secs(config.cache.check_period_secs);
    memory.spawn_sweeper(sweep_period);

    let issuer = Arc::new(SignedUrlIssuer::new(
        storage,
        cache.clone(),
        config.issue_policy(),
    ));
    let batch = BatchIssuer::new(
        issuer.clone(),
        config.batch_pacing(),
        config.batch.default_chunk_size,
        config.batch.max_files,
    );

    let auth = AuthService::from_settings(&config.otp, http_client);
    auth.store().spawn_sweeper(sweep_period);

    let limiters = RateLimiters::from_settings(&config.rate_limit);
    limiters.spawn_pruner(RATE_LIMIT_PRUNE_PERIOD);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!(
        environment = ?config.environment,
        signed_url_expiry_secs = config.signed_url_expiry_secs,
        cache_ttl_secs = config.cache.ttl_secs,
        "Gatewayを {} で起動します",
        addr
    );

    let state = Arc::new(GatewayState {
        config,
        cache,
        issuer,
        batch,
        auth,
    });
    let app = build_router(state, limiters);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Gatewayを停止しました");
    Ok(())
}

// ---------------------------------------------------------------------------
// テスト
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_config, test_state, test_state_with, MockOtpProvider, MockStorage};
    use serde_json::json;

    /// ルーターをローカルポートで起動し、ベースURLを返す。
    async fn spawn_app(state: Arc<GatewayState>, limiters: RateLimiters) -> String {
        let app = build_router(state, limiters);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        format!("http://127.0.0.1:{port}")
    }

    fn no_limits() -> RateLimiters {
        let mut settings = test_config().rate_limit;
        settings.enabled = false;
        RateLimiters::from_settings(&settings)
    }

    /// 未定義パスはエンドポイント一覧付きの404になることを確認
    #[tokio::test]
    async fn test_unknown_path_lists_endpoints() {
        let base = spawn_app(test_state(Arc::new(MockStorage::new())), no_limits()).await;

        let response = reqwest::get(format!("{base}/nope")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Endpoint not found");
        let endpoints = body["availableEndpoints"].as_array().unwrap();
        assert!(endpoints.iter().any(|e| e == "GET /health"));
    }

    /// セキュリティヘッダーとCORSヘッダーが付与されることを確認
    #[tokio::test]
    async fn test_security_and_cors_headers() {
        let base = spawn_app(test_state(Arc::new(MockStorage::new())), no_limits()).await;

        let response = reqwest::Client::new()
            .get(format!("{base}/health"))
            .header("Origin", "https://app.example.com")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["access-control-allow-origin"], "*");
    }

    /// 署名付きURLをHTTP経由で2回取得すると、2回目はキャッシュから同じURLが返ることを確認
    #[tokio::test]
    async fn test_signed_url_over_http_uses_cache() {
        let storage = Arc::new(MockStorage::new());
        let base = spawn_app(test_state(storage.clone()), no_limits()).await;
        let url = format!("{base}/getSignedUrl?file=books/cover.png");

        let first: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        let second: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();

        assert_eq!(first["fromCache"], false);
        assert_eq!(second["fromCache"], true);
        assert_eq!(first["signedUrl"], second["signedUrl"]);
        assert_eq!(second["contentType"], "image/png");
        assert_eq!(second["cacheKey"], "r2:get:test-bucket:books/cover.png");
        assert_eq!(storage.presign_get_count(), 1);

        let missing = reqwest::get(format!("{base}/getSignedUrl")).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = missing.json().await.unwrap();
        assert_eq!(body["error"], "File parameter is required");
    }

    /// OTP送信は上限を超えると429とRetry-Afterを返し、他のルートには影響しないことを確認
    #[tokio::test]
    async fn test_send_otp_is_rate_limited() {
        let mut config = test_config();
        config.rate_limit.send_limit = 2;
        let limiters = RateLimiters::from_settings(&config.rate_limit);
        let state = test_state_with(
            config,
            Arc::new(MockStorage::new()),
            Some(Arc::new(MockOtpProvider::new())),
        );
        let base = spawn_app(state, limiters).await;
        let client = reqwest::Client::new();

        for _ in 0..2 {
            let response = client
                .post(format!("{base}/auth/send-otp"))
                .json(&json!({ "phoneNumber": "9647701234567" }))
                .send()
                .await
                .unwrap();
            assert!(response.status().is_success());
        }

        let response = client
            .post(format!("{base}/auth/send-otp"))
            .json(&json!({ "phoneNumber": "9647701234567" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Too many OTP requests, please try again later");

        // 検証側は別の制限
        let response = client
            .post(format!("{base}/auth/verify-otp"))
            .json(&json!({ "phoneNumber": "9647701234567", "verificationCode": "12" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    /// JSONでないボディは400になり、Content-Typeなしは必須項目エラーになることを確認
    #[tokio::test]
    async fn test_body_rejections_are_bad_requests() {
        let base = spawn_app(test_state(Arc::new(MockStorage::new())), no_limits()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/getUploadUrl"))
            .header("Content-Type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = client
            .delete(format!("{base}/deleteFile"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["message"], "File parameter is required");
    }
}
