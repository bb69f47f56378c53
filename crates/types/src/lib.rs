//! # Signurl Gateway 共有型定義
//!
//! GatewayのHTTPインターフェースで送受信するリクエスト・レスポンスの
//! データ構造をRust構造体として提供する。
//!
//! ## エンコーディング規則
//! - JSONフィールド名: camelCase（既存のモバイルクライアントとの互換性のため）
//! - 時刻: ISO 8601 / UTC（ミリ秒精度、末尾`Z`）

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// 署名付きURL発行
// ---------------------------------------------------------------------------

/// `GET /getSignedUrl` / `GET /getIOSAudioUrl` のクエリ。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileQuery {
    /// バケット内のオブジェクトキー（例: `books/cover.jpg`）
    pub file: Option<String>,
}

/// 署名付きダウンロードURLのレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlResponse {
    pub success: bool,
    /// 署名付きURL
    pub signed_url: String,
    /// サニタイズ済みのオブジェクトキー
    pub file: String,
    /// 拡張子から導出したMIMEタイプ
    pub content_type: String,
    /// URLの有効期間（秒）
    pub expires_in: u64,
    /// URLの有効期限（ISO 8601）
    pub expires_at: String,
    /// キャッシュから返却されたか
    pub from_cache: bool,
    /// キャッシュヒット時のみ付与されるキャッシュキー
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

/// iOS (AVPlayer) 向け音声URLのレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IosAudioUrlResponse {
    #[serde(flatten)]
    pub url: SignedUrlResponse,
    /// 常に `"ios-optimized"`
    pub platform: String,
    /// クライアントが期待してよいレスポンスヘッダー
    pub headers: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// バッチ発行
// ---------------------------------------------------------------------------

/// `POST /getBatchSignedUrls` のリクエスト。
///
/// `files` の要素は文字列以外も受け付け、要素単位のエラーとして報告する。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSignedUrlRequest {
    pub files: Option<Vec<serde_json::Value>>,
    /// チャンクサイズ（省略時はサーバー設定値）
    pub batch_size: Option<usize>,
}

/// バッチ内で失敗した1ファイル分の結果。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemError {
    pub file: String,
    pub error: String,
    pub success: bool,
}

/// バッチ処理の性能指標。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPerformance {
    pub total_time_ms: u64,
    pub avg_time_per_file_ms: f64,
    pub throughput_files_per_second: f64,
}

/// バッチ処理の集計。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub cached: usize,
    pub fresh: usize,
    /// 処理したチャンク数
    pub chunks: usize,
    pub performance: BatchPerformance,
}

/// `POST /getBatchSignedUrls` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSignedUrlResponse {
    pub success: bool,
    pub results: Vec<SignedUrlResponse>,
    pub errors: Vec<BatchItemError>,
    pub stats: BatchStats,
    pub processed_at: String,
}

// ---------------------------------------------------------------------------
// アップロード・削除
// ---------------------------------------------------------------------------

/// `POST /getUploadUrl` のリクエスト。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    pub file: Option<String>,
    /// 省略時は `application/octet-stream`
    pub content_type: Option<String>,
}

/// `POST /getUploadUrl` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    pub success: bool,
    /// 署名付きアップロードURL（PUT）
    pub signed_url: String,
    pub file: String,
    pub content_type: String,
    /// 音声ファイルの場合のみ付与されるメタデータ
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    pub expires_in: u64,
    pub expires_at: String,
}

/// ファイル単位の操作（削除・キャッシュ無効化）のリクエスト。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRequest {
    pub file: Option<String>,
}

/// `DELETE /deleteFile` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFileResponse {
    pub success: bool,
    pub message: String,
    pub file: String,
    pub deleted_at: String,
    pub cache_invalidated: bool,
}

// ---------------------------------------------------------------------------
// キャッシュ管理
// ---------------------------------------------------------------------------

/// `POST /invalidate-cache` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateCacheResponse {
    pub success: bool,
    pub message: String,
    pub file: String,
    pub cache_key: String,
    pub invalidated_at: String,
}

/// インメモリ層の統計。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCacheStats {
    pub keys: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// キャッシュ全体の統計。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory: MemoryCacheStats,
    /// リモート層の状態（`connected` / `disconnected` / `disabled`）
    pub redis: String,
}

/// `GET /cache-stats` に含めるキャッシュ設定。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfigView {
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: u64,
    pub max_cache_keys: usize,
    pub check_period: u64,
}

/// `GET /cache-stats` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    pub success: bool,
    pub cache: CacheStats,
    pub config: CacheConfigView,
    pub timestamp: String,
}

/// `POST /clear-cache` のリクエスト。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearCacheRequest {
    /// キーに含まれる部分文字列。省略時は全削除。
    pub pattern: Option<String>,
}

/// `POST /clear-cache` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared_keys: Option<usize>,
}

// ---------------------------------------------------------------------------
// ヘルスチェック
// ---------------------------------------------------------------------------

/// `GET /health` のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub service: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// OTP認証
// ---------------------------------------------------------------------------

/// `POST /auth/send-otp` のリクエスト。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOtpRequest {
    pub phone_number: Option<String>,
}

/// `POST /auth/verify-otp` のリクエスト。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpRequest {
    pub phone_number: Option<String>,
    pub verification_code: Option<String>,
}

/// OTP送信成功時の`data`。コード自体は含めない。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOtpData {
    pub phone_number: String,
}

/// OTP検証成功時の`data`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpData {
    pub phone_number: String,
    pub verified_at: String,
}

/// 認証系エンドポイント共通のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

// ---------------------------------------------------------------------------
// エラー
// ---------------------------------------------------------------------------

/// 全エンドポイント共通のエラーレスポンス。
///
/// 本番環境ではプロバイダー由来の詳細を`message`に含めない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// 未定義パスへのリクエストに対するレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointNotFoundResponse {
    pub success: bool,
    pub error: String,
    pub available_endpoints: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 署名付きURLレスポンスがcamelCaseで出力され、cacheKeyが省略されることを確認
    #[test]
    fn test_signed_url_response_wire_names() {
        let response = SignedUrlResponse {
            success: true,
            signed_url: "https://example.com/a.mp3?sig=x".to_string(),
            file: "books/a.mp3".to_string(),
            content_type: "audio/mpeg".to_string(),
            expires_in: 7200,
            expires_at: "2025-01-01T00:00:00.000Z".to_string(),
            from_cache: false,
            cache_key: None,
        };
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["signedUrl"], "https://example.com/a.mp3?sig=x");
        assert_eq!(value["contentType"], "audio/mpeg");
        assert_eq!(value["expiresIn"], 7200);
        assert_eq!(value["fromCache"], false);
        assert!(value.get("cacheKey").is_none());
    }

    /// iOS音声レスポンスがSignedUrlResponseのフィールドを平坦化して持つことを確認
    #[test]
    fn test_ios_audio_response_is_flattened() {
        let mut headers = BTreeMap::new();
        headers.insert("Accept-Ranges".to_string(), "bytes".to_string());
        let response = IosAudioUrlResponse {
            url: SignedUrlResponse {
                success: true,
                signed_url: "https://example.com/a.m4a".to_string(),
                file: "a.m4a".to_string(),
                content_type: "audio/mp4".to_string(),
                expires_in: 60,
                expires_at: "2025-01-01T00:00:00.000Z".to_string(),
                from_cache: true,
                cache_key: Some("r2:ios-audio:bucket:a.m4a".to_string()),
            },
            platform: "ios-optimized".to_string(),
            headers,
        };
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["signedUrl"], "https://example.com/a.m4a");
        assert_eq!(value["platform"], "ios-optimized");
        assert_eq!(value["headers"]["Accept-Ranges"], "bytes");
        assert_eq!(value["cacheKey"], "r2:ios-audio:bucket:a.m4a");
    }

    /// キャッシュ設定のTTLフィールドが`cacheTTL`で出力されることを確認
    #[test]
    fn test_cache_config_view_ttl_name() {
        let view = CacheConfigView {
            cache_ttl: 3600,
            max_cache_keys: 5000,
            check_period: 60,
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["cacheTTL"], 3600);
        assert_eq!(value["maxCacheKeys"], 5000);
        assert_eq!(value["checkPeriod"], 60);
    }

    /// バッチリクエストが文字列以外の要素も受け付けることを確認
    #[test]
    fn test_batch_request_accepts_mixed_files() {
        let request: BatchSignedUrlRequest =
            serde_json::from_str(r#"{"files": ["a.jpg", 42], "batchSize": 5}"#).unwrap();
        let files = request.files.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[1].is_number());
        assert_eq!(request.batch_size, Some(5));
    }
}
