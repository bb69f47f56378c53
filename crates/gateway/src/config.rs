//! # Gateway設定・共有状態
//!
//! 環境変数からの設定読み込みとGatewayの共有状態の定義。
//! `.env` ファイルがあれば起動時に `dotenvy` で読み込まれる。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::{BatchIssuer, BatchPacing};
use crate::cache::UrlCache;
use crate::issuer::{IssuePolicy, SignedUrlIssuer};
use crate::otp::AuthService;

/// 実行環境。`NODE_ENV` で指定する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// ストレージバックエンドの種別。`STORAGE_BACKEND` で指定する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Cloudflare R2（S3互換署名）
    R2,
    /// Appwrite Storage
    Appwrite,
}

/// URLキャッシュの設定。
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// キャッシュエントリのTTL（秒）
    pub ttl_secs: u64,
    /// インメモリ層の最大エントリ数
    pub max_keys: usize,
    /// 期限切れエントリの掃除間隔（秒）
    pub check_period_secs: u64,
    /// 期限切れ間近と見なす残り時間（秒）
    pub expiry_buffer_secs: u64,
    /// 設定されていればRedisをリモート層として使う
    pub redis_url: Option<String>,
}

/// バッチ発行の設定。
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub default_chunk_size: usize,
    pub max_files: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub per_file_delay_ms: u64,
}

/// OTP認証の設定。
#[derive(Debug, Clone)]
pub struct OtpSettings {
    /// OTPIQ APIキー。未設定ならOTP送信は常に失敗する。
    pub api_key: Option<String>,
    pub api_url: String,
    /// 発行済みコードの有効期間（秒）。0なら失効しない。
    pub code_ttl_secs: u64,
    /// 電話番号の国番号プレフィックス
    pub country_code: String,
    /// 国番号に続く桁数
    pub national_digits: usize,
}

/// OTPエンドポイントのレート制限設定。
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// ウィンドウあたりのOTP送信回数
    pub send_limit: u32,
    /// ウィンドウあたりのOTP検証回数
    pub verify_limit: u32,
    pub window_secs: u64,
    /// `X-Forwarded-For` をクライアントアドレスとして信頼するか
    pub trust_proxy_headers: bool,
}

/// Gateway全体の設定。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub environment: Environment,
    pub storage_backend: StorageBackend,
    /// 署名付きURLの有効期間（秒）
    pub signed_url_expiry_secs: u32,
    pub cache: CacheSettings,
    pub batch: BatchSettings,
    pub otp: OtpSettings,
    pub rate_limit: RateLimitSettings,
    pub cors_origin: String,
}

/// 環境変数を読み、未設定・パース不能・0の場合はデフォルト値を使う。
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + PartialEq + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v != T::default())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl GatewayConfig {
    /// 環境変数から構築する。
    pub fn from_env() -> Self {
        let environment = match std::env::var("NODE_ENV").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };
        let storage_backend = match std::env::var("STORAGE_BACKEND")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "appwrite" => StorageBackend::Appwrite,
            _ => StorageBackend::R2,
        };

        Self {
            port: env_or("PORT", 3000),
            environment,
            storage_backend,
            signed_url_expiry_secs: env_or("SIGNED_URL_EXPIRY_SECONDS", 7200),
            cache: CacheSettings {
                ttl_secs: env_or("CACHE_TTL_SECONDS", 3600),
                max_keys: env_or("MAX_CACHE_KEYS", 5000),
                check_period_secs: env_or("CACHE_CHECK_PERIOD", 60),
                expiry_buffer_secs: env_or("CACHE_EXPIRY_BUFFER_SECONDS", 300),
                redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            },
            batch: BatchSettings {
                default_chunk_size: env_or("BATCH_SIZE", 15),
                max_files: env_or("MAX_BATCH_FILES", 500),
                min_delay_ms: env_or("BATCH_DELAY_MS", 50),
                max_delay_ms: env_or("BATCH_MAX_DELAY_MS", 200),
                per_file_delay_ms: env_or("BATCH_DELAY_PER_FILE_MS", 10),
            },
            otp: OtpSettings {
                api_key: std::env::var("OTPIQ_API_KEY").ok().filter(|v| !v.is_empty()),
                api_url: std::env::var("OTPIQ_API_URL")
                    .unwrap_or_else(|_| "https://api.otpiq.com/api/sms".to_string()),
                // 0は「失効しない」を意味するため env_or を使わない
                code_ttl_secs: std::env::var("OTP_CODE_TTL_SECONDS")
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(600),
                country_code: std::env::var("PHONE_COUNTRY_CODE")
                    .unwrap_or_else(|_| "964".to_string()),
                national_digits: env_or("PHONE_NATIONAL_DIGITS", 10),
            },
            rate_limit: RateLimitSettings {
                enabled: env_flag("RATE_LIMIT_ENABLED", true),
                send_limit: env_or("OTP_SEND_LIMIT", 5),
                verify_limit: env_or("OTP_VERIFY_LIMIT", 10),
                window_secs: env_or("OTP_RATE_WINDOW_SECONDS", 15 * 60),
                trust_proxy_headers: env_flag("TRUST_PROXY_HEADERS", false),
            },
            cors_origin: std::env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".to_string()),
        }
    }

    /// 署名付きURL発行ポリシー。
    pub fn issue_policy(&self) -> IssuePolicy {
        IssuePolicy {
            signed_url_expiry_secs: self.signed_url_expiry_secs,
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            expiry_buffer: Duration::from_secs(self.cache.expiry_buffer_secs),
        }
    }

    /// バッチのチャンク間待機ポリシー。
    pub fn batch_pacing(&self) -> BatchPacing {
        BatchPacing {
            min_delay: Duration::from_millis(self.batch.min_delay_ms),
            max_delay: Duration::from_millis(self.batch.max_delay_ms),
            per_file_delay: Duration::from_millis(self.batch.per_file_delay_ms),
        }
    }
}

/// Gatewayの共有状態。
pub struct GatewayState {
    pub config: GatewayConfig,
    /// 2層URLキャッシュ（統計・全削除用）
    pub cache: Arc<UrlCache>,
    /// 署名付きURL発行
    pub issuer: Arc<SignedUrlIssuer>,
    /// バッチ発行
    pub batch: BatchIssuer,
    /// OTP認証
    pub auth: AuthService,
}

impl GatewayState {
    pub fn is_production(&self) -> bool {
        self.config.environment.is_production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 未設定・不正値・0はデフォルト値になることを確認
    #[test]
    fn test_env_or_falls_back() {
        std::env::set_var("SIGNURL_TEST_ENV_OR_BAD", "abc");
        std::env::set_var("SIGNURL_TEST_ENV_OR_ZERO", "0");
        std::env::set_var("SIGNURL_TEST_ENV_OR_OK", " 42 ");

        assert_eq!(env_or("SIGNURL_TEST_ENV_OR_MISSING", 7u64), 7);
        assert_eq!(env_or("SIGNURL_TEST_ENV_OR_BAD", 7u64), 7);
        assert_eq!(env_or("SIGNURL_TEST_ENV_OR_ZERO", 7u64), 7);
        assert_eq!(env_or("SIGNURL_TEST_ENV_OR_OK", 7u64), 42);
    }

    /// フラグ値の解釈を確認
    #[test]
    fn test_env_flag() {
        std::env::set_var("SIGNURL_TEST_FLAG_ON", "TRUE");
        std::env::set_var("SIGNURL_TEST_FLAG_OFF", "false");

        assert!(env_flag("SIGNURL_TEST_FLAG_ON", false));
        assert!(!env_flag("SIGNURL_TEST_FLAG_OFF", true));
        assert!(env_flag("SIGNURL_TEST_FLAG_MISSING", true));
    }

    /// バッチ待機ポリシーがミリ秒設定から構築されることを確認
    #[test]
    fn test_batch_pacing_from_settings() {
        let mut config = GatewayConfig::from_env();
        config.batch.min_delay_ms = 50;
        config.batch.max_delay_ms = 200;
        config.batch.per_file_delay_ms = 10;

        let pacing = config.batch_pacing();
        assert_eq!(pacing.min_delay, Duration::from_millis(50));
        assert_eq!(pacing.max_delay, Duration::from_millis(200));
        assert_eq!(pacing.per_file_delay, Duration::from_millis(10));
    }
}
