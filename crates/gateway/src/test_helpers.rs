//! # テスト用共通ヘルパー
//!
//! ストレージ・OTPプロバイダーのモックと、テスト用GatewayStateの構築。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};

use crate::batch::BatchIssuer;
use crate::cache::{CacheError, CacheTier, MemoryTier, UrlCache};
use crate::config::{
    BatchSettings, CacheSettings, Environment, GatewayConfig, GatewayState, OtpSettings,
    RateLimitSettings, StorageBackend,
};
use crate::error::GatewayError;
use crate::issuer::SignedUrlIssuer;
use crate::otp::{AuthService, OtpProvider, PhoneFormat, VerificationStore};
use crate::storage::{not_found, ObjectStorage, ResponseOverrides, UploadOptions};

pub const TEST_BUCKET: &str = "test-bucket";

/// 到達可否を切り替えられるリモート層の代役。操作は内部のメモリ層で成立する。
pub struct ToggleTier {
    pub inner: MemoryTier,
    up: AtomicBool,
}

impl ToggleTier {
    pub fn new() -> Self {
        Self {
            inner: MemoryTier::new(100),
            up: AtomicBool::new(true),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl CacheTier for ToggleTier {
    fn name(&self) -> &'static str {
        "toggle"
    }

    fn is_available(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }

    async fn clear(&self, pattern: Option<&str>) -> Result<usize, CacheError> {
        self.inner.clear(pattern).await
    }
}

/// テスト用のモックストレージ。
/// 署名は行わず、発行のたびに異なるダミーURLを返す。
#[derive(Default)]
pub struct MockStorage {
    objects: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    overrides: Mutex<Vec<ResponseOverrides>>,
    uploads: Mutex<Vec<UploadOptions>>,
    presign_gets: AtomicUsize,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 削除可能なオブジェクトを登録する。
    pub fn add_object(&self, key: &str) {
        self.objects.lock().unwrap().insert(key.to_string());
    }

    /// 指定キーの署名を失敗させる。
    pub fn fail_presign(&self, key: &str) {
        self.failing.lock().unwrap().insert(key.to_string());
    }

    pub fn presign_get_count(&self) -> usize {
        self.presign_gets.load(Ordering::SeqCst)
    }

    /// これまでの署名で渡されたレスポンス上書き（呼び出し順）。
    pub fn last_overrides(&self) -> Vec<ResponseOverrides> {
        self.overrides.lock().unwrap().clone()
    }

    /// これまでのPUT署名で渡されたアップロード条件（呼び出し順）。
    pub fn last_uploads(&self) -> Vec<UploadOptions> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MockStorage {
    fn bucket(&self) -> &str {
        TEST_BUCKET
    }

    async fn presign_get(
        &self,
        object_key: &str,
        expiry_secs: u32,
        overrides: &ResponseOverrides,
    ) -> Result<String, GatewayError> {
        if self.failing.lock().unwrap().contains(object_key) {
            return Err(GatewayError::storage(
                "Failed to generate signed URL",
                "mock signing failure",
            ));
        }
        let serial = self.presign_gets.fetch_add(1, Ordering::SeqCst);
        self.overrides.lock().unwrap().push(overrides.clone());
        Ok(format!(
            "https://mock-storage/{TEST_BUCKET}/{object_key}?expires={expiry_secs}&sig={serial}"
        ))
    }

    async fn presign_put(
        &self,
        object_key: &str,
        expiry_secs: u32,
        upload: &UploadOptions,
    ) -> Result<String, GatewayError> {
        if self.failing.lock().unwrap().contains(object_key) {
            return Err(GatewayError::storage(
                "Failed to generate signed URL",
                "mock signing failure",
            ));
        }
        self.uploads.lock().unwrap().push(upload.clone());
        Ok(format!(
            "https://mock-storage/{TEST_BUCKET}/{object_key}?expires={expiry_secs}&upload=1"
        ))
    }

    async fn delete_object(&self, object_key: &str) -> Result<(), GatewayError> {
        if self.objects.lock().unwrap().remove(object_key) {
            Ok(())
        } else {
            Err(not_found(object_key))
        }
    }
}

/// テスト用のモックOTPプロバイダー。送信したコードを記録する。
#[derive(Default)]
pub struct MockOtpProvider {
    sent: Mutex<HashMap<String, String>>,
    failure: Option<String>,
}

impl MockOtpProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 常に `message` で送信に失敗するプロバイダー。
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// 最後に送信したコード。
    pub fn last_code(&self, phone_number: &str) -> Option<String> {
        self.sent.lock().unwrap().get(phone_number).cloned()
    }
}

#[async_trait::async_trait]
impl OtpProvider for MockOtpProvider {
    async fn send_code(&self, phone_number: &str, code: &str) -> Result<(), GatewayError> {
        if let Some(message) = &self.failure {
            return Err(GatewayError::Otp {
                message: message.clone(),
                detail: Some("mock dispatch failure".to_string()),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .insert(phone_number.to_string(), code.to_string());
        Ok(())
    }
}

/// インメモリ層のみのキャッシュ。
pub fn test_cache() -> Arc<UrlCache> {
    Arc::new(UrlCache::new(Arc::new(MemoryTier::new(1000)), None))
}

/// 環境変数に依存しないテスト用設定。
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        port: 0,
        environment: Environment::Development,
        storage_backend: StorageBackend::R2,
        signed_url_expiry_secs: 7200,
        cache: CacheSettings {
            ttl_secs: 3600,
            max_keys: 1000,
            check_period_secs: 60,
            expiry_buffer_secs: 300,
            redis_url: None,
        },
        batch: BatchSettings {
            default_chunk_size: 15,
            max_files: 500,
            min_delay_ms: 50,
            max_delay_ms: 200,
            per_file_delay_ms: 10,
        },
        otp: OtpSettings {
            api_key: None,
            api_url: "http://127.0.0.1:1/api/sms".to_string(),
            code_ttl_secs: 600,
            country_code: "964".to_string(),
            national_digits: 10,
        },
        rate_limit: RateLimitSettings {
            enabled: true,
            send_limit: 5,
            verify_limit: 10,
            window_secs: 900,
            trust_proxy_headers: true,
        },
        cors_origin: "*".to_string(),
    }
}

/// モックを差し込んだGatewayStateを構築する。
pub fn test_state_with(
    config: GatewayConfig,
    storage: Arc<MockStorage>,
    otp_provider: Option<Arc<MockOtpProvider>>,
) -> Arc<GatewayState> {
    let cache = Arc::new(UrlCache::new(
        Arc::new(MemoryTier::new(config.cache.max_keys)),
        None,
    ));
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
    let auth = AuthService::new(
        Arc::new(VerificationStore::new(None)),
        otp_provider.map(|p| p as Arc<dyn OtpProvider>),
        PhoneFormat {
            country_code: config.otp.country_code.clone(),
            national_digits: config.otp.national_digits,
        },
    );
    Arc::new(GatewayState {
        config,
        cache,
        issuer,
        batch,
        auth,
    })
}

/// 既定設定のテスト用GatewayState。
pub fn test_state(storage: Arc<MockStorage>) -> Arc<GatewayState> {
    test_state_with(test_config(), storage, Some(Arc::new(MockOtpProvider::new())))
}
