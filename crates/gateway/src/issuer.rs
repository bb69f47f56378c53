//! # 署名付きURL発行
//!
//! キャッシュを確認し、有効期限まで十分な余裕がある署名付きURLはそのまま返す。
//! それ以外はストレージに新しいURLを発行させてキャッシュに保存する。
//!
//! アップロードURL（PUT）はキャッシュしない。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use signurl_types::SignedUrlResponse;

use crate::cache::{CacheKey, Operation, UrlCache};
use crate::error::GatewayError;
use crate::storage::{ObjectStorage, ResponseOverrides, UploadOptions};

/// 音声ファイルに付与するキャッシュ制御
const AUDIO_CACHE_CONTROL: &str = "public, max-age=31536000";

/// iOS向けURLを発行できる拡張子
const IOS_AUDIO_EXTENSIONS: [&str; 4] = [".mp3", ".m4a", ".aac", ".wav"];

/// 時刻をミリ秒精度のISO 8601（UTC、末尾`Z`）で表す。
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// 発行ポリシー。
#[derive(Debug, Clone, Copy)]
pub struct IssuePolicy {
    /// 署名付きURLの有効期間（秒）
    pub signed_url_expiry_secs: u32,
    /// キャッシュエントリのTTL
    pub cache_ttl: Duration,
    /// 残り有効期間がこれ以下のキャッシュは使わない
    pub expiry_buffer: Duration,
}

/// キャッシュに保存する署名付きURLレコード。保存後は変更しない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlRecord {
    #[serde(rename = "signedUrl")]
    pub url: String,
    #[serde(rename = "file")]
    pub file_path: String,
    pub content_type: String,
    pub expires_in: u64,
    #[serde(with = "iso_millis")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "fromCache", default)]
    pub issued_from_cache: bool,
}

impl From<SignedUrlRecord> for SignedUrlResponse {
    fn from(record: SignedUrlRecord) -> Self {
        SignedUrlResponse {
            success: true,
            signed_url: record.url,
            file: record.file_path,
            content_type: record.content_type,
            expires_in: record.expires_in,
            expires_at: format_timestamp(record.expires_at),
            from_cache: record.issued_from_cache,
            cache_key: None,
        }
    }
}

/// 発行結果とそのキャッシュキー。
#[derive(Debug, Clone)]
pub struct IssuedUrl {
    pub record: SignedUrlRecord,
    pub cache_key: CacheKey,
}

impl IssuedUrl {
    /// 単体発行のレスポンス。キャッシュヒット時のみキャッシュキーを含める。
    pub fn into_response(self) -> SignedUrlResponse {
        let cache_key = self
            .record
            .issued_from_cache
            .then(|| self.cache_key.to_string());
        SignedUrlResponse {
            cache_key,
            ..SignedUrlResponse::from(self.record)
        }
    }
}

/// アップロードURLの発行結果。
#[derive(Debug, Clone)]
pub struct UploadGrant {
    pub url: String,
    pub file_path: String,
    pub content_type: String,
    pub metadata: Option<BTreeMap<String, String>>,
    pub expires_in: u64,
    pub expires_at: DateTime<Utc>,
}

/// ファイルパスを検証・正規化する。
///
/// 空白のみは拒否し、`..` を残らなくなるまで取り除いてから前後の空白を削る。
pub fn sanitize_file_path(raw: &str) -> Result<String, GatewayError> {
    if raw.trim().is_empty() {
        return Err(GatewayError::BadRequest("Invalid file parameter".to_string()));
    }
    let mut path = raw.to_string();
    while path.contains("..") {
        path = path.replace("..", "");
    }
    let path = path.trim();
    if path.is_empty() {
        return Err(GatewayError::BadRequest("Invalid file parameter".to_string()));
    }
    Ok(path.to_string())
}

/// 拡張子（小文字化）からMIMEタイプを決める。
pub fn content_type_for(file_path: &str) -> &'static str {
    let extension = file_path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

fn is_audio(content_type: &str) -> bool {
    content_type.starts_with("audio/")
}

fn download_overrides(content_type: &str) -> ResponseOverrides {
    ResponseOverrides {
        content_type: content_type.to_string(),
        content_disposition: "inline".to_string(),
        cache_control: is_audio(content_type).then(|| AUDIO_CACHE_CONTROL.to_string()),
    }
}

/// iOS向け音声URLでクライアントが期待してよいレスポンスヘッダー。
pub fn ios_audio_headers(content_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("Content-Type".to_string(), content_type.to_string()),
        ("Content-Disposition".to_string(), "inline".to_string()),
        ("Cache-Control".to_string(), AUDIO_CACHE_CONTROL.to_string()),
        ("Accept-Ranges".to_string(), "bytes".to_string()),
    ])
}

/// 音声アップロードに付与するメタデータ。音声以外は `None`。
fn upload_metadata(content_type: &str) -> Option<BTreeMap<String, String>> {
    if !is_audio(content_type) {
        return None;
    }
    let mut metadata = BTreeMap::from([
        ("Content-Disposition".to_string(), "inline".to_string()),
        ("Cache-Control".to_string(), AUDIO_CACHE_CONTROL.to_string()),
    ]);
    if matches!(content_type, "audio/mpeg" | "audio/mp4" | "audio/aac") {
        metadata.insert("Content-Type".to_string(), content_type.to_string());
    }
    Some(metadata)
}

/// キャッシュ値の判定結果。
enum Cached {
    Fresh(SignedUrlRecord),
    /// 期限切れ間近、または読めない値
    Stale,
    Missing,
}

/// 署名付きURL発行サービス。
pub struct SignedUrlIssuer {
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<UrlCache>,
    policy: IssuePolicy,
}

impl SignedUrlIssuer {
    pub fn new(storage: Arc<dyn ObjectStorage>, cache: Arc<UrlCache>, policy: IssuePolicy) -> Self {
        Self {
            storage,
            cache,
            policy,
        }
    }

    fn key(&self, operation: Operation, file_path: &str) -> CacheKey {
        CacheKey::new(self.storage.bucket(), operation, file_path)
    }

    fn classify(&self, raw: Option<String>) -> Cached {
        let Some(raw) = raw else {
            return Cached::Missing;
        };
        let record = match serde_json::from_str::<SignedUrlRecord>(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "キャッシュ値を解釈できないため破棄");
                return Cached::Stale;
            }
        };
        let fresh = record
            .expires_at
            .signed_duration_since(Utc::now())
            .to_std()
            .map(|remaining| remaining > self.policy.expiry_buffer)
            .unwrap_or(false);
        if fresh {
            Cached::Fresh(SignedUrlRecord {
                issued_from_cache: true,
                ..record
            })
        } else {
            Cached::Stale
        }
    }

    async fn mint(
        &self,
        file_path: &str,
        content_type: &str,
        overrides: &ResponseOverrides,
    ) -> Result<SignedUrlRecord, GatewayError> {
        let expiry = self.policy.signed_url_expiry_secs;
        tracing::info!(file = %file_path, "署名付きURLを新規発行");
        let url = self.storage.presign_get(file_path, expiry, overrides).await?;
        Ok(SignedUrlRecord {
            url,
            file_path: file_path.to_string(),
            content_type: content_type.to_string(),
            expires_in: u64::from(expiry),
            expires_at: Utc::now() + chrono::Duration::seconds(i64::from(expiry)),
            issued_from_cache: false,
        })
    }

    async fn issue_cached(
        &self,
        file_path: &str,
        operation: Operation,
        content_type: &str,
        overrides: &ResponseOverrides,
    ) -> Result<IssuedUrl, GatewayError> {
        let cache_key = self.key(operation, file_path);

        match self.classify(self.cache.get(&cache_key).await) {
            Cached::Fresh(record) => {
                tracing::debug!(file = %file_path, "キャッシュ済みの署名付きURLを返却");
                return Ok(IssuedUrl { record, cache_key });
            }
            Cached::Stale => {
                tracing::debug!(file = %file_path, "キャッシュ済みURLが期限切れ間近のため破棄");
                self.cache.delete(&cache_key).await;
            }
            Cached::Missing => {}
        }

        let record = self.mint(file_path, content_type, overrides).await?;
        match serde_json::to_string(&record) {
            Ok(value) => self.cache.set(&cache_key, &value, self.policy.cache_ttl).await,
            Err(e) => tracing::warn!(error = %e, "レコードのシリアライズに失敗"),
        }
        Ok(IssuedUrl { record, cache_key })
    }

    /// 署名付きダウンロードURLを発行する。
    pub async fn issue(&self, raw_file: &str) -> Result<IssuedUrl, GatewayError> {
        let file_path = sanitize_file_path(raw_file)?;
        let content_type = content_type_for(&file_path);
        self.issue_cached(
            &file_path,
            Operation::Get,
            content_type,
            &download_overrides(content_type),
        )
        .await
    }

    /// iOS (AVPlayer) 向けの音声URLを発行する。音声拡張子以外は拒否する。
    pub async fn issue_ios_audio(&self, raw_file: &str) -> Result<IssuedUrl, GatewayError> {
        let file_path = sanitize_file_path(raw_file)?;
        let lower = file_path.to_ascii_lowercase();
        if !IOS_AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            return Err(GatewayError::BadRequest(
                "File must be an audio file (.mp3, .m4a, .aac, .wav)".to_string(),
            ));
        }
        let content_type = content_type_for(&file_path);
        let overrides = ResponseOverrides {
            content_type: content_type.to_string(),
            content_disposition: "inline".to_string(),
            cache_control: Some(AUDIO_CACHE_CONTROL.to_string()),
        };
        self.issue_cached(&file_path, Operation::IosAudio, content_type, &overrides)
            .await
            .map_err(|e| match e {
                GatewayError::NotFound { file, .. } => GatewayError::NotFound {
                    message: "Audio file not found".to_string(),
                    file,
                },
                other => other,
            })
    }

    /// 署名付きアップロードURLを発行する。キャッシュは使わない。
    pub async fn issue_upload(
        &self,
        raw_file: &str,
        content_type: Option<&str>,
    ) -> Result<UploadGrant, GatewayError> {
        let file_path = sanitize_file_path(raw_file)?;
        let content_type = content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or("application/octet-stream")
            .to_string();
        let expiry = self.policy.signed_url_expiry_secs;
        let upload = UploadOptions {
            metadata: upload_metadata(&content_type),
            content_type,
        };

        let url = self.storage.presign_put(&file_path, expiry, &upload).await?;
        tracing::info!(file = %file_path, content_type = %upload.content_type, "アップロードURLを発行");

        let UploadOptions {
            content_type,
            metadata,
        } = upload;
        Ok(UploadGrant {
            url,
            metadata,
            file_path,
            content_type,
            expires_in: u64::from(expiry),
            expires_at: Utc::now() + chrono::Duration::seconds(i64::from(expiry)),
        })
    }

    /// オブジェクトを削除し、関連するキャッシュを無効化する。
    /// 戻り値は正規化済みのファイルパス。
    pub async fn delete(&self, raw_file: &str) -> Result<String, GatewayError> {
        let file_path = sanitize_file_path(raw_file)?;
        tracing::info!(file = %file_path, bucket = %self.storage.bucket(), "ファイルを削除");
        self.storage.delete_object(&file_path).await?;

        for operation in [Operation::Get, Operation::IosAudio] {
            self.cache.delete(&self.key(operation, &file_path)).await;
        }
        Ok(file_path)
    }

    /// ダウンロードURLのキャッシュを無効化する。
    pub async fn invalidate(&self, raw_file: &str) -> Result<(String, CacheKey), GatewayError> {
        let file_path = sanitize_file_path(raw_file)?;
        let cache_key = self.key(Operation::Get, &file_path);
        self.cache.delete(&cache_key).await;
        tracing::info!(key = %cache_key, "キャッシュを無効化");
        Ok((file_path, cache_key))
    }

    /// 複数ファイルをまとめて発行する。結果は入力と同じ順序。
    ///
    /// キャッシュの読み書きは一括で行い、ミスしたファイルだけ並行して発行する。
    pub async fn issue_chunk(&self, raw_files: &[String]) -> Vec<Result<IssuedUrl, GatewayError>> {
        let mut outcomes: Vec<Option<Result<IssuedUrl, GatewayError>>> =
            (0..raw_files.len()).map(|_| None).collect();

        // (入力位置, 正規化済みパス, キャッシュキー)
        let mut valid: Vec<(usize, String, CacheKey)> = Vec::new();
        for (index, raw) in raw_files.iter().enumerate() {
            match sanitize_file_path(raw) {
                Ok(file_path) => {
                    let key = self.key(Operation::Get, &file_path);
                    valid.push((index, file_path, key));
                }
                Err(e) => outcomes[index] = Some(Err(e)),
            }
        }

        let keys: Vec<CacheKey> = valid.iter().map(|(_, _, key)| key.clone()).collect();
        let cached = self.cache.get_batch(&keys).await;

        let mut stale: Vec<CacheKey> = Vec::new();
        let mut to_mint: Vec<(usize, String, CacheKey)> = Vec::new();
        for ((index, file_path, key), raw) in valid.into_iter().zip(cached) {
            match self.classify(raw) {
                Cached::Fresh(record) => {
                    outcomes[index] = Some(Ok(IssuedUrl {
                        record,
                        cache_key: key,
                    }));
                }
                Cached::Stale => {
                    stale.push(key.clone());
                    to_mint.push((index, file_path, key));
                }
                Cached::Missing => to_mint.push((index, file_path, key)),
            }
        }

        join_all(stale.iter().map(|key| self.cache.delete(key))).await;

        let minted = join_all(to_mint.iter().map(|(_, file_path, _)| {
            let content_type = content_type_for(file_path);
            async move {
                self.mint(file_path, content_type, &download_overrides(content_type))
                    .await
            }
        }))
        .await;

        let mut fresh_entries: Vec<(CacheKey, String)> = Vec::new();
        for ((index, _, key), result) in to_mint.into_iter().zip(minted) {
            if let Ok(record) = &result {
                match serde_json::to_string(record) {
                    Ok(value) => fresh_entries.push((key.clone(), value)),
                    Err(e) => tracing::warn!(error = %e, "レコードのシリアライズに失敗"),
                }
            }
            outcomes[index] = Some(result.map(|record| IssuedUrl {
                record,
                cache_key: key,
            }));
        }
        self.cache
            .set_batch(&fresh_entries, self.policy.cache_ttl)
            .await;

        outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| {
                    Err(GatewayError::Internal("発行結果が欠落しました".to_string()))
                })
            })
            .collect()
    }
}
