//! # Cloudflare R2 ストレージ実装
//!
//! S3互換APIの署名（SigV4、region `auto`）で署名付きURLを発行する。
//! 署名付きURLの生成はローカル計算のみで、R2への通信は削除時だけ発生する。

use std::collections::HashMap;

use super::{not_found, ObjectStorage, ResponseOverrides, UploadOptions};
use crate::error::GatewayError;

/// Cloudflare R2 によるストレージ実装。
pub struct R2Storage {
    bucket: s3::Bucket,
    bucket_name: String,
}

impl R2Storage {
    /// アカウントIDと認証情報からR2バケットを構築する。
    pub fn new(
        account_id: &str,
        access_key: &str,
        secret_key: &str,
        bucket_name: &str,
    ) -> anyhow::Result<Self> {
        let region = s3::Region::R2 {
            account_id: account_id.to_string(),
        };

        let credentials = s3::creds::Credentials::new(
            Some(access_key),
            Some(secret_key),
            None,
            None,
            None,
        )?;

        let bucket = s3::Bucket::new(bucket_name, region, credentials)?.with_path_style();

        Ok(Self {
            bucket: *bucket,
            bucket_name: bucket_name.to_string(),
        })
    }

    /// 環境変数から構築する。
    pub fn from_env() -> anyhow::Result<Self> {
        let account_id = std::env::var("R2_ACCOUNT_ID")
            .map_err(|_| anyhow::anyhow!("R2_ACCOUNT_IDが設定されていません"))?;
        let access_key = std::env::var("R2_ACCESS_KEY")
            .map_err(|_| anyhow::anyhow!("R2_ACCESS_KEYが設定されていません"))?;
        let secret_key = std::env::var("R2_SECRET_KEY")
            .map_err(|_| anyhow::anyhow!("R2_SECRET_KEYが設定されていません"))?;
        let bucket_name = std::env::var("R2_BUCKET")
            .map_err(|_| anyhow::anyhow!("R2_BUCKETが設定されていません"))?;

        tracing::info!(bucket = %bucket_name, "R2ストレージを設定");
        Self::new(&account_id, &access_key, &secret_key, &bucket_name)
    }
}

/// レスポンスヘッダー上書きをS3のクエリパラメータに変換する。
fn override_queries(overrides: &ResponseOverrides) -> HashMap<String, String> {
    let mut queries = HashMap::new();
    queries.insert(
        "response-content-type".to_string(),
        overrides.content_type.clone(),
    );
    queries.insert(
        "response-content-disposition".to_string(),
        overrides.content_disposition.clone(),
    );
    if let Some(cache_control) = &overrides.cache_control {
        queries.insert("response-cache-control".to_string(), cache_control.clone());
    }
    queries
}

/// アップロード時のユーザーメタデータを `x-amz-meta-*` クエリに変換する。
/// クエリは署名対象に含まれるため、アップロードされたオブジェクトに必ず付与される。
fn metadata_queries(upload: &UploadOptions) -> Option<HashMap<String, String>> {
    let metadata = upload.metadata.as_ref()?;
    Some(
        metadata
            .iter()
            .map(|(key, value)| {
                (
                    format!("x-amz-meta-{}", key.to_ascii_lowercase()),
                    value.clone(),
                )
            })
            .collect(),
    )
}

#[async_trait::async_trait]
impl ObjectStorage for R2Storage {
    fn bucket(&self) -> &str {
        &self.bucket_name
    }

    async fn presign_get(
        &self,
        object_key: &str,
        expiry_secs: u32,
        overrides: &ResponseOverrides,
    ) -> Result<String, GatewayError> {
        self.bucket
            .presign_get(object_key, expiry_secs, Some(override_queries(overrides)))
            .await
            .map_err(|e| GatewayError::storage("Failed to generate signed URL", e))
    }

    /// Content-Typeは署名に含めず、アップロード時のリクエストヘッダーで指定させる。
    async fn presign_put(
        &self,
        object_key: &str,
        expiry_secs: u32,
        upload: &UploadOptions,
    ) -> Result<String, GatewayError> {
        self.bucket
            .presign_put(object_key, expiry_secs, None, metadata_queries(upload))
            .await
            .map_err(|e| GatewayError::storage("Failed to generate signed URL", e))
    }

    async fn delete_object(&self, object_key: &str) -> Result<(), GatewayError> {
        // R2のDeleteObjectは存在しないキーでも204を返すため、先にHEADで存在確認する
        match self.bucket.head_object(object_key).await {
            Ok((_, 404)) | Err(s3::error::S3Error::HttpFailWithBody(404, _)) => {
                return Err(not_found(object_key));
            }
            Ok(_) => {}
            Err(e) => return Err(GatewayError::storage("Failed to delete file", e)),
        }

        let response = self
            .bucket
            .delete_object(object_key)
            .await
            .map_err(|e| GatewayError::storage("Failed to delete file", e))?;

        match response.status_code() {
            404 => Err(not_found(object_key)),
            code if (200..300).contains(&code) => Ok(()),
            code => Err(GatewayError::storage(
                "Failed to delete file",
                format!("R2がエラーを返しました: HTTP {code}"),
            )),
        }
    }
}
