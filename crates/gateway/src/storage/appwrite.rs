//! # Appwrite Storage 実装
//!
//! Appwrite REST API を使うストレージ実装。オブジェクトキーはAppwriteのファイルIDとして扱う。
//!
//! AppwriteのファイルビューURLはプロジェクトIDで参照するもので署名を持たない。
//! 有効期限はGateway側のキャッシュ管理上の値としてのみ意味を持つ。

use super::{not_found, ObjectStorage, ResponseOverrides, UploadOptions};
use crate::error::GatewayError;

/// Appwrite Storage によるストレージ実装。
pub struct AppwriteStorage {
    http_client: reqwest::Client,
    /// APIエンドポイント（例: `https://fra.cloud.appwrite.io/v1`）
    endpoint: String,
    project_id: String,
    api_key: String,
    bucket_id: String,
}

impl AppwriteStorage {
    pub fn new(
        http_client: reqwest::Client,
        endpoint: &str,
        project_id: &str,
        api_key: &str,
        bucket_id: &str,
    ) -> Self {
        Self {
            http_client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            api_key: api_key.to_string(),
            bucket_id: bucket_id.to_string(),
        }
    }

    /// 環境変数から構築する。
    pub fn from_env(http_client: reqwest::Client) -> anyhow::Result<Self> {
        let endpoint = std::env::var("APPWRITE_ENDPOINT")
            .unwrap_or_else(|_| "https://fra.cloud.appwrite.io/v1".to_string());
        let project_id = std::env::var("APPWRITE_PROJECT_ID")
            .map_err(|_| anyhow::anyhow!("APPWRITE_PROJECT_IDが設定されていません"))?;
        let api_key = std::env::var("APPWRITE_API_KEY")
            .map_err(|_| anyhow::anyhow!("APPWRITE_API_KEYが設定されていません"))?;
        let bucket_id = std::env::var("APPWRITE_BUCKET_ID")
            .map_err(|_| anyhow::anyhow!("APPWRITE_BUCKET_IDが設定されていません"))?;

        tracing::info!(endpoint = %endpoint, bucket = %bucket_id, "Appwriteストレージを設定");
        Ok(Self::new(
            http_client,
            &endpoint,
            &project_id,
            &api_key,
            &bucket_id,
        ))
    }

    fn file_url(&self, file_id: &str) -> String {
        format!(
            "{}/storage/buckets/{}/files/{}",
            self.endpoint, self.bucket_id, file_id
        )
    }
}

#[async_trait::async_trait]
impl ObjectStorage for AppwriteStorage {
    fn bucket(&self) -> &str {
        &self.bucket_id
    }

    async fn presign_get(
        &self,
        object_key: &str,
        _expiry_secs: u32,
        _overrides: &ResponseOverrides,
    ) -> Result<String, GatewayError> {
        Ok(format!(
            "{}/view?project={}",
            self.file_url(object_key),
            self.project_id
        ))
    }

    async fn presign_put(
        &self,
        _object_key: &str,
        _expiry_secs: u32,
        _upload: &UploadOptions,
    ) -> Result<String, GatewayError> {
        Err(GatewayError::storage(
            "Failed to generate signed URL",
            "Appwrite Storageは署名付きアップロードURLに対応していません",
        ))
    }

    async fn delete_object(&self, object_key: &str) -> Result<(), GatewayError> {
        let response = self
            .http_client
            .delete(self.file_url(object_key))
            .header("X-Appwrite-Project", &self.project_id)
            .header("X-Appwrite-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::storage("Failed to delete file", format!("HTTP送信失敗: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(not_found(object_key));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::storage(
                "Failed to delete file",
                format!("Appwriteがエラーを返しました: HTTP {status} - {body}"),
            ));
        }
        Ok(())
    }
}
