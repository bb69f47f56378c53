//! # オブジェクトストレージ
//!
//! 署名付きURLを発行するストレージバックエンドの抽象インターフェース。
//! バックエンド実装は feature で選択する。
//!
//! - `r2`: Cloudflare R2（S3互換署名、`vendor-r2`）
//! - `appwrite`: Appwrite Storage（`vendor-appwrite`）

#[cfg(feature = "vendor-r2")]
pub mod r2;

#[cfg(feature = "vendor-appwrite")]
pub mod appwrite;

#[cfg(feature = "vendor-r2")]
pub use r2::R2Storage;

#[cfg(feature = "vendor-appwrite")]
pub use appwrite::AppwriteStorage;

use std::collections::BTreeMap;

use crate::error::GatewayError;

/// 署名付きGET URLに埋め込むレスポンスヘッダーの上書き指定。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseOverrides {
    pub content_type: String,
    pub content_disposition: String,
    pub cache_control: Option<String>,
}

/// 署名付きPUT URLに含めるアップロード条件。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_type: String,
    /// オブジェクトに付与するユーザーメタデータ（`x-amz-meta-*`）
    pub metadata: Option<BTreeMap<String, String>>,
}

/// オブジェクトストレージの抽象インターフェース。
///
/// 実装は1つのバケットに束縛される。NoSuchKey相当の応答は
/// `GatewayError::NotFound` として返さなければならない。
#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// 束縛されたバケット名（キャッシュキーに使う）
    fn bucket(&self) -> &str;

    /// 署名付きダウンロードURL（GET）を生成する。
    async fn presign_get(
        &self,
        object_key: &str,
        expiry_secs: u32,
        overrides: &ResponseOverrides,
    ) -> Result<String, GatewayError>;

    /// 署名付きアップロードURL（PUT）を生成する。
    async fn presign_put(
        &self,
        object_key: &str,
        expiry_secs: u32,
        upload: &UploadOptions,
    ) -> Result<String, GatewayError>;

    /// オブジェクトを削除する。
    async fn delete_object(&self, object_key: &str) -> Result<(), GatewayError>;
}

/// 削除対象が存在しない場合のエラー。
pub(crate) fn not_found(object_key: &str) -> GatewayError {
    GatewayError::NotFound {
        message: "File not found".to_string(),
        file: object_key.to_string(),
    }
}
