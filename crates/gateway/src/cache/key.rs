//! # キャッシュキー
//!
//! `(bucket, operation, file)` から決定的にキャッシュキーを導出する。
//! 形式は `r2:{operation}:{bucket}:{file}`。

use std::fmt;

/// キャッシュ対象の発行操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// 通常の署名付きダウンロードURL
    Get,
    /// iOS (AVPlayer) 向け音声URL
    IosAudio,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::IosAudio => "ios-audio",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URLキャッシュのキー。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// 全キャッシュキーの共通プレフィックス
    pub const PREFIX: &'static str = "r2:";

    pub fn new(bucket: &str, operation: Operation, file: &str) -> Self {
        // バケット名の `:` をエスケープして区切り位置を一意にする。
        // ファイルパスは末尾フィールドなのでそのまま連結してよい。
        let bucket = bucket.replace('%', "%25").replace(':', "%3A");
        Self(format!("{}{}:{}:{}", Self::PREFIX, operation, bucket, file))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
