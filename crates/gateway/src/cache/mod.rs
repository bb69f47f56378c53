//! # URLキャッシュ
//!
//! 署名付きURLレコードを優先順に並んだ複数の層に保存する。
//!
//! - リモート層（Redis、`REDIS_URL` 設定時のみ）
//! - ローカル層（インメモリ、常に有効）
//!
//! 読み取りは先頭の層から順に問い合わせて最初のヒットを返す。
//! 書き込みは到達可能な全層に行う。削除は古いURLが残らないよう、
//! 一時的に到達不能と判定された層にも必ず試みる。層のエラーはログに
//! 記録してその層のミスとして扱い、呼び出し元には返さない。

pub mod key;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use signurl_types::{CacheStats, MemoryCacheStats};

pub use key::{CacheKey, Operation};
pub use memory::MemoryTier;
pub use self::redis::RedisTier;

/// キャッシュ層のエラー。`UrlCache` の外には出ない。
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redisエラー: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("{0}")]
    Other(String),
}

/// キャッシュの1層。
#[async_trait::async_trait]
pub trait CacheTier: Send + Sync {
    /// ログ用の層名
    fn name(&self) -> &'static str;

    /// 現在問い合わせてよいか。
    fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// 複数キーの一括取得。結果は `keys` と同じ順序。
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// 複数エントリの一括保存。
    async fn set_many(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(key, value, ttl).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// `pattern` を含むキー（`None` なら全キー）を削除し、削除件数を返す。
    async fn clear(&self, pattern: Option<&str>) -> Result<usize, CacheError>;
}

/// 2層URLキャッシュ。
pub struct UrlCache {
    /// 優先順（リモート → ローカル）
    tiers: Vec<Arc<dyn CacheTier>>,
    memory: Arc<MemoryTier>,
    remote: Option<Arc<dyn CacheTier>>,
}

impl UrlCache {
    pub fn new(memory: Arc<MemoryTier>, remote: Option<Arc<dyn CacheTier>>) -> Self {
        let mut tiers: Vec<Arc<dyn CacheTier>> = Vec::new();
        if let Some(remote) = &remote {
            tiers.push(remote.clone());
        }
        tiers.push(memory.clone());
        Self {
            tiers,
            memory,
            remote,
        }
    }

    fn reachable(&self) -> impl Iterator<Item = &Arc<dyn CacheTier>> {
        self.tiers.iter().filter(|tier| tier.is_available())
    }

    /// 最初にヒットした層の値を返す。
    pub async fn get(&self, key: &CacheKey) -> Option<String> {
        for tier in self.reachable() {
            match tier.get(key.as_str()).await {
                Ok(Some(value)) => {
                    tracing::debug!(tier = tier.name(), key = %key, "キャッシュヒット");
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tier = tier.name(), key = %key, error = %e, "キャッシュ読み取りに失敗");
                }
            }
        }
        tracing::debug!(key = %key, "キャッシュミス");
        None
    }

    /// 到達可能な全層に書き込む。
    pub async fn set(&self, key: &CacheKey, value: &str, ttl: Duration) {
        for tier in self.reachable() {
            if let Err(e) = tier.set(key.as_str(), value, ttl).await {
                tracing::warn!(tier = tier.name(), key = %key, error = %e, "キャッシュ書き込みに失敗");
            }
        }
    }

    /// 複数キーを一括取得する。結果は `keys` と同じ順序。
    ///
    /// 層ごとに残ったミスだけを一括で問い合わせる。一括呼び出しが
    /// 失敗した層ではキー単位の呼び出しにフォールバックする。
    pub async fn get_batch(&self, keys: &[CacheKey]) -> Vec<Option<String>> {
        let mut values: Vec<Option<String>> = vec![None; keys.len()];

        for tier in self.reachable() {
            let pending: Vec<usize> = (0..keys.len()).filter(|&i| values[i].is_none()).collect();
            if pending.is_empty() {
                break;
            }
            let pending_keys: Vec<String> =
                pending.iter().map(|&i| keys[i].as_str().to_string()).collect();

            let found = match tier.get_many(&pending_keys).await {
                Ok(found) if found.len() == pending_keys.len() => found,
                Ok(found) => {
                    tracing::warn!(
                        tier = tier.name(),
                        expected = pending_keys.len(),
                        actual = found.len(),
                        "一括取得の件数が一致しないため個別取得に切り替え"
                    );
                    self.get_each(tier.as_ref(), &pending_keys).await
                }
                Err(e) => {
                    tracing::warn!(tier = tier.name(), error = %e, "一括取得に失敗したため個別取得に切り替え");
                    self.get_each(tier.as_ref(), &pending_keys).await
                }
            };

            for (index, value) in pending.into_iter().zip(found) {
                values[index] = value;
            }
        }
        values
    }

    async fn get_each(&self, tier: &dyn CacheTier, keys: &[String]) -> Vec<Option<String>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(tier.get(key).await.unwrap_or_else(|e| {
                tracing::warn!(tier = tier.name(), key = %key, error = %e, "キャッシュ読み取りに失敗");
                None
            }));
        }
        values
    }

    /// 複数エントリを到達可能な全層に一括で書き込む。
    pub async fn set_batch(&self, entries: &[(CacheKey, String)], ttl: Duration) {
        if entries.is_empty() {
            return;
        }
        let raw: Vec<(String, String)> = entries
            .iter()
            .map(|(key, value)| (key.as_str().to_string(), value.clone()))
            .collect();

        for tier in self.reachable() {
            if let Err(e) = tier.set_many(&raw, ttl).await {
                tracing::warn!(tier = tier.name(), error = %e, "一括書き込みに失敗したため個別書き込みに切り替え");
                for (key, value) in &raw {
                    if let Err(e) = tier.set(key, value, ttl).await {
                        tracing::warn!(tier = tier.name(), key = %key, error = %e, "キャッシュ書き込みに失敗");
                    }
                }
            }
        }
    }

    /// 全層からキーを削除する。冷却中の層にも試み、失敗はログのみ。
    pub async fn delete(&self, key: &CacheKey) {
        for tier in &self.tiers {
            if let Err(e) = tier.delete(key.as_str()).await {
                tracing::warn!(tier = tier.name(), key = %key, error = %e, "キャッシュ削除に失敗");
            }
        }
    }

    /// `pattern` を含むキー（`None` なら全キー）を全層から削除する。
    /// 戻り値はローカル層で削除した件数。
    pub async fn clear(&self, pattern: Option<&str>) -> usize {
        // 冷却中でも試みる（回復後に削除済みのキーが返らないように）
        if let Some(remote) = &self.remote {
            match remote.clear(pattern).await {
                Ok(count) => tracing::info!(tier = remote.name(), count, "リモートキャッシュを削除"),
                Err(e) => tracing::warn!(tier = remote.name(), error = %e, "リモートキャッシュの削除に失敗"),
            }
        }
        // ローカル層は常に成功する
        self.memory.clear(pattern).await.unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        let redis = match &self.remote {
            None => "disabled",
            Some(remote) if remote.is_available() => "connected",
            Some(_) => "disconnected",
        };
        CacheStats {
            memory: self.memory_stats(),
            redis: redis.to_string(),
        }
    }

    fn memory_stats(&self) -> MemoryCacheStats {
        self.memory.stats()
    }
}
