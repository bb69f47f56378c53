//! # インメモリキャッシュ層
//!
//! エントリごとのTTLと最大件数を持つローカル層。
//! 上限に達した状態で新しいキーを入れる場合、期限切れを掃除した上で
//! なお満杯なら最も早く失効するエントリを追い出す。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use signurl_types::MemoryCacheStats;
use tokio::time::Instant;

use super::{CacheError, CacheTier};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// インメモリキャッシュ層。
pub struct MemoryTier {
    entries: DashMap<String, Entry>,
    max_keys: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryTier {
    pub fn new(max_keys: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_keys: max_keys.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 期限切れエントリを削除し、削除件数を返す。
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// 最も早く失効するエントリを1件追い出す。
    fn evict_soonest(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            tracing::debug!(key = %key, "容量上限のためキャッシュエントリを追い出し");
        }
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        MemoryCacheStats {
            keys: self.entries.len(),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// 一定間隔で期限切れエントリを掃除するタスクを起動する。
    /// 層が破棄されるとタスクも終了する。
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let tier: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(tier) = tier.upgrade() else {
                    break;
                };
                let purged = tier.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = tier.len(), "期限切れキャッシュを掃除");
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));

        match found {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Some(None) => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_keys {
            self.purge_expired();
            if self.entries.len() >= self.max_keys {
                self.evict_soonest();
            }
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn clear(&self, pattern: Option<&str>) -> Result<usize, CacheError> {
        let before = self.entries.len();
        match pattern {
            Some(pattern) => self.entries.retain(|key, _| !key.contains(pattern)),
            None => self.entries.clear(),
        }
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// TTL経過後は読めず、ミスとして数えられることを確認
    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let tier = MemoryTier::new(10);
        tier.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(tier.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(tier.get("k").await.unwrap(), None);
        assert!(tier.is_empty());

        let stats = tier.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    /// 満杯時は期限切れを先に掃除し、それでも満杯なら最も早く失効するものを追い出す
    #[tokio::test(start_paused = true)]
    async fn test_capacity_is_bounded() {
        let tier = MemoryTier::new(2);
        tier.set("short", "1", Duration::from_secs(10)).await.unwrap();
        tier.set("long", "2", Duration::from_secs(100)).await.unwrap();

        tier.set("new", "3", Duration::from_secs(50)).await.unwrap();
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get("short").await.unwrap(), None);
        assert!(tier.get("long").await.unwrap().is_some());

        // 既存キーの上書きは追い出しを起こさない
        tier.set("new", "4", Duration::from_secs(50)).await.unwrap();
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get("new").await.unwrap().as_deref(), Some("4"));

        tokio::time::advance(Duration::from_secs(60)).await;
        tier.set("other", "5", Duration::from_secs(10)).await.unwrap();
        assert_eq!(tier.len(), 2);
        assert!(tier.get("long").await.unwrap().is_some());
    }

    /// 掃除タスクが期限切れエントリを削除することを確認
    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_expired_entries() {
        let tier = Arc::new(MemoryTier::new(10));
        tier.set("k", "v", Duration::from_secs(5)).await.unwrap();
        let handle = tier.spawn_sweeper(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(tier.is_empty());

        drop(tier);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.is_finished());
    }
}
