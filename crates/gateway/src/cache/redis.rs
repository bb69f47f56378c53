//! # Redisキャッシュ層
//!
//! `REDIS_URL` が設定されている場合のリモート層。一括操作はパイプラインで送る。
//! 失敗後は一定時間この層を到達不能と見なし、その後に再試行する。

use std::sync::Mutex;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::RedisResult;
use tokio::time::Instant;

use super::key::CacheKey;
use super::{CacheError, CacheTier};

/// 失敗後に再試行するまでの既定の待機時間
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// 直近の失敗時刻から到達可否を判定する。
#[derive(Debug)]
struct Availability {
    down_since: Mutex<Option<Instant>>,
    retry_after: Duration,
}

impl Availability {
    fn new(retry_after: Duration) -> Self {
        Self {
            down_since: Mutex::new(None),
            retry_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.down_since.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_available(&self) -> bool {
        match *self.lock() {
            None => true,
            Some(since) => since.elapsed() >= self.retry_after,
        }
    }

    fn mark_up(&self) {
        let mut down_since = self.lock();
        if down_since.take().is_some() {
            tracing::info!("Redisへの接続が回復");
        }
    }

    fn mark_down(&self) {
        let mut down_since = self.lock();
        if down_since.is_none() {
            tracing::warn!(retry_after_secs = self.retry_after.as_secs(), "Redisを一時的に到達不能として扱う");
        }
        *down_since = Some(Instant::now());
    }
}

/// Redisキャッシュ層。
pub struct RedisTier {
    conn: ConnectionManager,
    availability: Availability,
}

impl RedisTier {
    /// 接続してRedis層を構築する。
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            availability: Availability::new(DEFAULT_RETRY_AFTER),
        })
    }

    fn track<T>(&self, result: RedisResult<T>) -> Result<T, CacheError> {
        match result {
            Ok(value) => {
                self.availability.mark_up();
                Ok(value)
            }
            Err(e) => {
                self.availability.mark_down();
                Err(e.into())
            }
        }
    }

    async fn matching_keys(&self, pattern: Option<&str>) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("KEYS")
            .arg(key_glob(pattern))
            .query_async(&mut conn)
            .await;
        self.track(result)
    }
}

/// 削除対象キーのglobパターン。対象は常に本サービスのキーに限る。
fn key_glob(pattern: Option<&str>) -> String {
    match pattern {
        Some(pattern) => format!("{}*{}*", CacheKey::PREFIX, escape_glob(pattern)),
        None => format!("{}*", CacheKey::PREFIX),
    }
}

fn escape_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait::async_trait]
impl CacheTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("GET").arg(key).query_async(&mut conn).await;
        self.track(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        self.track(result)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let result = redis::cmd("MGET").arg(keys).query_async(&mut conn).await;
        self.track(result)
    }

    async fn set_many(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .ignore();
        }
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = pipe.query_async(&mut conn).await;
        self.track(result)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<i64> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        self.track(result).map(|_| ())
    }

    async fn clear(&self, pattern: Option<&str>) -> Result<usize, CacheError> {
        let keys = self.matching_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let result: RedisResult<i64> = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await;
        self.track(result).map(|deleted| deleted.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 削除パターンが本サービスのキーに限定され、glob記号がエスケープされることを確認
    #[test]
    fn test_key_glob() {
        assert_eq!(key_glob(None), "r2:*");
        assert_eq!(key_glob(Some("books/")), "r2:*books/*");
        assert_eq!(key_glob(Some("a*b?[c]")), "r2:*a\\*b\\?\\[c\\]*");
    }

    /// 失敗後は待機時間が過ぎるまで到達不能、成功で即座に回復することを確認
    #[tokio::test(start_paused = true)]
    async fn test_availability_cooldown() {
        let availability = Availability::new(Duration::from_secs(30));
        assert!(availability.is_available());

        availability.mark_down();
        assert!(!availability.is_available());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!availability.is_available());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(availability.is_available());

        availability.mark_down();
        availability.mark_up();
        assert!(availability.is_available());
    }
}
