//! # 認証コードストア
//!
//! 電話番号ごとに最新の認証コードを1件だけ保持する。
//! 有効期間を過ぎたコードは存在しないものとして扱う。

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

struct VerificationEntry {
    code: String,
    issued_at: Instant,
}

/// 検証結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// 一致したためコードを消費した
    Verified,
    /// 不一致。保存済みコードはそのまま
    Mismatch,
    /// コードが無い、または失効していた
    Missing,
}

/// 認証コードストア。
pub struct VerificationStore {
    entries: DashMap<String, VerificationEntry>,
    /// `None` なら失効しない
    ttl: Option<Duration>,
}

impl VerificationStore {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn is_expired(&self, entry: &VerificationEntry) -> bool {
        self.ttl
            .is_some_and(|ttl| entry.issued_at.elapsed() >= ttl)
    }

    /// コードを保存する。既存のコードは上書きされる。
    pub fn put(&self, phone_number: &str, code: &str) {
        self.entries.insert(
            phone_number.to_string(),
            VerificationEntry {
                code: code.to_string(),
                issued_at: Instant::now(),
            },
        );
    }

    /// 保存済みコードが `code` のときだけ削除する。
    /// 送信失敗時の取り消しで、後から保存された別のコードを消さないために使う。
    pub fn remove_if_code(&self, phone_number: &str, code: &str) -> bool {
        self.entries
            .remove_if(phone_number, |_, entry| entry.code == code)
            .is_some()
    }

    /// コードを検証する。一致した場合のみ消費する。
    pub fn verify(&self, phone_number: &str, code: &str) -> VerifyOutcome {
        match self.entries.entry(phone_number.to_string()) {
            Entry::Vacant(_) => VerifyOutcome::Missing,
            Entry::Occupied(occupied) => {
                if self.is_expired(occupied.get()) {
                    occupied.remove();
                    VerifyOutcome::Missing
                } else if occupied.get().code == code {
                    occupied.remove();
                    VerifyOutcome::Verified
                } else {
                    VerifyOutcome::Mismatch
                }
            }
        }
    }

    /// 失効したコードを削除し、削除件数を返す。
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| !self.is_expired(entry));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 一定間隔で失効したコードを掃除するタスクを起動する。
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "失効した認証コードを掃除");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHONE: &str = "9647701234567";

    /// 一致したコードは1回だけ検証でき、2回目は Missing になることを確認
    #[test]
    fn test_code_is_consumed_once() {
        let store = VerificationStore::new(None);
        store.put(PHONE, "123456");

        assert_eq!(store.verify(PHONE, "123456"), VerifyOutcome::Verified);
        assert_eq!(store.verify(PHONE, "123456"), VerifyOutcome::Missing);
    }

    /// 不一致では保存済みコードが変わらないことを確認
    #[test]
    fn test_mismatch_keeps_code() {
        let store = VerificationStore::new(None);
        store.put(PHONE, "123456");

        assert_eq!(store.verify(PHONE, "654321"), VerifyOutcome::Mismatch);
        assert_eq!(store.verify(PHONE, "123456"), VerifyOutcome::Verified);
    }

    /// 再送で上書きされ、古いコードは使えないことを確認
    #[test]
    fn test_second_send_overwrites() {
        let store = VerificationStore::new(None);
        store.put(PHONE, "111111");
        store.put(PHONE, "222222");

        assert!(!store.remove_if_code(PHONE, "111111"));
        assert_eq!(store.verify(PHONE, "111111"), VerifyOutcome::Mismatch);
        assert_eq!(store.verify(PHONE, "222222"), VerifyOutcome::Verified);
    }

    /// 有効期間を過ぎたコードは Missing になり、掃除で削除されることを確認
    #[tokio::test(start_paused = true)]
    async fn test_expired_code_is_missing() {
        let store = VerificationStore::new(Some(Duration::from_secs(600)));
        store.put(PHONE, "123456");
        store.put("9647700000000", "999999");

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(store.verify(PHONE, "123456"), VerifyOutcome::Missing);
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }
}
