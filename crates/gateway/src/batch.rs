//! # バッチ発行
//!
//! ファイル一覧を連続するチャンクに分割し、チャンク内は並行、チャンク間は
//! 待機を挟んで逐次に発行する。1ファイルの失敗はバッチ全体を中断しない。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use signurl_types::{
    BatchItemError, BatchPerformance, BatchSignedUrlResponse, BatchStats, SignedUrlResponse,
};
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::issuer::{format_timestamp, SignedUrlIssuer};

/// チャンク間の待機時間の決め方。
#[derive(Debug, Clone, Copy)]
pub struct BatchPacing {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub per_file_delay: Duration,
}

impl BatchPacing {
    /// `max(min_delay, min(max_delay, chunk_size × per_file_delay))`
    pub fn delay_for(&self, chunk_size: usize) -> Duration {
        let files = u32::try_from(chunk_size).unwrap_or(u32::MAX);
        let scaled = self.per_file_delay.saturating_mul(files);
        self.min_delay.max(self.max_delay.min(scaled))
    }
}

/// バッチ入力の1要素。
struct BatchItem {
    /// エラー報告に使う元の値
    label: String,
    /// 文字列でない要素は空文字列として扱い、入力エラーにする
    raw: String,
}

impl From<&serde_json::Value> for BatchItem {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => BatchItem {
                label: s.clone(),
                raw: s.clone(),
            },
            other => BatchItem {
                label: other.to_string(),
                raw: String::new(),
            },
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// バッチ発行サービス。
pub struct BatchIssuer {
    issuer: Arc<SignedUrlIssuer>,
    pacing: BatchPacing,
    default_chunk_size: usize,
    max_files: usize,
}

impl BatchIssuer {
    pub fn new(
        issuer: Arc<SignedUrlIssuer>,
        pacing: BatchPacing,
        default_chunk_size: usize,
        max_files: usize,
    ) -> Self {
        Self {
            issuer,
            pacing,
            default_chunk_size,
            max_files,
        }
    }

    /// ファイル一覧の署名付きURLをまとめて発行する。
    pub async fn issue_batch(
        &self,
        files: Option<Vec<serde_json::Value>>,
        chunk_size: Option<usize>,
    ) -> Result<BatchSignedUrlResponse, GatewayError> {
        let files = files.unwrap_or_default();
        if files.is_empty() {
            return Err(GatewayError::BadRequest("Files array is required".to_string()));
        }
        if files.len() > self.max_files {
            return Err(GatewayError::BadRequest(format!(
                "Maximum {} files per batch request. For larger batches, split into multiple requests.",
                self.max_files
            )));
        }
        let chunk_size = chunk_size.unwrap_or(self.default_chunk_size);
        if chunk_size == 0 {
            return Err(GatewayError::BadRequest(
                "batchSize must be a positive integer".to_string(),
            ));
        }

        let items: Vec<BatchItem> = files.iter().map(BatchItem::from).collect();
        let chunk_count = items.len().div_ceil(chunk_size);
        let batch_id = uuid::Uuid::new_v4();
        let delay = self.pacing.delay_for(chunk_size);
        tracing::info!(%batch_id, files = items.len(), chunk_size, chunks = chunk_count, "バッチ発行を開始");

        let started = Instant::now();
        let mut results: Vec<SignedUrlResponse> = Vec::new();
        let mut errors: Vec<BatchItemError> = Vec::new();

        for (index, chunk) in items.chunks(chunk_size).enumerate() {
            tracing::debug!(%batch_id, chunk = index + 1, of = chunk_count, "チャンクを処理");
            let raws: Vec<String> = chunk.iter().map(|item| item.raw.clone()).collect();
            let outcomes = self.issuer.issue_chunk(&raws).await;

            for (item, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(issued) => results.push(issued.record.into()),
                    Err(e) => {
                        tracing::warn!(%batch_id, file = %item.label, error = %e, "バッチ内の発行に失敗");
                        errors.push(BatchItemError {
                            file: item.label.clone(),
                            error: e.to_string(),
                            success: false,
                        });
                    }
                }
            }

            if index + 1 < chunk_count {
                tokio::time::sleep(delay).await;
            }
        }

        let elapsed = started.elapsed();
        let total = items.len();
        let cached = results.iter().filter(|r| r.from_cache).count();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let throughput = if elapsed.is_zero() {
            0.0
        } else {
            total as f64 / elapsed.as_secs_f64()
        };

        tracing::info!(
            %batch_id,
            successful = results.len(),
            failed = errors.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "バッチ発行が完了"
        );

        Ok(BatchSignedUrlResponse {
            success: true,
            stats: BatchStats {
                total,
                successful: results.len(),
                failed: errors.len(),
                cached,
                fresh: results.len() - cached,
                chunks: chunk_count,
                performance: BatchPerformance {
                    total_time_ms: elapsed.as_millis() as u64,
                    avg_time_per_file_ms: round2(elapsed_ms / total as f64),
                    throughput_files_per_second: round2(throughput),
                },
            },
            results,
            errors,
            processed_at: format_timestamp(Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::IssuePolicy;
    use crate::test_helpers::{test_cache, MockStorage};
    use serde_json::json;

    fn pacing() -> BatchPacing {
        BatchPacing {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            per_file_delay: Duration::from_millis(10),
        }
    }

    fn batch_issuer(storage: Arc<MockStorage>) -> BatchIssuer {
        let issuer = SignedUrlIssuer::new(
            storage,
            test_cache(),
            IssuePolicy {
                signed_url_expiry_secs: 7200,
                cache_ttl: Duration::from_secs(3600),
                expiry_buffer: Duration::from_secs(300),
            },
        );
        BatchIssuer::new(Arc::new(issuer), pacing(), 15, 500)
    }

    fn files(n: usize) -> Option<Vec<serde_json::Value>> {
        Some((0..n).map(|i| json!(format!("covers/{i}.jpg"))).collect())
    }

    #[test]
    fn test_delay_for_is_clamped() {
        let pacing = pacing();
        assert_eq!(pacing.delay_for(1), Duration::from_millis(50));
        assert_eq!(pacing.delay_for(15), Duration::from_millis(150));
        assert_eq!(pacing.delay_for(100), Duration::from_millis(200));
    }

    /// N件をチャンクcで処理すると ceil(N/c)-1 回だけ待機し、N件の結果を返すことを確認
    #[tokio::test(start_paused = true)]
    async fn test_chunks_are_paced() {
        let storage = Arc::new(MockStorage::new());
        let batch = batch_issuer(storage.clone());

        let response = batch.issue_batch(files(7), Some(3)).await.unwrap();

        assert_eq!(response.stats.chunks, 3);
        assert_eq!(response.stats.total, 7);
        assert_eq!(response.results.len() + response.errors.len(), 7);
        // 2回 × max(50ms, min(200ms, 3 × 10ms))
        assert_eq!(response.stats.performance.total_time_ms, 100);
        assert_eq!(storage.presign_get_count(), 7);

        // 1チャンクに収まる場合は待機しない
        let response = batch.issue_batch(files(3), Some(15)).await.unwrap();
        assert_eq!(response.stats.chunks, 1);
        assert_eq!(response.stats.performance.total_time_ms, 0);
        assert_eq!(response.stats.cached, 3);
        assert_eq!(response.stats.fresh, 0);
    }

    /// 文字列以外・空文字列・署名失敗は要素単位のエラーになり、他の要素は成功することを確認
    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_abort_batch() {
        let storage = Arc::new(MockStorage::new());
        storage.fail_presign("broken.jpg");
        let batch = batch_issuer(storage);

        let response = batch
            .issue_batch(
                Some(vec![
                    json!("a.jpg"),
                    json!(42),
                    json!("   "),
                    json!("broken.jpg"),
                    json!("b.mp3"),
                ]),
                Some(2),
            )
            .await
            .unwrap();

        assert_eq!(response.stats.successful, 2);
        assert_eq!(response.stats.failed, 3);
        let failed: Vec<&str> = response.errors.iter().map(|e| e.file.as_str()).collect();
        assert_eq!(failed, vec!["42", "   ", "broken.jpg"]);
        assert!(response.errors.iter().all(|e| !e.success));
        assert_eq!(response.errors[0].error, "Invalid file parameter");
        assert_eq!(response.results[1].content_type, "audio/mpeg");
    }

    /// 空・上限超過・チャンクサイズ0は拒否されることを確認
    #[tokio::test(start_paused = true)]
    async fn test_batch_limits() {
        let batch = batch_issuer(Arc::new(MockStorage::new()));

        let rejected = [
            (None, None),
            (Some(vec![]), None),
            (files(501), None),
            (files(3), Some(0)),
        ];
        for (input, chunk) in rejected {
            let err = batch.issue_batch(input, chunk).await.unwrap_err();
            assert!(matches!(err, GatewayError::BadRequest(_)));
        }
        assert!(batch.issue_batch(files(500), None).await.is_ok());
    }
}
