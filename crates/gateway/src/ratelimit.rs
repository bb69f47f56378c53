//! # OTPエンドポイントのレート制限
//!
//! クライアントアドレスごとのトークンバケット（governor）。
//! 送信と検証で別々の制限を持つ。
//!
//! `X-Forwarded-For` は `TRUST_PROXY_HEADERS` が有効な場合のみ信頼する。
//! それ以外は接続元アドレス（`ConnectInfo`）を使う。

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::config::RateLimitSettings;
use crate::error::GatewayError;

struct LimiterInner {
    limiter: DefaultKeyedRateLimiter<String>,
    /// 拒否時のメッセージ
    message: &'static str,
    trust_proxy_headers: bool,
}

/// 1種類のエンドポイント用のレート制限。無効化されている場合は常に通す。
#[derive(Clone)]
pub struct OtpRateLimiter {
    inner: Option<Arc<LimiterInner>>,
}

impl OtpRateLimiter {
    /// `window` あたり `limit` 回まで許可する。
    pub fn new(limit: u32, window: Duration, message: &'static str, trust_proxy_headers: bool) -> Self {
        let burst = NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            inner: Some(Arc::new(LimiterInner {
                limiter: RateLimiter::keyed(quota),
                message,
                trust_proxy_headers,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// `client` の1リクエストを消費する。超過時は再試行までの秒数を含むエラーを返す。
    pub fn check(&self, client: &str) -> Result<(), (GatewayError, u64)> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        inner.limiter.check_key(&client.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            (
                GatewayError::RateLimited(inner.message.to_string()),
                wait.as_secs() + 1,
            )
        })
    }

    /// 上限まで回復したキーを破棄する。
    pub fn prune(&self) {
        if let Some(inner) = &self.inner {
            inner.limiter.retain_recent();
            inner.limiter.shrink_to_fit();
        }
    }

    fn client_key(&self, req: &Request<Body>) -> String {
        let trust_proxy_headers = self
            .inner
            .as_ref()
            .is_some_and(|inner| inner.trust_proxy_headers);
        if trust_proxy_headers {
            if let Some(forwarded) = forwarded_ip(req) {
                return forwarded;
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// `X-Forwarded-For` の先頭（元のクライアント）を取り出す。
fn forwarded_ip(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// OTP送信・検証のレート制限一式。
#[derive(Clone)]
pub struct RateLimiters {
    pub send: OtpRateLimiter,
    pub verify: OtpRateLimiter,
}

impl RateLimiters {
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        if !settings.enabled {
            tracing::warn!("OTPエンドポイントのレート制限は無効です");
            return Self {
                send: OtpRateLimiter::disabled(),
                verify: OtpRateLimiter::disabled(),
            };
        }
        let window = Duration::from_secs(settings.window_secs);
        Self {
            send: OtpRateLimiter::new(
                settings.send_limit,
                window,
                "Too many OTP requests, please try again later",
                settings.trust_proxy_headers,
            ),
            verify: OtpRateLimiter::new(
                settings.verify_limit,
                window,
                "Too many verification attempts, please try again later",
                settings.trust_proxy_headers,
            ),
        }
    }

    /// 一定間隔で古いキーを破棄するタスクを起動する。
    pub fn spawn_pruner(&self, period: Duration) -> Option<tokio::task::JoinHandle<()>> {
        if !self.send.is_enabled() && !self.verify.is_enabled() {
            return None;
        }
        let limiters = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                limiters.send.prune();
                limiters.verify.prune();
            }
        }))
    }
}

/// ルートに適用するレート制限ミドルウェア。
pub async fn rate_limit_middleware(
    State(limiter): State<OtpRateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(req).await;
    }
    let client = limiter.client_key(&req);
    match limiter.check(&client) {
        Ok(()) => next.run(req).await,
        Err((err, retry_after_secs)) => {
            tracing::warn!(client = %client, path = %req.uri().path(), "レート制限超過");
            (
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                err,
            )
                .into_response()
        }
    }
}
