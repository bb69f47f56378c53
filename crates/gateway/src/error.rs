//! # Gateway エラー型
//!
//! 全エンドポイントで共通のエラー型。
//! キャッシュ層のエラー（`cache::CacheError`）はここに現れない。
//! キャッシュ障害は常にログに記録した上でミス扱いに縮退する。

use axum::http::StatusCode;
use axum::Json;
use signurl_types::ErrorResponse;

/// Gatewayエラー型。
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// 不正なリクエスト（入力の欠落・形式不正）。副作用の前に検出する。
    #[error("{0}")]
    BadRequest(String),
    /// ストレージにオブジェクトが存在しない
    #[error("{message}")]
    NotFound { message: String, file: String },
    /// ストレージ（署名・削除）操作に失敗
    #[error("{message}")]
    Storage {
        message: String,
        detail: Option<String>,
    },
    /// OTPプロバイダーへの送信に失敗
    #[error("{message}")]
    Otp {
        message: String,
        detail: Option<String>,
    },
    /// レート制限超過
    #[error("{0}")]
    RateLimited(String),
    /// 内部エラー
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// ストレージ操作失敗を、プロバイダーの詳細付きで構築する。
    pub fn storage(message: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        GatewayError::Storage {
            message: message.into(),
            detail: Some(detail.to_string()),
        }
    }

    /// 本番環境ではプロバイダー由来の詳細を取り除く。
    pub fn redact(self, production: bool) -> Self {
        if !production {
            return self;
        }
        match self {
            GatewayError::Storage { message, .. } => GatewayError::Storage {
                message,
                detail: None,
            },
            GatewayError::Otp { message, .. } => GatewayError::Otp {
                message,
                detail: None,
            },
            other => other,
        }
    }

    /// HTTPステータスコード。
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Storage { .. } | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            // OTP送信失敗は既存クライアントとの互換のため400で返す
            GatewayError::Otp { .. } => StatusCode::BAD_REQUEST,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn public_message(&self) -> String {
        match self {
            GatewayError::BadRequest(msg)
            | GatewayError::RateLimited(msg)
            | GatewayError::Otp { message: msg, .. } => msg.clone(),
            GatewayError::NotFound { .. } => {
                "The specified file does not exist in the bucket".to_string()
            }
            GatewayError::Storage { detail, .. } => detail
                .clone()
                .unwrap_or_else(|| "Internal server error".to_string()),
            GatewayError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "リクエスト処理に失敗");
        } else if let GatewayError::Otp {
            message,
            detail: Some(detail),
        } = &self
        {
            tracing::warn!(%message, %detail, "OTP送信に失敗");
        }
        let file = match &self {
            GatewayError::NotFound { file, .. } => Some(file.clone()),
            _ => None,
        };
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
            message: self.public_message(),
            file,
        };
        (status, Json(body)).into_response()
    }
}
