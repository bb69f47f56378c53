//! # OTP送信プロバイダー
//!
//! 認証コードを利用者の端末に届ける外部サービスの抽象と、OTPIQ実装。

use serde::Serialize;

use crate::error::GatewayError;

/// 認証コードの送信手段。
#[async_trait::async_trait]
pub trait OtpProvider: Send + Sync {
    /// `phone_number` に `code` を送信する。
    async fn send_code(&self, phone_number: &str, code: &str) -> Result<(), GatewayError>;
}

/// OTPIQ APIへの送信リクエスト。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OtpiqSmsRequest<'a> {
    phone_number: &'a str,
    sms_type: &'a str,
    provider: &'a str,
    verification_code: &'a str,
}

/// OTPIQ (`https://api.otpiq.com`) による送信。
pub struct OtpiqProvider {
    http_client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl OtpiqProvider {
    pub fn new(http_client: reqwest::Client, api_url: &str, api_key: &str) -> Self {
        Self {
            http_client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

fn send_failed(detail: String) -> GatewayError {
    GatewayError::Otp {
        message: "Failed to send OTP".to_string(),
        detail: Some(detail),
    }
}

#[async_trait::async_trait]
impl OtpProvider for OtpiqProvider {
    async fn send_code(&self, phone_number: &str, code: &str) -> Result<(), GatewayError> {
        let body = OtpiqSmsRequest {
            phone_number,
            sms_type: "verification",
            provider: "whatsapp-sms",
            verification_code: code,
        };

        let response = self
            .http_client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_failed(format!("HTTP送信失敗: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // エラー応答に message があれば利用者向けメッセージとして使う
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| "Failed to send OTP".to_string());
        Err(GatewayError::Otp {
            message,
            detail: Some(format!("OTPIQがエラーを返しました: HTTP {status} - {text}")),
        })
    }
}
