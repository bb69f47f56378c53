//! # OTP認証
//!
//! 電話番号に認証コードを送り、後から照合する。
//!
//! - `provider`: コードの送信手段（OTPIQ）
//! - `store`: 発行済みコードの保持と照合

pub mod provider;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use signurl_types::{SendOtpData, VerifyOtpData};

pub use provider::{OtpProvider, OtpiqProvider};
pub use store::{VerificationStore, VerifyOutcome};

use crate::config::OtpSettings;
use crate::error::GatewayError;
use crate::issuer::format_timestamp;

/// 電話番号の形式（国番号 + 固定桁数の数字）。
#[derive(Debug, Clone)]
pub struct PhoneFormat {
    pub country_code: String,
    pub national_digits: usize,
}

impl PhoneFormat {
    pub fn is_valid(&self, phone_number: &str) -> bool {
        phone_number.len() == self.country_code.len() + self.national_digits
            && phone_number.bytes().all(|b| b.is_ascii_digit())
            && phone_number.starts_with(&self.country_code)
    }

    fn invalid_message(&self) -> String {
        format!(
            "Invalid phone number format. Please use format: {}{}",
            self.country_code,
            "X".repeat(self.national_digits)
        )
    }
}

/// 認証コードの形式（4〜6桁の数字）。
pub fn is_valid_code(code: &str) -> bool {
    (4..=6).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_digit())
}

/// 6桁の認証コードを生成する。
fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

/// OTP認証サービス。
pub struct AuthService {
    store: Arc<VerificationStore>,
    /// APIキー未設定なら `None`
    provider: Option<Arc<dyn OtpProvider>>,
    phone_format: PhoneFormat,
}

impl AuthService {
    pub fn new(
        store: Arc<VerificationStore>,
        provider: Option<Arc<dyn OtpProvider>>,
        phone_format: PhoneFormat,
    ) -> Self {
        Self {
            store,
            provider,
            phone_format,
        }
    }

    /// 設定から構築する。APIキーがあればOTPIQを送信手段にする。
    pub fn from_settings(settings: &OtpSettings, http_client: reqwest::Client) -> Self {
        let ttl = (settings.code_ttl_secs > 0).then(|| Duration::from_secs(settings.code_ttl_secs));
        let provider = settings.api_key.as_deref().map(|key| {
            Arc::new(OtpiqProvider::new(http_client, &settings.api_url, key)) as Arc<dyn OtpProvider>
        });
        if provider.is_none() {
            tracing::warn!("OTPIQ_API_KEYが設定されていないため、OTP送信は失敗します");
        }
        Self::new(
            Arc::new(VerificationStore::new(ttl)),
            provider,
            PhoneFormat {
                country_code: settings.country_code.clone(),
                national_digits: settings.national_digits,
            },
        )
    }

    pub fn store(&self) -> &Arc<VerificationStore> {
        &self.store
    }

    fn validate_phone(&self, phone_number: &str) -> Result<(), GatewayError> {
        if self.phone_format.is_valid(phone_number) {
            Ok(())
        } else {
            Err(GatewayError::BadRequest(self.phone_format.invalid_message()))
        }
    }

    /// 認証コードを生成・保存して送信する。送信に失敗したコードは取り消す。
    pub async fn send_otp(&self, phone_number: Option<&str>) -> Result<SendOtpData, GatewayError> {
        let phone_number = phone_number
            .filter(|p| !p.is_empty())
            .ok_or_else(|| GatewayError::BadRequest("Phone number is required".to_string()))?;
        self.validate_phone(phone_number)?;

        let provider = self.provider.as_ref().ok_or_else(|| GatewayError::Otp {
            message: "OTPIQ API key not configured".to_string(),
            detail: Some("Missing OTPIQ_API_KEY environment variable".to_string()),
        })?;

        let code = generate_code();
        self.store.put(phone_number, &code);

        if let Err(e) = provider.send_code(phone_number, &code).await {
            self.store.remove_if_code(phone_number, &code);
            return Err(e);
        }

        tracing::info!(phone = %phone_number, "認証コードを送信");
        Ok(SendOtpData {
            phone_number: phone_number.to_string(),
        })
    }

    /// 認証コードを照合する。一致すればコードを消費する。
    pub fn verify_otp(
        &self,
        phone_number: Option<&str>,
        code: Option<&str>,
    ) -> Result<VerifyOtpData, GatewayError> {
        let (Some(phone_number), Some(code)) = (
            phone_number.filter(|p| !p.is_empty()),
            code.filter(|c| !c.is_empty()),
        ) else {
            return Err(GatewayError::BadRequest(
                "Phone number and verification code are required".to_string(),
            ));
        };
        self.validate_phone(phone_number)?;
        if !is_valid_code(code) {
            return Err(GatewayError::BadRequest(
                "Invalid OTP format. Please enter a valid verification code".to_string(),
            ));
        }

        match self.store.verify(phone_number, code) {
            VerifyOutcome::Verified => {
                tracing::info!(phone = %phone_number, "認証コードを検証");
                Ok(VerifyOtpData {
                    phone_number: phone_number.to_string(),
                    verified_at: format_timestamp(Utc::now()),
                })
            }
            VerifyOutcome::Mismatch => {
                tracing::debug!(phone = %phone_number, "認証コードが一致しない");
                Err(GatewayError::BadRequest("Invalid verification code".to_string()))
            }
            VerifyOutcome::Missing => Err(GatewayError::BadRequest(
                "No OTP found for this phone number. Please request a new OTP.".to_string(),
            )),
        }
    }
}
