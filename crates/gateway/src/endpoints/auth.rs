//! # OTP認証エンドポイント
//!
//! 送信・検証はルート単位のレート制限（`ratelimit`）の内側で動く。

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use signurl_types::{AuthResponse, SendOtpData, SendOtpRequest, VerifyOtpData, VerifyOtpRequest};

use super::parse_body;
use crate::config::GatewayState;
use crate::error::GatewayError;

/// POST /auth/send-otp — 認証コードの送信。
pub async fn handle_send_otp(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<SendOtpRequest>, JsonRejection>,
) -> Result<Json<AuthResponse<SendOtpData>>, GatewayError> {
    let body = parse_body(body)?;
    let data = state
        .auth
        .send_otp(body.phone_number.as_deref())
        .await
        .map_err(|e| e.redact(state.is_production()))?;

    Ok(Json(AuthResponse {
        success: true,
        message: "OTP sent successfully".to_string(),
        data: Some(data),
    }))
}

/// POST /auth/verify-otp — 認証コードの検証。成功したコードは再利用できない。
pub async fn handle_verify_otp(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<VerifyOtpRequest>, JsonRejection>,
) -> Result<Json<AuthResponse<VerifyOtpData>>, GatewayError> {
    let body = parse_body(body)?;
    let data = state.auth.verify_otp(
        body.phone_number.as_deref(),
        body.verification_code.as_deref(),
    )?;

    Ok(Json(AuthResponse {
        success: true,
        message: "OTP verified successfully".to_string(),
        data: Some(data),
    }))
}

/// GET /auth/status
pub async fn handle_auth_status() -> Json<AuthResponse<()>> {
    Json(AuthResponse {
        success: true,
        message: "Authentication service is running".to_string(),
        data: None,
    })
}
