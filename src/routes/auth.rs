//! Auth API endpoints.

use crate::auth::middleware::{bearer_token, ApiJson, AppState, Authenticated};
use crate::auth::orchestrator::DeliveryReceipt;
use crate::error::AppError;
use crate::models::{
    DeliveryStatus, MeResponse, ResendRequest, ResendResponse, StartChallengeRequest,
    StartChallengeResponse, VerifyRequest, VerifyResponse,
};
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Count the request against the client's OTP budget.
async fn enforce_rate_limit(
    state: &AppState,
    addr: &SocketAddr,
    endpoint: &'static str,
) -> Result<(), AppError> {
    let now = state.auth.clock().now();
    if state.limiter.check(&addr.ip().to_string(), now).await? {
        return Ok(());
    }

    let mut hasher = std::hash::DefaultHasher::new();
    addr.ip().hash(&mut hasher);
    let ip_hash = format!("{:x}", hasher.finish());
    tracing::warn!(action = "rate_limited", endpoint = endpoint, ip_hash = %ip_hash, "Rate limit exceeded");
    Err(AppError::RateLimited)
}

/// Seconds left on the code, plus what to tell the caller about delivery.
fn describe_delivery(
    state: &AppState,
    receipt: &DeliveryReceipt,
) -> (i64, Option<String>) {
    let expires_in_secs = (receipt.code_expires_at - state.auth.clock().now())
        .num_seconds()
        .max(0);

    let note = match (receipt.status, receipt.exposed_code.is_some()) {
        (DeliveryStatus::Delivered, _) => None,
        (DeliveryStatus::DeliveryUncertain, true) => Some(
            "SMS delivery failed; code included for development use only".to_string(),
        ),
        (DeliveryStatus::DeliveryUncertain, false) => {
            Some("SMS delivery could not be confirmed; request a resend if no code arrives".to_string())
        }
    };

    (expires_in_secs, note)
}

/// POST /api/auth/otp: Start a challenge for a mobile number
pub async fn start_challenge(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ApiJson(req): ApiJson<StartChallengeRequest>,
) -> Result<impl IntoResponse, AppError> {
    enforce_rate_limit(&state, &addr, "auth/otp").await?;

    let receipt = state.auth.begin_challenge(&req.mobile_number).await?;
    let (expires_in_secs, note) = describe_delivery(&state, &receipt.delivery);

    Ok(Json(StartChallengeResponse {
        session_id: receipt.session_id,
        status: receipt.delivery.status,
        expires_in_secs,
        otp: receipt.delivery.exposed_code,
        note,
    }))
}

/// POST /api/auth/otp/resend: Send a fresh code for an active session
pub async fn resend_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ApiJson(req): ApiJson<ResendRequest>,
) -> Result<impl IntoResponse, AppError> {
    enforce_rate_limit(&state, &addr, "auth/otp/resend").await?;

    let receipt = state.auth.resend(&req.session_id).await?;
    let (expires_in_secs, note) = describe_delivery(&state, &receipt);

    Ok(Json(ResendResponse {
        status: receipt.status,
        expires_in_secs,
        otp: receipt.exposed_code,
        note,
    }))
}

/// POST /api/auth/otp/verify: Exchange a code for a credential
pub async fn verify_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ApiJson(req): ApiJson<VerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    enforce_rate_limit(&state, &addr, "auth/otp/verify").await?;

    let credential = state
        .auth
        .complete_challenge(&req.session_id, &req.code)
        .await?;

    Ok(Json(VerifyResponse {
        token: credential.token,
        token_type: "Bearer",
        expires_at: credential.expires_at,
        subject_id: credential.subject_id,
        mobile_number: credential.contact_address,
    }))
}

/// POST /api/auth/logout: Revoke the presented credential, if any
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    state.auth.end_session(bearer_token(&headers)).await;
    tracing::info!(action = "logout", "Logout processed");
    StatusCode::NO_CONTENT
}

/// GET /api/auth/me: Identity behind the presented credential
pub async fn me(auth: Authenticated) -> Json<MeResponse> {
    let expires_at = auth.claims.expires_at();
    Json(MeResponse {
        subject_id: auth.claims.sub,
        mobile_number: auth.claims.contact,
        expires_at,
    })
}
