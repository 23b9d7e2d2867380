//! Axum extractors for authentication, JSON bodies and rate limiting.

use crate::auth::credential::{Claims, CredentialIssuer};
use crate::auth::orchestrator::{Authenticator, ChallengePolicy};
use crate::clock::Clock;
use crate::config::Config;
use crate::delivery::DeliveryChannel;
use crate::error::AppError;
use crate::storage::{RateLimitStore, StorageError, Stores};
use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Request},
    http::request::Parts,
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<Authenticator>,
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Wire the orchestrator, credential issuer and rate limiter from config.
    pub fn new(
        config: Config,
        stores: &Stores,
        delivery: Arc<dyn DeliveryChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let issuer = CredentialIssuer::new(
            config.jwt_secret.as_bytes(),
            config.jwt_issuer.clone(),
            config.jwt_audience.clone(),
            Duration::seconds(config.token_ttl_secs as i64),
            clock.clone(),
            stores.revocations.clone(),
        );

        let policy = ChallengePolicy {
            otp_ttl: Duration::seconds(config.otp_ttl_secs as i64),
            session_grace: Duration::seconds(config.session_grace_secs as i64),
            expose_code_on_delivery_failure: config.expose_code_on_delivery_failure,
            sender_name: config.sms_sender_name.clone(),
        };

        let limiter = RateLimiter::new(
            stores.rate_limits.clone(),
            config.rate_limit_otp_requests,
            Duration::seconds(config.rate_limit_window_secs as i64),
        );

        let started_at = clock.now();
        let auth = Authenticator::new(stores, delivery, issuer, clock, policy);

        Self {
            auth: Arc::new(auth),
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            started_at,
        }
    }
}

/// Pull the raw credential from `Authorization: Bearer {token}` or
/// `x-access-token`, in that order.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let from_authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    from_authorization
        .or_else(|| {
            headers
                .get("x-access-token")
                .and_then(|v| v.to_str().ok())
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Verified credential extractor.
///
/// Returns 401 Unauthorized if the token is missing, invalid, expired or
/// revoked.
pub struct Authenticated {
    pub claims: Claims,
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("No token provided".to_string()))?;

        let claims = state.auth.verify(token).await?;
        Ok(Authenticated { claims })
    }
}

/// JSON body extractor whose rejection is an [`AppError`].
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// Per-client OTP request budget over a [`RateLimitStore`].
///
/// Counters live in the configured store, so with Redis every instance
/// draws on one budget per client.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    max: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, max: u32, window: Duration) -> Self {
        Self { store, max, window }
    }

    /// Count one OTP request from `client`. Returns `false` when over the limit.
    pub async fn check(&self, client: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        self.store
            .hit(&format!("otp:{}", client), self.max, self.window, now)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRateLimitStore;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_rate_limiter_uses_shared_store() {
        let store = Arc::new(MemoryRateLimitStore::new());
        let first = RateLimiter::new(store.clone(), 2, Duration::minutes(15));
        let second = RateLimiter::new(store.clone(), 2, Duration::minutes(15));
        let now = Utc::now();

        assert!(first.check("10.0.0.1", now).await.unwrap());
        assert!(second.check("10.0.0.1", now).await.unwrap());
        assert!(!first.check("10.0.0.1", now).await.unwrap());
        assert!(first.check("10.0.0.2", now).await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_bearer_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("x-access-token", HeaderValue::from_static("from-header"));
        assert_eq!(bearer_token(&headers), Some("from-header"));

        headers.insert("authorization", HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(bearer_token(&headers), Some("from-bearer"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
