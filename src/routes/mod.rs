//! API route handlers.

pub mod auth;
pub mod health;

use crate::auth::middleware::AppState;
use crate::middleware::security_headers;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::{routing::get, routing::post, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the API router with all endpoints.
pub fn api_router() -> Router<AppState> {
    Router::new()
        // OTP challenge endpoints
        .route("/api/auth/otp", post(auth::start_challenge))
        .route("/api/auth/otp/resend", post(auth::resend_code))
        .route("/api/auth/otp/verify", post(auth::verify_code))
        // Credential endpoints
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/health", get(health::health))
}

/// CORS policy. Without an allowed origin every cross-origin request is
/// denied (`CorsLayer::new()` allows nothing).
fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    let Some(origin) = allowed_origin else {
        return CorsLayer::new();
    };

    match origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static("x-access-token"),
            ]),
        Err(e) => {
            tracing::warn!(origin = %origin, error = %e, "Ignoring invalid ALLOWED_ORIGIN");
            CorsLayer::new()
        }
    }
}

/// Full application: routes, CORS, request tracing and security headers.
pub fn build_app(state: AppState) -> Router {
    let cors = cors_layer(state.config.allowed_origin.as_deref());

    api_router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

