//! Security headers middleware.
//!
//! The service only speaks JSON, so the header set is the API subset:
//! nothing is cached, nothing is framed, and no referrer leaves the client.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

/// Adds security headers to every response.
///
/// - `Cache-Control: no-store` keeps session ids and credentials out of caches.
/// - `Referrer-Policy: no-referrer`
/// - `X-Content-Type-Options: nosniff`
/// - `X-Frame-Options: DENY`
/// - `Strict-Transport-Security` for two years, including subdomains.
///
/// # Usage
///
/// ```rust,no_run
/// use axum::Router;
/// use axum::middleware;
/// use otpgate::middleware::security_headers;
///
/// let app: Router = Router::new()
///     .layer(middleware::from_fn(security_headers));
/// ```
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );

    response
}
