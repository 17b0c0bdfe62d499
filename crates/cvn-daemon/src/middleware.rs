// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the studio HTTP API.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use cvn_error::{ErrorBody, StudioError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RequestId middleware
// ---------------------------------------------------------------------------

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generates a [`RequestId`] for each request and sets the `X-Request-Id`
/// response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

// ---------------------------------------------------------------------------
// Request logger
// ---------------------------------------------------------------------------

/// Logs method, path, status code, and duration for each request using
/// structured tracing fields.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

// ---------------------------------------------------------------------------
// Per-client rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window per-IP rate limiter surfacing `rate_limited` responses.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max_per_window: u32,
    window: Duration,
}

impl RateLimiter {
    /// Allow `max_per_window` requests per client within `window`.
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_per_window,
            window,
        }
    }

    fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.inner.lock().expect("rate limiter lock");
        let stamps = clients.entry(client.to_string()).or_default();
        stamps.retain(|t| now.duration_since(*t) < self.window);
        if stamps.len() >= self.max_per_window as usize {
            return false;
        }
        stamps.push(now);
        true
    }
}

/// Axum middleware over a shared [`RateLimiter`].
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !limiter.check(&client) {
        let err = StudioError::rate_limited("too many requests, slow down");
        let status = axum::http::StatusCode::from_u16(err.kind.http_status())
            .unwrap_or(axum::http::StatusCode::TOO_MANY_REQUESTS);
        return (status, axum::Json(ErrorBody::from(err))).into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_until_window_fills() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
        // Other clients are unaffected.
        assert!(limiter.check("5.6.7.8"));
    }

    #[test]
    fn limiter_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));
        assert!(limiter.check("c"));
        assert!(!limiter.check("c"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.check("c"));
    }
}
