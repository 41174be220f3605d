use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{num::NonZeroU32, sync::Arc};
use tracing::warn;

// SECURITY: Rate limiting configuration
pub const REQUESTS_PER_MINUTE: u32 = 60; // Allow 60 requests per minute per IP
pub const TASK_REQUESTS_PER_MINUTE: u32 = 10; // More restrictive for task creation

#[derive(Clone)]
pub struct RateLimitConfig {
    pub general_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    pub task_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        // SECURITY: General rate limiter - 60 requests per minute
        let general_quota = Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap());
        let general_limiter = Arc::new(RateLimiter::direct(general_quota));

        // SECURITY: Task creation rate limiter - 10 requests per minute
        let task_quota = Quota::per_minute(NonZeroU32::new(TASK_REQUESTS_PER_MINUTE).unwrap());
        let task_limiter = Arc::new(RateLimiter::direct(task_quota));

        Self {
            general_limiter,
            task_limiter,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

// SECURITY: General rate limiting middleware
//
// Note: this is a single global token bucket per limiter, not per-IP — the
// `governor::state::NotKeyed` state backing both limiters is shared across
// every caller. Good enough for a single-tenant control plane; a keyed
// limiter (and `extract_client_ip` below) would be the place to start for
// a multi-tenant deployment.
pub async fn rate_limit_middleware(
    State(config): State<Arc<RateLimitConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = request.uri().path().to_string();
    let is_task_create = path.starts_with("/api/tasks") && request.method() == axum::http::Method::POST;

    let limiter = if is_task_create { &config.task_limiter } else { &config.general_limiter };
    if limiter.check().is_err() {
        warn!(path = %path, task_create = is_task_create, "rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

// SECURITY: IP-based rate limiting helper
pub fn extract_client_ip(request: &Request) -> String {
    // Try to get real IP from headers (for proxy setups)
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(ip_str) = forwarded_for.to_str() {
            // Take the first IP in the chain
            if let Some(first_ip) = ip_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }

    // Fallback to connection info
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, middleware, routing::{get, post}, Router};
    use tower::ServiceExt;

    #[test]
    fn test_rate_limit_config_creation() {
        let config = RateLimitConfig::new();
        assert!(config.general_limiter.check().is_ok());
        assert!(config.task_limiter.check().is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_quota() {
        let config = RateLimitConfig::new();

        // Should allow initial requests
        assert!(config.general_limiter.check().is_ok());
        assert!(config.task_limiter.check().is_ok());

        // After many requests, should start limiting
        // (This test would need to be adjusted based on actual quota limits)
    }

    fn app(config: Arc<RateLimitConfig>) -> Router {
        Router::new()
            .route("/api/tasks", post(|| async { "ok" }))
            .route("/api/health", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(config, rate_limit_middleware))
    }

    #[tokio::test]
    async fn task_create_bucket_empties_after_its_burst_size() {
        let config = Arc::new(RateLimitConfig::new());
        let router = app(config);

        for _ in 0..TASK_REQUESTS_PER_MINUTE {
            let response = router
                .clone()
                .oneshot(Request::builder().method("POST").uri("/api/tasks").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let exhausted = router
            .oneshot(Request::builder().method("POST").uri("/api/tasks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(exhausted.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn exhausting_the_task_bucket_does_not_affect_the_general_bucket() {
        let config = Arc::new(RateLimitConfig::new());
        let router = app(config);

        for _ in 0..TASK_REQUESTS_PER_MINUTE {
            router
                .clone()
                .oneshot(Request::builder().method("POST").uri("/api/tasks").body(Body::empty()).unwrap())
                .await
                .unwrap();
        }

        let health = router
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }
}
