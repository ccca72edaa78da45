//! Axum admission middleware.
//!
//! Serve `SecurityCore` as the state so automatic blocks, suspicious
//! clients and rate-limit denials reach the audit ledger. A bare
//! `RateLimiter` admits without auditing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::security::rate_limit::{AdmissionDecision, DenialReason, RateLimiter, RequestContext};

pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Something that decides whether a request may proceed.
pub trait Admission: Send + Sync + 'static {
    fn admit(&self, request: &RequestContext<'_>) -> AdmissionDecision;
}

impl Admission for RateLimiter {
    fn admit(&self, request: &RequestContext<'_>) -> AdmissionDecision {
        self.check_request(request)
    }
}

/// Runs the admission check for every request.
///
/// Needs the router to be served with `into_make_service_with_connect_info::<SocketAddr>()`.
pub async fn admission_middleware<A: Admission>(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(gate): State<Arc<A>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let decision = gate.admit(&RequestContext {
        ip: &ip,
        user_agent: user_agent.as_deref(),
    });

    match decision {
        AdmissionDecision::Allowed { remaining, .. } => {
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
            response
        }
        AdmissionDecision::Denied {
            reason: DenialReason::Blocked,
            ..
        } => {
            tracing::warn!(client = %ip, "Request from blocked IP rejected");
            let mut response = Response::new(Body::from("Forbidden"));
            *response.status_mut() = StatusCode::FORBIDDEN;
            response
        }
        AdmissionDecision::Denied {
            reason: DenialReason::RateLimited,
            retry_after_secs,
        } => {
            tracing::warn!(client = %ip, retry_after = ?retry_after_secs, "Rate limit exceeded");
            let mut response = Response::new(Body::from("Rate limit exceeded"));
            *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
            if let Some(secs) = retry_after_secs {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            response
                .headers_mut()
                .insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditQuery};
    use crate::clock::ManualClock;
    use crate::config::{GuardConfig, RateLimitSettings};
    use crate::lifecycle::SecurityCore;
    use crate::security::BlockDuration;
    use axum::{extract::connect_info::MockConnectInfo, routing::get, Router};
    use tower::ServiceExt;

    fn app<A: Admission>(gate: Arc<A>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                gate,
                admission_middleware::<A>,
            ))
            .layer(MockConnectInfo(SocketAddr::from(([10, 1, 2, 3], 4000))))
    }

    fn limiter(max_requests: u32) -> Arc<RateLimiter> {
        let settings = RateLimitSettings {
            max_requests,
            window_ms: 60_000,
            adaptive: false,
            auto_block_enabled: false,
            ..RateLimitSettings::default()
        };
        Arc::new(RateLimiter::with_clock(
            settings,
            Arc::new(ManualClock::new(0)),
        ))
    }

    fn request() -> Request<Body> {
        Request::builder()
            .uri("/")
            .header(header::USER_AGENT, "test-agent")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_carries_remaining_header() {
        let app = app(limiter(3));
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "2");
    }

    #[tokio::test]
    async fn test_limited_returns_429_with_retry_after() {
        let limiter = limiter(1);
        let app = app(limiter.clone());
        assert_eq!(
            app.clone().oneshot(request()).await.unwrap().status(),
            StatusCode::OK
        );
        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert_eq!(limiter.stats().limited, 1);
    }

    #[tokio::test]
    async fn test_blocked_returns_403() {
        let limiter = limiter(10);
        limiter.block_ip("10.1.2.3", "manual", BlockDuration::Permanent);
        let response = app(limiter).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_automatic_block_through_core_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GuardConfig::default();
        config.audit.log_dir = dir.path().join("audit");
        config.vault.pbkdf2_iterations = 1_000;
        config.rate_limit.max_requests = 2;
        config.rate_limit.adaptive = false;
        config.rate_limit.auto_block_score = 25;
        let core = Arc::new(
            SecurityCore::build(
                &config,
                b"middleware-key".to_vec(),
                None,
                Arc::new(ManualClock::new(1_760_000_000_000)),
            )
            .unwrap(),
        );
        let app = app(core.clone());
        let ip_blocks = || {
            core.ledger
                .query(&AuditQuery {
                    event_type: Some(AuditEventType::IpBlocked),
                    ..AuditQuery::default()
                })
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // Spending the last token scores rapid requests, which crosses the threshold.
        let second = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::FORBIDDEN);
        let blocks = ip_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].ip_address, "10.1.2.3");
        assert_eq!(blocks[0].user_agent.as_deref(), Some("test-agent"));

        let third = app.oneshot(request()).await.unwrap();
        assert_eq!(third.status(), StatusCode::FORBIDDEN);
        assert_eq!(ip_blocks().len(), 1);
    }
}
