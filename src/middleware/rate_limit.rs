use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    metrics::RateLimitMetrics,
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::{RateLimitDecision, RateLimiter, resolver::ProfileResolver},
};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

#[derive(Serialize)]
struct RateLimitBody<'a> {
    error: &'a str,
    message: String,
    retry_after: u64,
    limit: u64,
    window: &'a str,
}

pub struct RateLimitMiddleware {
    limiter: RateLimiter,
    resolver: ProfileResolver,
    exempt_paths: Vec<String>,
    metrics: Arc<RateLimitMetrics>,
}

impl RateLimitMiddleware {
    pub fn new(
        limiter: RateLimiter,
        resolver: ProfileResolver,
        exempt_paths: Vec<String>,
        metrics: Arc<RateLimitMetrics>,
    ) -> Self {
        Self {
            limiter,
            resolver,
            exempt_paths,
            metrics,
        }
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| exempt == path)
    }

    fn limited_response(decision: &RateLimitDecision) -> Response<Body> {
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitBody {
                error: "rate_limit_exceeded",
                message: format!(
                    "Rate limit exceeded. Please try again in {} seconds.",
                    decision.retry_after
                ),
                retry_after: decision.retry_after,
                limit: decision.limit,
                window: decision.window.unwrap_or_default(),
            }),
        )
            .into_response();

        insert_quota_headers(response.headers_mut(), decision);
        if let Ok(value) = HeaderValue::from_str(&decision.retry_after.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }

        response
    }
}

fn insert_quota_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    for (name, value) in [
        (X_RATELIMIT_LIMIT, decision.limit),
        (X_RATELIMIT_REMAINING, decision.remaining),
        (X_RATELIMIT_RESET, decision.reset),
    ] {
        headers.insert(name, HeaderValue::from(value));
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if self.is_exempt(ctx.uri.path()) {
            self.metrics.exempt();
            return Ok(ControlFlow::Continue);
        }

        let subject = self.resolver.resolve(ctx);
        ctx.rate_limit_identifier = Some(subject.identifier.clone());

        let decision = self
            .limiter
            .check(&subject.identifier, &subject.profile, &ctx.request_id)
            .await?;

        let flow = if decision.limited {
            tracing::debug!(
                request_id = %ctx.request_id,
                identifier = %subject.identifier,
                tier = %subject.tier,
                window = decision.window.unwrap_or_default(),
                retry_after = decision.retry_after,
                "rate limit exceeded"
            );
            ControlFlow::ShortCircuit(Self::limited_response(&decision))
        } else {
            ControlFlow::Continue
        };

        ctx.rate_limit = Some(decision);
        Ok(flow)
    }

    async fn on_response(&self, ctx: &RequestContext, response: &mut Response<Body>) -> GatewayResult<()> {
        // A zero limit means nothing was metered (all windows disabled, or the
        // store was bypassed under fail-open); there is no quota to report.
        if let Some(decision) = &ctx.rate_limit
            && !decision.limited
            && decision.limit > 0
        {
            insert_quota_headers(response.headers_mut(), decision);
        }

        Ok(())
    }
}
