use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Access log. Sits first in the chain so it sees every outcome, including
/// requests the limiter turned away.
pub struct RequestLoggingMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(&self, ctx: &RequestContext, response: &mut Response<Body>) -> GatewayResult<()> {
        let latency_ms = ctx.started_at.elapsed().as_millis() as u64;
        let identifier = ctx.rate_limit_identifier.as_deref().unwrap_or("-");
        let (limited, window, degraded) = ctx
            .rate_limit
            .as_ref()
            .map(|d| (d.limited, d.window.unwrap_or("-"), d.degraded))
            .unwrap_or((false, "-", false));

        if limited {
            tracing::warn!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.uri.path(),
                identifier,
                window,
                latency_ms,
                "request rate limited"
            );
        } else {
            tracing::info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.uri.path(),
                status = response.status().as_u16(),
                identifier,
                degraded,
                latency_ms,
                "request completed"
            );
        }
        Ok(())
    }
}
