use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};
use http::header::HeaderName;
use std::time::{
    Duration,
    Instant,
};

use crate::{
    config::ScannerConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
};

/// Whatever sits behind the middleware chain. Admitted requests are handed
/// here unchanged.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn forward(&self, ctx: &RequestContext) -> GatewayResult<Response<Body>>;
}

/// Proxies admitted requests to the contract scanner service.
#[derive(Clone)]
pub struct ScannerUpstream {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl ScannerUpstream {
    pub fn new(cfg: &ScannerConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(cfg.timeout_ms),
        })
    }

    fn target_url(&self, ctx: &RequestContext) -> String {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(ctx.uri.path());
        format!("{}{}", self.base_url, path_and_query)
    }
}

#[async_trait]
impl Downstream for ScannerUpstream {
    async fn forward(&self, ctx: &RequestContext) -> GatewayResult<Response<Body>> {
        let mut request = self
            .client
            .request(ctx.method.clone(), self.target_url(ctx))
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if should_forward_header(name) {
                request = request.header(name, value);
            }
        }

        request = request.header("x-request-id", ctx.request_id.clone());
        if let Some(client_ip) = ctx.client_ip {
            request = request.header("x-forwarded-for", client_ip.to_string());
        }

        let started = Instant::now();
        let upstream_response = request.timeout(self.timeout).send().await?;
        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await?;

        tracing::debug!(
            request_id = %ctx.request_id,
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "scanner responded"
        );

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if should_forward_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    // HeaderName is always lowercase.
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}
