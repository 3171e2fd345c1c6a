use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde::Serialize;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    gateway::Gateway,
    metrics::RateLimitMetrics,
    ratelimit::RateLimiter,
};

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    limiter: Option<RateLimiter>,
    metrics: Arc<RateLimitMetrics>,
    admin_token: Option<String>,
    // Route-override prefixes; a reset clears the caller's counters under each.
    route_prefixes: Vec<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
struct UsageResponse {
    identifier: String,
    usage: BTreeMap<&'static str, u64>,
}

#[derive(Serialize)]
struct ResetResponse {
    identifier: String,
    reset: bool,
}

pub fn routes(
    config: &GatewayConfig,
    gateway: Arc<Gateway>,
    limiter: Option<RateLimiter>,
    metrics: Arc<RateLimitMetrics>,
) -> Router {
    let state = AppState {
        gateway,
        limiter,
        metrics,
        admin_token: config.admin_token.clone(),
        route_prefixes: config
            .rate_limit
            .resolver
            .route_overrides
            .iter()
            .map(|route| route.path_prefix.clone())
            .collect(),
    };
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route(
            "/admin/ratelimit/{identifier}",
            get(get_usage).delete(reset_usage),
        )
        .fallback(any(proxy_handler))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, store) = match &state.limiter {
        Some(limiter) => {
            let status = if limiter.store_healthy().await { "ok" } else { "degraded" };
            (status, limiter.store_name())
        }
        None => ("ok", "disabled"),
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        store,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identifier): Path<String>,
) -> GatewayResult<Json<UsageResponse>> {
    let limiter = authorize_admin(&state, &headers)?;
    let usage = limiter.get_usage(&identifier).await?;
    Ok(Json(UsageResponse { identifier, usage }))
}

async fn reset_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identifier): Path<String>,
) -> GatewayResult<Json<ResetResponse>> {
    let limiter = authorize_admin(&state, &headers)?;
    limiter.reset(&identifier, &state.route_prefixes).await?;
    Ok(Json(ResetResponse {
        identifier,
        reset: true,
    }))
}

async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    state.gateway.handle_http(request, client_ip).await
}

/// Admin routes do not exist unless a token is configured, and need a
/// limiter to act on.
fn authorize_admin<'a>(state: &'a AppState, headers: &HeaderMap) -> GatewayResult<&'a RateLimiter> {
    let (Some(expected), Some(limiter)) = (&state.admin_token, &state.limiter) else {
        return Err(GatewayError::NotFound);
    };

    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthorized)?;

    if !timing_safe_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(GatewayError::Unauthorized);
    }

    Ok(limiter)
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = usize::from(a.len() != b.len());

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= usize::from(av ^ bv);
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::Ordering};

    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::{routes, timing_safe_eq};
    use crate::{
        clock::ManualClock,
        config::{GatewayConfig, RouteLimitConfig},
        gateway::{
            Gateway,
            tests::{StubScanner, test_config},
        },
        metrics::RateLimitMetrics,
        ratelimit::{
            FailurePolicy, LimitProfile, RateLimiter,
            in_memory::InMemoryCounterStore,
            store::CounterStore,
            tests::{BrokenStore, T0, limiter_with},
        },
    };

    fn build_app(
        store: Arc<dyn CounterStore>,
        mut config: GatewayConfig,
        admin_token: Option<&str>,
    ) -> (Router, Arc<StubScanner>) {
        config.admin_token = admin_token.map(ToString::to_string);
        let clock = Arc::new(ManualClock::at(T0));
        let limiter: RateLimiter = limiter_with(store, clock, 0, FailurePolicy::FailClosed);
        let metrics = Arc::new(RateLimitMetrics::new());
        let scanner = Arc::new(StubScanner::default());
        let gateway = Arc::new(Gateway::new(
            &config,
            Some(limiter.clone()),
            metrics.clone(),
            scanner.clone(),
        ));
        let app = routes(&config, gateway, Some(limiter), metrics);
        (app, scanner)
    }

    fn app_with(store: Arc<dyn CounterStore>, admin_token: Option<&str>) -> (Router, Arc<StubScanner>) {
        build_app(store, test_config(2), admin_token)
    }

    fn memory_app(admin_token: Option<&str>) -> (Router, Arc<StubScanner>) {
        let store = Arc::new(InMemoryCounterStore::new(Arc::new(ManualClock::at(T0))));
        app_with(store, admin_token)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn admin_request(method: &str, identifier: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("/admin/ratelimit/{identifier}"));
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_store_status() {
        let (app, _) = memory_app(None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn health_is_degraded_when_the_store_is_down() {
        let (app, _) = app_with(Arc::new(BrokenStore), None);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "degraded");
    }

    #[tokio::test]
    async fn unmatched_paths_are_proxied_through_the_limiter() {
        let (app, scanner) = memory_app(None);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/scan").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // No peer address in tests; the caller is metered as unknown.
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "1");
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);

        let metrics = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = to_bytes(metrics.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&text).contains("ratelimit_admitted_total 1\n"));
    }

    #[tokio::test]
    async fn admin_routes_are_hidden_without_a_token() {
        let (app, _) = memory_app(None);
        let response = app
            .oneshot(admin_request("GET", "ip:unknown", Some("anything")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_routes_require_the_right_token() {
        let (app, _) = memory_app(Some("s3cret"));

        let missing = app.clone().oneshot(admin_request("GET", "ip:unknown", None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(admin_request("GET", "ip:unknown", Some("s3cre")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_can_inspect_and_reset_usage() {
        let (app, _) = memory_app(Some("s3cret"));

        for _ in 0..2 {
            app.clone()
                .oneshot(Request::builder().uri("/api/v1/scan").body(Body::empty()).unwrap())
                .await
                .unwrap();
        }
        let limited = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/scan").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        let usage = app
            .clone()
            .oneshot(admin_request("GET", "ip:unknown", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(usage.status(), StatusCode::OK);
        let body = json_body(usage).await;
        assert_eq!(body["identifier"], "ip:unknown");
        assert_eq!(body["usage"]["minute"], 2);

        let reset = app
            .clone()
            .oneshot(admin_request("DELETE", "ip:unknown", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);
        assert_eq!(json_body(reset).await["reset"], true);

        let admitted = app
            .oneshot(Request::builder().uri("/api/v1/scan").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(admitted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_reset_clears_route_override_counters() {
        let mut config = test_config(10);
        config.rate_limit.resolver.route_overrides = vec![RouteLimitConfig {
            path_prefix: "/api/v1/scan".to_string(),
            profile: LimitProfile::new(1, 0, 0),
        }];
        let store = Arc::new(InMemoryCounterStore::new(Arc::new(ManualClock::at(T0))));
        let (app, _) = build_app(store, config, Some("s3cret"));

        let first = app.clone().oneshot(get("/api/v1/scan")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(get("/api/v1/scan")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let reset = app
            .clone()
            .oneshot(admin_request("DELETE", "ip:unknown", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(reset.status(), StatusCode::OK);

        let after = app.oneshot(get("/api/v1/scan")).await.unwrap();
        assert_eq!(after.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_store_outage_is_a_503() {
        let (app, _) = app_with(Arc::new(BrokenStore), Some("s3cret"));
        let response = app
            .oneshot(admin_request("DELETE", "ip:unknown", Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn timing_safe_eq_compares_whole_inputs() {
        assert!(timing_safe_eq(b"token", b"token"));
        assert!(!timing_safe_eq(b"token", b"tokem"));
        assert!(!timing_safe_eq(b"token", b"token-longer"));
        assert!(!timing_safe_eq(b"", b"x"));
    }
}
