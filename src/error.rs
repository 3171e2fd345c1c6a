use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::ratelimit::RateLimitError;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug)]
pub enum GatewayError {
    Unauthorized,
    NotFound,
    RateLimiterUnavailable { retry_after_secs: u64 },
    UpstreamUnavailable(String),
    Upstream(String),
    PayloadTooLarge,
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::RateLimiterUnavailable { .. } => "rate_limiter_unavailable",
            Self::UpstreamUnavailable(_) => "scanner_unavailable",
            Self::Upstream(_) => "scanner_error",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Internal(_) => "internal_server_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Unauthorized => "Invalid or missing admin token".to_string(),
            Self::NotFound => "The requested resource was not found".to_string(),
            Self::RateLimiterUnavailable { .. } => {
                "Rate limiting is temporarily unavailable; retry shortly".to_string()
            }
            Self::UpstreamUnavailable(msg) => msg.clone(),
            Self::Upstream(msg) => msg.clone(),
            Self::PayloadTooLarge => "Request body exceeds configured limit".to_string(),
            Self::Internal(msg) => msg.clone(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimiterUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, Json(ErrorBody {
            error: self.code(),
            message: self.message(),
        }))
            .into_response();

        if let Self::RateLimiterUnavailable { retry_after_secs } = self
            && let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        response
    }
}

impl From<RateLimitError> for GatewayError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::StoreUnavailable(_) => Self::RateLimiterUnavailable {
                retry_after_secs: 1,
            },
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::UpstreamUnavailable(err.to_string())
        } else {
            Self::Upstream(err.to_string())
        }
    }
}
