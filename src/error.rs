use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;
use crate::services::ServiceError;
use crate::session::SessionError;
use crate::store::StoreError;

/// Every way a request can be refused or fail, with its HTTP mapping.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("authorization header is required")]
    MissingAuthHeader,

    #[error("authorization header must be a bearer token")]
    MalformedAuthHeader,

    #[error("invalid token: {0}")]
    Auth(#[from] AuthError),

    #[error("rate limit exceeded: maximum {limit} requests per endpoint per window")]
    RateLimitExceeded {
        count: u64,
        limit: u64,
        retry_after: Duration,
    },

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("user id in request does not match authenticated user")]
    IdentityMismatch,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("unauthorized")]
    AdminUnauthorized,

    #[error("{0} not configured")]
    NotConfigured(&'static str),

    #[error("{context}: {source}")]
    Upstream {
        context: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl GateError {
    pub fn upstream(context: &'static str) -> impl FnOnce(ServiceError) -> GateError {
        move |source| GateError::Upstream { context, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GateError::MissingAuthHeader | GateError::MalformedAuthHeader => StatusCode::UNAUTHORIZED,
            GateError::Auth(AuthError::BackendUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            GateError::Auth(_) => StatusCode::UNAUTHORIZED,
            GateError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::Session(SessionError::Forbidden) | GateError::IdentityMismatch => StatusCode::FORBIDDEN,
            GateError::Session(SessionError::NotFound) => StatusCode::NOT_FOUND,
            GateError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GateError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GateError::AdminUnauthorized => StatusCode::UNAUTHORIZED,
            GateError::NotConfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GateError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Metrics label for refusals raised by the gate itself.
    pub fn auth_reason(&self) -> Option<&'static str> {
        match self {
            GateError::MissingAuthHeader => Some("missing_auth_header"),
            GateError::MalformedAuthHeader => Some("malformed_auth_header"),
            GateError::Auth(e) => Some(e.reason()),
            _ => None,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            GateError::RateLimitExceeded {
                count,
                limit,
                retry_after,
            } => {
                let secs = retry_after.as_secs().max(1);
                let body = json!({
                    "error": format!(
                        "rate limit exceeded: maximum {} requests per endpoint per window",
                        limit
                    ),
                    "limit": limit,
                    "count": count,
                    "retry_after": secs,
                });
                let mut resp = (status, Json(body)).into_response();
                if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                    resp.headers_mut().insert(header::RETRY_AFTER, v);
                }
                resp
            }
            other => {
                if status.is_server_error() {
                    tracing::error!(error = %other, "request failed");
                }
                (status, Json(json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}
