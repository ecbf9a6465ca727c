//! Request admission: bearer token verification followed by rate limiting.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::AuthenticatedIdentity;
use crate::error::GateError;
use crate::rate_limit::Admission;
use crate::AppState;

pub const ADMIN_KEY_HEADER: &str = "x-admin-api-key";

/// Category used when a path has no segment below `/api/`.
const ROOT_CATEGORY: &str = "root";

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, GateError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(GateError::MissingAuthHeader)?
        .to_str()
        .map_err(|_| GateError::MalformedAuthHeader)?;
    if raw.trim().is_empty() {
        return Err(GateError::MissingAuthHeader);
    }
    let (scheme, token) = raw.split_once(' ').ok_or(GateError::MalformedAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(GateError::MalformedAuthHeader);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(GateError::MalformedAuthHeader);
    }
    Ok(token)
}

/// First path segment below `/api/`: `/api/session/abc` → `session`.
pub fn endpoint_category(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/")?;
    let segment = rest.split('/').next().unwrap_or_default();
    (!segment.is_empty()).then_some(segment)
}

/// Compare the admin header against the configured secret. With no secret
/// configured every admin request is refused.
pub fn check_admin_key(headers: &HeaderMap, configured: Option<&str>) -> Result<(), GateError> {
    let Some(expected) = configured.filter(|k| !k.is_empty()) else {
        return Err(GateError::AdminUnauthorized);
    };
    let supplied = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GateError::AdminUnauthorized)?;
    if constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(GateError::AdminUnauthorized)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware guarding `/api/*`. On success the verified identity is stored
/// as a request extension for the handlers.
pub async fn access_gate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match admit(&state, req.headers(), req.uri().path()).await {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(err) => {
            if let Some(reason) = err.auth_reason() {
                state.metrics.record_auth_failure(reason);
                tracing::info!(reason, path = %req.uri().path(), "request refused");
            }
            err.into_response()
        }
    }
}

// Takes the parts it needs rather than `&Request`: the body is not `Sync`.
async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
) -> Result<AuthenticatedIdentity, GateError> {
    let token = extract_bearer_token(headers)?;
    let identity = state.verifier.verify(token).await?;
    let category = endpoint_category(path).unwrap_or(ROOT_CATEGORY);

    match state.limiter.admit(identity.as_str(), category).await {
        Admission::Rejected {
            count,
            limit,
            retry_after,
        } => {
            return Err(GateError::RateLimitExceeded {
                count,
                limit,
                retry_after,
            })
        }
        Admission::Allowed { count } => {
            tracing::debug!(identity = %identity, category, count, "request admitted");
        }
        Admission::FailedOpen => {}
    }
    state.metrics.record_admitted();
    Ok(identity)
}
