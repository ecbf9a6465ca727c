//! Small helpers shared by the gate components.
//!
//! Cache key construction lives here so the rate limiter and the key cache
//! agree on one escaping scheme, and so does the timeout wrapper every
//! distributed-cache call goes through.

use std::future::Future;
use std::time::Duration;

use crate::store::StoreError;

/// Escape one component of a colon-separated cache key.
///
/// Identities come from token subjects and may contain `:`; without escaping
/// the prefix `rate-limit:a:` would also match the keys of identity `a:b`.
/// Glob metacharacters are escaped too since prefix deletes are expressed
/// as `KEYS <prefix>*` on remote stores.
pub fn key_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '*' => out.push_str("%2A"),
            '?' => out.push_str("%3F"),
            '[' => out.push_str("%5B"),
            ']' => out.push_str("%5D"),
            '\\' => out.push_str("%5C"),
            other => out.push(other),
        }
    }
    out
}

/// Run a store operation under a bounded timeout. Elapsed deadlines are
/// reported as [`StoreError::Timeout`] so callers treat them like any other
/// unreachable backend.
pub async fn bounded<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            op,
            after_ms: limit.as_millis() as u64,
        }),
    }
}
