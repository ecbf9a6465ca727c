//! Distributed cache abstraction.
//!
//! The key cache and the rate limiter only need a handful of Redis-style
//! primitives. [`CacheStore`] names them. [`MemoryStore`] keeps them in
//! process. [`RedisStore`] talks to Redis directly over RESP and
//! [`RestStore`] speaks a Redis-compatible REST protocol, so several gate
//! processes can share counters and the cached key set.

use std::time::Duration;

use thiserror::Error;

pub mod memory;
pub mod redis;
pub mod rest;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::rest::RestStore;

/// Failures talking to the distributed cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or returned a transport error.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// Operation did not finish within its deadline.
    #[error("cache operation '{op}' timed out after {after_ms}ms")]
    Timeout { op: &'static str, after_ms: u64 },

    /// Backend answered with something we could not interpret.
    #[error("cache protocol error: {0}")]
    Protocol(String),
}

/// Primitive operations required from the shared cache.
///
/// `incr` must be atomic on the backend. The pair `incr` + `expire` is not,
/// and callers tolerate a counter left without expiry.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Human readable backend name for health output.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Increment the integer at `key`, creating it at 1 when absent.
    /// An existing expiry is preserved.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Attach an expiry. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining lifetime; `None` for a missing key or one without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Delete every live key starting with `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Escape glob metacharacters so a literal prefix can be used as a
/// `KEYS`/`SCAN MATCH` pattern.
pub(crate) fn glob_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('*');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_prefix_escapes_metacharacters() {
        assert_eq!(glob_prefix("a:b"), "a:b*");
        assert_eq!(glob_prefix("a*[x]"), "a\\*\\[x\\]*");
    }
}
