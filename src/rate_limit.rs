//! Per-identity, per-category daily request counters.
//!
//! Counter keys look like `rate-limit:<identity>:<category>:<YYYY-MM-DD>`
//! with both free-form components escaped by [`key_component`]. The first
//! increment of a key attaches the window TTL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;

use crate::store::{CacheStore, StoreError};
use crate::util::{bounded, key_component};

pub const KEY_PREFIX: &str = "rate-limit";

/// Threshold and window applied to every (identity, category) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u64,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of one admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed { count: u64 },
    Rejected {
        count: u64,
        limit: u64,
        retry_after: Duration,
    },
    /// Counter backend failed; the request is let through uncounted.
    FailedOpen,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }

    /// Counter value after this check; `None` when the backend failed.
    pub fn count(&self) -> Option<u64> {
        match self {
            Admission::Allowed { count } | Admission::Rejected { count, .. } => Some(*count),
            Admission::FailedOpen => None,
        }
    }
}

/// One category's counter for the usage report; `None` when unreadable.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CategoryUsage {
    pub category: String,
    pub count: Option<u64>,
}

pub fn counter_key(identity: &str, category: &str, day: NaiveDate) -> String {
    format!(
        "{}:{}:{}:{}",
        KEY_PREFIX,
        key_component(identity),
        key_component(category),
        day.format("%Y-%m-%d")
    )
}

/// Prefix shared by every counter of `identity`, across categories and days.
pub fn identity_prefix(identity: &str) -> String {
    format!("{}:{}:", KEY_PREFIX, key_component(identity))
}

pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    policy: RateLimitPolicy,
    op_timeout: Duration,
    rejected_total: AtomicU64,
    fail_open_total: AtomicU64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheStore>, policy: RateLimitPolicy, op_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            op_timeout,
            rejected_total: AtomicU64::new(0),
            fail_open_total: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub async fn admit(&self, identity: &str, category: &str) -> Admission {
        self.admit_on(identity, category, Utc::now().date_naive()).await
    }

    /// Count one request against `day`'s counter and decide.
    pub async fn admit_on(&self, identity: &str, category: &str, day: NaiveDate) -> Admission {
        let key = counter_key(identity, category, day);
        let count = match bounded(self.op_timeout, "incr", self.store.incr(&key)).await {
            Ok(n) => n,
            Err(e) => {
                self.fail_open_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    identity = %identity,
                    category = %category,
                    error = %e,
                    "rate limit backend unavailable; admitting request"
                );
                return Admission::FailedOpen;
            }
        };

        if count == 1 {
            let expire = bounded(
                self.op_timeout,
                "expire",
                self.store.expire(&key, self.policy.window),
            )
            .await;
            if let Err(e) = expire {
                tracing::warn!(key = %key, error = %e, "failed to set counter expiry");
            }
        }

        if count <= self.policy.max_requests {
            return Admission::Allowed { count };
        }

        self.rejected_total.fetch_add(1, Ordering::Relaxed);
        let retry_after = match bounded(self.op_timeout, "ttl", self.store.ttl(&key)).await {
            Ok(Some(left)) => left,
            _ => self.policy.window,
        };
        tracing::info!(
            identity = %identity,
            category = %category,
            count,
            limit = self.policy.max_requests,
            "rate limit exceeded"
        );
        Admission::Rejected {
            count,
            limit: self.policy.max_requests,
            retry_after,
        }
    }

    /// Today's counters for `categories`, without incrementing them.
    pub async fn usage(&self, identity: &str, categories: &[&str]) -> Vec<CategoryUsage> {
        let day = Utc::now().date_naive();
        let mut out = Vec::with_capacity(categories.len());
        for category in categories {
            let key = counter_key(identity, category, day);
            let count = match bounded(self.op_timeout, "get", self.store.get(&key)).await {
                Ok(None) => Some(0),
                Ok(Some(raw)) => raw.parse::<u64>().ok(),
                Err(e) => {
                    tracing::warn!(category = %category, error = %e, "failed to read usage counter");
                    None
                }
            };
            out.push(CategoryUsage {
                category: (*category).to_string(),
                count,
            });
        }
        out
    }

    /// Remove every counter of `identity`; returns how many keys were deleted.
    pub async fn clear(&self, identity: &str) -> Result<u64, StoreError> {
        let prefix = identity_prefix(identity);
        let removed = bounded(self.op_timeout, "delete_prefix", self.store.delete_prefix(&prefix)).await?;
        tracing::info!(identity = %identity, removed, "cleared rate limit counters");
        Ok(removed)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total.load(Ordering::Relaxed)
    }

    pub fn fail_open_total(&self) -> u64 {
        self.fail_open_total.load(Ordering::Relaxed)
    }
}
