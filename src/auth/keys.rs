//! Verification key set and its refresh policy.
//!
//! # Cache strategy
//!
//! ```text
//! verify → snapshot fresh?      → use it
//!        → stale?               → one caller reloads (distributed cache first,
//!                                 then origin), others keep the old snapshot
//!        → kid unknown?         → synchronous origin reload, then retry once
//! ```
//!
//! Snapshots are immutable `Arc<KeySet>` values. A reload builds a complete
//! new set before swapping it in, so a cancelled reload leaves the previous
//! snapshot untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::DecodingKey;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::AuthError;
use crate::store::CacheStore;
use crate::util::bounded;

/// Distributed cache entry holding the raw JWKS document.
pub const KEYSET_CACHE_KEY: &str = "identity-jwks";

/// Default staleness interval (30 minutes); also the TTL of the cached copy.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Default origin fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between reload attempts after a failed time-triggered refresh.
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// Where a key set snapshot was loaded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySetOrigin {
    DistributedCache,
    Origin,
}

/// Immutable set of verification keys addressable by key id.
pub struct KeySet {
    keys: HashMap<String, DecodingKey>,
    fetched_at: DateTime<Utc>,
    loaded_at: Instant,
    origin: KeySetOrigin,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("kids", &self.kids())
            .field("fetched_at", &self.fetched_at)
            .field("origin", &self.origin)
            .finish()
    }
}

impl KeySet {
    /// Parse a JWKS document. Keys without a `kid` and symmetric keys are
    /// skipped; a document with no usable key is an error.
    pub fn from_jwks(raw: &str, origin: KeySetOrigin) -> Result<Self, AuthError> {
        let set: JwkSet = serde_json::from_str(raw)
            .map_err(|e| AuthError::BackendUnavailable(format!("unparsable key set: {}", e)))?;
        let mut keys = HashMap::with_capacity(set.keys.len());
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                tracing::debug!("skipping key without kid");
                continue;
            };
            if matches!(jwk.algorithm, AlgorithmParameters::OctetKey(_)) {
                tracing::warn!(kid = %kid, "skipping symmetric key in published key set");
                continue;
            }
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => tracing::warn!(kid = %kid, error = %e, "skipping unusable key"),
            }
        }
        if keys.is_empty() {
            return Err(AuthError::BackendUnavailable(
                "key set contains no usable keys".into(),
            ));
        }
        Ok(Self {
            keys,
            fetched_at: Utc::now(),
            loaded_at: Instant::now(),
            origin,
        })
    }

    pub fn get(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    pub fn kids(&self) -> Vec<&str> {
        let mut kids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        kids.sort_unstable();
        kids
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn origin(&self) -> KeySetOrigin {
        self.origin
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }
}

/// When a snapshot counts as stale and how long loads may take.
#[derive(Clone, Copy, Debug)]
pub struct RefreshPolicy {
    pub stale_after: Duration,
    pub fetch_timeout: Duration,
    pub failure_backoff: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }
}

impl RefreshPolicy {
    pub fn is_stale(&self, loaded_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(loaded_at) > self.stale_after
    }

    /// True while a recent failed reload should suppress another attempt.
    pub fn backing_off(&self, last_failure: Option<Instant>, now: Instant) -> bool {
        last_failure.is_some_and(|at| now.saturating_duration_since(at) < self.failure_backoff)
    }
}

/// Origin of the published key set.
#[async_trait::async_trait]
pub trait KeySource: Send + Sync {
    /// Fetch the raw JWKS document.
    async fn fetch(&self) -> Result<String, AuthError>;
}

/// Fetches `<issuer>/.well-known/jwks.json` (or a configured URL) over HTTP.
pub struct HttpKeySource {
    url: String,
    client: reqwest::Client,
}

impl HttpKeySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::BackendUnavailable(format!("http client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn for_issuer(issuer: &str, timeout: Duration) -> Result<Self, AuthError> {
        Self::new(
            format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/')),
            timeout,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<String, AuthError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AuthError::BackendUnavailable(format!("key set fetch failed: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::BackendUnavailable(format!(
                "key set endpoint returned status {}",
                status
            )));
        }
        resp.text()
            .await
            .map_err(|e| AuthError::BackendUnavailable(format!("key set read failed: {}", e)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LoadPath {
    /// Distributed cache first, origin on miss or parse failure.
    PreferCache,
    /// Straight to origin; the cached copy is as stale as ours.
    OriginOnly,
}

/// Process-wide holder of the current [`KeySet`].
pub struct KeyCache {
    current: RwLock<Option<Arc<KeySet>>>,
    reload: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    last_failure: Mutex<Option<Instant>>,
    source: Arc<dyn KeySource>,
    store: Option<Arc<dyn CacheStore>>,
    policy: RefreshPolicy,
    store_timeout: Duration,
    refreshes_total: AtomicU64,
    refresh_failures_total: AtomicU64,
    origin_fetches_total: AtomicU64,
}

impl KeyCache {
    pub fn new(
        source: Arc<dyn KeySource>,
        store: Option<Arc<dyn CacheStore>>,
        policy: RefreshPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            current: RwLock::new(None),
            reload: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            source,
            store,
            policy,
            store_timeout,
            refreshes_total: AtomicU64::new(0),
            refresh_failures_total: AtomicU64::new(0),
            origin_fetches_total: AtomicU64::new(0),
        }
    }

    /// Initial load at startup, distributed cache first.
    pub async fn load(&self) -> Result<Arc<KeySet>, AuthError> {
        let _guard = self.reload.lock().await;
        self.reload_locked(LoadPath::PreferCache).await
    }

    pub fn snapshot(&self) -> Option<Arc<KeySet>> {
        self.current.read().clone()
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Current snapshot, reloading it first when stale.
    ///
    /// Only one caller reloads a stale set; concurrent callers keep using the
    /// stale snapshot meanwhile. A failed reload is logged and the previous
    /// snapshot served. Fails only when no snapshot exists at all.
    pub async fn current(&self) -> Result<Arc<KeySet>, AuthError> {
        let now = Instant::now();
        let Some(set) = self.snapshot() else {
            let failure_seen = *self.last_failure.lock();
            let _guard = self.reload.lock().await;
            if let Some(set) = self.snapshot() {
                return Ok(set);
            }
            // waiters share the outcome of the attempt they queued behind
            let last_failure = *self.last_failure.lock();
            if last_failure != failure_seen || self.policy.backing_off(last_failure, Instant::now()) {
                return Err(AuthError::BackendUnavailable(
                    "no key set loaded; origin recently unreachable".into(),
                ));
            }
            return self.reload_locked(LoadPath::PreferCache).await;
        };
        if !self.policy.is_stale(set.loaded_at, now)
            || self.policy.backing_off(*self.last_failure.lock(), now)
        {
            return Ok(set);
        }
        let Ok(_guard) = self.reload.try_lock() else {
            return Ok(set);
        };
        // another caller may have swapped a fresh set between our read and the lock
        if let Some(latest) = self.snapshot() {
            if !self.policy.is_stale(latest.loaded_at, Instant::now()) {
                return Ok(latest);
            }
        }
        match self.reload_locked(LoadPath::PreferCache).await {
            Ok(fresh) => Ok(fresh),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    age_secs = set.age().as_secs(),
                    "key set refresh failed; continuing with last known keys"
                );
                Ok(set)
            }
        }
    }

    /// Synchronous reload after a token named a key id we do not hold.
    ///
    /// Goes straight to origin. If another caller completed a reload while we
    /// waited for the lock, that result is used instead of fetching again.
    pub async fn refresh_for_unknown_kid(&self, kid: &str) -> Result<Arc<KeySet>, AuthError> {
        let seen = self.generation.load(Ordering::Acquire);
        let _guard = self.reload.lock().await;
        if let Some(set) = self.snapshot() {
            if set.get(kid).is_some() || self.generation.load(Ordering::Acquire) != seen {
                return Ok(set);
            }
        }
        tracing::info!(kid = %kid, "unknown signing key; reloading key set from origin");
        self.reload_locked(LoadPath::OriginOnly).await
    }

    pub fn refreshes_total(&self) -> u64 {
        self.refreshes_total.load(Ordering::Relaxed)
    }

    pub fn refresh_failures_total(&self) -> u64 {
        self.refresh_failures_total.load(Ordering::Relaxed)
    }

    pub fn origin_fetches_total(&self) -> u64 {
        self.origin_fetches_total.load(Ordering::Relaxed)
    }

    // Caller must hold `self.reload`.
    async fn reload_locked(&self, path: LoadPath) -> Result<Arc<KeySet>, AuthError> {
        let result = self.fetch_set(path).await;
        match result {
            Ok(set) => {
                let set = Arc::new(set);
                *self.current.write() = Some(set.clone());
                self.generation.fetch_add(1, Ordering::AcqRel);
                *self.last_failure.lock() = None;
                self.refreshes_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(keys = set.len(), origin = ?set.origin(), "key set loaded");
                Ok(set)
            }
            Err(e) => {
                *self.last_failure.lock() = Some(Instant::now());
                self.refresh_failures_total.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn fetch_set(&self, path: LoadPath) -> Result<KeySet, AuthError> {
        if path == LoadPath::PreferCache {
            if let Some(set) = self.load_from_store().await {
                return Ok(set);
            }
        }

        self.origin_fetches_total.fetch_add(1, Ordering::Relaxed);
        let raw = match tokio::time::timeout(self.policy.fetch_timeout, self.source.fetch()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(AuthError::BackendUnavailable(format!(
                    "key set fetch timed out after {}ms",
                    self.policy.fetch_timeout.as_millis()
                )))
            }
        };
        let set = KeySet::from_jwks(&raw, KeySetOrigin::Origin)?;

        if let Some(store) = &self.store {
            let write = bounded(
                self.store_timeout,
                "set",
                store.set_with_ttl(KEYSET_CACHE_KEY, &raw, self.policy.stale_after),
            )
            .await;
            if let Err(e) = write {
                tracing::warn!(error = %e, "failed to write key set to distributed cache");
            }
        }
        Ok(set)
    }

    async fn load_from_store(&self) -> Option<KeySet> {
        let store = self.store.as_ref()?;
        match bounded(self.store_timeout, "get", store.get(KEYSET_CACHE_KEY)).await {
            Ok(Some(raw)) => match KeySet::from_jwks(&raw, KeySetOrigin::DistributedCache) {
                Ok(set) => Some(set),
                Err(e) => {
                    tracing::warn!(error = %e, "cached key set unusable; fetching from origin");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "distributed cache read failed; fetching from origin");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testutil::{jwks_for, TestKey, StaticKeySource};
    use crate::store::MemoryStore;

    fn policy(stale_ms: u64) -> RefreshPolicy {
        RefreshPolicy {
            stale_after: Duration::from_millis(stale_ms),
            fetch_timeout: Duration::from_millis(500),
            failure_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn policy_staleness_is_strictly_greater() {
        let p = policy(100);
        let t0 = Instant::now();
        assert!(!p.is_stale(t0, t0 + Duration::from_millis(100)));
        assert!(p.is_stale(t0, t0 + Duration::from_millis(101)));
    }

    #[test]
    fn policy_backoff_window() {
        let p = RefreshPolicy {
            failure_backoff: Duration::from_secs(30),
            ..RefreshPolicy::default()
        };
        let t0 = Instant::now();
        assert!(!p.backing_off(None, t0));
        assert!(p.backing_off(Some(t0), t0 + Duration::from_secs(5)));
        assert!(!p.backing_off(Some(t0), t0 + Duration::from_secs(31)));
    }

    #[test]
    fn keyset_skips_unusable_entries() {
        let key = TestKey::from_seed(1, "k1");
        let mut doc: serde_json::Value = serde_json::from_str(&jwks_for(&[&key])).unwrap();
        doc["keys"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({"kty": "oct", "kid": "hmac", "k": "c2VjcmV0"}));
        let set = KeySet::from_jwks(&doc.to_string(), KeySetOrigin::Origin).unwrap();
        assert_eq!(set.kids(), vec!["k1"]);
        assert!(set.get("hmac").is_none());
    }

    #[test]
    fn keyset_without_keys_is_rejected() {
        assert!(KeySet::from_jwks(r#"{"keys":[]}"#, KeySetOrigin::Origin).is_err());
        assert!(KeySet::from_jwks("not json", KeySetOrigin::Origin).is_err());
    }

    #[tokio::test]
    async fn load_prefers_distributed_cache() {
        let key = TestKey::from_seed(2, "cached");
        let store = Arc::new(MemoryStore::new());
        store
            .set_with_ttl(KEYSET_CACHE_KEY, &jwks_for(&[&key]), Duration::from_secs(60))
            .await
            .unwrap();
        let source = Arc::new(StaticKeySource::failing());
        let cache = KeyCache::new(source.clone(), Some(store), policy(60_000), Duration::from_secs(1));
        let set = cache.load().await.unwrap();
        assert_eq!(set.origin(), KeySetOrigin::DistributedCache);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn origin_load_writes_back_to_cache() {
        let key = TestKey::from_seed(3, "fresh");
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticKeySource::serving(jwks_for(&[&key])));
        let cache = KeyCache::new(source.clone(), Some(store.clone()), policy(60_000), Duration::from_secs(1));
        let set = cache.load().await.unwrap();
        assert_eq!(set.origin(), KeySetOrigin::Origin);
        assert_eq!(source.calls(), 1);
        assert!(store.get(KEYSET_CACHE_KEY).await.unwrap().is_some());
        let ttl = store.ttl(KEYSET_CACHE_KEY).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn corrupt_cache_entry_falls_back_to_origin() {
        let key = TestKey::from_seed(4, "k");
        let store = Arc::new(MemoryStore::new());
        store
            .set_with_ttl(KEYSET_CACHE_KEY, "{garbage", Duration::from_secs(60))
            .await
            .unwrap();
        let source = Arc::new(StaticKeySource::serving(jwks_for(&[&key])));
        let cache = KeyCache::new(source.clone(), Some(store), policy(60_000), Duration::from_secs(1));
        assert_eq!(cache.load().await.unwrap().origin(), KeySetOrigin::Origin);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn stale_refresh_failure_keeps_previous_snapshot() {
        let key = TestKey::from_seed(5, "k");
        let source = Arc::new(StaticKeySource::serving(jwks_for(&[&key])));
        let cache = KeyCache::new(source.clone(), None, policy(10), Duration::from_secs(1));
        let first = cache.load().await.unwrap();

        source.set_failing();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let served = cache.current().await.unwrap();
        assert!(Arc::ptr_eq(&first, &served));
        assert_eq!(cache.refresh_failures_total(), 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn stale_snapshot_is_replaced_not_mutated() {
        let old = TestKey::from_seed(6, "old");
        let new = TestKey::from_seed(7, "new");
        let source = Arc::new(StaticKeySource::serving(jwks_for(&[&old])));
        let cache = KeyCache::new(source.clone(), None, policy(10), Duration::from_secs(1));
        let first = cache.load().await.unwrap();

        source.serve(jwks_for(&[&new]));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = cache.current().await.unwrap();
        assert_eq!(first.kids(), vec!["old"]);
        assert_eq!(second.kids(), vec!["new"]);
    }

    #[tokio::test]
    async fn fetch_timeout_is_bounded() {
        let source = Arc::new(StaticKeySource::slow(Duration::from_secs(5)));
        let cache = KeyCache::new(
            source,
            None,
            RefreshPolicy {
                fetch_timeout: Duration::from_millis(50),
                ..policy(60_000)
            },
            Duration::from_secs(1),
        );
        let started = Instant::now();
        assert!(matches!(cache.load().await, Err(AuthError::BackendUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(cache.snapshot().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_without_snapshot_share_one_failed_fetch() {
        let source = Arc::new(StaticKeySource::slow(Duration::from_secs(5)));
        let cache = Arc::new(KeyCache::new(
            source.clone(),
            None,
            RefreshPolicy {
                stale_after: Duration::from_secs(60),
                fetch_timeout: Duration::from_millis(200),
                failure_backoff: Duration::from_secs(30),
            },
            Duration::from_secs(1),
        ));

        let started = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.current().await }));
        }
        for t in tasks {
            assert!(matches!(t.await.unwrap(), Err(AuthError::BackendUnavailable(_))));
        }
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(cache.origin_fetches_total(), 1);
        assert_eq!(source.calls(), 1);

        // still backing off: no new origin fetch
        assert!(cache.current().await.is_err());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn missing_snapshot_retries_after_backoff() {
        let key = TestKey::from_seed(9, "k");
        let source = Arc::new(StaticKeySource::failing());
        let cache = KeyCache::new(
            source.clone(),
            None,
            RefreshPolicy {
                failure_backoff: Duration::from_millis(50),
                ..policy(60_000)
            },
            Duration::from_secs(1),
        );
        assert!(cache.load().await.is_err());
        source.serve(jwks_for(&[&key]));
        assert!(cache.current().await.is_err());
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.current().await.unwrap().kids(), vec!["k"]);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn cancelled_reload_leaves_snapshot_intact() {
        let key = TestKey::from_seed(8, "k");
        let source = Arc::new(StaticKeySource::serving(jwks_for(&[&key])));
        let cache = Arc::new(KeyCache::new(source.clone(), None, policy(60_000), Duration::from_secs(1)));
        let first = cache.load().await.unwrap();

        source.set_slow(Duration::from_secs(5));
        let task = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.refresh_for_unknown_kid("other").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let _ = task.await;
        assert!(Arc::ptr_eq(&first, &cache.snapshot().unwrap()));
    }
}
