use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CacheStore, StoreError};

#[derive(Clone, Debug)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process [`CacheStore`] backed by a sharded map.
///
/// Expired entries are dropped lazily when touched and during
/// `delete_prefix` scans. Used when no remote cache is configured; counters
/// are then per process.
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| s.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let hit = self
            .slots
            .get(key)
            .map(|slot| (slot.live(now), slot.value.clone()));
        match hit {
            Some((true, value)) => Ok(Some(value)),
            Some((false, _)) => {
                self.slots.remove_if(key, |_, slot| !slot.live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if !slot.live(now) {
                    *slot = Slot {
                        value: "1".into(),
                        expires_at: None,
                    };
                    return Ok(1);
                }
                let current: u64 = slot.value.parse().map_err(|_| {
                    StoreError::Protocol(format!("value at '{}' is not an integer", key))
                })?;
                let next = current + 1;
                slot.value = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: "1".into(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.slots.get_mut(key) {
            Some(mut slot) if slot.live(now) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        Ok(self.slots.get(key).and_then(|slot| match slot.expires_at {
            Some(at) if at > now => Some(at - now),
            _ => None,
        }))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut removed = 0u64;
        self.slots.retain(|key, slot| {
            if !slot.live(now) {
                return false;
            }
            if key.starts_with(prefix) {
                removed += 1;
                return false;
            }
            true
        });
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_creates_then_counts() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn incr_keeps_existing_expiry() {
        let store = MemoryStore::new();
        store.incr("c").await.unwrap();
        assert!(store.expire("c", Duration::from_secs(60)).await.unwrap());
        store.incr("c").await.unwrap();
        let ttl = store.ttl("c").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn expired_entries_read_as_missing() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
        // an expired counter restarts from one
        store.incr("n").await.unwrap();
        store.expire("n", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.incr("n").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expire_on_missing_key_is_false() {
        let store = MemoryStore::new();
        assert!(!store.expire("nope", Duration::from_secs(1)).await.unwrap());
        assert!(store.ttl("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_prefix_counts_only_matching_keys() {
        let store = MemoryStore::new();
        store.incr("rate-limit:a:save:d1").await.unwrap();
        store.incr("rate-limit:a:query:d1").await.unwrap();
        store.incr("rate-limit:ab:query:d1").await.unwrap();
        assert_eq!(store.delete_prefix("rate-limit:a:").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn non_integer_value_rejects_incr() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "text", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(
            store.incr("k").await,
            Err(StoreError::Protocol(_))
        ));
    }
}
