use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::trace;

use crate::codec::BinaryCodec;
use crate::error::GridError;
use crate::plan::{EvictionPolicy, MapPolicy, MaxSizePolicy};

#[derive(Clone)]
/// A named cache map with the eviction/TTL policy configured at bootstrap.
///
/// Handles are cheap to clone and share the underlying entries.
pub struct GridMap {
    inner: Arc<GridMapInner>,
}

struct GridMapInner {
    name: String,
    policy: MapPolicy,
    entries: RwLock<HashMap<String, MapEntry>>,
}

struct MapEntry {
    value: Vec<u8>,
    touched: Instant,
    expires_at: Option<Instant>,
}

impl MapEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl GridMap {
    pub(crate) fn new(name: impl Into<String>, policy: MapPolicy) -> Self {
        Self {
            inner: Arc::new(GridMapInner {
                name: name.into(),
                policy,
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> &MapPolicy {
        &self.inner.policy
    }

    /// Inserts a value, applying the map's TTL and evicting the
    /// least-recently-used entry if the per-node size bound is hit.
    pub fn insert(&self, key: impl Into<String>, value: Vec<u8>) {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.inner.entries.write();

        if let MaxSizePolicy::PerNodeEntries(cap) = self.inner.policy.max_size {
            if !entries.contains_key(&key) && entries.len() >= cap {
                self.evict_one(&mut entries, now);
            }
        }

        let expires_at = self.inner.policy.ttl.map(|ttl| now + ttl);
        entries.insert(
            key,
            MapEntry {
                value,
                touched: now,
                expires_at,
            },
        );
    }

    /// Looks a value up, refreshing its recency. Expired entries are dropped
    /// lazily on access.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();

        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            return None;
        }

        entries.get_mut(key).map(|entry| {
            entry.touched = now;
            entry.value.clone()
        })
    }

    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.entries.write().remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a value through a registered codec.
    pub fn insert_with<T>(&self, codec: &dyn BinaryCodec<T>, key: impl Into<String>, value: &T) {
        self.insert(key, codec.encode(value));
    }

    /// Looks up and decodes a value through a registered codec.
    pub fn get_with<T>(
        &self,
        codec: &dyn BinaryCodec<T>,
        key: &str,
    ) -> Result<Option<T>, GridError> {
        self.get(key).map(|bytes| codec.decode(&bytes)).transpose()
    }

    fn evict_one(&self, entries: &mut HashMap<String, MapEntry>, now: Instant) {
        // Expired entries go first; otherwise the least recently used.
        let victim = entries
            .iter()
            .find(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .or_else(|| {
                if self.inner.policy.eviction != EvictionPolicy::Lru {
                    return None;
                }
                entries
                    .iter()
                    .min_by_key(|(_, e)| e.touched)
                    .map(|(k, _)| k.clone())
            });

        if let Some(key) = victim {
            trace!(map = %self.inner.name, key = %key, "Evicting map entry.");
            entries.remove(&key);
        }
    }
}
