use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Keyed cache with lazy TTL expiry
///
/// Entries are only evicted when a read finds them stale; there is no
/// background sweep. Concurrent writers to the same key are last-write-wins.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CachedEntry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a fresh value, evicting it if its age reached the TTL
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            drop(entry); // Release read lock before removing
            self.entries.remove(key);
            return None;
        }

        Some(entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            CachedEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Insert unless `keep_existing` says the current (fresh) entry wins.
    /// Returns true when the new value was stored.
    pub fn insert_if<F>(&self, key: K, value: V, keep_existing: F) -> bool
    where
        F: FnOnce(&V, &V) -> bool,
    {
        let ttl = self.ttl;
        let mut stored = true;
        self.entries
            .entry(key)
            .and_modify(|entry| {
                if entry.inserted_at.elapsed() < ttl && keep_existing(&entry.value, &value) {
                    stored = false;
                } else {
                    entry.value = value.clone();
                    entry.inserted_at = Instant::now();
                }
            })
            .or_insert_with(|| CachedEntry {
                value: value.clone(),
                inserted_at: Instant::now(),
            });
        stored
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, stale ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
