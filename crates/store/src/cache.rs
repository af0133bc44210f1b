//! In-process cache primitives shared by the content, memory and index layers
//!
//! Recency is tracked purely by access order: a hit moves the entry to the
//! front, and overflowing the configured capacity drops the oldest fifth in
//! one sweep rather than one entry per insert.

use lru::LruCache;
use serde::Serialize;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Immutable snapshot of a value's canonical serialization
///
/// Captured once at the write boundary. Callers may keep mutating the value
/// they handed in, so equality checks compare snapshots, never live values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Arc<str>);

impl Fingerprint {
    /// Serialize `value` canonically and snapshot the result
    pub fn of<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_string(value).map(Self::from_serialized)
    }

    /// Wrap an already-canonical serialization (e.g. a persisted record)
    pub fn from_serialized(serialized: impl Into<Arc<str>>) -> Self {
        Self(serialized.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A cached value paired with the fingerprint it was cached under
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fingerprint: Fingerprint,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, fingerprint: Fingerprint) -> Self {
        Self { value, fingerprint }
    }
}

/// Number of entries dropped when a cache of `capacity` overflows
pub(crate) fn eviction_batch(capacity: usize) -> usize {
    capacity.div_ceil(5).max(1)
}

/// LRU map that sheds its oldest 20% once it grows past capacity
pub struct BoundedLru<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V> BoundedLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { inner: LruCache::unbounded(), capacity: capacity.max(1) }
    }

    /// Look up and promote to most-recently-used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Look up mutably and promote to most-recently-used
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    /// Look up mutably without touching recency
    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.peek_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Insert as most-recently-used, returning whatever was evicted
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        self.inner.put(key, value);

        let mut evicted = Vec::new();
        if self.inner.len() > self.capacity {
            for _ in 0..eviction_batch(self.capacity) {
                match self.inner.pop_lru() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    /// Remove every entry whose key matches `pred`
    pub fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize
    where
        K: Clone,
    {
        let doomed: Vec<K> = self.inner.iter().filter(|(k, _)| pred(k)).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            self.inner.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

/// Insertion-ordered cache whose entries expire after a fixed TTL
///
/// Reads do not refresh an entry; overflow evicts the oldest insert first.
pub struct TtlCache<K: Hash + Eq, V> {
    inner: LruCache<K, (V, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Hash + Eq, V> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { inner: LruCache::unbounded(), capacity: capacity.max(1), ttl }
    }

    /// Fresh value for `key`, dropping it if expired
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let expired = match self.inner.peek(key) {
            Some((_, inserted_at)) => inserted_at.elapsed() >= self.ttl,
            None => return None,
        };

        if expired {
            self.inner.pop(key);
            return None;
        }

        self.inner.peek(key).map(|(value, _)| value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.inner.put(key, (value, Instant::now()));
        while self.inner.len() > self.capacity {
            if self.inner.pop_lru().is_none() {
                break;
            }
        }
    }

    /// Remove every entry whose key matches `pred`
    pub fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> usize
    where
        K: Clone,
    {
        let doomed: Vec<K> = self.inner.iter().filter(|(k, _)| pred(k)).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            self.inner.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
