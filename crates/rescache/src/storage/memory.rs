//! In-memory storage: a bounded LRU with a bidirectional key↔reference
//! index supporting exact-set, multi-reference, and wildcard invalidation.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{dedup_sorted, diff_references, sorted_insert, sorted_remove, wildcard_match, Backend};
use crate::time::Clock;

/// Default capacity when [`MemoryOptions::default`] is used.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Configuration for [`MemoryStorage`].
#[derive(Clone)]
pub struct MemoryOptions {
    /// Maximum number of live entries before LRU eviction kicks in.
    pub size: usize,
    /// Whether this backend tracks references for tag-based invalidation.
    /// When `false`, `set` ignores `references` (and logs a warning) and
    /// `invalidate` always returns an empty set.
    pub invalidation: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_CAPACITY,
            invalidation: true,
        }
    }
}

struct Entry {
    value: Value,
    ttl_secs: i64,
    inserted_at_secs: u64,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.inserted_at_secs.saturating_add(self.ttl_secs.max(0) as u64) <= now
    }
}

struct Inner {
    entries: LruCache<String, Entry>,
    reference_to_keys: HashMap<String, Vec<String>>,
    key_to_references: HashMap<String, Vec<String>>,
}

/// Bounded in-memory cache backend with LRU eviction and a tag index.
pub struct MemoryStorage {
    options: MemoryOptions,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    /// Create a new memory storage with the given options and clock.
    ///
    /// # Panics
    ///
    /// Panics if `options.size` is zero.
    #[must_use]
    pub fn new(options: MemoryOptions, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(options.size.max(1)).unwrap_or_else(|| {
            // `max(1)` above makes this unreachable; kept for clarity over a panic.
            NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN)
        });
        Self {
            options,
            clock,
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                reference_to_keys: HashMap::new(),
                key_to_references: HashMap::new(),
            }),
        }
    }

    /// Number of live entries, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the backend currently holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Detach `key` from every reference it holds, removing empty reference
/// lists from the index (the invariant in spec §3: `k ∈ refToKeys[r] ⇔ r ∈
/// keyToRefs[k]`, with empty lists removed from the mapping).
fn detach(inner: &mut Inner, key: &str) {
    let Some(refs) = inner.key_to_references.remove(key) else {
        return;
    };
    for r in refs {
        if let Some(keys) = inner.reference_to_keys.get_mut(&r) {
            sorted_remove(keys, key);
            if keys.is_empty() {
                inner.reference_to_keys.remove(&r);
            }
        }
    }
}

fn attach(inner: &mut Inner, key: &str, references: Vec<String>) {
    let previous = inner
        .key_to_references
        .get(key)
        .cloned()
        .unwrap_or_default();
    let next = dedup_sorted(&references);
    let (to_remove, to_add) = diff_references(&previous, &next);

    for r in &to_remove {
        if let Some(keys) = inner.reference_to_keys.get_mut(r) {
            sorted_remove(keys, key);
            if keys.is_empty() {
                inner.reference_to_keys.remove(r);
            }
        }
    }
    for r in &to_add {
        let keys = inner.reference_to_keys.entry(r.clone()).or_default();
        sorted_insert(keys, key.to_string());
    }

    if next.is_empty() {
        inner.key_to_references.remove(key);
    } else {
        inner.key_to_references.insert(key.to_string(), next);
    }
}

#[async_trait]
impl Backend for MemoryStorage {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_secs();
        let mut inner = self.inner.lock().await;
        let expired = match inner.entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => return None,
        };
        if expired {
            inner.entries.pop(key);
            detach(&mut inner, key);
            return None;
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: i64, references: Option<Vec<String>>) {
        if ttl_secs < 1 {
            return;
        }
        if !self.options.invalidation && references.as_ref().is_some_and(|r| !r.is_empty()) {
            tracing::warn!(key = %key, "invalidation disabled on this storage; ignoring references");
        }

        let now = self.clock.now_secs();
        let mut inner = self.inner.lock().await;

        if let Some((evicted_key, _)) = inner.entries.push(
            key.to_string(),
            Entry {
                value,
                ttl_secs,
                inserted_at_secs: now,
            },
        ) {
            if evicted_key != key {
                detach(&mut inner, &evicted_key);
                debug!(evicted = %evicted_key, "memory storage evicted LRU entry");
            }
        }

        if self.options.invalidation {
            if let Some(refs) = references {
                if !refs.is_empty() {
                    attach(&mut inner, key, refs);
                }
            }
        }
    }

    async fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.pop(key).is_some();
        if removed {
            detach(&mut inner, key);
        }
        removed
    }

    async fn invalidate(&self, references: &[String]) -> Vec<String> {
        if !self.options.invalidation || references.is_empty() {
            return Vec::new();
        }

        let mut inner = self.inner.lock().await;
        let mut matched_refs: Vec<String> = Vec::new();
        for pattern in references {
            if pattern.contains('*') {
                for r in inner.reference_to_keys.keys() {
                    if wildcard_match(pattern, r) {
                        matched_refs.push(r.clone());
                    }
                }
            } else if inner.reference_to_keys.contains_key(pattern) {
                matched_refs.push(pattern.clone());
            }
        }
        matched_refs.sort_unstable();
        matched_refs.dedup();

        let mut removed_keys: Vec<String> = Vec::new();
        for r in &matched_refs {
            let Some(keys) = inner.reference_to_keys.remove(r) else {
                continue;
            };
            for key in keys {
                if inner.entries.pop(&key).is_some() {
                    removed_keys.push(key.clone());
                }
                detach(&mut inner, &key);
            }
        }
        removed_keys.sort_unstable();
        removed_keys.dedup();
        removed_keys
    }

    async fn clear(&self, prefix: Option<&str>) {
        let mut inner = self.inner.lock().await;
        match prefix {
            None => {
                inner.entries.clear();
                inner.reference_to_keys.clear();
                inner.key_to_references.clear();
            }
            Some(prefix) => {
                let keys: Vec<String> = inner
                    .entries
                    .iter()
                    .map(|(k, _)| k.clone())
                    .filter(|k| k.starts_with(prefix))
                    .collect();
                for key in keys {
                    inner.entries.pop(&key);
                    detach(&mut inner, &key);
                }
            }
        }
    }

    async fn get_ttl(&self, key: &str) -> u64 {
        let now = self.clock.now_secs();
        let inner = self.inner.lock().await;
        let Some(entry) = inner.entries.peek(key) else {
            return 0;
        };
        if entry.is_expired(now) {
            return 0;
        }
        let expires_at = entry.inserted_at_secs.saturating_add(entry.ttl_secs.max(0) as u64);
        expires_at.saturating_sub(now)
    }

    async fn refresh(&self) {
        let mut inner = self.inner.lock().await;
        let capacity = inner.entries.cap();
        inner.entries = LruCache::new(capacity);
        inner.reference_to_keys.clear();
        inner.key_to_references.clear();
    }
}
