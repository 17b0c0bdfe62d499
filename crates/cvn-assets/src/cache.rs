// SPDX-License-Identifier: MIT OR Apache-2.0
//! LRU cache of parsed sidecar documents, with pinning.

use std::collections::HashMap;
use std::sync::Mutex;

/// Default cache capacity before the registry starts evicting on insert.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

struct Entry {
    value: serde_json::Value,
    /// Monotonic touch stamp; lowest is least recently used.
    touched: u64,
    pinned: bool,
}

/// Thread-safe LRU of parsed sidecars keyed by uid.
pub struct SidecarCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    clock: u64,
}

impl SidecarCache {
    /// Cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Fetch, refreshing recency.
    pub fn get(&self, uid: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock().expect("sidecar cache lock");
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(uid)?;
        entry.touched = clock;
        Some(entry.value.clone())
    }

    /// Insert or replace, evicting the LRU unpinned entry when full.
    pub fn put(&self, uid: &str, value: serde_json::Value) {
        let mut inner = self.inner.lock().expect("sidecar cache lock");
        inner.clock += 1;
        let clock = inner.clock;
        if !inner.entries.contains_key(uid) && inner.entries.len() >= self.capacity {
            if let Some(victim) = inner
                .entries
                .iter()
                .filter(|(_, e)| !e.pinned)
                .min_by_key(|(_, e)| e.touched)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&victim);
            }
        }
        inner.entries.insert(
            uid.to_string(),
            Entry {
                value,
                touched: clock,
                pinned: false,
            },
        );
    }

    /// Pin or unpin an entry; pinned entries survive eviction.
    pub fn set_pinned(&self, uid: &str, pinned: bool) {
        let mut inner = self.inner.lock().expect("sidecar cache lock");
        if let Some(e) = inner.entries.get_mut(uid) {
            e.pinned = pinned;
        }
    }

    /// Drop an entry outright (asset removed).
    pub fn invalidate(&self, uid: &str) {
        self.inner
            .lock()
            .expect("sidecar cache lock")
            .entries
            .remove(uid);
    }

    /// Evict up to `max` unpinned entries by LRU; returns how many went.
    pub fn evict_lru(&self, max: usize) -> usize {
        let mut inner = self.inner.lock().expect("sidecar cache lock");
        let mut victims: Vec<(String, u64)> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned)
            .map(|(k, e)| (k.clone(), e.touched))
            .collect();
        victims.sort_by_key(|(_, touched)| *touched);
        victims.truncate(max);
        for (k, _) in &victims {
            inner.entries.remove(k);
        }
        victims.len()
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("sidecar cache lock").entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SidecarCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
