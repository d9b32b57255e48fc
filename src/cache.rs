use core::marker::PhantomData;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{FlagWithMeta, Host};

/// How an entry's expiry window is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpiryPolicy {
    /// Window fixed at put time.
    Absolute,
    /// Window re-anchored to `now` on every successful read.
    Sliding,
    /// Longer windows for values that have not changed in a while.
    Adaptive,
}

/// Freshness of a cache hit. Expired entries are a miss, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Fresh,
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: i64,
    pub expires_at: i64,
    pub stale_at: i64,
    pub access_count: u64,
    pub last_accessed_at: i64,
    pub policy: ExpiryPolicy,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_ms: i64,
    pub min_ttl_ms: i64,
    pub max_ttl_ms: i64,
    pub stale_ttl_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: 1000,
            default_ttl_ms: 300_000,
            min_ttl_ms: 1_000,
            max_ttl_ms: 86_400_000,
            stale_ttl_ms: 60_000,
        }
    }
}

/// Counter snapshot. `hit_rate` counts stale hits as misses of the fresh
/// window, not of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Bounded key→entry cache with TTL, a stale-while-revalidate window and
/// approximate-LRU eviction. Owns copies of the stored values; store and
/// cache lifetimes are independent.
#[derive(Debug)]
pub struct FlagCache<H: Host> {
    entries: RwLock<HashMap<String, CacheEntry<FlagWithMeta>>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    evictions: AtomicU64,
    host: PhantomData<H>,
}

impl<H: Host> FlagCache<H> {
    pub fn new(config: CacheConfig) -> FlagCache<H> {
        FlagCache {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            host: PhantomData,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Inserts or overwrites, evicting the coldest tenth first when at
    /// capacity. `last_changed` feeds the adaptive policy: values that have
    /// not changed recently earn longer windows.
    pub fn put(
        &self,
        key: &str,
        value: FlagWithMeta,
        policy: ExpiryPolicy,
        last_changed: Option<i64>,
    ) {
        let now = H::now_millis();
        let (expires_at, stale_at) = self.window(policy, now, last_changed);
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if !entries.contains_key(key) && entries.len() >= self.config.max_size {
            let evicted = Self::evict_coldest(&mut entries, self.config.max_size);
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                cached_at: now,
                expires_at,
                stale_at,
                access_count: 0,
                last_accessed_at: now,
                policy,
            },
        );
    }

    /// Returns the value and its freshness, or `None` on miss or when the
    /// stale window has passed. Reads bump the entry's access bookkeeping;
    /// sliding entries get their windows re-anchored.
    pub fn get(&self, key: &str) -> Option<(FlagWithMeta, CacheState)> {
        let now = H::now_millis();
        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        let Some(entry) = entries.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if now >= entry.stale_at {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let state = if now < entry.expires_at {
            CacheState::Fresh
        } else {
            CacheState::Stale
        };
        entry.access_count += 1;
        entry.last_accessed_at = now;
        if entry.policy == ExpiryPolicy::Sliding {
            entry.expires_at = now + self.config.default_ttl_ms;
            entry.stale_at = entry.expires_at + self.config.stale_ttl_ms;
        }
        match state {
            CacheState::Fresh => self.hits.fetch_add(1, Ordering::Relaxed),
            CacheState::Stale => self.stale_hits.fetch_add(1, Ordering::Relaxed),
        };
        Some((entry.value.clone(), state))
    }

    /// Like `get` but a stale entry is treated as a miss.
    pub fn get_fresh(&self, key: &str) -> Option<FlagWithMeta> {
        let now = H::now_millis();
        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        let Some(entry) = entries.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if now >= entry.expires_at {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        entry.access_count += 1;
        entry.last_accessed_at = now;
        if entry.policy == ExpiryPolicy::Sliding {
            entry.expires_at = now + self.config.default_ttl_ms;
            entry.stale_at = entry.expires_at + self.config.stale_ttl_ms;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub fn get_with_stale(&self, key: &str) -> Option<(FlagWithMeta, bool)> {
        self.get(key)
            .map(|(value, state)| (value, state == CacheState::Stale))
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Drops every entry whose stale window has passed.
    pub fn purge_expired(&self) -> u32 {
        let now = H::now_millis();
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| now < entry.stale_at);
        (before - entries.len()) as u32
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn size(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.size(),
        }
    }

    fn window(&self, policy: ExpiryPolicy, now: i64, last_changed: Option<i64>) -> (i64, i64) {
        let ttl = match policy {
            ExpiryPolicy::Absolute | ExpiryPolicy::Sliding => self.config.default_ttl_ms,
            ExpiryPolicy::Adaptive => {
                let stability = match last_changed {
                    Some(changed) => {
                        ((now - changed) as f64 / self.config.default_ttl_ms as f64).clamp(0.0, 10.0)
                    }
                    None => 1.0,
                };
                let scaled = self.config.default_ttl_ms as f64 * (1.0 + stability);
                scaled.clamp(self.config.min_ttl_ms as f64, self.config.max_ttl_ms as f64) as i64
            }
        };
        let expires_at = now + ttl;
        (expires_at, expires_at + self.config.stale_ttl_ms)
    }

    /// Approximate LRU: removes the ⌊max_size/10⌋ (at least one) entries
    /// with the oldest `last_accessed_at`.
    fn evict_coldest(
        entries: &mut HashMap<String, CacheEntry<FlagWithMeta>>,
        max_size: usize,
    ) -> u64 {
        let batch = (max_size / 10).max(1);
        let mut by_age: Vec<(i64, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.last_accessed_at, key.clone()))
            .collect();
        by_age.sort();
        let victims: Vec<String> = by_age.into_iter().take(batch).map(|(_, key)| key).collect();
        for key in &victims {
            entries.remove(key);
        }
        victims.len() as u64
    }
}
