//! TTL cache of resolved permissions keyed by identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::ResolvedPermissions;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Clone)]
pub struct PermissionCache {
    ttl: Duration,
    max_entries: usize,
    inner: Arc<DashMap<String, CachedPermissions>>,
    /// Bumped by every invalidation.
    generation: Arc<AtomicU64>,
}

#[derive(Clone)]
struct CachedPermissions {
    inserted_at: Instant,
    value: ResolvedPermissions,
}

impl PermissionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            inner: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expired entries are removed and reported as missing.
    pub fn get(&self, key: &str) -> Option<ResolvedPermissions> {
        let expired = match self.inner.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.inner.remove(key);
        }
        None
    }

    pub fn insert(&self, key: &str, value: ResolvedPermissions) {
        self.make_room(key);
        self.inner.insert(
            key.to_string(),
            CachedPermissions {
                inserted_at: Instant::now(),
                value,
            },
        );
    }

    /// Current invalidation generation. Capture it before reading the role
    /// store and hand it to [`insert_if_current`](Self::insert_if_current).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Insert unless an invalidation happened since `generation` was read.
    ///
    /// The generation is compared while the key's shard is locked, so an
    /// invalidation racing with this call either makes it a no-op or removes
    /// the entry it wrote.
    pub fn insert_if_current(&self, key: &str, value: ResolvedPermissions, generation: u64) -> bool {
        self.make_room(key);
        let entry = self.inner.entry(key.to_string());
        if self.generation() != generation {
            return false;
        }
        entry.insert(CachedPermissions {
            inserted_at: Instant::now(),
            value,
        });
        true
    }

    pub fn invalidate(&self, key: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.clear();
    }

    fn make_room(&self, key: &str) {
        if self.max_entries > 0
            && self.inner.len() >= self.max_entries
            && !self.inner.contains_key(key)
        {
            self.inner.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}
