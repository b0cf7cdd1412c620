//! Sharded In-Memory Store
//!
//! The store splits the key space across many independently locked
//! shards so concurrent request handlers rarely contend on the same
//! lock. Keys route to shards by FNV-1a, the same hash the routing
//! ring uses, so a key's shard is a pure function of its bytes.
//!
//! Expiry is two-tier:
//! 1. **Lazy**: a read that finds an expired item upgrades to the
//!    write lock, re-checks, and deletes it.
//! 2. **Active**: the background sweeper walks a window of shards per
//!    tick and removes what reads never touch.

use crate::hash::fnv1a32;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Number of shards. Large enough that even a hot multi-core server
/// spreads its writes thin.
pub const SHARD_COUNT: usize = 256;

/// A stored value with an optional absolute expiry deadline.
///
/// `expires_at == None` means the item never expires.
#[derive(Debug, Clone)]
pub struct Item {
    pub value: Bytes,
    pub expires_at: Option<Instant>,
}

impl Item {
    fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    /// True once the deadline has passed. Items without a deadline
    /// never report expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct Shard {
    data: RwLock<HashMap<String, Item>>,
}

/// The sharded store at the heart of every storage node.
///
/// Designed to sit in an `Arc` shared by all connection handlers, the
/// AOF replayer, and the sweeper. All operations are thread-safe; no
/// lock is ever held across I/O or across shards.
pub struct ShardedStore {
    shards: Vec<Shard>,

    // Operation counters, approximate under relaxed ordering.
    key_count: AtomicU64,
    set_count: AtomicU64,
    get_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

/// Point-in-time snapshot of the store's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub keys: u64,
    pub sets: u64,
    pub gets: u64,
    pub dels: u64,
    pub expired: u64,
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("shards", &self.shards.len())
            .field("keys", &self.key_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ShardedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
            key_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(key: &str) -> usize {
        fnv1a32(key.as_bytes()) as usize % SHARD_COUNT
    }

    #[inline]
    fn shard(&self, key: &str) -> &Shard {
        &self.shards[Self::shard_index(key)]
    }

    /// Inserts or overwrites a key. `ttl = None` means never expires.
    pub fn set(&self, key: String, value: Bytes, ttl: Option<Duration>) {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(&key);
        let mut data = shard.data.write().unwrap();

        if data.insert(key, Item::new(value, ttl)).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Looks up a key, deleting it on the way out if it has expired.
    ///
    /// The fast path holds only the read lock. When the item looks
    /// expired, the lock is upgraded and the check repeats: another
    /// writer may have deleted the key or overwritten it with a fresh
    /// deadline in the gap between the two locks.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(key);
        {
            let data = shard.data.read().unwrap();
            match data.get(key) {
                Some(item) if !item.is_expired() => return Some(item.value.clone()),
                Some(_) => {} // expired, fall through to the write path
                None => return None,
            }
        }

        let mut data = shard.data.write().unwrap();
        match data.get(key) {
            Some(item) if item.is_expired() => {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            // Rewritten with a future deadline while we waited.
            Some(item) => Some(item.value.clone()),
            None => None,
        }
    }

    /// Deletes a key unconditionally. Returns whether it was present.
    pub fn del(&self, key: &str) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(key);
        let mut data = shard.data.write().unwrap();

        if data.remove(key).is_some() {
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// True if the key exists and has not expired. Does not reclaim.
    pub fn contains(&self, key: &str) -> bool {
        let shard = self.shard(key);
        let data = shard.data.read().unwrap();
        data.get(key).map(|i| !i.is_expired()).unwrap_or(false)
    }

    /// Approximate number of live keys.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.key_count.load(Ordering::Relaxed),
            sets: self.set_count.load(Ordering::Relaxed),
            gets: self.get_count.load(Ordering::Relaxed),
            dels: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired items from `count` shards starting at shard
    /// `start` (wrapping). Returns how many items were reclaimed.
    ///
    /// Each shard is handled in two passes: collect candidates under
    /// the read lock, then re-verify each under the write lock before
    /// deleting, since a writer may have refreshed the key in between.
    /// No lock is held across shards.
    pub fn cleanup_expired(&self, start: usize, count: usize) -> u64 {
        let mut reclaimed = 0u64;

        for offset in 0..count.min(SHARD_COUNT) {
            let shard = &self.shards[(start + offset) % SHARD_COUNT];

            let candidates: Vec<String> = {
                let data = shard.data.read().unwrap();
                data.iter()
                    .filter(|(_, item)| item.is_expired())
                    .map(|(key, _)| key.clone())
                    .collect()
            };

            if candidates.is_empty() {
                continue;
            }

            let mut data = shard.data.write().unwrap();
            for key in candidates {
                if data.get(&key).map(Item::is_expired).unwrap_or(false) {
                    data.remove(&key);
                    reclaimed += 1;
                }
            }
        }

        if reclaimed > 0 {
            self.key_count.fetch_sub(reclaimed, Ordering::Relaxed);
            self.expired_count.fetch_add(reclaimed, Ordering::Relaxed);
        }
        reclaimed
    }

    /// Sweeps every shard once. Used by tests and on-demand cleanup.
    pub fn cleanup_all(&self) -> u64 {
        self.cleanup_expired(0, SHARD_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn set_get_del_round_trip() {
        let store = ShardedStore::new();

        store.set("a".into(), b("1"), None);
        assert_eq!(store.get("a"), Some(b("1")));

        assert!(store.del("a"));
        assert_eq!(store.get("a"), None);
        assert!(!store.del("a"));
    }

    #[test]
    fn set_overwrites_in_place() {
        let store = ShardedStore::new();

        store.set("k".into(), b("v1"), None);
        store.set("k".into(), b("v2"), None);

        assert_eq!(store.get("k"), Some(b("v2")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_key_is_invisible_and_reclaimed_lazily() {
        let store = ShardedStore::new();

        store.set("k".into(), b("v"), Some(Duration::from_millis(20)));
        assert_eq!(store.get("k"), Some(b("v")));

        thread::sleep(Duration::from_millis(40));

        // The read itself deletes the expired item.
        assert_eq!(store.get("k"), None);
        assert_eq!(store.len(), 0);
        assert_eq!(store.stats().expired, 1);
    }

    #[test]
    fn rewrite_during_expiry_wins() {
        let store = ShardedStore::new();

        store.set("k".into(), b("old"), Some(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(20));

        // Overwrite with a live item; the next get must see it.
        store.set("k".into(), b("new"), None);
        assert_eq!(store.get("k"), Some(b("new")));
    }

    #[test]
    fn cleanup_reclaims_untouched_expired_keys() {
        let store = ShardedStore::new();

        for i in 0..50 {
            store.set(format!("tmp{i}"), b("x"), Some(Duration::from_millis(10)));
        }
        store.set("keep".into(), b("y"), None);
        thread::sleep(Duration::from_millis(30));

        let reclaimed = store.cleanup_all();
        assert_eq!(reclaimed, 50);
        assert_eq!(store.len(), 1);
        assert!(store.contains("keep"));
    }

    #[test]
    fn cleanup_window_is_bounded() {
        let store = ShardedStore::new();

        store.set("k".into(), b("v"), Some(Duration::from_millis(5)));
        thread::sleep(Duration::from_millis(15));

        let shard = ShardedStore::shard_index("k");
        // A window that excludes the key's shard must not touch it.
        let missed = store.cleanup_expired(shard + 1, 1);
        assert_eq!(missed, 0);

        // A window that covers it reclaims it.
        let hit = store.cleanup_expired(shard, 1);
        assert_eq!(hit, 1);
    }

    #[test]
    fn concurrent_writers_converge() {
        let store = Arc::new(ShardedStore::new());
        let mut handles = Vec::new();

        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    store.set(format!("key{}", i % 50), b(&format!("t{t}")), None);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // 50 distinct keys regardless of interleaving.
        assert_eq!(store.len(), 50);
        for i in 0..50 {
            assert!(store.get(&format!("key{i}")).is_some());
        }
    }
}
