//! Byte-bounded cache with a SIEVE replacement policy.
//!
//! Entries keep a "visited" bit set on read and cleared by the eviction hand,
//! which sweeps in insertion order from the oldest entry toward the newest and
//! evicts the first entry whose bit is already clear. One sweep over a scan's
//! leftovers evicts them before anything the workload actually re-reads.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Values carry their own size estimate toward the byte capacity.
pub trait MemSized {
    fn approx_mem_usage(&self) -> u64;
}

/// Observer for cache events. Implementations must be cheap; hooks run after
/// the cache lock is released.
pub trait SieveStatusHook: Send + Sync {
    fn on_hit(&self) {}
    fn on_miss(&self) {}
    fn on_evict(&self, _bytes: u64) {}
}

struct NoopStatusHook;

impl SieveStatusHook for NoopStatusHook {}

struct Node<K, V> {
    value: V,
    size: u64,
    visited: bool,
    /// Toward the most recent insertion.
    newer: Option<K>,
    /// Toward the oldest insertion.
    older: Option<K>,
}

struct Inner<K, V> {
    entries: HashMap<K, Node<K, V>>,
    /// Most recent insertion.
    head: Option<K>,
    /// Oldest insertion; the hand starts here.
    tail: Option<K>,
    /// Eviction hand, sweeping from tail toward head.
    hand: Option<K>,
    used: u64,
}

/// Size-bounded concurrent map with SIEVE replacement.
pub struct Sieve<K, V> {
    capacity: AtomicU64,
    inner: Mutex<Inner<K, V>>,
    hook: RwLock<Arc<dyn SieveStatusHook>>,
}

impl<K, V> Sieve<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + MemSized,
{
    pub fn new(capacity: u64) -> Self {
        Sieve {
            capacity: AtomicU64::new(capacity),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                head: None,
                tail: None,
                hand: None,
                used: 0,
            }),
            hook: RwLock::new(Arc::new(NoopStatusHook)),
        }
    }

    /// Replace the status observer.
    pub fn set_status_hook(&self, hook: Arc<dyn SieveStatusHook>) {
        *self.hook.write() = hook;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently accounted against the capacity.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }

    /// Whether `key` is resident, without touching its visited bit.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Current value for `key`, marking the entry visited.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = {
            let mut inner = self.inner.lock();
            inner.entries.get_mut(key).map(|node| {
                node.visited = true;
                node.value.clone()
            })
        };
        let hook = self.hook.read().clone();
        match &value {
            Some(_) => hook.on_hit(),
            None => hook.on_miss(),
        }
        value
    }

    /// Insert or replace `key`. Replacement keeps the entry's list position and
    /// never double-counts its size. Evicts until the cache fits its capacity
    /// before returning; the inserted entry itself may be evicted if nothing
    /// else can make room.
    pub fn set(&self, key: K, value: V) {
        let size = value.approx_mem_usage();
        let evicted = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(node) = inner.entries.get_mut(&key) {
                let old = node.size;
                node.value = value;
                node.size = size;
                inner.used = inner.used - old + size;
            } else {
                push_newest(inner, key, value, size);
            }
            evict_until(inner, self.capacity())
        };
        self.report_evictions(&evicted);
    }

    /// Delete `key` unconditionally.
    pub fn remove(&self, key: &K) {
        let mut guard = self.inner.lock();
        unlink(&mut guard, key);
    }

    /// Resize and synchronously evict until the new bound holds.
    pub fn set_capacity_and_wait_evict(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::Relaxed);
        let evicted = {
            let mut guard = self.inner.lock();
            evict_until(&mut guard, capacity)
        };
        self.report_evictions(&evicted);
    }

    fn report_evictions(&self, evicted: &[u64]) {
        if evicted.is_empty() {
            return;
        }
        let hook = self.hook.read().clone();
        for bytes in evicted {
            hook.on_evict(*bytes);
        }
    }
}

fn push_newest<K, V>(inner: &mut Inner<K, V>, key: K, value: V, size: u64)
where
    K: Clone + Eq + Hash,
{
    let node = Node {
        value,
        size,
        visited: false,
        newer: None,
        older: inner.head.clone(),
    };
    if let Some(head) = inner.head.clone() {
        if let Some(prev_head) = inner.entries.get_mut(&head) {
            prev_head.newer = Some(key.clone());
        }
    }
    inner.head = Some(key.clone());
    if inner.tail.is_none() {
        inner.tail = Some(key.clone());
    }
    inner.used += size;
    inner.entries.insert(key, node);
}

fn unlink<K, V>(inner: &mut Inner<K, V>, key: &K) -> Option<u64>
where
    K: Clone + Eq + Hash,
{
    let node = inner.entries.remove(key)?;
    match node.newer.clone() {
        Some(newer) => {
            if let Some(n) = inner.entries.get_mut(&newer) {
                n.older = node.older.clone();
            }
        }
        None => inner.head = node.older.clone(),
    }
    match node.older.clone() {
        Some(older) => {
            if let Some(n) = inner.entries.get_mut(&older) {
                n.newer = node.newer.clone();
            }
        }
        None => inner.tail = node.newer.clone(),
    }
    if inner.hand.as_ref() == Some(key) {
        inner.hand = node.newer.clone();
    }
    inner.used -= node.size;
    Some(node.size)
}

/// Evict entries until `used <= capacity`. Returns the evicted sizes.
fn evict_until<K, V>(inner: &mut Inner<K, V>, capacity: u64) -> Vec<u64>
where
    K: Clone + Eq + Hash,
{
    let mut evicted = Vec::new();
    while inner.used > capacity {
        match evict_one(inner) {
            Some(bytes) => evicted.push(bytes),
            None => break,
        }
    }
    evicted
}

/// One SIEVE step: clear visited bits from the hand onward and evict the first
/// unvisited entry. Terminates because cleared entries are not re-marked
/// within the sweep.
fn evict_one<K, V>(inner: &mut Inner<K, V>) -> Option<u64>
where
    K: Clone + Eq + Hash,
{
    if inner.entries.is_empty() {
        return None;
    }
    let mut cursor = match inner.hand.clone().filter(|k| inner.entries.contains_key(k)) {
        Some(hand) => hand,
        None => inner.tail.clone()?,
    };
    loop {
        let node = inner.entries.get_mut(&cursor)?;
        if node.visited {
            node.visited = false;
            cursor = match node.newer.clone() {
                Some(newer) => newer,
                // Wrap past the newest entry back to the oldest.
                None => inner.tail.clone()?,
            };
            continue;
        }
        inner.hand = node.newer.clone();
        return unlink(inner, &cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Blob(u64);

    impl MemSized for Blob {
        fn approx_mem_usage(&self) -> u64 {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingHook {
        hits: AtomicU64,
        misses: AtomicU64,
        evictions: AtomicU64,
    }

    impl SieveStatusHook for CountingHook {
        fn on_hit(&self) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        fn on_miss(&self) {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fn on_evict(&self, _bytes: u64) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn stays_within_capacity_after_set() {
        let cache: Sieve<u32, Blob> = Sieve::new(100);
        for key in 0..20u32 {
            cache.set(key, Blob(30));
            assert!(cache.used_bytes() <= 100);
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn replacing_a_key_does_not_double_count() {
        let cache: Sieve<u32, Blob> = Sieve::new(100);
        cache.set(1, Blob(40));
        cache.set(1, Blob(60));
        assert_eq!(cache.used_bytes(), 60);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), Some(Blob(60)));
    }

    #[test]
    fn visited_entries_survive_one_sweep() {
        let cache: Sieve<u32, Blob> = Sieve::new(90);
        cache.set(1, Blob(30));
        cache.set(2, Blob(30));
        cache.set(3, Blob(30));
        // Mark 1 as reused; the next insertion must evict 2, the oldest
        // unvisited entry.
        assert!(cache.get(&1).is_some());
        cache.set(4, Blob(30));
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&3).is_some());
        assert!(cache.get(&4).is_some());
    }

    #[test]
    fn remove_frees_space() {
        let cache: Sieve<u32, Blob> = Sieve::new(100);
        cache.set(1, Blob(70));
        cache.remove(&1);
        assert_eq!(cache.used_bytes(), 0);
        cache.set(2, Blob(90));
        assert_eq!(cache.get(&2), Some(Blob(90)));
    }

    #[test]
    fn shrinking_capacity_evicts_synchronously() {
        let cache: Sieve<u32, Blob> = Sieve::new(300);
        for key in 0..6u32 {
            cache.set(key, Blob(50));
        }
        cache.set_capacity_and_wait_evict(100);
        assert!(cache.used_bytes() <= 100);
        assert_eq!(cache.capacity(), 100);
    }

    #[test]
    fn an_entry_larger_than_capacity_cannot_stay() {
        let cache: Sieve<u32, Blob> = Sieve::new(50);
        cache.set(1, Blob(80));
        assert_eq!(cache.used_bytes(), 0);
        assert!(cache.get(&1).is_none());
    }

    #[test]
    fn status_hook_counts_events() {
        let cache: Sieve<u32, Blob> = Sieve::new(60);
        let hook = Arc::new(CountingHook::default());
        cache.set_status_hook(hook.clone());

        cache.set(1, Blob(30));
        cache.set(2, Blob(30));
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&9).is_none());
        cache.set(3, Blob(30));

        assert_eq!(hook.hits.load(Ordering::Relaxed), 1);
        assert_eq!(hook.misses.load(Ordering::Relaxed), 1);
        assert_eq!(hook.evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn concurrent_readers_and_writers_do_not_corrupt_accounting() {
        let cache: Arc<Sieve<u32, Blob>> = Arc::new(Sieve::new(1000));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    let key = t * 1000 + (i % 40);
                    cache.set(key, Blob(25));
                    let _ = cache.get(&key);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("cache worker");
        }
        assert!(cache.used_bytes() <= 1000);
    }
}
