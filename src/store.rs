//! Thread-safe keyed store backing the attempt tracker.
//!
//! Separate-chaining hash table behind a single coarse mutex, with
//! handle-based access to entries. The coarse lock guards all structural
//! operations (insert, remove, resize); each entry additionally carries its
//! own small mutex so per-key state transitions serialize without holding the
//! table lock. Lock order is always table first, then slot, never the
//! reverse.
//!
//! Handles stay valid across resizes. A removed entry's slot is marked dead,
//! so a handle held across a removal observes the removal instead of touching
//! reclaimed state.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Buckets never shrink below this.
const MIN_BUCKETS: usize = 16;

/// Grow once live entries reach this fraction of the bucket count.
const MAX_LOAD_FACTOR: f64 = 0.75;

/// `compact` only acts below this load factor.
const SHRINK_LOAD_FACTOR: f64 = 0.25;

/// Visitor verdict for [`ConcurrentKeyStore::for_each_safe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

struct SlotState<V> {
    value: V,
    live: bool,
}

struct Slot<K, V> {
    key: K,
    state: Mutex<SlotState<V>>,
}

impl<K, V> Slot<K, V> {
    fn lock(&self) -> MutexGuard<'_, SlotState<V>> {
        // A panic while holding a slot lock leaves the value in whatever
        // state the panicking closure produced; recover the guard rather
        // than wedging every later operation on this key.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stable reference to a live store entry.
///
/// Never a raw address into the table: the slot is reference-counted, so a
/// handle held across a resize or a removal stays safe to use. Operations on
/// a handle whose entry has been removed return `None`; callers re-resolve
/// the key to recreate the entry.
pub struct Handle<K, V> {
    slot: Arc<Slot<K, V>>,
}

impl<K, V> Clone for Handle<K, V> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

impl<K, V> Handle<K, V> {
    pub fn key(&self) -> &K {
        &self.slot.key
    }

    /// Run `f` against the entry's value under the slot lock.
    ///
    /// Returns `None` if the entry has been removed from the store.
    pub fn update<R>(&self, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut state = self.slot.lock();
        if !state.live {
            return None;
        }
        Some(f(&mut state.value))
    }

    /// Read-only variant of [`Handle::update`].
    pub fn read<R>(&self, f: impl FnOnce(&V) -> R) -> Option<R> {
        let state = self.slot.lock();
        if !state.live {
            return None;
        }
        Some(f(&state.value))
    }
}

struct Node<K, V> {
    hash: u64,
    slot: Arc<Slot<K, V>>,
    next: Option<Box<Node<K, V>>>,
}

struct Table<K, V> {
    buckets: Vec<Option<Box<Node<K, V>>>>,
    len: usize,
}

impl<K, V> Table<K, V> {
    fn new(buckets: usize) -> Self {
        Self { buckets: (0..buckets).map(|_| None).collect(), len: 0 }
    }

    fn bucket_index(&self, hash: u64) -> usize {
        // Bucket counts are powers of two, so masking is the mod.
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn insert(&mut self, hash: u64, slot: Arc<Slot<K, V>>) {
        let idx = self.bucket_index(hash);
        let next = self.buckets[idx].take();
        self.buckets[idx] = Some(Box::new(Node { hash, slot, next }));
        self.len += 1;
    }

    /// Replace the bucket array and relink every node into the new one.
    /// Nodes are moved, not reallocated, so each entry lands in exactly one
    /// new bucket.
    fn resize(&mut self, new_buckets: usize) {
        let old = std::mem::replace(
            &mut self.buckets,
            (0..new_buckets).map(|_| None).collect(),
        );
        for mut chain in old {
            while let Some(mut node) = chain {
                chain = node.next.take();
                let idx = self.bucket_index(node.hash);
                node.next = self.buckets[idx].take();
                self.buckets[idx] = Some(node);
            }
        }
    }

    fn load_factor(&self) -> f64 {
        self.len as f64 / self.buckets.len() as f64
    }
}

/// Concurrent associative container with handle-based entry access.
///
/// Generic over the hasher so tests can pin a deterministic one; production
/// use sticks with [`RandomState`].
pub struct ConcurrentKeyStore<K, V, S = RandomState> {
    table: Mutex<Table<K, V>>,
    hasher: S,
}

impl<K, V> ConcurrentKeyStore<K, V>
where
    K: Hash + Eq,
{
    pub fn new() -> Self {
        Self::with_capacity(MIN_BUCKETS)
    }

    pub fn with_capacity(buckets: usize) -> Self {
        Self::with_capacity_and_hasher(buckets, RandomState::new())
    }
}

impl<K, V> Default for ConcurrentKeyStore<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentKeyStore<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub fn with_capacity_and_hasher(buckets: usize, hasher: S) -> Self {
        let buckets = buckets.max(MIN_BUCKETS).next_power_of_two();
        Self { table: Mutex::new(Table::new(buckets)), hasher }
    }

    fn lock_table(&self) -> MutexGuard<'_, Table<K, V>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hash_of<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.hasher.hash_one(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock_table().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count.
    pub fn capacity(&self) -> usize {
        self.lock_table().buckets.len()
    }

    /// Look up `key`, inserting a fresh entry from `factory` when absent.
    ///
    /// The boolean is `true` when the entry was created by this call, which
    /// lets callers distinguish "first observation" from "already tracked"
    /// without a second lookup.
    pub fn get_or_create(&self, key: K, factory: impl FnOnce() -> V) -> (Handle<K, V>, bool) {
        let hash = self.hash_of(&key);
        let mut table = self.lock_table();

        let idx = table.bucket_index(hash);
        let mut cursor = &table.buckets[idx];
        while let Some(node) = cursor {
            if node.hash == hash && node.slot.key == key {
                return (Handle { slot: Arc::clone(&node.slot) }, false);
            }
            cursor = &node.next;
        }

        let slot = Arc::new(Slot {
            key,
            state: Mutex::new(SlotState { value: factory(), live: true }),
        });
        table.insert(hash, Arc::clone(&slot));
        if table.load_factor() >= MAX_LOAD_FACTOR {
            let doubled = table.buckets.len() * 2;
            table.resize(doubled);
        }
        (Handle { slot }, true)
    }

    /// Look up an existing entry.
    pub fn get<Q>(&self, key: &Q) -> Option<Handle<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        let table = self.lock_table();
        let idx = table.bucket_index(hash);
        let mut cursor = &table.buckets[idx];
        while let Some(node) = cursor {
            if node.hash == hash && node.slot.key.borrow() == key {
                return Some(Handle { slot: Arc::clone(&node.slot) });
            }
            cursor = &node.next;
        }
        None
    }

    /// Remove `key` if present. Removing an absent key is a no-op.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_if(key, |_| true)
    }

    /// Remove `key` only if `pred` holds for its value, atomically with
    /// respect to every other operation on that entry.
    pub fn remove_if<Q>(&self, key: &Q, mut pred: impl FnMut(&V) -> bool) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        let mut guard = self.lock_table();
        // Borrow the table through a plain reference so the bucket chain and
        // the length counter can be borrowed disjointly.
        let table = &mut *guard;
        let idx = table.bucket_index(hash);

        let mut link = &mut table.buckets[idx];
        loop {
            enum Step {
                Miss,
                Advance,
                Unlink,
                Stop,
            }
            let step = match link {
                None => Step::Miss,
                Some(node) => {
                    if node.hash == hash && node.slot.key.borrow() == key {
                        let mut state = node.slot.lock();
                        if pred(&state.value) {
                            state.live = false;
                            Step::Unlink
                        } else {
                            Step::Stop
                        }
                    } else {
                        Step::Advance
                    }
                }
            };
            match step {
                Step::Miss => return false,
                Step::Stop => return false,
                Step::Unlink => {
                    if let Some(mut node) = link.take() {
                        *link = node.next.take();
                    }
                    table.len -= 1;
                    return true;
                }
                Step::Advance => {
                    if let Some(node) = link {
                        link = &mut node.next;
                    }
                }
            }
        }
    }

    /// Visit every live entry under the table lock.
    ///
    /// The visitor may remove the entry it is currently looking at by
    /// returning [`Visit::Remove`]. Entries inserted concurrently with the
    /// traversal may or may not be visited; no stronger guarantee is made.
    /// The visitor must not call back into the store.
    pub fn for_each_safe(&self, mut visitor: impl FnMut(&K, &mut V) -> Visit) {
        let mut guard = self.lock_table();
        let table = &mut *guard;
        let mut removed = 0usize;
        for idx in 0..table.buckets.len() {
            let mut link = &mut table.buckets[idx];
            loop {
                let verdict = match link {
                    None => break,
                    Some(node) => {
                        let mut state = node.slot.lock();
                        let verdict = visitor(&node.slot.key, &mut state.value);
                        if verdict == Visit::Remove {
                            state.live = false;
                        }
                        verdict
                    }
                };
                match verdict {
                    Visit::Remove => {
                        if let Some(mut node) = link.take() {
                            *link = node.next.take();
                        }
                        removed += 1;
                    }
                    Visit::Keep => {
                        if let Some(node) = link {
                            link = &mut node.next;
                        }
                    }
                }
            }
        }
        table.len -= removed;
    }

    /// Shrink the bucket array when the table has mostly drained.
    ///
    /// No-op unless the load factor is below [`SHRINK_LOAD_FACTOR`]; when it
    /// is, rehash into the smallest power-of-two bucket count that keeps the
    /// resulting load factor under [`MAX_LOAD_FACTOR`], floored at
    /// [`MIN_BUCKETS`]. Returns `true` when a resize happened.
    pub fn compact(&self) -> bool {
        let mut table = self.lock_table();
        if table.load_factor() >= SHRINK_LOAD_FACTOR {
            return false;
        }
        // Smallest n with len / n strictly below the growth threshold:
        // len * 4 / 3 rounded up past any exact multiple, then the next
        // power of two.
        let target = (table.len * 4 / 3 + 1)
            .next_power_of_two()
            .max(MIN_BUCKETS);
        if target >= table.buckets.len() {
            return false;
        }
        table.resize(target);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn store() -> ConcurrentKeyStore<String, u32> {
        ConcurrentKeyStore::new()
    }

    fn collect(s: &ConcurrentKeyStore<String, u32>) -> HashMap<String, u32> {
        let mut out = HashMap::new();
        s.for_each_safe(|k, v| {
            out.insert(k.clone(), *v);
            Visit::Keep
        });
        out
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let s = store();
        let (h, created) = s.get_or_create("10.0.0.1".to_string(), || 1);
        assert!(created);
        assert_eq!(
            h.update(|v| {
                *v += 1;
                *v
            }),
            Some(2)
        );

        let again = s.get("10.0.0.1").expect("present");
        assert_eq!(again.read(|v| *v), Some(2));

        assert!(s.remove("10.0.0.1"));
        assert!(s.get("10.0.0.1").is_none());
        // Idempotent.
        assert!(!s.remove("10.0.0.1"));
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn get_or_create_finds_existing() {
        let s = store();
        let (_, created) = s.get_or_create("a".to_string(), || 7);
        assert!(created);
        let (h, created) = s.get_or_create("a".to_string(), || 99);
        assert!(!created);
        assert_eq!(h.read(|v| *v), Some(7));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn handle_dies_with_entry() {
        let s = store();
        let (h, _) = s.get_or_create("a".to_string(), || 1);
        assert!(s.remove("a"));
        assert_eq!(h.update(|v| *v += 1), None);
        assert_eq!(h.read(|v| *v), None);
        assert_eq!(h.key(), "a");
    }

    #[test]
    fn grow_keeps_load_factor_below_threshold() {
        let s = store();
        for i in 0..1000 {
            s.get_or_create(format!("key-{i}"), || i);
        }
        assert_eq!(s.len(), 1000);
        assert!((s.len() as f64) / (s.capacity() as f64) < MAX_LOAD_FACTOR);
        // Every entry survived the growth chain.
        for i in 0..1000 {
            let h = s.get(&format!("key-{i}")).expect("entry lost in resize");
            assert_eq!(h.read(|v| *v), Some(i));
        }
    }

    #[test]
    fn compact_is_noop_when_loaded() {
        let s = store();
        for i in 0..100 {
            s.get_or_create(format!("key-{i}"), || i);
        }
        let cap = s.capacity();
        assert!(!s.compact());
        assert_eq!(s.capacity(), cap);
    }

    #[test]
    fn compact_shrinks_to_bounded_load_factor() {
        let s = store();
        for i in 0..1000 {
            s.get_or_create(format!("key-{i}"), || i);
        }
        for i in 20..1000 {
            s.remove(&format!("key-{i}"));
        }
        let before = s.capacity();
        assert!(s.compact());
        let after = s.capacity();
        assert!(after < before);
        assert!(after >= MIN_BUCKETS);
        let lf = s.len() as f64 / after as f64;
        assert!(lf < MAX_LOAD_FACTOR, "load factor {lf} after shrink");
        // Contents intact.
        for i in 0..20 {
            assert!(s.get(&format!("key-{i}")).is_some());
        }
        assert_eq!(s.len(), 20);
    }

    #[test]
    fn compact_never_goes_below_floor() {
        let s = store();
        for i in 0..1000 {
            s.get_or_create(format!("key-{i}"), || i);
        }
        for i in 0..1000 {
            s.remove(&format!("key-{i}"));
        }
        s.compact();
        assert_eq!(s.capacity(), MIN_BUCKETS);
    }

    #[test]
    fn visitor_can_remove_current_entry() {
        let s = store();
        for i in 0..50u32 {
            s.get_or_create(format!("key-{i}"), || i);
        }
        s.for_each_safe(|_, v| if *v % 2 == 0 { Visit::Remove } else { Visit::Keep });
        assert_eq!(s.len(), 25);
        let left = collect(&s);
        assert!(left.values().all(|v| v % 2 == 1));
    }

    #[test]
    fn concurrent_updates_on_one_key_are_serialized() {
        let s = Arc::new(ConcurrentKeyStore::<String, u32>::new());
        let mut joins = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&s);
            joins.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let (h, created) = s.get_or_create("hot".to_string(), || 1);
                    if !created {
                        h.update(|v| *v += 1);
                    }
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        let h = s.get("hot").unwrap();
        assert_eq!(h.read(|v| *v), Some(8000));
    }

    #[test]
    fn concurrent_insert_remove_distinct_keys() {
        let s = Arc::new(ConcurrentKeyStore::<String, u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for t in 0..4 {
            let s = Arc::clone(&s);
            let hits = Arc::clone(&hits);
            joins.push(thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("t{t}-{i}");
                    s.get_or_create(key.clone(), || i);
                    if s.get(&key).is_some() {
                        hits.fetch_add(1, Ordering::Relaxed);
                    }
                    s.remove(&key);
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 2000);
        assert_eq!(s.len(), 0);
    }

    proptest! {
        /// Any interleaving of inserts and removes, plus a compact at the
        /// end, leaves the store holding exactly the same set of keys as a
        /// std HashMap mirror: resizes lose nothing and duplicate nothing.
        #[test]
        fn resize_preserves_entries(ops in prop::collection::vec((any::<bool>(), 0u16..300), 1..400)) {
            let s = ConcurrentKeyStore::<String, u32>::new();
            let mut mirror: HashMap<String, u32> = HashMap::new();
            for (insert, k) in ops {
                let key = format!("k{k}");
                if insert {
                    s.get_or_create(key.clone(), || u32::from(k));
                    mirror.entry(key).or_insert(u32::from(k));
                } else {
                    s.remove(&key);
                    mirror.remove(&key);
                }
            }
            s.compact();
            let mut visited = Vec::new();
            s.for_each_safe(|k, v| {
                visited.push((k.clone(), *v));
                Visit::Keep
            });
            let distinct: HashSet<&String> = visited.iter().map(|(k, _)| k).collect();
            prop_assert_eq!(distinct.len(), visited.len(), "duplicate keys after resize");
            let contents: HashMap<String, u32> = visited.into_iter().collect();
            prop_assert_eq!(s.len(), mirror.len());
            prop_assert_eq!(contents, mirror);
        }
    }
}
