//! Lock-striped concurrent hash table (spec.md §4.1, component C1).
//!
//! Deduplicates variable-length byte keys (the interned
//! `(context ‖ state)` encodings used by the step executor) under a
//! compare-and-swap-published, open-chained bucket array. Grounded on
//! `hashtab.c`'s `ht_new`/`ht_find`/`ht_find_lock`/`ht_resize` from the
//! original Harmony `charm` engine: same FNV-seeded 8-byte mixer, same
//! "insert publishes atomically, growth is deferred to a quiesced
//! phase between layers" discipline.
//!
//! Nodes are allocated from [`Arena`], a per-worker bump allocator, and
//! leaked onto the bucket chains for the lifetime of the run — nothing
//! here is ever freed, matching the original allocator and spec.md
//! §9's re-architecture guidance ("it may be freed wholesale at
//! program exit").

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A bump allocator modeled on 1 MiB chunks with no individual free;
/// large allocations fall back to the system heap. Private to one
/// worker — there is no cross-worker free, so no synchronization is
/// needed here at all.
///
/// Node storage itself is still heap-boxed and leaked (`Box::leak`):
/// this keeps the hash table free of raw-pointer placement arithmetic
/// while preserving the "never freed, lives for the whole run"
/// lifetime the original's chunk allocator gives it. `Arena` tracks
/// chunk-rounded byte usage so the checker can report `allocated`
/// (spec.md §C "informational output") the way the original does.
pub struct Arena {
    used: usize,
    chunk_used: usize,
}

const CHUNK_SIZE: usize = 1 << 20;

impl Arena {
    pub fn new() -> Self {
        Arena {
            used: 0,
            chunk_used: CHUNK_SIZE,
        }
    }

    fn alloc<T>(&mut self, value: T) -> &'static mut T {
        let size = std::mem::size_of::<T>().max(16);
        if self.chunk_used + size > CHUNK_SIZE {
            self.chunk_used = 0;
            self.used += CHUNK_SIZE;
        }
        self.chunk_used += size;
        Box::leak(Box::new(value))
    }

    /// Bytes accounted for so far, rounded up to whole chunks.
    pub fn bytes_allocated(&self) -> usize {
        self.used + self.chunk_used
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

/// One bucket-chain node: a published key/value pair plus the next
/// pointer in its chain.
pub(crate) struct HtNode<V> {
    key: Box<[u8]>,
    value: V,
    next: AtomicPtr<HtNode<V>>,
}

/// The 32-bit mixer used by the original `hashtab.c` (`meiyan`):
/// FNV-offset seeded, folded 8 bytes at a time.
pub fn mix_hash(key: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    let mut rest = key;
    while rest.len() >= 8 {
        let a = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let b = u32::from_le_bytes(rest[4..8].try_into().unwrap());
        h = (h ^ (a.rotate_left(5) ^ b)).wrapping_mul(0x0002_ad3e7);
        rest = &rest[8..];
    }
    if rest.len() & 4 != 0 {
        let v = u16::from_le_bytes(rest[0..2].try_into().unwrap());
        h = (h ^ v as u32).wrapping_mul(0x0002_ad3e7);
        let v = u16::from_le_bytes(rest[2..4].try_into().unwrap());
        h = (h ^ v as u32).wrapping_mul(0x0002_ad3e7);
        rest = &rest[4..];
    }
    if rest.len() & 2 != 0 {
        let v = u16::from_le_bytes(rest[0..2].try_into().unwrap());
        h = (h ^ v as u32).wrapping_mul(0x0002_ad3e7);
        rest = &rest[2..];
    }
    if rest.len() & 1 != 0 {
        h = (h ^ rest[0] as u32).wrapping_mul(0x0002_ad3e7);
    }
    h ^ (h >> 16)
}

/// Lock-striped concurrent hash table mapping variable-length byte
/// keys to `V`, plus a stable handle (a `'static` reference, since
/// entries are never freed) a caller can hold across a mutation.
///
/// The bucket array itself is an `AtomicPtr` to a leaked `Vec`, not a
/// plain field: `grow_prepare` swaps in a freshly sized array from a
/// shared `&HashTable` reference during the quiesced handoff between
/// BFS layers (spec.md §4.1), and the old array is handed to
/// `rehash_stripe` rather than freed.
pub struct HashTable<V> {
    buckets: AtomicPtr<Vec<AtomicPtr<HtNode<V>>>>,
    locks: Vec<Mutex<()>>,
    count: AtomicUsize,
    concurrent: AtomicU32,
}

/// A stable reference into the table, returned by `insert`/`find_lock`.
pub type Slot<'t, V> = &'t V;

fn fresh_buckets<V>(nbuckets: usize) -> *mut Vec<AtomicPtr<HtNode<V>>> {
    let array: Vec<AtomicPtr<HtNode<V>>> = (0..nbuckets).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect();
    Box::into_raw(Box::new(array))
}

impl<V> HashTable<V> {
    pub fn new(nbuckets: usize, nworkers: usize) -> Self {
        let nbuckets = nbuckets.max(1024);
        HashTable {
            buckets: AtomicPtr::new(fresh_buckets(nbuckets)),
            locks: (0..64 * nworkers.max(1)).map(|_| Mutex::new(())).collect(),
            count: AtomicUsize::new(0),
            concurrent: AtomicU32::new(0),
        }
    }

    /// The live bucket array. Only swapped during the quiesced growth
    /// handoff (`grow_prepare`), never freed, so a reference borrowed
    /// from `&self` is always valid for as long as `self` is.
    fn buckets(&self) -> &Vec<AtomicPtr<HtNode<V>>> {
        // SAFETY: `self.buckets` always points at a `Box::into_raw`'d
        // `Vec` that is swapped, never freed; see `grow_prepare`.
        unsafe { &*self.buckets.load(Ordering::Acquire) }
    }

    /// Enters concurrent mode: growth is deferred until `grow_prepare`
    /// runs between layers. Called once by the coordinator before
    /// releasing workers for an epoch.
    pub fn begin_concurrent(&self) {
        self.concurrent.store(1, Ordering::SeqCst);
    }

    pub fn end_concurrent(&self) {
        self.concurrent.store(0, Ordering::SeqCst);
    }

    fn bucket_index(&self, hash: u32) -> usize {
        hash as usize % self.buckets().len()
    }

    fn lock_index(&self, hash: u32) -> usize {
        hash as usize % self.locks.len()
    }

    /// Inserts `key` with `make_value()` if absent. Concurrent inserts
    /// racing on the same key converge on the node whose CAS won; the
    /// loser's freshly allocated node is simply discarded (the arena
    /// never frees it — matches the original's behavior when running
    /// without a per-worker allocator passed to `ht_find`).
    pub fn insert(&self, arena: &mut Arena, key: &[u8], make_value: impl FnOnce() -> V) -> (Slot<'_, V>, bool) {
        let hash = mix_hash(key);
        let buckets = self.buckets();
        let head = &buckets[hash as usize % buckets.len()];

        let mut cursor = head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: `cursor` was published by a prior successful CAS
            // below and is never freed or mutated after publication.
            let node = unsafe { &*cursor };
            if node.key.as_ref() == key {
                return (&node.value, false);
            }
            cursor = node.next.load(Ordering::Acquire);
        }

        let node = arena.alloc(HtNode {
            key: key.to_vec().into_boxed_slice(),
            value: make_value(),
            next: AtomicPtr::new(std::ptr::null_mut()),
        });
        let node_ptr: *mut HtNode<V> = node;

        let mut expected = head.load(Ordering::Acquire);
        loop {
            // SAFETY: see above.
            let mut existing = expected;
            while !existing.is_null() {
                let n = unsafe { &*existing };
                if n.key.as_ref() == key {
                    return (&n.value, false);
                }
                existing = n.next.load(Ordering::Acquire);
            }
            node.next.store(expected, Ordering::Relaxed);
            match head.compare_exchange_weak(expected, node_ptr, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                    // SAFETY: `node_ptr` was just published.
                    let published = unsafe { &*node_ptr };
                    return (&published.value, true);
                }
                Err(actual) => expected = actual,
            }
        }
    }

    /// Like `insert`, but also returns the stripe lock the caller
    /// should hold across any mutation of the returned payload.
    pub fn insert_locked<'t>(
        &'t self,
        arena: &mut Arena,
        key: &[u8],
        make_value: impl FnOnce() -> V,
    ) -> (Slot<'t, V>, bool, parking_lot::MutexGuard<'t, ()>) {
        let hash = mix_hash(key);
        let (slot, is_new) = self.insert(arena, key, make_value);
        let guard = self.locks[self.lock_index(hash)].lock();
        (slot, is_new, guard)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.buckets().len() as f64
    }

    /// Whether a new bucket array should be swapped in before the next
    /// epoch. Sequential mode grows eagerly at load > 2 (5x - 1 new
    /// buckets); concurrent mode defers until load > 0.5 (spec.md
    /// §4.1 "Modes").
    pub fn should_grow(&self) -> Option<usize> {
        let load = self.load_factor();
        let nbuckets = self.buckets().len();
        if self.concurrent.load(Ordering::SeqCst) != 0 {
            (load > 0.5).then(|| nbuckets * 2)
        } else {
            (load > 2.0).then(|| nbuckets * 5 - 1)
        }
    }

    /// Swaps in a fresh array of `nbuckets` slots and returns the
    /// previous one for `rehash_stripe` to drain. Called once, by the
    /// coordinator, during the quiesced handoff between BFS layers
    /// (spec.md §4.1) — concurrent callers would each install their
    /// own array and clobber one another, so the caller must ensure
    /// only one worker calls this per growth.
    ///
    /// The returned array is never freed (matching every other
    /// allocation in this table), so handing back a `'static`
    /// reference to it is sound.
    pub(crate) fn grow_prepare(&self, nbuckets: usize) -> &'static Vec<AtomicPtr<HtNode<V>>> {
        let new_ptr = fresh_buckets(nbuckets);
        let old_ptr = self.buckets.swap(new_ptr, Ordering::AcqRel);
        // SAFETY: `old_ptr` was itself leaked by a prior `new`/
        // `grow_prepare` call and is never freed or mutated by anyone
        // else once it stops being `self.buckets`.
        unsafe { &*old_ptr }
    }

    /// Rehashes every node of `old` whose key now targets a bucket in
    /// `[new_start, new_end)` into `self`'s current (already
    /// swapped-in) array. Workers partition `[0, nbuckets)` of the
    /// *new* array disjointly and each scan the whole of `old`, so two
    /// workers never write the same bucket head concurrently even
    /// though their source ranges overlap (`make_stable`, spec.md
    /// §4.1).
    pub(crate) fn rehash_stripe(&self, old: &[AtomicPtr<HtNode<V>>], new_start: usize, new_end: usize) {
        let buckets = self.buckets();
        for bucket in old {
            let mut cursor = bucket.load(Ordering::Relaxed);
            while !cursor.is_null() {
                // SAFETY: nodes are never freed; a node's `next` is
                // mutated here only, and only by the one worker whose
                // disjoint target range the node's new bucket falls in.
                let node = unsafe { &*cursor };
                let next = node.next.load(Ordering::Relaxed);
                let hash = mix_hash(&node.key);
                let target = hash as usize % buckets.len();
                if target >= new_start && target < new_end {
                    let new_head = &buckets[target];
                    node.next.store(new_head.load(Ordering::Relaxed), Ordering::Relaxed);
                    new_head.store(cursor, Ordering::Relaxed);
                }
                cursor = next;
            }
        }
    }

    pub fn nbuckets(&self) -> usize {
        self.buckets().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn insert_dedups_identical_keys() {
        let table: HashTable<u32> = HashTable::new(1024, 1);
        let mut arena = Arena::new();
        let (slot_a, new_a) = table.insert(&mut arena, b"hello", || 1);
        assert!(new_a);
        assert_eq!(*slot_a, 1);
        let (slot_b, new_b) = table.insert(&mut arena, b"hello", || 2);
        assert!(!new_b);
        assert_eq!(*slot_b, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_distinguishes_distinct_keys() {
        let table: HashTable<u32> = HashTable::new(1024, 1);
        let mut arena = Arena::new();
        table.insert(&mut arena, b"a", || 1);
        table.insert(&mut arena, b"b", || 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn hash_mixer_is_deterministic() {
        assert_eq!(mix_hash(b"abcdefgh"), mix_hash(b"abcdefgh"));
        assert_ne!(mix_hash(b"abcdefgh"), mix_hash(b"abcdefgi"));
    }

    #[test]
    fn concurrent_inserts_converge_on_one_slot() {
        use std::sync::Arc;
        let table = Arc::new(HashTable::<u32>::new(1024, 4));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    let mut arena = Arena::new();
                    let (slot, _) = table.insert(&mut arena, b"shared-key", || i);
                    *slot
                })
            })
            .collect();
        let results: HashSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.len(), 1, "all threads must observe the same winning value");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sequential_mode_grows_past_load_factor_two() {
        let table: HashTable<u32> = HashTable::new(1024, 1);
        assert!(table.should_grow().is_none());
        let mut arena = Arena::new();
        for i in 0..2049u32 {
            table.insert(&mut arena, &i.to_le_bytes(), || i);
        }
        assert_eq!(table.should_grow(), Some(1024 * 5 - 1));
    }

    #[test]
    fn concurrent_mode_grows_past_load_factor_half() {
        let table: HashTable<u32> = HashTable::new(1024, 1);
        table.begin_concurrent();
        let mut arena = Arena::new();
        for i in 0..513u32 {
            table.insert(&mut arena, &i.to_le_bytes(), || i);
        }
        assert_eq!(table.should_grow(), Some(2048));
    }

    #[test]
    fn grow_and_rehash_preserves_every_key_in_exactly_one_array() {
        let table: HashTable<u32> = HashTable::new(16, 1);
        let mut arena = Arena::new();
        let keys: Vec<[u8; 4]> = (0..64u32).map(|i| i.to_le_bytes()).collect();
        for (i, key) in keys.iter().enumerate() {
            table.insert(&mut arena, key, || i as u32);
        }
        assert_eq!(table.len(), 64);

        let new_nbuckets = 64;
        let old = table.grow_prepare(new_nbuckets);
        table.rehash_stripe(old, 0, new_nbuckets);

        // Every key is still findable — and findable exactly once, since
        // a fresh `insert` call would otherwise allocate a duplicate
        // entry and bump `len`.
        for (i, key) in keys.iter().enumerate() {
            let (slot, is_new) = table.insert(&mut arena, key, || u32::MAX);
            assert!(!is_new, "key {i} should already be present after rehash");
            assert_eq!(*slot, i as u32);
        }
        assert_eq!(table.len(), 64, "rehash must not duplicate or drop entries");
    }
}
