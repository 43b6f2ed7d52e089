//! The allocation index: base address -> allocation record.
//!
//! An open hash table with separate chaining and prime bucket counts. The
//! chains are not raw linked lists; records live in an arena and buckets
//! hold indices into it, so only the scanner ever touches untyped memory.
//! Freed arena slots are recycled through a free list.

use index_vec::IndexVec;
use rustc_hash::FxHasher;
use std::hash::Hasher;

use crate::primes::next_prime;

/// Destructor callback invoked with the block's base pointer right before
/// the block is released. C-compatible so embedders can hand one through
/// the FFI surface unchanged.
pub type Finalizer = extern "C" fn(*mut u8);

pub const TAG_NONE: u8 = 0x0;
/// Treat the record as a root regardless of stack reachability.
pub const TAG_ROOT: u8 = 0x1;
/// Transient reachability bit, set during a mark phase and cleared by sweep.
pub const TAG_MARK: u8 = 0x2;

index_vec::define_index_type! {
    pub struct RecordIdx = u32;
}

/// Metadata for one managed block.
pub struct AllocRecord {
    pub ptr: *mut u8,
    pub size: usize,
    pub tag: u8,
    pub finalizer: Option<Finalizer>,
    next: Option<RecordIdx>,
}

/// Snapshot of a record handed back by [`AllocationIndex::remove`]. The
/// managed block itself is released by the caller, never by the index.
pub struct RemovedRecord {
    pub size: usize,
    pub tag: u8,
    pub finalizer: Option<Finalizer>,
}

pub struct AllocationIndex {
    /// Bucket count, always prime and >= `min_capacity`.
    capacity: usize,
    min_capacity: usize,
    /// Live record count, equal to the total chain length across buckets.
    size: usize,
    downsize_factor: f64,
    upsize_factor: f64,
    sweep_factor: f64,
    /// When `size` reaches this, the next allocation triggers a cycle.
    sweep_limit: usize,
    buckets: Vec<Option<RecordIdx>>,
    records: IndexVec<RecordIdx, AllocRecord>,
    free_slots: Vec<RecordIdx>,
}

impl AllocationIndex {
    /// Both capacities are raised to the next prime; the stored capacity is
    /// the larger of the two. Factors are stored verbatim, so a zero
    /// `downsize_factor` genuinely disables shrinking.
    pub fn new(
        min_capacity: usize,
        capacity: usize,
        sweep_factor: f64,
        downsize_factor: f64,
        upsize_factor: f64,
    ) -> Self {
        let min_capacity = next_prime(min_capacity);
        let capacity = next_prime(capacity).max(min_capacity);
        let mut index = Self {
            capacity,
            min_capacity,
            size: 0,
            downsize_factor,
            upsize_factor,
            sweep_factor,
            sweep_limit: 0,
            buckets: vec![None; capacity],
            records: IndexVec::new(),
            free_slots: Vec::new(),
        };
        index.sweep_limit = index.compute_sweep_limit();
        index
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    pub fn sweep_limit(&self) -> usize {
        self.sweep_limit
    }

    pub fn record(&self, idx: RecordIdx) -> &AllocRecord {
        &self.records[idx]
    }

    pub fn record_mut(&mut self, idx: RecordIdx) -> &mut AllocRecord {
        &mut self.records[idx]
    }

    /// Insert or update the record for `ptr`.
    ///
    /// An existing record keeps its tag; only size and finalizer change.
    /// New records are linked at the head of their bucket chain, and the
    /// insert may grow the table afterwards. Arena indices are stable
    /// across resizes, so the returned index stays valid either way.
    pub fn put(&mut self, ptr: *mut u8, size: usize, finalizer: Option<Finalizer>) -> RecordIdx {
        let bucket = self.bucket_of(ptr);
        let mut cur = self.buckets[bucket];
        while let Some(idx) = cur {
            let rec = &mut self.records[idx];
            if rec.ptr == ptr {
                rec.size = size;
                rec.finalizer = finalizer;
                return idx;
            }
            cur = rec.next;
        }

        let record = AllocRecord {
            ptr,
            size,
            tag: TAG_NONE,
            finalizer,
            next: self.buckets[bucket],
        };
        let idx = match self.free_slots.pop() {
            Some(slot) => {
                self.records[slot] = record;
                slot
            }
            None => self.records.push(record),
        };
        self.buckets[bucket] = Some(idx);
        self.size += 1;
        self.resize_to_fit();
        idx
    }

    pub fn get(&self, ptr: *mut u8) -> Option<RecordIdx> {
        let mut cur = self.buckets[self.bucket_of(ptr)];
        while let Some(idx) = cur {
            let rec = &self.records[idx];
            if rec.ptr == ptr {
                return Some(idx);
            }
            cur = rec.next;
        }
        None
    }

    /// Unlink and recycle the record for `ptr`, invoking the finalizer when
    /// asked. Unknown pointers are ignored, which makes the call safe on
    /// stale addresses during teardown. Removal may shrink the table.
    pub fn remove(&mut self, ptr: *mut u8, call_finalizer: bool) -> Option<RemovedRecord> {
        let bucket = self.bucket_of(ptr);
        let mut prev: Option<RecordIdx> = None;
        let mut cur = self.buckets[bucket];
        while let Some(idx) = cur {
            if self.records[idx].ptr != ptr {
                prev = cur;
                cur = self.records[idx].next;
                continue;
            }
            let next = self.records[idx].next;
            match prev {
                Some(p) => self.records[p].next = next,
                // Head removal: an emptied chain leaves the bucket at None.
                None => self.buckets[bucket] = next,
            }
            let rec = &mut self.records[idx];
            let removed = RemovedRecord {
                size: rec.size,
                tag: rec.tag,
                finalizer: rec.finalizer,
            };
            rec.ptr = std::ptr::null_mut();
            rec.next = None;
            self.free_slots.push(idx);
            self.size -= 1;
            if call_finalizer {
                if let Some(finalizer) = removed.finalizer {
                    finalizer(ptr);
                }
            }
            self.resize_to_fit();
            return Some(removed);
        }
        None
    }

    /// Indices of every live record, gathered by walking all bucket chains.
    /// Callers mutate tags or remove entries afterwards without holding any
    /// borrow into the table.
    pub fn live_indices(&self) -> Vec<RecordIdx> {
        let mut out = Vec::with_capacity(self.size);
        for head in self.buckets.iter().copied() {
            let mut cur = head;
            while let Some(idx) = cur {
                out.push(idx);
                cur = self.records[idx].next;
            }
        }
        out
    }

    fn load_factor(&self) -> f64 {
        self.size as f64 / self.capacity as f64
    }

    fn bucket_of(&self, ptr: *mut u8) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_usize(ptr as usize);
        (hasher.finish() as usize) % self.capacity
    }

    fn compute_sweep_limit(&self) -> usize {
        ((self.capacity as f64 * self.sweep_factor) as usize).max(1)
    }

    fn resize_to_fit(&mut self) {
        let load_factor = self.load_factor();
        if load_factor > self.upsize_factor {
            self.resize(next_prime(self.capacity * 2));
        } else if load_factor < self.downsize_factor {
            let shrunk = next_prime(self.min_capacity.max(self.capacity / 2));
            if shrunk < self.capacity {
                self.resize(shrunk);
            }
        }
    }

    fn resize(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.buckets, vec![None; new_capacity]);
        self.capacity = new_capacity;
        for head in old.into_iter().flatten() {
            let mut cur = Some(head);
            while let Some(idx) = cur {
                let next = self.records[idx].next;
                let bucket = self.bucket_of(self.records[idx].ptr);
                self.records[idx].next = self.buckets[bucket];
                self.buckets[bucket] = Some(idx);
                cur = next;
            }
        }
        self.sweep_limit = self.compute_sweep_limit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primes::is_prime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    extern "C" fn noop_finalizer(_ptr: *mut u8) {}

    fn synthetic(i: usize) -> *mut u8 {
        (0x1000 + i * 16) as *mut u8
    }

    #[test]
    fn new_rounds_capacities_to_primes() {
        let index = AllocationIndex::new(8, 16, 0.5, 0.2, 0.8);
        assert_eq!(index.min_capacity(), 11);
        assert_eq!(index.capacity(), 17);
        assert_eq!(index.len(), 0);
        assert_eq!(index.sweep_limit(), 8);
        assert_eq!(index.downsize_factor, 0.2);
        assert_eq!(index.upsize_factor, 0.8);
    }

    #[test]
    fn new_enforces_min_capacity() {
        let index = AllocationIndex::new(8, 4, 0.5, 0.2, 0.8);
        assert_eq!(index.min_capacity(), 11);
        assert_eq!(index.capacity(), 11);
        assert_eq!(index.sweep_limit(), 5);
    }

    #[test]
    fn put_get_update_remove() {
        static REMOVALS: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn count_removal(_ptr: *mut u8) {
            REMOVALS.fetch_add(1, Ordering::Relaxed);
        }

        let mut index = AllocationIndex::new(8, 16, 0.5, 0.2, 0.8);
        let five = synthetic(5);
        assert!(index.get(five).is_none());

        let a = index.put(five, 4, None);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(five), Some(a));
        assert_eq!(index.record(a).ptr, five);
        assert_eq!(index.record(a).size, 4);
        assert_eq!(index.record(a).tag, TAG_NONE);
        assert!(index.record(a).next.is_none());

        // Upsert: same identity, updated payload.
        let b = index.put(five, 4, Some(count_removal));
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);
        assert_eq!(index.record(b).finalizer, Some(count_removal as Finalizer));

        let removed = index.remove(five, true).unwrap();
        assert_eq!(removed.size, 4);
        assert_eq!(REMOVALS.load(Ordering::Relaxed), 1);
        assert_eq!(index.len(), 0);
        assert!(index.get(five).is_none());
        // Skipping the finalizer leaves the count untouched.
        let c = index.put(five, 8, Some(count_removal));
        assert_eq!(index.record(c).size, 8);
        index.remove(five, false);
        assert_eq!(REMOVALS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn upsert_preserves_tag() {
        let mut index = AllocationIndex::new(8, 16, 0.5, 0.2, 0.8);
        let ptr = synthetic(1);
        let idx = index.put(ptr, 32, Some(noop_finalizer));
        index.record_mut(idx).tag |= TAG_ROOT;

        let again = index.put(ptr, 64, None);
        assert_eq!(idx, again);
        let rec = index.record(again);
        assert_eq!(rec.size, 64);
        assert!(rec.finalizer.is_none());
        assert_ne!(rec.tag & TAG_ROOT, 0);
    }

    #[test]
    fn chained_collisions_update_and_drain() {
        // Resizing disabled: 64 keys in 37 buckets force chains longer than
        // one, exercising mid-chain updates and removals.
        let mut index = AllocationIndex::new(32, 32, f64::MAX, 0.0, f64::MAX);
        assert_eq!(index.capacity(), 37);

        for i in 0..64 {
            index.put(synthetic(i), 4, None);
        }
        assert_eq!(index.len(), 64);
        assert_eq!(index.capacity(), 37);

        for i in 0..64 {
            index.put(synthetic(i), 4, Some(noop_finalizer));
        }
        assert_eq!(index.len(), 64);
        assert_eq!(index.live_indices().len(), 64);

        for i in 0..64 {
            index.remove(synthetic(i), false);
        }
        assert_eq!(index.len(), 0);
        assert!(index.buckets.iter().all(|head| head.is_none()));
    }

    #[test]
    fn upsize_keeps_records_reachable() {
        let mut index = AllocationIndex::new(2, 2, 0.5, 0.0, 0.8);
        let initial_capacity = index.capacity();
        for i in 0..32 {
            index.put(synthetic(i), 8, None);
        }
        assert!(index.capacity() > initial_capacity);
        assert!(is_prime(index.capacity()));
        assert_eq!(index.len(), 32);
        assert_eq!(
            index.sweep_limit(),
            ((index.capacity() as f64 * 0.5) as usize).max(1)
        );
        for i in 0..32 {
            let idx = index.get(synthetic(i)).unwrap();
            assert_eq!(index.record(idx).ptr, synthetic(i));
        }
    }

    #[test]
    fn downsize_respects_min_capacity() {
        let mut index = AllocationIndex::new(3, 101, 0.5, 0.25, f64::MAX);
        assert_eq!(index.capacity(), 101);
        for i in 0..40 {
            index.put(synthetic(i), 8, None);
        }
        for i in 0..40 {
            index.remove(synthetic(i), false);
        }
        assert_eq!(index.len(), 0);
        assert!(index.capacity() < 101);
        assert!(index.capacity() >= index.min_capacity());
        assert!(is_prime(index.capacity()));
        assert!(index.buckets.iter().all(|head| head.is_none()));
    }

    #[test]
    fn arena_slots_are_recycled() {
        let mut index = AllocationIndex::new(8, 16, f64::MAX, 0.0, f64::MAX);
        let first = index.put(synthetic(0), 8, None);
        index.remove(synthetic(0), false);
        let second = index.put(synthetic(1), 8, None);
        assert_eq!(first, second);
        assert_eq!(index.record(second).ptr, synthetic(1));
    }
}
