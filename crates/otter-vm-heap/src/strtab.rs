//! String table
//!
//! Interned strings live in a power-of-two bucket array with separate
//! chaining. Each chain entry caches the string hash so resizing never has
//! to look at string bodies. Load is checked every few interns and the table
//! grows or shrinks one step at a time.

use crate::ptr::{HeapRef, PtrRepr};

/// String table sizing policy
#[derive(Debug, Clone)]
pub struct StrtabPolicy {
    /// Initial bucket count (power of two)
    pub initial_size: usize,
    /// Never shrink below this bucket count
    pub min_size: usize,
    /// Never grow above this bucket count
    pub max_size: usize,
    /// Grow when load (.4 fixed point) reaches this
    pub grow_limit: usize,
    /// Shrink when load (.4 fixed point) drops to this
    pub shrink_limit: usize,
    /// Load check runs when `inserts & mask == 0`
    pub resize_check_mask: u32,
}

impl Default for StrtabPolicy {
    fn default() -> Self {
        Self {
            initial_size: 1024,
            min_size: 1024,
            max_size: 1 << 28,
            grow_limit: 17,  // 1.0625
            shrink_limit: 6, // 0.375
            resize_check_mask: 255,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StrEntry<P: PtrRepr> {
    hash: u32,
    string: HeapRef<P>,
}

/// Interned string registry
pub struct StringTable<P: PtrRepr> {
    buckets: Vec<Vec<StrEntry<P>>>,
    count: usize,
    inserts: u32,
    resizes: u64,
    policy: StrtabPolicy,
}

impl<P: PtrRepr> StringTable<P> {
    /// Create a table with the policy's initial size
    pub fn new(policy: StrtabPolicy) -> Self {
        let size = policy.initial_size.next_power_of_two().max(1);
        Self {
            buckets: (0..size).map(|_| Vec::new()).collect(),
            count: 0,
            inserts: 0,
            resizes: 0,
            policy,
        }
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.count
    }

    /// True if nothing is interned
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bucket count
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Number of completed resizes
    pub fn resize_count(&self) -> u64 {
        self.resizes
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    /// Find a string with `hash` for which `eq` holds
    pub fn find(&self, hash: u32, mut eq: impl FnMut(HeapRef<P>) -> bool) -> Option<HeapRef<P>> {
        self.buckets[self.bucket_of(hash)]
            .iter()
            .find(|e| e.hash == hash && eq(e.string))
            .map(|e| e.string)
    }

    /// True if `string` is interned here
    pub fn contains(&self, hash: u32, string: HeapRef<P>) -> bool {
        self.buckets[self.bucket_of(hash)]
            .iter()
            .any(|e| e.string == string)
    }

    /// Insert a new string and run the periodic load check
    pub fn insert(&mut self, hash: u32, string: HeapRef<P>) {
        let b = self.bucket_of(hash);
        self.buckets[b].push(StrEntry { hash, string });
        self.count += 1;
        self.inserts = self.inserts.wrapping_add(1);
        if self.inserts & self.policy.resize_check_mask == 0 {
            self.check_resize();
        }
    }

    /// Remove a string; returns false if it was not interned
    pub fn unlink(&mut self, hash: u32, string: HeapRef<P>) -> bool {
        let b = self.bucket_of(hash);
        let chain = &mut self.buckets[b];
        match chain.iter().position(|e| e.string == string) {
            Some(pos) => {
                chain.swap_remove(pos);
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    /// Keep only strings for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(HeapRef<P>) -> bool) -> usize {
        let mut removed = 0;
        for chain in &mut self.buckets {
            chain.retain(|e| {
                let k = keep(e.string);
                if !k {
                    removed += 1;
                }
                k
            });
        }
        self.count -= removed;
        removed
    }

    /// Snapshot of all interned strings
    pub fn strings(&self) -> Vec<HeapRef<P>> {
        self.buckets.iter().flatten().map(|e| e.string).collect()
    }

    /// Remove and return everything
    pub fn drain_all(&mut self) -> Vec<HeapRef<P>> {
        let all: Vec<_> = self.buckets.iter_mut().flat_map(|c| c.drain(..)).map(|e| e.string).collect();
        self.count = 0;
        all
    }

    /// Load check regardless of the insert counter (emergency GC)
    pub fn force_resize(&mut self) {
        self.check_resize();
    }

    fn check_resize(&mut self) {
        let size = self.buckets.len();
        let load = self.count / (size >> 4).max(1);
        if load >= self.policy.grow_limit && size < self.policy.max_size {
            self.resize(size << 1);
        } else if load <= self.policy.shrink_limit && size > self.policy.min_size {
            self.resize(size >> 1);
        }
    }

    fn resize(&mut self, new_size: usize) {
        let old = std::mem::replace(&mut self.buckets, (0..new_size).map(|_| Vec::new()).collect());
        for entry in old.into_iter().flatten() {
            let b = self.bucket_of(entry.hash);
            self.buckets[b].push(entry);
        }
        self.resizes += 1;
        tracing::debug!(target: "otter::heap", size = new_size, count = self.count, "string table resized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr::Wide;

    fn small_policy() -> StrtabPolicy {
        StrtabPolicy {
            initial_size: 16,
            min_size: 16,
            max_size: 1024,
            resize_check_mask: 0,
            ..StrtabPolicy::default()
        }
    }

    #[test]
    fn test_insert_find_unlink() {
        let mut t: StringTable<Wide> = StringTable::new(small_policy());
        let a = HeapRef::new(1, 0);
        let b = HeapRef::new(2, 0);
        t.insert(7, a);
        t.insert(7, b);
        assert_eq!(t.find(7, |r| r == b), Some(b));
        assert_eq!(t.find(8, |_| true), None);
        assert!(t.unlink(7, a));
        assert!(!t.unlink(7, a));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_grow_and_shrink() {
        let mut t: StringTable<Wide> = StringTable::new(small_policy());
        for i in 0..64u32 {
            t.insert(i.wrapping_mul(2_654_435_761), HeapRef::new(i, 0));
        }
        assert!(t.size() > 16);
        let grown = t.size();

        let removed = t.retain(|r| r.slot() < 2);
        assert_eq!(removed, 62);
        t.force_resize();
        assert!(t.size() < grown);
        for i in 0..2u32 {
            assert!(t.contains(i.wrapping_mul(2_654_435_761), HeapRef::new(i, 0)));
        }
    }
}
