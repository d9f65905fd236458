//! Entries part with optional hash part
//!
//! The same layout backs both the string-keyed entries part and the sparse
//! index part; only the key type differs.

use std::mem;

use super::{PropFlags, PropValue, StrKey};
use crate::ptr::PtrRepr;

/// Hash slot that has never held an entry; ends a probe sequence
pub const HASH_UNUSED: u32 = 0xffff_ffff;
/// Hash slot whose entry was deleted; probing continues past it
pub const HASH_DELETED: u32 = 0xffff_fffe;

/// Key stored in a property part
pub trait PartKey: Copy + PartialEq {
    /// Hash used for hash part probing
    fn key_hash(&self) -> u32;
}

impl<P: PtrRepr> PartKey for StrKey<P> {
    #[inline]
    fn key_hash(&self) -> u32 {
        self.hash
    }
}

impl PartKey for u32 {
    #[inline]
    fn key_hash(&self) -> u32 {
        self.wrapping_mul(3)
    }
}

/// Hash part size for an entry part of `e_size` slots: zero below
/// `hash_limit`, otherwise a power of two strictly larger than `e_size`
/// with some headroom.
pub fn compute_hash_size(e_size: u32, hash_limit: u32) -> u32 {
    if e_size < hash_limit {
        return 0;
    }
    let mut tmp = e_size;
    let mut res: u32 = 2;
    while tmp >= 0x40 {
        tmp >>= 6;
        res <<= 6;
    }
    while tmp != 0 {
        tmp >>= 1;
        res <<= 1;
    }
    res
}

/// Property part: `size` slots of which `[0, next)` have been handed out
#[derive(Debug, Clone)]
pub struct PropPart<K: PartKey, P: PtrRepr> {
    keys: Vec<Option<K>>,
    values: Vec<PropValue<P>>,
    attrs: Vec<PropFlags>,
    next: u32,
    hash: Option<Box<[u32]>>,
}

impl<K: PartKey, P: PtrRepr> Default for PropPart<K, P> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            attrs: Vec::new(),
            next: 0,
            hash: None,
        }
    }
}

impl<K: PartKey, P: PtrRepr> PropPart<K, P> {
    /// Empty part with room for `size` entries
    pub fn with_size(size: u32, hash_limit: u32) -> Self {
        let n = size as usize;
        let h_size = compute_hash_size(size, hash_limit);
        Self {
            keys: vec![None; n],
            values: vec![PropValue::default(); n],
            attrs: vec![PropFlags::empty(); n],
            next: 0,
            hash: (h_size > 0).then(|| vec![HASH_UNUSED; h_size as usize].into_boxed_slice()),
        }
    }

    /// Allocated slot count
    #[inline]
    pub fn size(&self) -> u32 {
        self.keys.len() as u32
    }

    /// First never-used slot
    #[inline]
    pub fn next(&self) -> u32 {
        self.next
    }

    /// Hash part size (0 if absent)
    #[inline]
    pub fn hash_size(&self) -> u32 {
        self.hash.as_ref().map_or(0, |h| h.len() as u32)
    }

    /// True when no slot is free for a new entry
    #[inline]
    pub fn is_full(&self) -> bool {
        self.next >= self.size()
    }

    /// Number of live entries
    pub fn used_count(&self) -> u32 {
        self.keys[..self.next as usize].iter().filter(|k| k.is_some()).count() as u32
    }

    /// Accounted bytes for a part of the given shape
    pub fn bytes_for(size: u32, hash_size: u32) -> usize {
        let per_entry = mem::size_of::<Option<K>>() + mem::size_of::<PropValue<P>>() + mem::size_of::<PropFlags>();
        size as usize * per_entry + hash_size as usize * mem::size_of::<u32>()
    }

    /// Accounted bytes for this part
    pub fn byte_size(&self) -> usize {
        Self::bytes_for(self.size(), self.hash_size())
    }

    /// Locate `key`: entry index and, when a hash part exists, hash slot
    pub fn find(&self, key: K) -> Option<(u32, Option<u32>)> {
        match &self.hash {
            Some(h) => {
                let mask = h.len() as u32 - 1;
                let mut i = key.key_hash() & mask;
                loop {
                    let t = h[i as usize];
                    if t == HASH_UNUSED {
                        return None;
                    }
                    if t != HASH_DELETED && self.keys[t as usize] == Some(key) {
                        return Some((t, Some(i)));
                    }
                    i = (i + 1) & mask;
                }
            }
            None => self.keys[..self.next as usize]
                .iter()
                .position(|k| *k == Some(key))
                .map(|idx| (idx as u32, None)),
        }
    }

    /// Append an entry; `None` if the part is full
    pub fn insert(&mut self, key: K, value: PropValue<P>, attrs: PropFlags) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let idx = self.next;
        self.next += 1;
        self.keys[idx as usize] = Some(key);
        self.values[idx as usize] = value;
        self.attrs[idx as usize] = attrs;
        if let Some(h) = &mut self.hash {
            let mask = h.len() as u32 - 1;
            let mut i = key.key_hash() & mask;
            // The hash part is larger than the entry part, so a free slot exists.
            while h[i as usize] < HASH_DELETED {
                i = (i + 1) & mask;
            }
            h[i as usize] = idx;
        }
        Some(idx)
    }

    /// Remove the entry at `idx`, handing back ownership of its contents
    pub fn remove(&mut self, idx: u32, hash_slot: Option<u32>) -> Option<(K, PropValue<P>, PropFlags)> {
        let key = self.keys.get_mut(idx as usize)?.take()?;
        let value = mem::take(&mut self.values[idx as usize]);
        let attrs = mem::take(&mut self.attrs[idx as usize]);
        if let (Some(h), Some(slot)) = (&mut self.hash, hash_slot) {
            h[slot as usize] = HASH_DELETED;
        }
        Some((key, value, attrs))
    }

    /// Key at `idx` (None for deleted or unused slots)
    #[inline]
    pub fn key(&self, idx: u32) -> Option<K> {
        self.keys.get(idx as usize).copied().flatten()
    }

    /// Value at `idx`
    #[inline]
    pub fn value(&self, idx: u32) -> &PropValue<P> {
        &self.values[idx as usize]
    }

    /// Mutable value at `idx`
    #[inline]
    pub fn value_mut(&mut self, idx: u32) -> &mut PropValue<P> {
        &mut self.values[idx as usize]
    }

    /// Attributes at `idx`
    #[inline]
    pub fn attrs(&self, idx: u32) -> PropFlags {
        self.attrs[idx as usize]
    }

    /// Replace attributes at `idx`
    #[inline]
    pub fn set_attrs(&mut self, idx: u32, attrs: PropFlags) {
        self.attrs[idx as usize] = attrs;
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (u32, K, &PropValue<P>, PropFlags)> + '_ {
        (0..self.next).filter_map(move |i| {
            let k = self.keys[i as usize]?;
            Some((i, k, &self.values[i as usize], self.attrs[i as usize]))
        })
    }

    /// Live values, for child enumeration
    pub fn live_values(&self) -> impl Iterator<Item = &PropValue<P>> + '_ {
        self.keys[..self.next as usize]
            .iter()
            .zip(&self.values)
            .filter_map(|(k, v)| k.is_some().then_some(v))
    }

    /// Rebuild into a part of `new_size` slots, moving live entries in order
    /// and dropping deleted ones. Ownership of values moves; no refcount
    /// changes are needed. `new_size` must hold every live entry.
    pub fn rebuild(mut self, new_size: u32, hash_limit: u32) -> Self {
        debug_assert!(new_size >= self.used_count(), "rebuild would drop entries");
        let mut out = Self::with_size(new_size, hash_limit);
        for i in 0..self.next as usize {
            if let Some(k) = self.keys[i] {
                let v = mem::take(&mut self.values[i]);
                out.insert(k, v, self.attrs[i]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr::Wide;
    use crate::value::TaggedValue;

    fn num(n: f64) -> PropValue<Wide> {
        PropValue::Data(TaggedValue::Number(n))
    }

    #[test]
    fn test_hash_size() {
        assert_eq!(compute_hash_size(0, 32), 0);
        assert_eq!(compute_hash_size(31, 32), 0);
        for e in [32u32, 33, 63, 64, 100, 1000, 4096, 100_000] {
            let h = compute_hash_size(e, 32);
            assert!(h.is_power_of_two());
            assert!(h > e, "hash {h} for {e}");
        }
    }

    #[test]
    fn test_linear_find_insert_remove() {
        let mut part: PropPart<u32, Wide> = PropPart::with_size(4, 32);
        assert_eq!(part.hash_size(), 0);
        part.insert(10, num(1.0), PropFlags::WEC).unwrap();
        part.insert(20, num(2.0), PropFlags::WEC).unwrap();
        let (idx, slot) = part.find(20).unwrap();
        assert_eq!(slot, None);
        assert_eq!(part.value(idx).as_data(), Some(TaggedValue::Number(2.0)));

        let (k, v, _) = part.remove(idx, slot).unwrap();
        assert_eq!(k, 20);
        assert_eq!(v, num(2.0));
        assert!(part.find(20).is_none());
        assert_eq!(part.used_count(), 1);
        assert_eq!(part.next(), 2);
    }

    #[test]
    fn test_hashed_probe_skips_deleted() {
        let mut part: PropPart<u32, Wide> = PropPart::with_size(40, 32);
        assert!(part.hash_size() > 40);
        for k in 0..40u32 {
            part.insert(k * 64, num(k as f64), PropFlags::WEC).unwrap();
        }
        assert!(part.is_full());
        assert!(part.insert(9999, num(0.0), PropFlags::WEC).is_none());

        let (idx, slot) = part.find(5 * 64).unwrap();
        assert!(slot.is_some());
        part.remove(idx, slot);
        assert!(part.find(5 * 64).is_none());
        for k in (0..40u32).filter(|&k| k != 5) {
            let (idx, _) = part.find(k * 64).unwrap();
            assert_eq!(part.value(idx).as_data(), Some(TaggedValue::Number(k as f64)));
        }
    }

    #[test]
    fn test_rebuild_compacts() {
        let mut part: PropPart<u32, Wide> = PropPart::with_size(8, 4);
        for k in 0..8u32 {
            part.insert(k, num(k as f64), PropFlags::WEC);
        }
        for k in [1u32, 3, 5] {
            let (idx, slot) = part.find(k).unwrap();
            part.remove(idx, slot);
        }
        let part = part.rebuild(5, 4);
        assert_eq!(part.size(), 5);
        assert_eq!(part.next(), 5);
        assert!(part.is_full());
        let keys: Vec<u32> = part.iter().map(|(_, k, _, _)| k).collect();
        assert_eq!(keys, vec![0, 2, 4, 6, 7]);
        assert_eq!(part.value(part.find(7).unwrap().0).as_data(), Some(TaggedValue::Number(7.0)));
    }
}
