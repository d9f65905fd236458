//! String position cache
//!
//! Weak `(string, char offset, byte offset)` entries that let repeated
//! char-to-byte offset lookups on long non-ASCII strings resume scanning from
//! a nearby known position. Entries do not keep strings alive; the heap
//! evicts them when a string is freed.

use crate::hstring::HString;
use crate::ptr::{HeapRef, PtrRepr};

#[derive(Debug, Clone, Copy)]
struct CacheEntry<P: PtrRepr> {
    string: HeapRef<P>,
    cidx: u32,
    bidx: usize,
}

/// Fixed-size string position cache, most recently used entry first
pub struct StringCache<P: PtrRepr> {
    entries: Vec<Option<CacheEntry<P>>>,
    no_cache_limit: u32,
}

#[inline]
fn is_continuation(b: u8) -> bool {
    b & 0xc0 == 0x80
}

impl<P: PtrRepr> StringCache<P> {
    /// Create a cache with `size` entries; strings up to `no_cache_limit`
    /// characters are always scanned from the start
    pub fn new(size: usize, no_cache_limit: u32) -> Self {
        Self {
            entries: vec![None; size],
            no_cache_limit,
        }
    }

    /// True if `string` has a cache entry
    pub fn contains(&self, string: HeapRef<P>) -> bool {
        self.entries.iter().flatten().any(|e| e.string == string)
    }

    /// Drop any entry for a freed string
    pub fn remove_string(&mut self, string: HeapRef<P>) {
        for slot in &mut self.entries {
            if slot.is_some_and(|e| e.string == string) {
                *slot = None;
            }
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    /// Translate a char offset into a byte offset; `None` if out of range
    pub fn char_to_byte(&mut self, string: HeapRef<P>, h: &HString, cidx: u32) -> Option<usize> {
        let clen = h.char_len();
        if cidx > clen {
            return None;
        }
        if h.is_ascii() {
            return Some(cidx as usize);
        }
        let bytes = h.bytes();
        if clen <= self.no_cache_limit || self.entries.is_empty() {
            return Some(scan_forward(bytes, 0, 0, cidx));
        }

        let hit = self
            .entries
            .iter()
            .position(|e| e.is_some_and(|e| e.string == string));

        // Pick the closest known position: start, end, or the cached entry.
        let dist_start = cidx;
        let dist_end = clen - cidx;
        let mut best = if dist_start <= dist_end {
            (dist_start, 0u32, 0usize)
        } else {
            (dist_end, clen, bytes.len())
        };
        if let Some(e) = hit.and_then(|i| self.entries[i]) {
            let d = e.cidx.abs_diff(cidx);
            if d < best.0 {
                best = (d, e.cidx, e.bidx);
            }
        }
        let (_, from_c, from_b) = best;
        let bidx = if from_c <= cidx {
            scan_forward(bytes, from_c, from_b, cidx)
        } else {
            scan_backward(bytes, from_c, from_b, cidx)
        };

        let victim = hit.unwrap_or(self.entries.len() - 1);
        self.entries[victim] = Some(CacheEntry { string, cidx, bidx });
        self.entries[..=victim].rotate_right(1);
        Some(bidx)
    }
}

fn scan_forward(bytes: &[u8], mut c: u32, mut b: usize, target: u32) -> usize {
    while c < target {
        b += 1;
        while b < bytes.len() && is_continuation(bytes[b]) {
            b += 1;
        }
        c += 1;
    }
    b
}

fn scan_backward(bytes: &[u8], mut c: u32, mut b: usize, target: u32) -> usize {
    while c > target {
        b -= 1;
        while b > 0 && is_continuation(bytes[b]) {
            b -= 1;
        }
        c -= 1;
    }
    b
}
