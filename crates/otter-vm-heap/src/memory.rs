//! Allocation wrapper
//!
//! Every heap allocation goes through [`Heap::alloc`] and friends. The
//! underlying [`Allocator`] only does byte accounting; storage itself comes
//! from the global allocator. An allocation attempt first ticks the voluntary
//! GC trigger, then asks the allocator. On failure the wrapper runs
//! mark-and-sweep and retries, escalating to an emergency collection after a
//! few failed attempts. Freeing never triggers a collection.

use crate::error::{HeapError, HeapResult};
use crate::heap::Heap;
use crate::mark_sweep::MsFlags;
use crate::ptr::PtrRepr;

/// Byte accounting backend
pub trait Allocator {
    /// Try to account `size` more bytes; false if the request cannot be met
    fn try_reserve(&mut self, size: usize) -> bool;

    /// Return `size` previously reserved bytes
    fn release(&mut self, size: usize);

    /// Bytes currently accounted
    fn in_use(&self) -> usize;
}

/// Unbounded accounting allocator
#[derive(Debug, Default)]
pub struct SystemAllocator {
    in_use: usize,
}

impl Allocator for SystemAllocator {
    fn try_reserve(&mut self, size: usize) -> bool {
        match self.in_use.checked_add(size) {
            Some(total) => {
                self.in_use = total;
                true
            }
            None => false,
        }
    }

    fn release(&mut self, size: usize) {
        debug_assert!(size <= self.in_use, "released more than reserved");
        self.in_use = self.in_use.saturating_sub(size);
    }

    fn in_use(&self) -> usize {
        self.in_use
    }
}

/// Accounting allocator with a hard byte limit
#[derive(Debug)]
pub struct LimitAllocator {
    limit: usize,
    in_use: usize,
    peak: usize,
}

impl LimitAllocator {
    /// Create an allocator that refuses to go above `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_use: 0,
            peak: 0,
        }
    }

    /// Configured limit
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Highest accounted total seen
    pub fn peak(&self) -> usize {
        self.peak
    }
}

impl Allocator for LimitAllocator {
    fn try_reserve(&mut self, size: usize) -> bool {
        match self.in_use.checked_add(size) {
            Some(total) if total <= self.limit => {
                self.in_use = total;
                self.peak = self.peak.max(total);
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, size: usize) {
        debug_assert!(size <= self.in_use, "released more than reserved");
        self.in_use = self.in_use.saturating_sub(size);
    }

    fn in_use(&self) -> usize {
        self.in_use
    }
}

/// Byte block handed out by the heap allocation API
#[derive(Debug, Default)]
pub struct HeapBlock {
    data: Vec<u8>,
    accounted: usize,
}

impl HeapBlock {
    /// Current length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes accounted against the heap allocator
    pub fn accounted(&self) -> usize {
        self.accounted
    }

    /// Contents
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Underlying vector; its length may change up to the accounted size
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    fn resize(&mut self, new_size: usize) {
        self.data.resize(new_size, 0);
        if new_size < self.data.capacity() / 2 {
            self.data.shrink_to_fit();
        }
        self.accounted = new_size;
    }
}

impl<P: PtrRepr> Heap<P> {
    /// Account `size` bytes, collecting garbage if the allocator refuses.
    ///
    /// This is the core of every allocating entry point: it decrements the
    /// voluntary trigger, runs the retry loop, and may run finalizers.
    pub(crate) fn reserve_bytes(&mut self, size: usize) -> HeapResult<()> {
        self.tick_voluntary_gc();
        if self.allocator.try_reserve(size) {
            return Ok(());
        }
        self.reserve_slow(size)
    }

    fn tick_voluntary_gc(&mut self) {
        if !self.config.voluntary_gc {
            return;
        }
        self.ms_trigger_counter -= 1;
        if self.ms_trigger_counter < 0 {
            tracing::trace!(target: "otter::heap", "voluntary GC triggered by allocation");
            self.mark_and_sweep(MsFlags::empty());
        }
    }

    fn reserve_slow(&mut self, size: usize) -> HeapResult<()> {
        if self.headers.ms_running {
            tracing::debug!(target: "otter::heap", size, "allocation failed during mark-and-sweep");
            return Err(HeapError::OutOfMemory);
        }
        for attempt in 0..self.config.alloc_retry_limit {
            let flags = if attempt + 1 >= self.config.emergency_retry_limit {
                MsFlags::EMERGENCY
            } else {
                MsFlags::empty()
            };
            tracing::debug!(
                target: "otter::heap",
                size,
                attempt,
                emergency = flags.contains(MsFlags::EMERGENCY),
                "allocation failed, retrying after mark-and-sweep"
            );
            self.mark_and_sweep(flags);
            if self.allocator.try_reserve(size) {
                return Ok(());
            }
        }
        tracing::debug!(target: "otter::heap", size, "allocation failed after retries");
        Err(HeapError::OutOfMemory)
    }

    /// Return accounted bytes; never triggers a collection
    pub(crate) fn release_bytes(&mut self, size: usize) {
        if size > 0 {
            self.allocator.release(size);
        }
    }

    /// Allocate an empty block with room for `size` bytes
    pub fn alloc(&mut self, size: usize) -> HeapResult<HeapBlock> {
        self.reserve_bytes(size)?;
        Ok(HeapBlock {
            data: Vec::with_capacity(size),
            accounted: size,
        })
    }

    /// Allocate a zero-filled block of `size` bytes
    pub fn alloc_zeroed(&mut self, size: usize) -> HeapResult<HeapBlock> {
        self.reserve_bytes(size)?;
        Ok(HeapBlock {
            data: vec![0; size],
            accounted: size,
        })
    }

    /// Resize a block held by the caller; new bytes are zero
    pub fn realloc(&mut self, block: &mut HeapBlock, new_size: usize) -> HeapResult<()> {
        let old = block.accounted;
        if new_size > old {
            self.reserve_bytes(new_size - old)?;
        } else {
            self.tick_voluntary_gc();
            self.release_bytes(old - new_size);
        }
        block.resize(new_size);
        Ok(())
    }

    /// Resize a block that lives inside the heap.
    ///
    /// A collection triggered by a retry may run finalizers that touch the
    /// block, so `get` re-fetches it before every attempt and the size delta
    /// is recomputed from what is current at that point.
    pub fn realloc_indirect<F>(&mut self, mut get: F, new_size: usize) -> HeapResult<()>
    where
        F: FnMut(&mut Heap<P>) -> Option<&mut HeapBlock>,
    {
        self.tick_voluntary_gc();
        let mut attempt = 0;
        loop {
            let old = get(self).ok_or(HeapError::InvalidRef)?.accounted;
            let reserved = new_size <= old || self.allocator.try_reserve(new_size - old);
            if reserved {
                if new_size < old {
                    self.release_bytes(old - new_size);
                }
                get(self).ok_or(HeapError::InvalidRef)?.resize(new_size);
                return Ok(());
            }
            if self.headers.ms_running || attempt >= self.config.alloc_retry_limit {
                return Err(HeapError::OutOfMemory);
            }
            let flags = if attempt + 1 >= self.config.emergency_retry_limit {
                MsFlags::EMERGENCY
            } else {
                MsFlags::empty()
            };
            tracing::debug!(target: "otter::heap", new_size, attempt, "indirect realloc failed, retrying");
            self.mark_and_sweep(flags);
            attempt += 1;
        }
    }

    /// Free a block; never triggers a collection
    pub fn free(&mut self, block: HeapBlock) {
        self.release_bytes(block.accounted);
    }

    /// Bytes currently accounted by the allocator
    pub fn memory_in_use(&self) -> usize {
        self.allocator.in_use()
    }
}
