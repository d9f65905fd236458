//! Header arena
//!
//! Headers are stored apart from cell bodies so the marker and the refcount
//! code can mutate header state while reading object bodies. The table owns
//! the slot free list and the three heap lists.

use std::marker::PhantomData;

use crate::error::{HeapError, HeapResult};
use crate::header::{HeapHeader, HeapType};
use crate::list::{HeapList, ListKind};
use crate::ptr::{HeapRef, PtrRepr};
use crate::value::TaggedValue;

/// Header storage, heap lists and refzero queues
pub struct HeaderTable<P: PtrRepr> {
    pub(crate) hdrs: Vec<HeapHeader>,
    free: Vec<u32>,
    pub(crate) allocated: HeapList,
    pub(crate) finalize: HeapList,
    pub(crate) refzero: HeapList,
    /// Strings whose refcount reached zero; freed at the next drain
    pub(crate) pending_strings: Vec<HeapRef<P>>,
    /// Set while mark-and-sweep runs; refzero queuing is suppressed
    pub(crate) ms_running: bool,
    _repr: PhantomData<P>,
}

impl<P: PtrRepr> HeaderTable<P> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            hdrs: Vec::new(),
            free: Vec::new(),
            allocated: HeapList::new(ListKind::Allocated),
            finalize: HeapList::new(ListKind::Finalize),
            refzero: HeapList::new(ListKind::Refzero),
            pending_strings: Vec::new(),
            ms_running: false,
            _repr: PhantomData,
        }
    }

    /// Slot capacity (live and free)
    pub fn capacity(&self) -> usize {
        self.hdrs.len()
    }

    /// Number of live cells
    pub fn live_count(&self) -> usize {
        self.hdrs.len() - self.free.len()
    }

    /// Take a free slot (or a new one) for a fresh cell
    pub fn alloc(&mut self, htype: HeapType, user_flags: u32) -> HeapResult<HeapRef<P>> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.hdrs.len() as u32;
                if slot >= P::MAX_SLOTS {
                    return Err(HeapError::OutOfMemory);
                }
                self.hdrs.push(HeapHeader::new(htype, 0, 0));
                slot
            }
        };
        let generation = self.hdrs[slot as usize].generation();
        self.hdrs[slot as usize] = HeapHeader::new(htype, user_flags, generation);
        Ok(HeapRef::new(slot, generation))
    }

    /// Return a slot to the free list, invalidating outstanding handles
    pub(crate) fn release(&mut self, slot: u32) {
        let h = &mut self.hdrs[slot as usize];
        debug_assert!(h.list.is_none(), "releasing a linked header");
        let next_gen = h.generation().wrapping_add(1) & P::GENERATION_MASK;
        *h = HeapHeader::new(HeapType::Object, 0, next_gen);
        self.free.push(slot);
    }

    /// Resolve a handle to its slot if it is still live
    #[inline]
    pub fn resolve(&self, r: HeapRef<P>) -> Option<usize> {
        let slot = r.slot() as usize;
        let h = self.hdrs.get(slot)?;
        // Release bumps the generation, so stale handles never match.
        (h.generation() == r.generation()).then_some(slot)
    }

    /// Header for a live handle
    #[inline]
    pub fn get(&self, r: HeapRef<P>) -> Option<&HeapHeader> {
        self.resolve(r).map(|slot| &self.hdrs[slot])
    }

    /// Mutable header for a live handle
    #[inline]
    pub fn get_mut(&mut self, r: HeapRef<P>) -> Option<&mut HeapHeader> {
        let slot = self.resolve(r)?;
        Some(&mut self.hdrs[slot])
    }

    /// Header by raw slot
    #[inline]
    pub(crate) fn slot(&self, slot: u32) -> &HeapHeader {
        &self.hdrs[slot as usize]
    }

    /// Mutable header by raw slot
    #[inline]
    pub(crate) fn slot_mut(&mut self, slot: u32) -> &mut HeapHeader {
        &mut self.hdrs[slot as usize]
    }

    /// Handle for a raw slot holding a live cell
    #[inline]
    pub(crate) fn handle(&self, slot: u32) -> HeapRef<P> {
        HeapRef::new(slot, self.hdrs[slot as usize].generation())
    }

    /// List by identity, split from the header storage
    pub(crate) fn list_mut(&mut self, kind: ListKind) -> (&mut HeapList, &mut Vec<HeapHeader>) {
        let list = match kind {
            ListKind::Allocated => &mut self.allocated,
            ListKind::Finalize => &mut self.finalize,
            ListKind::Refzero => &mut self.refzero,
        };
        (list, &mut self.hdrs)
    }

    /// Link a fresh cell into the allocated list
    pub(crate) fn link_allocated(&mut self, r: HeapRef<P>) {
        self.allocated.push_front(&mut self.hdrs, r.slot());
    }

    /// Move a linked slot to the tail of another list
    pub(crate) fn move_to(&mut self, slot: u32, to: ListKind) {
        if let Some(from) = self.hdrs[slot as usize].list {
            let (list, hdrs) = self.list_mut(from);
            list.remove(hdrs, slot);
        }
        let (list, hdrs) = self.list_mut(to);
        list.push_back(hdrs, slot);
    }

    /// Unlink a slot from whatever list holds it
    pub(crate) fn unlink(&mut self, slot: u32) {
        if let Some(from) = self.hdrs[slot as usize].list {
            let (list, hdrs) = self.list_mut(from);
            list.remove(hdrs, slot);
        }
    }

    /// Increment the refcount of a heap cell
    #[inline]
    pub fn incref(&mut self, r: HeapRef<P>) {
        if let Some(h) = self.get_mut(r) {
            if !h.is_readonly() {
                h.preinc_refcount();
            }
        }
    }

    /// Increment the refcount of the cell held by a value, if any
    #[inline]
    pub fn incref_value(&mut self, v: &TaggedValue<P>) {
        if let Some(r) = v.heap_ref() {
            self.incref(r);
        }
    }

    /// Decrement without draining; returns true if refzero work was queued.
    ///
    /// Strings go to the pending-string queue and stay interned until the
    /// drain. Objects and buffers move from the allocated list to the
    /// refzero list. While mark-and-sweep runs nothing is queued: the sweep
    /// decides the fate of zero-refcount cells.
    pub fn decref_norz(&mut self, r: HeapRef<P>) -> bool {
        let Some(slot) = self.resolve(r) else {
            return false;
        };
        let h = &mut self.hdrs[slot];
        if h.is_readonly() || h.predec_refcount() != 0 {
            return false;
        }
        if self.ms_running {
            return false;
        }
        match h.htype() {
            HeapType::String => {
                self.pending_strings.push(r);
                true
            }
            HeapType::Object | HeapType::Buffer => {
                if h.list != Some(ListKind::Allocated) {
                    return false;
                }
                self.move_to(slot as u32, ListKind::Refzero);
                true
            }
        }
    }

    /// Decrement the cell held by a value without draining
    #[inline]
    pub fn decref_value_norz(&mut self, v: &TaggedValue<P>) -> bool {
        match v.heap_ref() {
            Some(r) => self.decref_norz(r),
            None => false,
        }
    }

    /// True if refzero work is waiting
    pub fn has_refzero_work(&self) -> bool {
        !self.refzero.is_empty() || !self.pending_strings.is_empty()
    }
}

impl<P: PtrRepr> Default for HeaderTable<P> {
    fn default() -> Self {
        Self::new()
    }
}
