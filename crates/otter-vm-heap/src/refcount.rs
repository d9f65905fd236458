//! Reference counting
//!
//! Every heap-to-heap reference and every root slot contributes one count.
//! A decref that reaches zero queues the cell; the queue is drained at a
//! refzero checkpoint, which frees cells iteratively so that releasing a
//! long chain never recurses.
//!
//! Objects with a finalizer that has not run yet are never freed here; they
//! stay on the allocated list for mark-and-sweep to finalize.

use crate::finalization::has_finalizer_fast;
use crate::header::HeapType;
use crate::heap::{Heap, HeapBody};
use crate::list::ListKind;
use crate::mark_sweep::MsFlags;
use crate::ptr::{HeapRef, PtrRepr};
use crate::value::TaggedValue;

impl<P: PtrRepr> Heap<P> {
    /// Increment the refcount of a cell
    #[inline]
    pub fn incref(&mut self, r: HeapRef<P>) {
        self.headers.incref(r);
    }

    /// Increment the refcount of the cell held by a value, if any
    #[inline]
    pub fn incref_value(&mut self, v: &TaggedValue<P>) {
        self.headers.incref_value(v);
    }

    /// Decrement and free whatever becomes unreferenced
    pub fn decref(&mut self, r: HeapRef<P>) {
        if self.headers.decref_norz(r) {
            self.refzero_free_pending();
        }
    }

    /// Decrement the cell held by a value, if any
    pub fn decref_value(&mut self, v: &TaggedValue<P>) {
        if self.headers.decref_value_norz(v) {
            self.refzero_free_pending();
        }
    }

    /// Decrement without draining. Returns true if the cell was queued; the
    /// caller must reach [`Heap::refzero_check`] before returning control.
    pub fn decref_norz(&mut self, r: HeapRef<P>) -> bool {
        self.headers.decref_norz(r)
    }

    /// Refzero checkpoint: drain queued cells if there are any
    #[inline]
    pub fn refzero_check(&mut self) {
        if self.headers.has_refzero_work() {
            self.refzero_free_pending();
        }
    }

    /// Drain the refzero queues and run the voluntary GC trigger for the
    /// freed cells
    pub fn refzero_free_pending(&mut self) {
        let freed = self.drain_refzero();
        if freed == 0 || !self.config.voluntary_gc {
            return;
        }
        self.ms_trigger_counter -= freed as i64;
        if self.ms_trigger_counter < 0 {
            tracing::trace!(target: "otter::heap", freed, "voluntary GC triggered by refzero");
            self.mark_and_sweep(MsFlags::empty());
        }
    }

    /// Free queued cells until both queues are empty. Re-entrant calls
    /// return immediately; the outer drain picks up their work.
    pub(crate) fn drain_refzero(&mut self) -> usize {
        if self.refzero_running {
            return 0;
        }
        self.refzero_running = true;
        let mut freed = 0usize;
        loop {
            let (list, hdrs) = self.headers.list_mut(ListKind::Refzero);
            if let Some(slot) = list.pop_front(hdrs) {
                if self.refzero_keep_for_finalizer(slot) {
                    self.headers.move_to(slot, ListKind::Allocated);
                    continue;
                }
                self.refcount_finalize_slot(slot);
                self.free_cell(slot);
                freed += 1;
            } else if let Some(r) = self.headers.pending_strings.pop() {
                // The string may have been re-referenced or already swept.
                let Some(h) = self.headers.get(r) else {
                    continue;
                };
                if h.htype() != HeapType::String || h.refcount() != 0 || h.is_readonly() {
                    continue;
                }
                if let Some(HeapBody::String(s)) = &self.bodies[r.slot() as usize] {
                    let hash = s.hash();
                    self.strtab.unlink(hash, r);
                }
                self.free_cell(r.slot());
                freed += 1;
            } else {
                break;
            }
        }
        self.refzero_running = false;
        if freed > 0 {
            self.stats.refzero_frees += freed as u64;
            tracing::trace!(target: "otter::heap", freed, "refzero drain");
        }
        freed
    }

    fn refzero_keep_for_finalizer(&self, slot: u32) -> bool {
        let h = self.headers.slot(slot);
        h.htype() == HeapType::Object && !h.is_finalized() && has_finalizer_fast(&self.headers, &self.bodies, slot)
    }

    /// Decref every child of an object without draining
    pub(crate) fn refcount_finalize_slot(&mut self, slot: u32) {
        if let Some(HeapBody::Object(o)) = &self.bodies[slot as usize] {
            let headers = &mut self.headers;
            o.for_each_child(|c| {
                headers.decref_norz(c);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::{Heap, HeapConfig};
    use crate::value::TaggedValue;

    #[test]
    fn test_chain_freed_iteratively() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let head = heap.alloc_object().unwrap();
        let mut prev = head;
        let mut cells = vec![head];
        for _ in 0..10_000 {
            let next = heap.alloc_object().unwrap();
            heap.put_str(prev, "next", TaggedValue::Object(next)).unwrap();
            heap.pop().unwrap();
            cells.push(next);
            prev = next;
        }
        assert_eq!(heap.stack_len(), 1);
        heap.pop().unwrap();
        assert!(cells.iter().all(|&c| !heap.is_live(c)));
    }

    #[test]
    fn test_string_freed_when_unreferenced() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let s = heap.push_string("transient").unwrap();
        let before = heap.string_count();
        heap.pop().unwrap();
        assert!(!heap.is_live(s));
        assert_eq!(heap.string_count(), before - 1);
        let again = heap.intern(b"transient").unwrap();
        assert_ne!(again, s);
    }
}
