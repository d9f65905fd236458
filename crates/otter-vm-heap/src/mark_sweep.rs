//! Mark-and-sweep collector
//!
//! Backs up reference counting: frees cycles, runs finalizers, and is the
//! allocation failure fallback. Marking recurses up to a depth limit; cells
//! reached beyond it are flagged as temp roots and rescanned from the heap
//! lists until no temp roots remain, so marking completes in bounded stack.
//!
//! ## Cycle
//!
//! 1. Drain pending refzero work
//! 2. Mark roots, then temp roots
//! 3. Flag unreachable objects with a pending finalizer and mark them
//! 4. Mark the finalize list, then temp roots
//! 5. Decref the children of every unreachable object
//! 6. Sweep the heap lists and the string table
//! 7. Emergency only: compact objects and resize the string table
//! 8. Reset the trigger, then run queued finalizers

use std::ops::BitOr;
use std::time::Instant;

use smallvec::SmallVec;

use crate::arena::HeaderTable;
use crate::finalization::has_finalizer_fast;
use crate::header::{HeapType, flags, object_flags};
use crate::heap::{Heap, HeapBody};
use crate::list::ListKind;
use crate::ptr::{HeapRef, PtrRepr};

/// Mark-and-sweep flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsFlags(u32);

impl MsFlags {
    /// Last-ditch cycle: compact every object, resize the string table
    pub const EMERGENCY: MsFlags = MsFlags(1 << 0);
    /// Do not run finalizers at the end of the cycle
    pub const NO_FINALIZERS: MsFlags = MsFlags(1 << 1);
    /// Do not compact objects even in an emergency
    pub const NO_OBJECT_COMPACTION: MsFlags = MsFlags(1 << 2);

    /// No flags
    pub const fn empty() -> Self {
        MsFlags(0)
    }

    /// True if all bits of `other` are set
    pub const fn contains(self, other: MsFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MsFlags {
    type Output = MsFlags;

    fn bitor(self, rhs: MsFlags) -> MsFlags {
        MsFlags(self.0 | rhs.0)
    }
}

struct Marker<'a, P: PtrRepr> {
    headers: &'a mut HeaderTable<P>,
    bodies: &'a [Option<HeapBody<P>>],
    depth: u32,
    limit: u32,
    reclimit_hit: bool,
}

impl<'a, P: PtrRepr> Marker<'a, P> {
    fn new(headers: &'a mut HeaderTable<P>, bodies: &'a [Option<HeapBody<P>>], limit: u32) -> Self {
        Self {
            headers,
            bodies,
            depth: 0,
            limit,
            reclimit_hit: false,
        }
    }

    fn mark(&mut self, r: HeapRef<P>) {
        if let Some(slot) = self.headers.resolve(r) {
            self.mark_slot(slot as u32);
        }
    }

    fn mark_slot(&mut self, slot: u32) {
        let h = self.headers.slot_mut(slot);
        if h.is_readonly() || h.is_reachable() {
            return;
        }
        h.set(flags::REACHABLE);
        if h.htype() != HeapType::Object {
            return;
        }
        if self.depth >= self.limit {
            h.set(flags::TEMPROOT);
            self.reclimit_hit = true;
            return;
        }
        let fastrefs = h.has(object_flags::FASTREFS);
        let bodies = self.bodies;
        let Some(Some(HeapBody::Object(obj))) = bodies.get(slot as usize) else {
            return;
        };
        self.depth += 1;
        obj.for_each_base_child(|c| self.mark(c));
        if !fastrefs {
            obj.for_each_subtype_child(|c| self.mark(c));
        }
        self.depth -= 1;
    }

    /// Rescan the heap lists for temp roots until none are left
    fn mark_temproots(&mut self) {
        let mut rounds = 0u32;
        while self.reclimit_hit {
            self.reclimit_hit = false;
            rounds += 1;
            for kind in [ListKind::Allocated, ListKind::Finalize, ListKind::Refzero] {
                let (list, hdrs) = self.headers.list_mut(kind);
                let slots = list.slots(hdrs);
                for slot in slots {
                    let h = self.headers.slot_mut(slot);
                    if !h.is_temproot() {
                        continue;
                    }
                    h.clear(flags::TEMPROOT | flags::REACHABLE);
                    self.mark_slot(slot);
                }
            }
        }
        if rounds > 0 {
            tracing::trace!(target: "otter::heap", rounds, "temp roots processed");
        }
    }

    /// Flag unreachable objects whose finalizer has not run, then mark them
    /// so everything they reference survives until the finalizer runs
    fn mark_finalizable(&mut self) -> usize {
        let (list, hdrs) = self.headers.list_mut(ListKind::Allocated);
        let slots = list.slots(hdrs);
        let mut flagged: SmallVec<[u32; 16]> = SmallVec::new();
        for slot in slots {
            let h = self.headers.slot(slot);
            if h.is_reachable() || h.htype() != HeapType::Object || h.is_finalized() {
                continue;
            }
            if has_finalizer_fast(self.headers, self.bodies, slot) {
                self.headers.slot_mut(slot).set(flags::FINALIZABLE);
                flagged.push(slot);
            }
        }
        for &slot in &flagged {
            self.mark_slot(slot);
        }
        flagged.len()
    }

    fn mark_finalize_list(&mut self) {
        let (list, hdrs) = self.headers.list_mut(ListKind::Finalize);
        for slot in list.slots(hdrs) {
            self.mark_slot(slot);
        }
    }
}

impl<P: PtrRepr> Heap<P> {
    /// Run a mark-and-sweep cycle. Returns false if the cycle was skipped
    /// because collection is prevented or already in progress.
    pub fn mark_and_sweep(&mut self, flags: MsFlags) -> bool {
        if self.ms_prevent_count != 0 || self.headers.ms_running || self.refzero_running {
            tracing::trace!(target: "otter::heap", "mark-and-sweep skipped");
            return false;
        }
        self.drain_refzero();

        let flags = flags | self.ms_base_flags;
        let emergency = flags.contains(MsFlags::EMERGENCY);
        let start = Instant::now();
        let bytes_before = self.allocator.in_use();
        tracing::debug!(
            target: "otter::heap",
            emergency,
            objects = self.object_count(),
            strings = self.strtab.len(),
            bytes = bytes_before,
            "GC cycle starting"
        );

        self.headers.ms_running = true;
        let roots = self.collect_roots();
        let finalizable = {
            let mut marker = Marker::new(&mut self.headers, &self.bodies, self.config.mark_recursion_limit);
            for r in roots {
                marker.mark(r);
            }
            marker.mark_temproots();
            let finalizable = marker.mark_finalizable();
            marker.mark_finalize_list();
            marker.mark_temproots();
            finalizable
        };

        self.finalize_refcounts();
        let (kept_objects, freed_objects) = self.sweep_heap();
        let (kept_strings, freed_strings) = self.sweep_stringtable();
        self.clear_finalize_list_flags();

        if emergency && !flags.contains(MsFlags::NO_OBJECT_COMPACTION) {
            self.compact_all_objects();
        }
        if emergency {
            self.strtab.force_resize();
        }

        self.headers.ms_running = false;
        let live = (kept_objects + kept_strings) as i64;
        self.ms_trigger_counter = (live / 256) * self.config.trigger_mult + self.config.trigger_add;

        let elapsed = start.elapsed();
        self.stats.collections += 1;
        if emergency {
            self.stats.emergency_collections += 1;
        }
        self.stats.last_kept_objects = kept_objects;
        self.stats.last_kept_strings = kept_strings;
        self.stats.last_freed = freed_objects + freed_strings;
        self.stats.last_gc_time = elapsed;
        self.stats.total_gc_time += elapsed;

        tracing::debug!(
            target: "otter::heap",
            kept_objects,
            kept_strings,
            freed_objects,
            freed_strings,
            finalizable,
            bytes_freed = bytes_before.saturating_sub(self.allocator.in_use()),
            elapsed_us = elapsed.as_micros() as u64,
            trigger = self.ms_trigger_counter,
            "GC cycle complete"
        );

        if !flags.contains(MsFlags::NO_FINALIZERS) {
            self.process_finalize_list();
        }
        true
    }

    fn collect_roots(&self) -> SmallVec<[HeapRef<P>; 32]> {
        let mut roots: SmallVec<[HeapRef<P>; 32]> = SmallVec::new();
        roots.push(self.heap_thread);
        roots.push(self.heap_object);
        roots.extend(self.builtin_strings.iter().copied());
        roots.extend([self.lj.value1, self.lj.value2].iter().filter_map(|v| v.heap_ref()));
        roots.extend(self.breakpoints.iter().map(|bp| bp.filename));
        roots.extend(self.pinned_keys.iter().copied());
        roots
    }

    /// Decref the children of every unreachable cell so that reachable
    /// cells end the cycle with exact counts
    fn finalize_refcounts(&mut self) {
        let (list, hdrs) = self.headers.list_mut(ListKind::Allocated);
        for slot in list.slots(hdrs) {
            if !self.headers.slot(slot).is_reachable() {
                self.refcount_finalize_slot(slot);
            }
        }
    }

    /// Free unreachable cells, move reachable finalizable objects to the
    /// finalize list, clear marks on the rest. Returns (kept, freed).
    fn sweep_heap(&mut self) -> (usize, usize) {
        let (list, hdrs) = self.headers.list_mut(ListKind::Allocated);
        let slots = list.slots(hdrs);
        let mut kept = 0;
        let mut freed = 0;
        for slot in slots {
            let h = self.headers.slot_mut(slot);
            if h.is_reachable() {
                if h.is_finalizable() {
                    self.headers.move_to(slot, ListKind::Finalize);
                } else {
                    // Reachable again after finalization: rescued.
                    h.clear(flags::REACHABLE | flags::FINALIZED);
                    kept += 1;
                }
            } else {
                self.free_cell(slot);
                freed += 1;
            }
        }
        (kept, freed)
    }

    /// Free unmarked strings and clear marks on the rest
    fn sweep_stringtable(&mut self) -> (usize, usize) {
        let headers = &mut self.headers;
        let mut dead: Vec<HeapRef<P>> = Vec::new();
        self.strtab.retain(|r| match headers.get_mut(r) {
            Some(h) if h.is_reachable() => {
                h.clear(flags::REACHABLE);
                true
            }
            Some(_) => {
                dead.push(r);
                false
            }
            None => false,
        });
        let freed = dead.len();
        for r in dead {
            self.free_cell(r.slot());
        }
        (self.strtab.len(), freed)
    }

    fn clear_finalize_list_flags(&mut self) {
        let (list, hdrs) = self.headers.list_mut(ListKind::Finalize);
        for slot in list.slots(hdrs) {
            let h = self.headers.slot_mut(slot);
            debug_assert!(h.is_finalizable());
            h.clear(flags::REACHABLE);
        }
    }

    fn compact_all_objects(&mut self) {
        let mut slots = Vec::new();
        for kind in [ListKind::Allocated, ListKind::Finalize] {
            let (list, hdrs) = self.headers.list_mut(kind);
            slots.extend(list.slots(hdrs));
        }
        let mut compacted = 0usize;
        for slot in slots {
            if self.headers.slot(slot).htype() != HeapType::Object {
                continue;
            }
            let r = self.headers.handle(slot);
            match self.compact_object(r) {
                Ok(()) => compacted += 1,
                Err(e) => tracing::trace!(target: "otter::heap", slot, error = %e, "compaction skipped"),
            }
        }
        tracing::debug!(target: "otter::heap", compacted, "emergency compaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;
    use crate::value::TaggedValue;

    #[test]
    fn test_flags() {
        let f = MsFlags::EMERGENCY | MsFlags::NO_FINALIZERS;
        assert!(f.contains(MsFlags::EMERGENCY));
        assert!(!f.contains(MsFlags::NO_OBJECT_COMPACTION));
        assert!(MsFlags::empty().contains(MsFlags::empty()));
    }

    #[test]
    fn test_cycle_is_collected() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let a = heap.alloc_object().unwrap();
        let b = heap.alloc_object().unwrap();
        heap.put_str(a, "peer", TaggedValue::Object(b)).unwrap();
        heap.put_str(b, "peer", TaggedValue::Object(a)).unwrap();
        heap.set_top(0).unwrap();
        assert!(heap.is_live(a) && heap.is_live(b));

        assert!(heap.mark_and_sweep(MsFlags::empty()));
        assert!(!heap.is_live(a));
        assert!(!heap.is_live(b));
        heap.verify().unwrap();
    }

    #[test]
    fn test_prevented_cycle_is_skipped() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        heap.prevent_gc();
        assert!(!heap.mark_and_sweep(MsFlags::empty()));
        heap.allow_gc();
        assert!(heap.mark_and_sweep(MsFlags::empty()));
    }

    #[test]
    fn test_deep_chain_uses_temproots() {
        let config = HeapConfig {
            mark_recursion_limit: 4,
            ..HeapConfig::default()
        };
        let mut heap = Heap::new(config).unwrap();
        let head = heap.alloc_object().unwrap();
        let mut prev = head;
        let mut cells = vec![head];
        for _ in 0..200 {
            let next = heap.alloc_object().unwrap();
            heap.put_str(prev, "next", TaggedValue::Object(next)).unwrap();
            heap.pop().unwrap();
            cells.push(next);
            prev = next;
        }
        // Close the loop so refcounting alone cannot free the chain.
        heap.put_str(prev, "next", TaggedValue::Object(head)).unwrap();

        heap.mark_and_sweep(MsFlags::empty());
        assert!(cells.iter().all(|&c| heap.is_live(c)));
        heap.verify().unwrap();

        heap.set_top(0).unwrap();
        heap.mark_and_sweep(MsFlags::empty());
        assert!(cells.iter().all(|&c| !heap.is_live(c)));
    }
}
