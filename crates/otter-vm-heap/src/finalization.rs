//! Finalizer lookup and execution
//!
//! An object has a finalizer when it, or something on its prototype chain,
//! carries the hidden finalizer property. The `HAVE_FINALIZER` header flag
//! caches that per object so the collector never does a property lookup.
//!
//! Finalizers run only from mark-and-sweep, after the sweep, with collection
//! prevented. Each object is pinned for the call, then flagged `FINALIZED`
//! and returned to the allocated list; a later cycle frees it if it is still
//! unreachable, or clears the flag if the finalizer rescued it.

use crate::arena::HeaderTable;
use crate::error::{HeapError, HeapResult};
use crate::header::{HeapType, flags, object_flags};
use crate::heap::{BuiltinStr, Heap, HeapBody};
use crate::list::ListKind;
use crate::props::{PropFlags, PropKey, PropValue};
use crate::ptr::{HeapRef, PtrRepr};
use crate::value::{NativeFnId, TaggedValue};

/// Prototype chain walk limit
const PROTO_SANITY: u32 = 10_000;

/// Flag-based finalizer check over the prototype chain
pub(crate) fn has_finalizer_fast<P: PtrRepr>(
    headers: &HeaderTable<P>,
    bodies: &[Option<HeapBody<P>>],
    slot: u32,
) -> bool {
    let mut cur = Some(slot);
    let mut sanity = PROTO_SANITY;
    while let Some(s) = cur {
        if headers.slot(s).has(object_flags::HAVE_FINALIZER) {
            return true;
        }
        sanity -= 1;
        if sanity == 0 {
            break;
        }
        cur = match &bodies[s as usize] {
            Some(HeapBody::Object(o)) => o.proto.and_then(|p| headers.resolve(p)).map(|s| s as u32),
            _ => None,
        };
    }
    false
}

impl<P: PtrRepr> Heap<P> {
    /// True if `obj` or its prototype chain defines a finalizer
    pub fn has_finalizer(&self, obj: HeapRef<P>) -> HeapResult<bool> {
        let slot = self.headers.resolve(obj).ok_or(HeapError::InvalidRef)?;
        if self.headers.slot(slot as u32).htype() != HeapType::Object {
            return Ok(false);
        }
        Ok(has_finalizer_fast(&self.headers, &self.bodies, slot as u32))
    }

    /// Install `func` as the finalizer of `obj`. `func` must be a native
    /// function object or a light function.
    pub fn set_finalizer(&mut self, obj: HeapRef<P>, func: TaggedValue<P>) -> HeapResult<()> {
        let key = PropKey::String(self.builtin_string(BuiltinStr::Finalizer));
        self.define_prop(
            obj,
            key,
            PropValue::Data(func),
            PropFlags::WRITABLE | PropFlags::CONFIGURABLE,
        )
    }

    /// Run queued finalizers. Does nothing while finalizers are prevented or
    /// already running.
    pub(crate) fn process_finalize_list(&mut self) {
        if self.pf_prevent_count != 0 || self.finalizers_running || self.headers.finalize.is_empty() {
            return;
        }
        self.finalizers_running = true;
        self.ms_prevent_count += 1;

        let mut count = 0u64;
        while let Some(slot) = self.headers.finalize.head() {
            self.finalize_one(slot);
            let h = self.headers.slot_mut(slot);
            h.clear(flags::FINALIZABLE);
            self.headers.move_to(slot, ListKind::Allocated);
            count += 1;
        }

        self.ms_prevent_count -= 1;
        self.finalizers_running = false;
        tracing::debug!(target: "otter::heap", count, "finalizers executed");
        self.refzero_check();
    }

    /// Pin, call the finalizer, unpin without queueing, flag `FINALIZED`
    fn finalize_one(&mut self, slot: u32) {
        let r = self.headers.handle(slot);
        self.headers.slot_mut(slot).preinc_refcount();
        let result = self.run_finalizer(r);
        let h = self.headers.slot_mut(slot);
        h.predec_refcount();
        h.set(flags::FINALIZED);

        self.stats.finalizers_run += 1;
        if let Err(e) = result {
            self.stats.finalizer_errors += 1;
            tracing::warn!(target: "otter::heap", obj = ?r, error = %e, "finalizer failed");
        }
    }

    fn run_finalizer(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        let key = PropKey::String(self.builtin_string(BuiltinStr::Finalizer));
        let Some(PropValue::Data(value)) = self.get_prop(obj, key)? else {
            return Ok(());
        };
        let id = self.callable_native(&value)?;
        self.call_native(id, obj)
    }

    fn callable_native(&self, value: &TaggedValue<P>) -> HeapResult<NativeFnId> {
        match value {
            TaggedValue::LightFunc(lf) => Ok(lf.func),
            TaggedValue::Object(f) => self
                .object(*f)?
                .kind
                .native_fn()
                .ok_or_else(|| HeapError::type_error("finalizer is not a native function")),
            TaggedValue::Undefined => Err(HeapError::type_error("finalizer is undefined")),
            _ => Err(HeapError::type_error("finalizer is not callable")),
        }
    }

    /// Heap destruction: run every finalizer that has not run yet, once
    pub(crate) fn run_remaining_finalizers(&mut self) {
        self.process_finalize_list();
        if self.pf_prevent_count != 0 {
            return;
        }
        self.finalizers_running = true;
        self.ms_prevent_count += 1;
        let (list, hdrs) = self.headers.list_mut(ListKind::Allocated);
        let slots = list.slots(hdrs);
        let mut count = 0u64;
        for slot in slots {
            // An earlier finalizer may have released this cell.
            if self.bodies[slot as usize].is_none() {
                continue;
            }
            let h = self.headers.slot(slot);
            if h.htype() != HeapType::Object || h.is_finalized() {
                continue;
            }
            if has_finalizer_fast(&self.headers, &self.bodies, slot) {
                self.finalize_one(slot);
                count += 1;
            }
        }
        self.ms_prevent_count -= 1;
        self.finalizers_running = false;
        if count > 0 {
            tracing::debug!(target: "otter::heap", count, "finalizers executed at teardown");
        }
        self.refzero_check();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::heap::{Heap, HeapConfig};
    use crate::mark_sweep::MsFlags;
    use crate::value::{LightFunc, TaggedValue};

    #[test]
    fn test_flag_follows_property() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let id = heap.register_native(|_, _| Ok(()));
        let obj = heap.alloc_object().unwrap();
        assert!(!heap.has_finalizer(obj).unwrap());
        heap.set_finalizer(obj, TaggedValue::LightFunc(LightFunc { func: id, flags: 0 }))
            .unwrap();
        assert!(heap.has_finalizer(obj).unwrap());

        let child = heap.alloc_object_with(Some(obj)).unwrap();
        assert!(heap.has_finalizer(child).unwrap());

        let key = crate::props::PropKey::String(heap.builtin_string(crate::heap::BuiltinStr::Finalizer));
        assert!(heap.delete_prop(obj, key).unwrap());
        assert!(!heap.has_finalizer(child).unwrap());
    }

    #[test]
    fn test_finalizer_runs_once_then_freed() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let id = heap.register_native(move |_, _| {
            seen.set(seen.get() + 1);
            Ok(())
        });
        let obj = heap.alloc_object().unwrap();
        heap.set_finalizer(obj, TaggedValue::LightFunc(LightFunc { func: id, flags: 0 }))
            .unwrap();

        // Refcount reaching zero keeps the object for the collector.
        heap.pop().unwrap();
        assert!(heap.is_live(obj));
        assert_eq!(calls.get(), 0);

        heap.mark_and_sweep(MsFlags::empty());
        assert_eq!(calls.get(), 1);
        assert!(heap.is_live(obj));
        assert!(heap.header(obj).unwrap().is_finalized());

        heap.mark_and_sweep(MsFlags::empty());
        assert_eq!(calls.get(), 1);
        assert!(!heap.is_live(obj));
    }

    #[test]
    fn test_failing_finalizer_is_counted() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let id = heap.register_native(|_, _| Err(crate::error::HeapError::type_error("boom")));
        let obj = heap.alloc_object().unwrap();
        heap.set_finalizer(obj, TaggedValue::LightFunc(LightFunc { func: id, flags: 0 }))
            .unwrap();
        heap.pop().unwrap();
        heap.mark_and_sweep(MsFlags::empty());
        let stats = heap.stats();
        assert_eq!(stats.finalizers_run, 1);
        assert_eq!(stats.finalizer_errors, 1);
    }
}
