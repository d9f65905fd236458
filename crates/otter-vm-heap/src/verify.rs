//! Heap consistency checks
//!
//! Full scans used by tests and debug builds. Refcounts are recomputed from
//! scratch over every live cell and the root set and compared against the
//! stored counts.

use crate::error::{HeapError, HeapResult};
use crate::header::{HeapType, flags};
use crate::heap::{Heap, HeapBody};
use crate::list::ListKind;
use crate::ptr::PtrRepr;

impl<P: PtrRepr> Heap<P> {
    /// Run every consistency check
    pub fn verify(&self) -> HeapResult<()> {
        self.verify_lists()?;
        self.verify_refcounts()
    }

    /// Every live cell is linked exactly where it belongs: objects and
    /// buffers on one heap list, strings in the string table (or read-only),
    /// and no mark flags survive outside a collection.
    pub fn verify_lists(&self) -> HeapResult<()> {
        let mut listed = 0usize;
        for kind in [ListKind::Allocated, ListKind::Finalize, ListKind::Refzero] {
            let list = match kind {
                ListKind::Allocated => &self.headers.allocated,
                ListKind::Finalize => &self.headers.finalize,
                ListKind::Refzero => &self.headers.refzero,
            };
            let mut count = 0usize;
            for slot in list.iter(&self.headers.hdrs) {
                let h = self.headers.slot(slot);
                if h.list() != Some(kind) {
                    return Err(HeapError::internal(format!("slot {slot} on {kind:?} list is tagged {:?}", h.list())));
                }
                if self.bodies.get(slot as usize).is_none_or(|b| b.is_none()) {
                    return Err(HeapError::internal(format!("slot {slot} on {kind:?} list has no body")));
                }
                count += 1;
            }
            if count != list.len() {
                return Err(HeapError::internal(format!(
                    "{kind:?} list length {} but {count} linked",
                    list.len()
                )));
            }
            listed += count;
        }

        let mut strings = 0usize;
        for (slot, body) in self.bodies.iter().enumerate() {
            let Some(body) = body else {
                continue;
            };
            let h = self.headers.slot(slot as u32);
            if !self.headers.ms_running && h.has(flags::REACHABLE) {
                return Err(HeapError::internal(format!("slot {slot} still marked reachable")));
            }
            if h.has(flags::TEMPROOT) {
                return Err(HeapError::internal(format!("slot {slot} left as temp root")));
            }
            match body {
                HeapBody::String(s) => {
                    let r = self.headers.handle(slot as u32);
                    let interned = self.strtab.contains(s.hash(), r);
                    if interned == h.is_readonly() {
                        return Err(HeapError::internal(format!(
                            "string slot {slot}: interned={interned} readonly={}",
                            h.is_readonly()
                        )));
                    }
                    strings += 1;
                }
                HeapBody::Object(_) | HeapBody::Buffer(_) => {
                    if h.list().is_none() {
                        return Err(HeapError::internal(format!("slot {slot} is on no heap list")));
                    }
                }
            }
        }
        let live = self.headers.live_count();
        if listed + strings != live {
            return Err(HeapError::internal(format!(
                "{live} live slots but {listed} listed and {strings} strings"
            )));
        }
        Ok(())
    }

    /// Stored refcounts match the references actually held
    pub fn verify_refcounts(&self) -> HeapResult<()> {
        let mut expected = vec![0usize; self.headers.capacity()];
        let mut count = |r| {
            if let Some(slot) = self.headers.resolve(r) {
                expected[slot] += 1;
            }
        };
        count(self.heap_thread);
        count(self.heap_object);
        for &r in &self.builtin_strings {
            count(r);
        }
        for v in [self.lj.value1, self.lj.value2] {
            if let Some(r) = v.heap_ref() {
                count(r);
            }
        }
        for bp in &self.breakpoints {
            count(bp.filename);
        }
        for body in self.bodies.iter().flatten() {
            if let HeapBody::Object(o) = body {
                o.for_each_child(&mut count);
            }
        }

        for (slot, body) in self.bodies.iter().enumerate() {
            if body.is_none() {
                continue;
            }
            let h = self.headers.slot(slot as u32);
            if h.is_readonly() {
                continue;
            }
            if h.refcount() != expected[slot] {
                let kind = match h.htype() {
                    HeapType::String => "string",
                    HeapType::Object => "object",
                    HeapType::Buffer => "buffer",
                };
                return Err(HeapError::internal(format!(
                    "{kind} slot {slot}: refcount {} but {} references",
                    h.refcount(),
                    expected[slot]
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::{Heap, HeapConfig};
    use crate::value::TaggedValue;

    #[test]
    fn test_fresh_heap_is_consistent() {
        let heap = Heap::new(HeapConfig::default()).unwrap();
        heap.verify().unwrap();
    }

    #[test]
    fn test_detects_refcount_drift() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let obj = heap.alloc_object().unwrap();
        heap.put_str(obj, "k", TaggedValue::Number(1.0)).unwrap();
        heap.verify().unwrap();
        heap.incref(obj);
        assert!(heap.verify_refcounts().is_err());
        heap.decref(obj);
        heap.verify().unwrap();
    }
}
