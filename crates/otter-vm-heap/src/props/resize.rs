//! Property storage resizing, array abandonment and compaction
//!
//! Every resize follows the same protocol: compute the new shape, enter a
//! critical section (no object compaction, no finalizers), reserve the
//! extra bytes (which may collect garbage), rebuild the part from the old
//! one, release the bytes no longer needed, leave the critical section.
//! Nothing can observe a half-built property table.

use std::mem;

use super::array::items_stats;
use super::{
    PropFlags, PropPart, PropValue, StrKey, abandon_density_check, abandon_slow_check_required, compute_hash_size,
};
use crate::error::{HeapError, HeapResult};
use crate::header::object_flags;
use crate::heap::{Heap, HeapBody};
use crate::hobject::HObject;
use crate::mark_sweep::MsFlags;
use crate::ptr::{HeapRef, PtrRepr};
use crate::value::TaggedValue;

/// Saved state of an enclosing critical section
pub(crate) struct CriticalSection {
    prev_flags: MsFlags,
}

impl<P: PtrRepr> Heap<P> {
    pub(crate) fn start_critical(&mut self) -> CriticalSection {
        let prev_flags = self.ms_base_flags;
        self.ms_base_flags = prev_flags | MsFlags::NO_OBJECT_COMPACTION;
        self.pf_prevent_count += 1;
        CriticalSection { prev_flags }
    }

    pub(crate) fn end_critical(&mut self, section: CriticalSection) {
        self.ms_base_flags = section.prev_flags;
        debug_assert!(self.pf_prevent_count > 0);
        self.pf_prevent_count -= 1;
    }

    fn check_part_size(&self, size: u32) -> HeapResult<()> {
        if size > self.config.props.max_properties {
            return Err(HeapError::PropertyLimit {
                requested: u64::from(size),
            });
        }
        Ok(())
    }

    /// Swap an object's storage inside a critical section, accounting the
    /// byte delta on the allocator and the cell header
    fn resize_storage(
        &mut self,
        obj: HeapRef<P>,
        old_bytes: usize,
        new_bytes: usize,
        apply: impl FnOnce(&mut HObject<P>),
    ) -> HeapResult<()> {
        let section = self.start_critical();
        let result = self.resize_storage_inner(obj, old_bytes, new_bytes, apply);
        self.end_critical(section);
        result
    }

    fn resize_storage_inner(
        &mut self,
        obj: HeapRef<P>,
        old_bytes: usize,
        new_bytes: usize,
        apply: impl FnOnce(&mut HObject<P>),
    ) -> HeapResult<()> {
        if new_bytes > old_bytes {
            self.reserve_bytes(new_bytes - old_bytes)?;
        }
        let slot = match self.headers.resolve(obj) {
            Some(slot) => slot,
            None => {
                self.release_bytes(new_bytes.saturating_sub(old_bytes));
                return Err(HeapError::InvalidRef);
            }
        };
        match self.bodies[slot].as_mut() {
            Some(HeapBody::Object(o)) => apply(o),
            _ => {
                self.release_bytes(new_bytes.saturating_sub(old_bytes));
                return Err(HeapError::InvalidRef);
            }
        }
        if new_bytes < old_bytes {
            self.release_bytes(old_bytes - new_bytes);
        }
        self.adjust_alloc_size(slot as u32, old_bytes, new_bytes);
        self.stats.prop_resizes += 1;
        Ok(())
    }

    /// Reallocate the entries part to `new_size` slots
    pub(crate) fn realloc_strprops(&mut self, obj: HeapRef<P>, new_size: u32) -> HeapResult<()> {
        self.check_part_size(new_size)?;
        let hash_limit = self.config.props.hash_limit;
        let old_bytes = self.object(obj)?.strprops.byte_size();
        let new_bytes = PropPart::<StrKey<P>, P>::bytes_for(new_size, compute_hash_size(new_size, hash_limit));
        self.resize_storage(obj, old_bytes, new_bytes, |o| {
            let part = mem::take(&mut o.strprops);
            o.strprops = part.rebuild(new_size, hash_limit);
        })?;
        tracing::trace!(target: "otter::heap", obj = ?obj, new_size, "entries part resized");
        Ok(())
    }

    /// Reallocate the index part to `new_size` slots
    pub(crate) fn realloc_idxprops(&mut self, obj: HeapRef<P>, new_size: u32) -> HeapResult<()> {
        self.check_part_size(new_size)?;
        let hash_limit = self.config.props.hash_limit;
        let old_bytes = self.object(obj)?.idxprops.byte_size();
        let new_bytes = PropPart::<u32, P>::bytes_for(new_size, compute_hash_size(new_size, hash_limit));
        self.resize_storage(obj, old_bytes, new_bytes, |o| {
            let part = mem::take(&mut o.idxprops);
            o.idxprops = part.rebuild(new_size, hash_limit);
        })?;
        tracing::trace!(target: "otter::heap", obj = ?obj, new_size, "index part resized");
        Ok(())
    }

    /// Reallocate the array items part; new slots are `Unused`. Shrinking
    /// must not cut off used items.
    pub(crate) fn realloc_items(&mut self, obj: HeapRef<P>, new_size: u32) -> HeapResult<()> {
        self.check_part_size(new_size)?;
        let tv = mem::size_of::<TaggedValue<P>>();
        let old_size = self.object(obj)?.items.len();
        let (old_bytes, new_bytes) = (old_size * tv, new_size as usize * tv);
        self.resize_storage(obj, old_bytes, new_bytes, |o| {
            debug_assert!(o.items[(new_size as usize).min(o.items.len())..].iter().all(|v| v.is_unused()));
            o.items.resize(new_size as usize, TaggedValue::Unused);
            o.items.shrink_to_fit();
        })?;
        tracing::trace!(target: "otter::heap", obj = ?obj, old_size, new_size, "array items resized");
        Ok(())
    }

    /// Grow the entries part so one more key fits
    pub(crate) fn grow_strprops_for_new_entry(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        let used = self.object(obj)?.strprops.used_count();
        let new_size = used.saturating_add(self.config.props.min_grow_entries(used));
        self.realloc_strprops(obj, new_size)
    }

    /// Grow the index part so one more key fits
    pub(crate) fn grow_idxprops_for_new_entry(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        let used = self.object(obj)?.idxprops.used_count();
        let new_size = used.saturating_add(self.config.props.min_grow_entries(used));
        self.realloc_idxprops(obj, new_size)
    }

    /// Grow array items to hold at least `min_len` slots, with headroom
    pub(crate) fn grow_items_for_size(&mut self, obj: HeapRef<P>, min_len: u32) -> HeapResult<()> {
        let max = self.config.props.max_properties;
        if min_len > max {
            return Err(HeapError::PropertyLimit {
                requested: u64::from(min_len),
            });
        }
        let new_len = min_len.saturating_add(self.config.props.min_grow_array(min_len)).min(max);
        self.realloc_items(obj, new_len)
    }

    /// Move every used array item into the index part and turn the items
    /// part off for good. Items become plain writable, enumerable,
    /// configurable properties.
    pub(crate) fn abandon_array_items(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        let hash_limit = self.config.props.hash_limit;
        let (used, old_bytes) = {
            let o = self.object(obj)?;
            debug_assert_eq!(o.idxprops.used_count(), 0, "index part in use while items are active");
            let (used, _) = items_stats(&o.items);
            let items_bytes = o.items.len() * mem::size_of::<TaggedValue<P>>();
            (used, items_bytes + o.idxprops.byte_size())
        };
        let new_size = used.saturating_add(self.config.props.min_grow_entries(used));
        self.check_part_size(new_size)?;
        let new_bytes = PropPart::<u32, P>::bytes_for(new_size, compute_hash_size(new_size, hash_limit));

        self.resize_storage(obj, old_bytes, new_bytes, |o| {
            let items = mem::take(&mut o.items);
            let mut part = PropPart::with_size(new_size, hash_limit);
            for (i, v) in items.into_iter().enumerate() {
                if !v.is_unused() {
                    part.insert(i as u32, PropValue::Data(v), PropFlags::WEC);
                }
            }
            o.idxprops = part;
        })?;
        if let Some(h) = self.headers.get_mut(obj) {
            h.clear(object_flags::ARRAY_ITEMS);
        }
        self.stats.array_abandons += 1;
        tracing::debug!(target: "otter::heap", obj = ?obj, used, index_size = new_size, "array items abandoned");
        Ok(())
    }

    /// Make room in the items part for a write at `idx`. Returns false if
    /// the write would leave the array too sparse and the items part was
    /// abandoned instead; the caller then stores into the index part.
    pub(crate) fn obtain_item_slot(&mut self, obj: HeapRef<P>, idx: u32) -> HeapResult<bool> {
        let (old_size, used) = {
            let o = self.object(obj)?;
            if (idx as usize) < o.items.len() {
                return Ok(true);
            }
            (o.items.len() as u32, items_stats(&o.items).0)
        };
        if abandon_slow_check_required(&self.config.props, idx, old_size)
            && abandon_density_check(&self.config.props, used, idx)
        {
            self.abandon_array_items(obj)?;
            return Ok(false);
        }
        self.grow_items_for_size(obj, idx.saturating_add(1))?;
        Ok(true)
    }

    /// Shrink an object's property storage to fit its live properties.
    /// Sparse array items are abandoned; trailing unused items are dropped.
    pub(crate) fn compact_object(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        let h = self.header(obj)?;
        if h.is_readonly() {
            return Ok(());
        }
        let array_items = h.has(object_flags::ARRAY_ITEMS);

        if array_items {
            let (used, min_size, size) = {
                let o = self.object(obj)?;
                let (used, min_size) = items_stats(&o.items);
                (used, min_size, o.items.len() as u32)
            };
            if abandon_density_check(&self.config.props, used, min_size) {
                self.abandon_array_items(obj)?;
            } else if min_size < size {
                self.realloc_items(obj, min_size)?;
            }
        }

        let (e_used, e_size, i_used, i_size) = {
            let o = self.object(obj)?;
            (
                o.strprops.used_count(),
                o.strprops.size(),
                o.idxprops.used_count(),
                o.idxprops.size(),
            )
        };
        if e_used != e_size {
            self.realloc_strprops(obj, e_used)?;
        }
        if i_used != i_size {
            self.realloc_idxprops(obj, i_used)?;
        }
        tracing::trace!(target: "otter::heap", obj = ?obj, entries = e_used, index = i_used, "object compacted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::header::object_flags;
    use crate::heap::{Heap, HeapConfig};
    use crate::mark_sweep::MsFlags;
    use crate::props::PropKey;
    use crate::value::{LightFunc, TaggedValue};

    #[test]
    fn test_entry_growth_formula() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let obj = heap.alloc_object().unwrap();
        heap.put_str(obj, "a", TaggedValue::Number(1.0)).unwrap();
        // (0 + 16) / 8 = 2 slots on first growth.
        assert_eq!(heap.object(obj).unwrap().strprops().size(), 2);
        heap.put_str(obj, "b", TaggedValue::Number(2.0)).unwrap();
        heap.put_str(obj, "c", TaggedValue::Number(3.0)).unwrap();
        // 2 + (2 + 16) / 8 = 4.
        assert_eq!(heap.object(obj).unwrap().strprops().size(), 4);
    }

    #[test]
    fn test_critical_section_restores_state() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let outer = heap.start_critical();
        let inner = heap.start_critical();
        assert_eq!(heap.pf_prevent_count, 2);
        heap.end_critical(inner);
        assert!(heap.ms_base_flags.contains(MsFlags::NO_OBJECT_COMPACTION));
        heap.end_critical(outer);
        assert_eq!(heap.pf_prevent_count, 0);
        assert!(!heap.ms_base_flags.contains(MsFlags::NO_OBJECT_COMPACTION));
    }

    #[test]
    fn test_collection_inside_critical_section_defers_compaction_and_finalizers() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let id = heap.register_native(|_, _| Ok(()));
        let obj = heap.alloc_object().unwrap();
        for i in 0..64 {
            heap.put_str(obj, &format!("p{i}"), TaggedValue::Number(i as f64)).unwrap();
        }
        for i in 0..60 {
            let key = heap.prop_key(&format!("p{i}")).unwrap();
            heap.delete_prop(obj, key).unwrap();
        }
        let garbage = heap.alloc_object().unwrap();
        heap.set_finalizer(garbage, TaggedValue::LightFunc(LightFunc { func: id, flags: 0 })).unwrap();
        heap.pop().unwrap();
        assert!(heap.is_live(garbage));

        let section = heap.start_critical();
        assert!(heap.mark_and_sweep(MsFlags::EMERGENCY));
        assert!(heap.object(obj).unwrap().strprops().size() >= 64);
        assert_eq!(heap.stats().finalizers_run, 0);
        assert_eq!(heap.finalize_pending(), 1);
        heap.end_critical(section);
        assert_eq!(heap.pf_prevent_count, 0);
        assert!(!heap.ms_base_flags.contains(MsFlags::NO_OBJECT_COMPACTION));

        heap.mark_and_sweep(MsFlags::EMERGENCY);
        assert_eq!(heap.object(obj).unwrap().strprops().size(), 4);
        assert_eq!(heap.stats().finalizers_run, 1);
        heap.verify().unwrap();
    }

    #[test]
    fn test_compact_shrinks_to_live() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let obj = heap.alloc_object().unwrap();
        for i in 0..40 {
            heap.put_str(obj, &format!("k{i}"), TaggedValue::Number(i as f64)).unwrap();
        }
        for i in 0..30 {
            let key = heap.prop_key(&format!("k{i}")).unwrap();
            heap.delete_prop(obj, key).unwrap();
        }
        let before = heap.header(obj).unwrap().alloc_size();
        heap.compact(obj).unwrap();
        let o = heap.object(obj).unwrap();
        assert_eq!(o.strprops().size(), 10);
        assert_eq!(o.strprops().hash_size(), 0);
        assert!(heap.header(obj).unwrap().alloc_size() < before);
        let key = heap.prop_key("k35").unwrap();
        assert_eq!(heap.get_own_data(obj, key).unwrap(), Some(TaggedValue::Number(35.0)));
    }

    #[test]
    fn test_far_write_abandons_items() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let arr = heap.alloc_array().unwrap();
        for i in 0..4u32 {
            heap.put_prop(arr, PropKey::Index(i), TaggedValue::Number(i as f64)).unwrap();
        }
        heap.put_prop(arr, PropKey::Index(1_000_000), TaggedValue::Number(-1.0))
            .unwrap();
        assert!(!heap.header(arr).unwrap().has(object_flags::ARRAY_ITEMS));
        assert_eq!(heap.array_length(arr).unwrap(), 1_000_001);
        let o = heap.object(arr).unwrap();
        assert!(o.items().is_empty());
        assert_eq!(o.idxprops().used_count(), 5);
        assert_eq!(heap.stats().array_abandons, 1);
        assert_eq!(
            heap.get_own_data(arr, PropKey::Index(2)).unwrap(),
            Some(TaggedValue::Number(2.0))
        );
    }

    #[test]
    fn test_dense_growth_keeps_items() {
        let mut heap = Heap::new(HeapConfig::default()).unwrap();
        let arr = heap.alloc_array().unwrap();
        for i in 0..1000u32 {
            heap.array_push(arr, TaggedValue::Number(i as f64)).unwrap();
        }
        assert!(heap.header(arr).unwrap().has(object_flags::ARRAY_ITEMS));
        assert!(heap.object(arr).unwrap().items().len() >= 1000);
        heap.compact(arr).unwrap();
        assert_eq!(heap.object(arr).unwrap().items().len(), 1000);
    }
}
