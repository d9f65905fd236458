//! Property operations
//!
//! Own-property reads, writes, definitions and deletions over the three
//! storage parts, the array `length` rules, and object-level integrity
//! operations (prevent extensions, seal, freeze).
//!
//! Keys and values passed in must be reachable: a write may grow storage,
//! and growth may collect garbage.

use super::{PropFlags, PropKey, PropValue, StrKey};
use crate::arena::HeaderTable;
use crate::error::{HeapError, HeapResult};
use crate::header::{object_flags, string_flags};
use crate::heap::{BuiltinStr, Heap};
use crate::hobject::HObject;
use crate::hstring::{hash_bytes, parse_array_index};
use crate::ptr::{HeapRef, PtrRepr};
use crate::value::TaggedValue;

/// Prototype chain walk limit
const PROTO_SANITY: u32 = 10_000;

#[derive(Debug, Clone, Copy)]
enum StoreMode {
    /// Assignment: respects `WRITABLE`, new properties get all attributes
    Put,
    /// Definition with explicit attributes
    Define(PropFlags),
}

/// Replace a stored value with refcount maintenance; true if refzero work
/// was queued
fn replace_value<P: PtrRepr>(slot: &mut PropValue<P>, new: PropValue<P>, headers: &mut HeaderTable<P>) -> bool {
    new.for_each_ref(|r| headers.incref(r));
    let old = std::mem::replace(slot, new);
    let mut queued = false;
    old.for_each_ref(|r| queued |= headers.decref_norz(r));
    queued
}

/// Check whether an existing property with attributes `cur` may be updated
/// under `mode`
fn check_update(cur: PropFlags, mode: StoreMode) -> HeapResult<()> {
    let writable_data = !cur.contains(PropFlags::ACCESSOR) && cur.contains(PropFlags::WRITABLE);
    match mode {
        StoreMode::Put => {
            if cur.contains(PropFlags::ACCESSOR) {
                return Err(HeapError::type_error("cannot assign to an accessor property"));
            }
            if !writable_data {
                return Err(HeapError::type_error("property is not writable"));
            }
        }
        StoreMode::Define(attrs) => {
            // A non-configurable property only accepts a new value, and only
            // while it is a writable data property.
            if !cur.contains(PropFlags::CONFIGURABLE) && (attrs != cur || !writable_data) {
                return Err(HeapError::type_error("property is not configurable"));
            }
        }
    }
    Ok(())
}

impl<P: PtrRepr> Heap<P> {
    fn str_key(&self, s: HeapRef<P>) -> HeapResult<StrKey<P>> {
        Ok(StrKey {
            string: s,
            hash: self.string(s)?.hash(),
        })
    }

    /// Canonical form: strings that are array indices become `Index`
    fn normalize_key(&self, key: PropKey<P>) -> HeapResult<PropKey<P>> {
        match key {
            PropKey::String(s) => Ok(match self.string(s)?.array_index() {
                Some(i) => PropKey::Index(i),
                None => key,
            }),
            PropKey::Index(_) => Ok(key),
        }
    }

    fn is_length_key(&self, obj: HeapRef<P>, s: HeapRef<P>) -> HeapResult<bool> {
        Ok(s == self.builtin_string(BuiltinStr::Length) && self.header(obj)?.has(object_flags::EXOTIC_ARRAY))
    }

    fn check_mutable(&self, obj: HeapRef<P>) -> HeapResult<()> {
        if self.header(obj)?.is_readonly() {
            return Err(HeapError::type_error("object is read-only"));
        }
        Ok(())
    }

    fn check_extensible(&self, obj: HeapRef<P>) -> HeapResult<()> {
        if !self.header(obj)?.has(object_flags::EXTENSIBLE) {
            return Err(HeapError::type_error("object is not extensible"));
        }
        Ok(())
    }

    /// Look up an already interned string without creating it
    pub fn find_interned(&self, bytes: &[u8]) -> Option<HeapRef<P>> {
        if let Some(&r) = self.rom_strings.get(bytes) {
            return Some(r);
        }
        let hash = hash_bytes(self.config.hash_seed, bytes);
        self.strtab.find(hash, |r| self.string(r).is_ok_and(|s| s.bytes() == bytes))
    }

    /// Property key for `name`. The key string is interned but not rooted;
    /// a store pins it until the write completes.
    pub fn prop_key(&mut self, name: &str) -> HeapResult<PropKey<P>> {
        match parse_array_index(name.as_bytes()) {
            Some(i) => Ok(PropKey::Index(i)),
            None => Ok(PropKey::String(self.intern(name.as_bytes())?)),
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Own property value and attributes
    pub fn get_own_prop(&self, obj: HeapRef<P>, key: PropKey<P>) -> HeapResult<Option<(PropValue<P>, PropFlags)>> {
        let key = self.normalize_key(key)?;
        let o = self.object(obj)?;
        Ok(match key {
            PropKey::String(s) => {
                if self.is_length_key(obj, s)? {
                    let len = o.kind.harray().map_or(0, |a| a.length);
                    return Ok(Some((PropValue::Data(TaggedValue::Number(f64::from(len))), PropFlags::WRITABLE)));
                }
                let sk = self.str_key(s)?;
                o.strprops
                    .find(sk)
                    .map(|(i, _)| (*o.strprops.value(i), o.strprops.attrs(i)))
            }
            PropKey::Index(i) => match o.items.get(i as usize).filter(|v| !v.is_unused()) {
                Some(v) => Some((PropValue::Data(*v), PropFlags::WEC)),
                None => o
                    .idxprops
                    .find(i)
                    .map(|(idx, _)| (*o.idxprops.value(idx), o.idxprops.attrs(idx))),
            },
        })
    }

    /// Own data property value
    pub fn get_own_data(&self, obj: HeapRef<P>, key: PropKey<P>) -> HeapResult<Option<TaggedValue<P>>> {
        Ok(self.get_own_prop(obj, key)?.and_then(|(v, _)| v.as_data()))
    }

    /// True if `obj` has an own property `key`
    pub fn has_own_prop(&self, obj: HeapRef<P>, key: PropKey<P>) -> HeapResult<bool> {
        Ok(self.get_own_prop(obj, key)?.is_some())
    }

    /// Property lookup along the prototype chain
    pub fn get_prop(&self, obj: HeapRef<P>, key: PropKey<P>) -> HeapResult<Option<PropValue<P>>> {
        let mut cur = Some(obj);
        let mut sanity = PROTO_SANITY;
        while let Some(o) = cur {
            if let Some((v, _)) = self.get_own_prop(o, key)? {
                return Ok(Some(v));
            }
            sanity -= 1;
            if sanity == 0 {
                return Err(HeapError::range_error("prototype chain too deep"));
            }
            cur = self.object(o)?.proto;
        }
        Ok(None)
    }

    /// Inherited data property by name; never allocates
    pub fn get_str(&self, obj: HeapRef<P>, name: &str) -> HeapResult<Option<TaggedValue<P>>> {
        let key = match parse_array_index(name.as_bytes()) {
            Some(i) => PropKey::Index(i),
            None => match self.find_interned(name.as_bytes()) {
                Some(s) => PropKey::String(s),
                // No object can hold a key that was never interned.
                None => return Ok(None),
            },
        };
        Ok(self.get_prop(obj, key)?.and_then(|v| v.as_data()))
    }

    /// Own keys: array indices in ascending order, then string keys in
    /// insertion order. Hidden keys are skipped.
    pub fn own_keys(&self, obj: HeapRef<P>) -> HeapResult<Vec<PropKey<P>>> {
        let o = self.object(obj)?;
        let mut keys: Vec<PropKey<P>> = o
            .items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_unused())
            .map(|(i, _)| PropKey::Index(i as u32))
            .collect();
        let mut idx: Vec<u32> = o.idxprops.iter().map(|(_, k, _, _)| k).collect();
        idx.sort_unstable();
        keys.extend(idx.into_iter().map(PropKey::Index));
        for (_, k, _, _) in o.strprops.iter() {
            if !self.header(k.string)?.has(string_flags::HIDDEN) {
                keys.push(PropKey::String(k.string));
            }
        }
        Ok(keys)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Assign an own data property, creating it with all attributes set if
    /// it does not exist
    pub fn put_prop(&mut self, obj: HeapRef<P>, key: PropKey<P>, value: TaggedValue<P>) -> HeapResult<()> {
        self.store(obj, key, PropValue::Data(value), StoreMode::Put)
    }

    /// Define or redefine an own property with explicit attributes
    pub fn define_prop(&mut self, obj: HeapRef<P>, key: PropKey<P>, value: PropValue<P>, attrs: PropFlags) -> HeapResult<()> {
        let attrs = match value {
            PropValue::Accessor { .. } => attrs.without(PropFlags::WRITABLE) | PropFlags::ACCESSOR,
            PropValue::Data(_) => attrs.without(PropFlags::ACCESSOR),
        };
        self.store(obj, key, value, StoreMode::Define(attrs))
    }

    /// Define an accessor property
    pub fn define_accessor(
        &mut self,
        obj: HeapRef<P>,
        key: PropKey<P>,
        get: Option<HeapRef<P>>,
        set: Option<HeapRef<P>>,
        attrs: PropFlags,
    ) -> HeapResult<()> {
        self.define_prop(obj, key, PropValue::Accessor { get, set }, attrs)
    }

    /// Assign by name; interns the key and keeps it rooted for the write
    pub fn put_str(&mut self, obj: HeapRef<P>, name: &str, value: TaggedValue<P>) -> HeapResult<()> {
        self.reserve_stack(1)?;
        let key = self.prop_key(name)?;
        let PropKey::String(s) = key else {
            return self.put_prop(obj, key, value);
        };
        self.push_unchecked(self.heap_thread, TaggedValue::String(s))?;
        let result = self.put_prop(obj, key, value);
        self.pop()?;
        result
    }

    fn store(&mut self, obj: HeapRef<P>, key: PropKey<P>, value: PropValue<P>, mode: StoreMode) -> HeapResult<()> {
        self.check_mutable(obj)?;
        match self.normalize_key(key)? {
            PropKey::String(s) => {
                // Keys from `prop_key` are unrooted; growth below may collect.
                let is_length = self.is_length_key(obj, s)?;
                self.pinned_keys.push(s);
                let result = if is_length {
                    self.store_length(obj, value)
                } else {
                    self.store_str(obj, s, value, mode)
                };
                self.pinned_keys.pop();
                result
            }
            PropKey::Index(i) => self.store_index(obj, i, value, mode),
        }
    }

    fn store_length(&mut self, obj: HeapRef<P>, value: PropValue<P>) -> HeapResult<()> {
        match value.as_data().and_then(|v| v.as_number()) {
            Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => self.set_array_length(obj, n as u64),
            _ => Err(HeapError::range_error("invalid array length")),
        }
    }

    fn store_str(&mut self, obj: HeapRef<P>, s: HeapRef<P>, value: PropValue<P>, mode: StoreMode) -> HeapResult<()> {
        let sk = self.str_key(s)?;
        let existing = self.object(obj)?.strprops.find(sk).map(|(i, _)| i);
        let queued = match existing {
            Some(idx) => {
                let (o, headers) = self.split_object_mut(obj)?;
                check_update(o.strprops.attrs(idx), mode)?;
                if let StoreMode::Define(attrs) = mode {
                    o.strprops.set_attrs(idx, attrs);
                }
                replace_value(o.strprops.value_mut(idx), value, headers)
            }
            None => {
                self.check_extensible(obj)?;
                if self.object(obj)?.strprops.is_full() {
                    self.grow_strprops_for_new_entry(obj)?;
                }
                let attrs = match mode {
                    StoreMode::Put => PropFlags::WEC,
                    StoreMode::Define(attrs) => attrs,
                };
                let (o, headers) = self.split_object_mut(obj)?;
                if o.strprops.insert(sk, value, attrs).is_none() {
                    return Err(HeapError::internal("entries part full after growth"));
                }
                headers.incref(s);
                value.for_each_ref(|r| headers.incref(r));
                if s == self.builtin_string(BuiltinStr::Finalizer) {
                    if let Some(h) = self.headers.get_mut(obj) {
                        h.set(object_flags::HAVE_FINALIZER);
                    }
                }
                false
            }
        };
        if queued {
            self.refzero_free_pending();
        }
        Ok(())
    }

    fn store_index(&mut self, obj: HeapRef<P>, i: u32, value: PropValue<P>, mode: StoreMode) -> HeapResult<()> {
        let h = self.header(obj)?;
        let exotic = h.has(object_flags::EXOTIC_ARRAY);
        if exotic && i == u32::MAX {
            return Err(HeapError::range_error("array length would exceed 2^32 - 1"));
        }

        if h.has(object_flags::ARRAY_ITEMS) {
            let plain = match mode {
                StoreMode::Put => true,
                StoreMode::Define(attrs) => attrs == PropFlags::WEC && matches!(value, PropValue::Data(_)),
            };
            if !plain {
                // Items cannot carry attributes.
                self.abandon_array_items(obj)?;
            } else if let PropValue::Data(v) = value {
                let present = self
                    .object(obj)?
                    .items
                    .get(i as usize)
                    .is_some_and(|v| !v.is_unused());
                if !present {
                    self.check_extensible(obj)?;
                }
                if present || self.obtain_item_slot(obj, i)? {
                    let (o, headers) = self.split_object_mut(obj)?;
                    let queued = o.items[i as usize].set_and_update_refs(v, headers);
                    if exotic {
                        bump_length(o, i);
                    }
                    if queued {
                        self.refzero_free_pending();
                    }
                    return Ok(());
                }
            }
        }

        let existing = self.object(obj)?.idxprops.find(i).map(|(idx, _)| idx);
        let queued = match existing {
            Some(idx) => {
                let (o, headers) = self.split_object_mut(obj)?;
                check_update(o.idxprops.attrs(idx), mode)?;
                if let StoreMode::Define(attrs) = mode {
                    o.idxprops.set_attrs(idx, attrs);
                }
                replace_value(o.idxprops.value_mut(idx), value, headers)
            }
            None => {
                self.check_extensible(obj)?;
                if self.object(obj)?.idxprops.is_full() {
                    self.grow_idxprops_for_new_entry(obj)?;
                }
                let attrs = match mode {
                    StoreMode::Put => PropFlags::WEC,
                    StoreMode::Define(attrs) => attrs,
                };
                let (o, headers) = self.split_object_mut(obj)?;
                if o.idxprops.insert(i, value, attrs).is_none() {
                    return Err(HeapError::internal("index part full after growth"));
                }
                value.for_each_ref(|r| headers.incref(r));
                if exotic {
                    bump_length(o, i);
                }
                false
            }
        };
        if queued {
            self.refzero_free_pending();
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Deletion
    // ---------------------------------------------------------------------

    /// Delete an own property. Returns false if it is not configurable;
    /// deleting a missing property succeeds.
    pub fn delete_prop(&mut self, obj: HeapRef<P>, key: PropKey<P>) -> HeapResult<bool> {
        self.check_mutable(obj)?;
        let mut queued = false;
        match self.normalize_key(key)? {
            PropKey::String(s) => {
                if self.is_length_key(obj, s)? {
                    return Ok(false);
                }
                let sk = self.str_key(s)?;
                let is_finalizer = s == self.builtin_string(BuiltinStr::Finalizer);
                let (o, headers) = self.split_object_mut(obj)?;
                let Some((idx, hash_slot)) = o.strprops.find(sk) else {
                    return Ok(true);
                };
                if !o.strprops.attrs(idx).contains(PropFlags::CONFIGURABLE) {
                    return Ok(false);
                }
                if let Some((k, v, _)) = o.strprops.remove(idx, hash_slot) {
                    queued |= headers.decref_norz(k.string);
                    v.for_each_ref(|r| queued |= headers.decref_norz(r));
                }
                if is_finalizer {
                    if let Some(h) = self.headers.get_mut(obj) {
                        h.clear(object_flags::HAVE_FINALIZER);
                    }
                }
            }
            PropKey::Index(i) => {
                let (o, headers) = self.split_object_mut(obj)?;
                match o.items.get_mut(i as usize) {
                    Some(slot) if !slot.is_unused() => {
                        queued |= slot.set_and_update_refs(TaggedValue::Unused, headers);
                    }
                    _ => {
                        let Some((idx, hash_slot)) = o.idxprops.find(i) else {
                            return Ok(true);
                        };
                        if !o.idxprops.attrs(idx).contains(PropFlags::CONFIGURABLE) {
                            return Ok(false);
                        }
                        if let Some((_, v, _)) = o.idxprops.remove(idx, hash_slot) {
                            v.for_each_ref(|r| queued |= headers.decref_norz(r));
                        }
                    }
                }
            }
        }
        if queued {
            self.refzero_free_pending();
        }
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Arrays
    // ---------------------------------------------------------------------

    /// Array `length`
    pub fn array_length(&self, arr: HeapRef<P>) -> HeapResult<u32> {
        self.object(arr)?
            .kind
            .harray()
            .map(|a| a.length)
            .ok_or_else(|| HeapError::type_error("not an array"))
    }

    /// Set array `length`, deleting elements at or above it. Fails with a
    /// `TypeError` if a non-configurable element stops the truncation; the
    /// length then ends just above that element.
    pub fn set_array_length(&mut self, arr: HeapRef<P>, new_len: u64) -> HeapResult<()> {
        if new_len > u64::from(u32::MAX) {
            return Err(HeapError::range_error("invalid array length"));
        }
        let new_len = new_len as u32;
        self.check_mutable(arr)?;
        let h = self.header(arr)?;
        if !h.has(object_flags::EXOTIC_ARRAY) {
            return Err(HeapError::type_error("not an array"));
        }
        let array_items = h.has(object_flags::ARRAY_ITEMS);
        let old_len = self.array_length(arr)?;
        let mut final_len = new_len;
        let mut queued = false;

        if new_len < old_len {
            let (o, headers) = self.split_object_mut(arr)?;
            if array_items {
                let end = (old_len as usize).min(o.items.len());
                for slot in o.items.iter_mut().take(end).skip(new_len as usize) {
                    queued |= slot.set_and_update_refs(TaggedValue::Unused, headers);
                }
            } else {
                let pinned = o
                    .idxprops
                    .iter()
                    .filter(|&(_, k, _, a)| k >= new_len && !a.contains(PropFlags::CONFIGURABLE))
                    .map(|(_, k, _, _)| k)
                    .max();
                if let Some(k) = pinned {
                    final_len = k + 1;
                }
                let doomed: Vec<u32> = o
                    .idxprops
                    .iter()
                    .filter(|&(_, k, _, _)| k >= final_len)
                    .map(|(_, k, _, _)| k)
                    .collect();
                for k in doomed {
                    let removed = o
                        .idxprops
                        .find(k)
                        .and_then(|(idx, hash_slot)| o.idxprops.remove(idx, hash_slot));
                    if let Some((_, v, _)) = removed {
                        v.for_each_ref(|r| queued |= headers.decref_norz(r));
                    }
                }
            }
        }
        if let Some(a) = self.object_mut(arr)?.kind.harray_mut() {
            a.length = final_len;
        }
        if queued {
            self.refzero_free_pending();
        }
        if final_len != new_len {
            return Err(HeapError::type_error("array length truncation blocked by a non-configurable element"));
        }
        Ok(())
    }

    /// Append to an array; returns the new length
    pub fn array_push(&mut self, arr: HeapRef<P>, value: TaggedValue<P>) -> HeapResult<u32> {
        let len = self.array_length(arr)?;
        self.put_prop(arr, PropKey::Index(len), value)?;
        self.array_length(arr)
    }

    // ---------------------------------------------------------------------
    // Object-level operations
    // ---------------------------------------------------------------------

    /// Replace the internal prototype
    pub fn set_prototype(&mut self, obj: HeapRef<P>, proto: Option<HeapRef<P>>) -> HeapResult<()> {
        self.check_mutable(obj)?;
        let mut cur = proto;
        let mut sanity = PROTO_SANITY;
        while let Some(p) = cur {
            if p == obj {
                return Err(HeapError::type_error("prototype cycle"));
            }
            sanity -= 1;
            if sanity == 0 {
                return Err(HeapError::range_error("prototype chain too deep"));
            }
            cur = self.object(p)?.proto;
        }
        let (o, headers) = self.split_object_mut(obj)?;
        if let Some(p) = proto {
            headers.incref(p);
        }
        let old = std::mem::replace(&mut o.proto, proto);
        if old.is_some_and(|p| headers.decref_norz(p)) {
            self.refzero_free_pending();
        }
        Ok(())
    }

    /// True if new properties may be added
    pub fn is_extensible(&self, obj: HeapRef<P>) -> HeapResult<bool> {
        Ok(self.header(obj)?.has(object_flags::EXTENSIBLE))
    }

    /// Forbid new properties
    pub fn prevent_extensions(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        self.check_mutable(obj)?;
        if let Some(h) = self.headers.get_mut(obj) {
            h.clear(object_flags::EXTENSIBLE);
        }
        Ok(())
    }

    /// Make every own property non-configurable and forbid new ones
    pub fn seal(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        self.seal_freeze(obj, false)
    }

    /// Seal, make data properties read-only, and compact the object
    pub fn freeze(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        self.seal_freeze(obj, true)
    }

    fn seal_freeze(&mut self, obj: HeapRef<P>, freeze: bool) -> HeapResult<()> {
        self.check_mutable(obj)?;
        if self.header(obj)?.has(object_flags::ARRAY_ITEMS) {
            self.abandon_array_items(obj)?;
        }
        let o = self.object_mut(obj)?;
        let restrict = |a: PropFlags| {
            let mut a = a.without(PropFlags::CONFIGURABLE);
            if freeze && !a.contains(PropFlags::ACCESSOR) {
                a = a.without(PropFlags::WRITABLE);
            }
            a
        };
        for i in 0..o.strprops.next() {
            if o.strprops.key(i).is_some() {
                o.strprops.set_attrs(i, restrict(o.strprops.attrs(i)));
            }
        }
        for i in 0..o.idxprops.next() {
            if o.idxprops.key(i).is_some() {
                o.idxprops.set_attrs(i, restrict(o.idxprops.attrs(i)));
            }
        }
        self.prevent_extensions(obj)?;
        if freeze {
            self.compact_object(obj)?;
        }
        Ok(())
    }

    /// Shrink an object's property storage to fit
    pub fn compact(&mut self, obj: HeapRef<P>) -> HeapResult<()> {
        self.check_mutable(obj)?;
        self.compact_object(obj)
    }
}

fn bump_length<P: PtrRepr>(o: &mut HObject<P>, i: u32) {
    if let Some(a) = o.kind.harray_mut() {
        if i >= a.length {
            a.length = i + 1;
        }
    }
}
