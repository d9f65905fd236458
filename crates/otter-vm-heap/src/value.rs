//! Tagged values
//!
//! [`TaggedValue`] is the engine-wide value representation. Variants holding
//! a [`HeapRef`] own one reference: whoever stores the value into a slot is
//! responsible for the incref, whoever overwrites or drops it for the decref.

use std::ffi::c_void;

use crate::arena::HeaderTable;
use crate::ptr::{HeapRef, PtrRepr, Wide};

/// Index into the heap's native function registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFnId(pub u32);

/// Lightweight function: a native function with no heap allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightFunc {
    /// Native function to call
    pub func: NativeFnId,
    /// Packed arg count / magic
    pub flags: u16,
}

/// Engine value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaggedValue<P: PtrRepr = Wide> {
    /// Gap marker in array items (distinct from `undefined`)
    Unused,
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean(bool),
    /// Number
    Number(f64),
    /// Heap string
    String(HeapRef<P>),
    /// Heap object
    Object(HeapRef<P>),
    /// Heap buffer
    Buffer(HeapRef<P>),
    /// Opaque native pointer
    Pointer(*mut c_void),
    /// Lightweight function
    LightFunc(LightFunc),
}

impl<P: PtrRepr> Default for TaggedValue<P> {
    fn default() -> Self {
        TaggedValue::Undefined
    }
}

impl<P: PtrRepr> TaggedValue<P> {
    /// Heap reference held by this value, if any
    #[inline]
    pub fn heap_ref(&self) -> Option<HeapRef<P>> {
        match *self {
            TaggedValue::String(r) | TaggedValue::Object(r) | TaggedValue::Buffer(r) => Some(r),
            _ => None,
        }
    }

    /// True if the value needs refcount updates when copied or dropped
    #[inline]
    pub fn is_heap_allocated(&self) -> bool {
        self.heap_ref().is_some()
    }

    /// True for the array gap marker
    #[inline]
    pub fn is_unused(&self) -> bool {
        matches!(self, TaggedValue::Unused)
    }

    /// Object reference, if this is an object
    #[inline]
    pub fn as_object(&self) -> Option<HeapRef<P>> {
        match *self {
            TaggedValue::Object(r) => Some(r),
            _ => None,
        }
    }

    /// String reference, if this is a string
    #[inline]
    pub fn as_string(&self) -> Option<HeapRef<P>> {
        match *self {
            TaggedValue::String(r) => Some(r),
            _ => None,
        }
    }

    /// Number payload, if this is a number
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            TaggedValue::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Assign `new` over `self` with refcount maintenance.
    ///
    /// The new value is increfed before the old one is decrefed so that a
    /// self-assignment never passes through a zero refcount. The decref is
    /// the NORZ variant: returns true if refzero work was queued and the
    /// caller must reach a refzero checkpoint.
    pub fn set_and_update_refs(&mut self, new: TaggedValue<P>, headers: &mut HeaderTable<P>) -> bool {
        headers.incref_value(&new);
        let old = std::mem::replace(self, new);
        headers.decref_value_norz(&old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HeapType, object_flags};

    #[test]
    fn test_heap_ref_extraction() {
        let r: HeapRef = HeapRef::new(3, 1);
        assert_eq!(TaggedValue::Object(r).heap_ref(), Some(r));
        assert_eq!(TaggedValue::<Wide>::Number(1.0).heap_ref(), None);
        assert!(TaggedValue::<Wide>::Unused.is_unused());
        assert!(!TaggedValue::<Wide>::Undefined.is_unused());
    }

    #[test]
    fn test_self_assignment_keeps_refcount() {
        let mut headers: HeaderTable<Wide> = HeaderTable::new();
        let r = headers.alloc(HeapType::Object, object_flags::EXTENSIBLE).unwrap();
        headers.link_allocated(r);

        let mut slot = TaggedValue::Undefined;
        assert!(!slot.set_and_update_refs(TaggedValue::Object(r), &mut headers));
        assert_eq!(headers.get(r).unwrap().refcount(), 1);

        let same = slot;
        assert!(!slot.set_and_update_refs(same, &mut headers));
        assert_eq!(headers.get(r).unwrap().refcount(), 1);

        assert!(slot.set_and_update_refs(TaggedValue::Null, &mut headers));
        assert_eq!(headers.get(r).unwrap().refcount(), 0);
    }
}
