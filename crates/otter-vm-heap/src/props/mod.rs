//! Object property storage
//!
//! An object keeps string-keyed properties in an entries part (`strprops`),
//! integer-keyed properties either in a dense array items part or in a
//! sparse index part (`idxprops`), never both at once.
//!
//! ## Design
//!
//! - **Entries part**: parallel key/value/attribute vectors with a
//!   `next` cursor; deleted entries keep their slot until the next resize
//! - **Hash part**: open addressing over a power-of-two table, rebuilt from
//!   scratch on every resize, never patched incrementally
//! - **Array items**: dense values with an `Unused` gap marker
//! - **Abandonment**: one-way migration of sparse array items into the
//!   index part

mod array;
mod ops;
mod part;
mod resize;

pub use array::{abandon_density_check, abandon_slow_check_required};
pub use part::{HASH_DELETED, HASH_UNUSED, PartKey, PropPart, compute_hash_size};

use std::ops::BitOr;

use crate::ptr::{HeapRef, PtrRepr, Wide};
use crate::value::TaggedValue;

/// Property attribute byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PropFlags(u8);

impl PropFlags {
    /// `[[Writable]]`
    pub const WRITABLE: PropFlags = PropFlags(1 << 0);
    /// `[[Enumerable]]`
    pub const ENUMERABLE: PropFlags = PropFlags(1 << 1);
    /// `[[Configurable]]`
    pub const CONFIGURABLE: PropFlags = PropFlags(1 << 2);
    /// Accessor property (getter/setter pair)
    pub const ACCESSOR: PropFlags = PropFlags(1 << 3);
    /// Writable, enumerable and configurable
    pub const WEC: PropFlags = PropFlags(0x07);

    /// No attributes
    pub const fn empty() -> Self {
        PropFlags(0)
    }

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if all bits of `other` are set
    pub const fn contains(self, other: PropFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Copy with the bits of `other` cleared
    pub const fn without(self, other: PropFlags) -> Self {
        PropFlags(self.0 & !other.0)
    }
}

impl BitOr for PropFlags {
    type Output = PropFlags;

    fn bitor(self, rhs: PropFlags) -> PropFlags {
        PropFlags(self.0 | rhs.0)
    }
}

/// Stored property value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropValue<P: PtrRepr = Wide> {
    /// Plain data value
    Data(TaggedValue<P>),
    /// Getter/setter pair
    Accessor {
        /// Getter function object
        get: Option<HeapRef<P>>,
        /// Setter function object
        set: Option<HeapRef<P>>,
    },
}

impl<P: PtrRepr> Default for PropValue<P> {
    fn default() -> Self {
        PropValue::Data(TaggedValue::Undefined)
    }
}

impl<P: PtrRepr> PropValue<P> {
    /// Visit every heap reference held by the value
    #[inline]
    pub fn for_each_ref(&self, mut f: impl FnMut(HeapRef<P>)) {
        match self {
            PropValue::Data(v) => {
                if let Some(r) = v.heap_ref() {
                    f(r);
                }
            }
            PropValue::Accessor { get, set } => {
                if let Some(r) = get {
                    f(*r);
                }
                if let Some(r) = set {
                    f(*r);
                }
            }
        }
    }

    /// Data payload, if this is a data property
    pub fn as_data(&self) -> Option<TaggedValue<P>> {
        match self {
            PropValue::Data(v) => Some(*v),
            PropValue::Accessor { .. } => None,
        }
    }
}

/// Entries part key: an interned string with its cached hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrKey<P: PtrRepr = Wide> {
    /// Interned key string
    pub string: HeapRef<P>,
    /// String hash
    pub hash: u32,
}

/// Property key as seen by the property API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKey<P: PtrRepr = Wide> {
    /// Non-index string key
    String(HeapRef<P>),
    /// Array index key
    Index(u32),
}

/// Property table tuning
#[derive(Debug, Clone)]
pub struct PropPolicy {
    /// Entry parts at least this large get a hash part
    pub hash_limit: u32,
    /// Entry and index part growth: `(size + add) / divisor`
    pub entry_min_grow_add: u32,
    /// See `entry_min_grow_add`
    pub entry_min_grow_divisor: u32,
    /// Array items growth: `(size + add) / divisor`
    pub array_min_grow_add: u32,
    /// See `array_min_grow_add`
    pub array_min_grow_divisor: u32,
    /// Growth beyond `limit/8` of the current size needs a density scan
    pub array_fast_resize_limit: u32,
    /// Abandon when fewer than `limit/8` of the slots would be used
    pub array_abandon_limit: u32,
    /// Arrays smaller than this are never abandoned on write
    pub array_abandon_min_size: u32,
    /// Hard cap on part sizes
    pub max_properties: u32,
}

impl Default for PropPolicy {
    fn default() -> Self {
        Self {
            hash_limit: 32,
            entry_min_grow_add: 16,
            entry_min_grow_divisor: 8, // 12.5%
            array_min_grow_add: 16,
            array_min_grow_divisor: 8,
            array_fast_resize_limit: 9, // 112.5%
            array_abandon_limit: 2,     // 25%
            array_abandon_min_size: 257,
            max_properties: 0x7fff_ffff,
        }
    }
}

impl PropPolicy {
    /// Minimum growth step for entry and index parts
    #[inline]
    pub fn min_grow_entries(&self, size: u32) -> u32 {
        (size.saturating_add(self.entry_min_grow_add) / self.entry_min_grow_divisor).max(1)
    }

    /// Minimum growth step for array items
    #[inline]
    pub fn min_grow_array(&self, size: u32) -> u32 {
        (size.saturating_add(self.array_min_grow_add) / self.array_min_grow_divisor).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let f = PropFlags::WRITABLE | PropFlags::CONFIGURABLE;
        assert!(f.contains(PropFlags::WRITABLE));
        assert!(!f.contains(PropFlags::ENUMERABLE));
        assert!(PropFlags::WEC.contains(f));
        assert_eq!(PropFlags::WEC.without(PropFlags::WRITABLE).bits(), 0x06);
    }

    #[test]
    fn test_min_grow() {
        let p = PropPolicy::default();
        assert_eq!(p.min_grow_entries(0), 2);
        assert_eq!(p.min_grow_entries(800), 102);
        assert!(p.min_grow_array(u32::MAX) >= 1);
    }
}
