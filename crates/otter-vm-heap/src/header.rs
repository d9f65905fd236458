//! Heap header layout
//!
//! Every heap cell (string, object, buffer) carries a [`HeapHeader`]. The
//! header packs the type tag and GC flags into one word, holds the refcount,
//! the arena generation, and the intrusive list links used by the heap lists.

use crate::list::ListKind;

/// Slot link sentinel for "no next/prev"
pub const NIL: u32 = u32::MAX;

/// Heap cell type tag
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapType {
    /// Interned string
    String = 0,
    /// Object (any subtype)
    Object = 1,
    /// Byte buffer
    Buffer = 2,
}

impl HeapType {
    fn from_bits(bits: u32) -> HeapType {
        match bits & TYPE_MASK {
            0 => HeapType::String,
            1 => HeapType::Object,
            _ => HeapType::Buffer,
        }
    }
}

const TYPE_MASK: u32 = 0x3;

/// Heap-level flag bits (shared by all heap types)
pub mod flags {
    /// Marked reachable during the current mark phase
    pub const REACHABLE: u32 = 1 << 2;
    /// Marking hit the recursion limit at this header; children pending
    pub const TEMPROOT: u32 = 1 << 3;
    /// Queued to run its finalizer this cycle
    pub const FINALIZABLE: u32 = 1 << 4;
    /// Finalizer has run; rescue or free decided on the next cycle
    pub const FINALIZED: u32 = 1 << 5;
    /// Read-only (ROM) cell, never refcounted or swept
    pub const READONLY: u32 = 1 << 6;

    /// First bit available for per-type user flags
    pub const USER_SHIFT: u32 = 7;

    /// All heap-level GC bits
    pub const HEAP_FLAGS_MASK: u32 = REACHABLE | TEMPROOT | FINALIZABLE | FINALIZED | READONLY;
}

const fn user(bit: u32) -> u32 {
    1 << (flags::USER_SHIFT + bit)
}

/// Object user flags
pub mod object_flags {
    use super::user;

    /// New properties may be added
    pub const EXTENSIBLE: u32 = user(0);
    /// Object is callable
    pub const CALLABLE: u32 = user(1);
    /// Object is constructable
    pub const CONSTRUCTABLE: u32 = user(2);
    /// Subtype has no children beyond entries/items/prototype
    pub const FASTREFS: u32 = user(3);
    /// Object is an array-like with an items part (`HArray` payload)
    pub const HARRAY: u32 = user(4);
    /// Dense array items part is active
    pub const ARRAY_ITEMS: u32 = user(5);
    /// Array exotic `length` behavior
    pub const EXOTIC_ARRAY: u32 = user(6);
    /// Object has its own finalizer property (cached)
    pub const HAVE_FINALIZER: u32 = user(7);
    /// Bound function subtype
    pub const BOUNDFUNC: u32 = user(8);
    /// Compiled function subtype
    pub const COMPFUNC: u32 = user(9);
    /// Native function subtype
    pub const NATFUNC: u32 = user(10);
    /// Buffer object subtype
    pub const BUFOBJ: u32 = user(11);
    /// Thread subtype
    pub const THREAD: u32 = user(12);
    /// Environment record subtype
    pub const ENV: u32 = user(13);

    /// Flags derived from the subtype payload
    pub const SUBTYPE_MASK: u32 =
        FASTREFS | HARRAY | BOUNDFUNC | COMPFUNC | NATFUNC | BUFOBJ | THREAD | ENV;
}

/// String user flags
pub mod string_flags {
    use super::user;

    /// Pure ASCII contents
    pub const ASCII: u32 = user(0);
    /// Canonical array index string
    pub const ARRIDX: u32 = user(1);
    /// Symbol (lead byte 0x80..=0xbf or 0xff)
    pub const SYMBOL: u32 = user(2);
    /// Hidden symbol (lead byte 0xff)
    pub const HIDDEN: u32 = user(3);
}

/// Buffer user flags
pub mod buffer_flags {
    use super::user;

    /// Resizable buffer
    pub const DYNAMIC: u32 = user(0);
    /// Storage owned by the embedder
    pub const EXTERNAL: u32 = user(1);
}

/// Common header of every heap cell
#[derive(Debug, Clone)]
pub struct HeapHeader {
    flags: u32,
    refcount: usize,
    generation: u32,
    pub(crate) next: u32,
    pub(crate) prev: u32,
    pub(crate) list: Option<ListKind>,
    alloc_size: usize,
}

impl HeapHeader {
    /// Create a header for a fresh cell
    pub fn new(htype: HeapType, user_flags: u32, generation: u32) -> Self {
        Self {
            flags: (htype as u32) | (user_flags & !(TYPE_MASK | flags::HEAP_FLAGS_MASK)),
            refcount: 0,
            generation,
            next: NIL,
            prev: NIL,
            list: None,
            alloc_size: 0,
        }
    }

    /// Heap type tag
    #[inline]
    pub fn htype(&self) -> HeapType {
        HeapType::from_bits(self.flags)
    }

    /// Raw flag word
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Check a flag (or all flags in a mask)
    #[inline]
    pub fn has(&self, mask: u32) -> bool {
        self.flags & mask == mask
    }

    /// Set flag bits
    #[inline]
    pub fn set(&mut self, mask: u32) {
        self.flags |= mask & !TYPE_MASK;
    }

    /// Clear flag bits
    #[inline]
    pub fn clear(&mut self, mask: u32) {
        self.flags &= !(mask & !TYPE_MASK);
    }

    /// Reachable in the current mark phase
    #[inline]
    pub fn is_reachable(&self) -> bool {
        self.has(flags::REACHABLE)
    }

    /// Pending temp root
    #[inline]
    pub fn is_temproot(&self) -> bool {
        self.has(flags::TEMPROOT)
    }

    /// Queued for finalization
    #[inline]
    pub fn is_finalizable(&self) -> bool {
        self.has(flags::FINALIZABLE)
    }

    /// Finalizer already executed
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.has(flags::FINALIZED)
    }

    /// Read-only cell
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.has(flags::READONLY)
    }

    /// Current reference count
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    /// Increment the refcount; returns the new count
    #[inline]
    pub(crate) fn preinc_refcount(&mut self) -> usize {
        self.refcount += 1;
        self.refcount
    }

    /// Decrement the refcount; returns the new count
    #[inline]
    pub(crate) fn predec_refcount(&mut self) -> usize {
        debug_assert!(self.refcount > 0, "refcount underflow");
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount
    }

    /// Arena generation of the cell
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// List the header is currently linked into
    #[inline]
    pub fn list(&self) -> Option<ListKind> {
        self.list
    }

    /// Bytes accounted to this cell by the heap allocator
    #[inline]
    pub fn alloc_size(&self) -> usize {
        self.alloc_size
    }

    #[inline]
    pub(crate) fn set_alloc_size(&mut self, size: usize) {
        self.alloc_size = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_flags() {
        let mut h = HeapHeader::new(HeapType::Object, object_flags::EXTENSIBLE, 0);
        assert_eq!(h.htype(), HeapType::Object);
        assert!(h.has(object_flags::EXTENSIBLE));
        assert!(!h.is_reachable());

        h.set(flags::REACHABLE | flags::TEMPROOT);
        assert!(h.is_reachable());
        assert!(h.is_temproot());

        h.clear(flags::TEMPROOT);
        assert!(!h.is_temproot());
        assert_eq!(h.htype(), HeapType::Object);
    }

    #[test]
    fn test_type_bits_protected() {
        let mut h = HeapHeader::new(HeapType::Buffer, 0, 0);
        h.clear(u32::MAX);
        assert_eq!(h.htype(), HeapType::Buffer);
        h.set(u32::MAX);
        assert_eq!(h.htype(), HeapType::Buffer);
    }

    #[test]
    fn test_refcount() {
        let mut h = HeapHeader::new(HeapType::String, 0, 0);
        assert_eq!(h.preinc_refcount(), 1);
        assert_eq!(h.preinc_refcount(), 2);
        assert_eq!(h.predec_refcount(), 1);
        assert_eq!(h.refcount(), 1);
    }
}
