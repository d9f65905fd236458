//! Heap pointer representation
//!
//! Heap cells live in a slot arena and are addressed by generation-checked
//! handles. The handle encoding is a policy: [`Wide`] packs a 32-bit slot and
//! a 32-bit generation into a `u64`, [`Compact`] packs a 16-bit slot and a
//! 16-bit generation into a `u32` for memory-constrained heaps.

use std::fmt;
use std::hash::Hash;

/// Handle encoding policy for a heap
pub trait PtrRepr: Copy + Eq + Hash + Default + fmt::Debug + 'static {
    /// Raw encoded handle
    type Raw: Copy + Eq + Hash + fmt::Debug;

    /// Maximum number of live cells addressable by this encoding
    const MAX_SLOTS: u32;

    /// Generations wrap within this mask
    const GENERATION_MASK: u32;

    /// Encode a slot index and generation
    fn encode(slot: u32, generation: u32) -> Self::Raw;

    /// Slot index of an encoded handle
    fn slot(raw: Self::Raw) -> u32;

    /// Generation of an encoded handle
    fn generation(raw: Self::Raw) -> u32;
}

/// Native-width handles: 32-bit slot, 32-bit generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Wide;

impl PtrRepr for Wide {
    type Raw = u64;

    const MAX_SLOTS: u32 = u32::MAX - 1;
    const GENERATION_MASK: u32 = u32::MAX;

    #[inline]
    fn encode(slot: u32, generation: u32) -> u64 {
        (slot as u64) | ((generation as u64) << 32)
    }

    #[inline]
    fn slot(raw: u64) -> u32 {
        raw as u32
    }

    #[inline]
    fn generation(raw: u64) -> u32 {
        (raw >> 32) as u32
    }
}

/// Compressed handles: 16-bit slot, 16-bit generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Compact;

impl PtrRepr for Compact {
    type Raw = u32;

    const MAX_SLOTS: u32 = 0xffff;
    const GENERATION_MASK: u32 = 0xffff;

    #[inline]
    fn encode(slot: u32, generation: u32) -> u32 {
        (slot & 0xffff) | ((generation & 0xffff) << 16)
    }

    #[inline]
    fn slot(raw: u32) -> u32 {
        raw & 0xffff
    }

    #[inline]
    fn generation(raw: u32) -> u32 {
        raw >> 16
    }
}

/// Generation-checked handle to a heap cell
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef<P: PtrRepr = Wide> {
    raw: P::Raw,
}

impl<P: PtrRepr> HeapRef<P> {
    /// Build a handle from a slot index and generation
    #[inline]
    pub fn new(slot: u32, generation: u32) -> Self {
        Self {
            raw: P::encode(slot, generation & P::GENERATION_MASK),
        }
    }

    /// Slot index in the heap arena
    #[inline]
    pub fn slot(self) -> u32 {
        P::slot(self.raw)
    }

    /// Generation the handle was issued for
    #[inline]
    pub fn generation(self) -> u32 {
        P::generation(self.raw)
    }

    /// Raw encoded value
    #[inline]
    pub fn raw(self) -> P::Raw {
        self.raw
    }
}

impl<P: PtrRepr> fmt::Debug for HeapRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapRef({}#{})", self.slot(), self.generation())
    }
}
