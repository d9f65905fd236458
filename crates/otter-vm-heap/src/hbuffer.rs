//! Heap buffers

use std::ffi::c_void;

use crate::header::buffer_flags;
use crate::memory::HeapBlock;

/// Buffer body
#[derive(Debug)]
pub enum HBuffer {
    /// Fixed-size storage allocated with the buffer
    Fixed(Box<[u8]>),
    /// Resizable storage, resized through the heap allocator
    Dynamic(HeapBlock),
    /// Embedder-owned storage; never freed by the heap
    External {
        /// Embedder pointer
        ptr: *mut c_void,
        /// Length in bytes
        len: usize,
    },
}

impl HBuffer {
    /// Byte length
    pub fn len(&self) -> usize {
        match self {
            HBuffer::Fixed(b) => b.len(),
            HBuffer::Dynamic(b) => b.len(),
            HBuffer::External { len, .. } => *len,
        }
    }

    /// True for zero-length buffers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contents of heap-owned storage
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            HBuffer::Fixed(b) => Some(b),
            HBuffer::Dynamic(b) => Some(b.as_slice()),
            HBuffer::External { .. } => None,
        }
    }

    /// Mutable contents of heap-owned storage
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            HBuffer::Fixed(b) => Some(b),
            HBuffer::Dynamic(b) => Some(b.as_mut_slice()),
            HBuffer::External { .. } => None,
        }
    }

    /// Header user flags for this buffer kind
    pub fn derived_flags(&self) -> u32 {
        match self {
            HBuffer::Fixed(_) => 0,
            HBuffer::Dynamic(_) => buffer_flags::DYNAMIC,
            HBuffer::External { .. } => buffer_flags::DYNAMIC | buffer_flags::EXTERNAL,
        }
    }

    /// Bytes accounted outside the cell itself (dynamic storage)
    pub(crate) fn detached_bytes(&self) -> usize {
        match self {
            HBuffer::Dynamic(b) => b.accounted(),
            _ => 0,
        }
    }
}
