//! # Otter VM Heap
//!
//! Reference-counted heap with a backup mark-and-sweep collector for
//! ECMAScript values: interned strings, objects with hybrid property
//! storage, and buffers.
//!
//! ## Design
//!
//! - **Headers**: every cell carries flags, a refcount and list links in a
//!   header table kept apart from the bodies
//! - **Refcounting**: frees most garbage immediately; zero-count cells are
//!   queued and freed iteratively at refzero checkpoints
//! - **Mark-and-sweep**: collects cycles, runs finalizers, and backs every
//!   failed allocation with retries and an emergency compaction cycle
//! - **Property tables**: string-keyed entries part with an optional hash
//!   part, dense array items, and a sparse index part for abandoned arrays
//! - **Handles**: [`HeapRef`] is a generation-checked slot index, either
//!   native width ([`Wide`]) or 16-bit slots ([`Compact`])

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod arena;
pub mod error;
pub mod finalization;
pub mod hbuffer;
pub mod header;
pub mod heap;
pub mod hobject;
pub mod hstring;
pub mod list;
pub mod mark_sweep;
pub mod memory;
pub mod props;
pub mod ptr;
pub mod refcount;
pub mod strcache;
pub mod strtab;
pub mod thread;
pub mod value;
pub mod verify;

pub use error::{HeapError, HeapResult};
pub use hbuffer::HBuffer;
pub use header::{HeapHeader, HeapType};
pub use heap::{Breakpoint, BuiltinStr, Heap, HeapBody, HeapConfig, HeapStats, LongjmpKind, NativeFn};
pub use hobject::{HArray, HBoundFunc, HBufObj, HCompFunc, HDecEnv, HNatFunc, HObjEnv, HObject, ObjectKind};
pub use hstring::HString;
pub use list::ListKind;
pub use mark_sweep::MsFlags;
pub use memory::{Allocator, HeapBlock, LimitAllocator, SystemAllocator};
pub use props::{PropFlags, PropKey, PropPolicy, PropValue};
pub use ptr::{Compact, HeapRef, PtrRepr, Wide};
pub use strtab::StrtabPolicy;
pub use thread::{Activation, Builtin, HThread, ThreadState};
pub use value::{LightFunc, NativeFnId, TaggedValue};
