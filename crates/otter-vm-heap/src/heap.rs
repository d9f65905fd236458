//! Heap-wide state
//!
//! [`Heap`] owns every cell, the heap lists, the string table, the GC
//! trigger and prevent counters, and the root set: the heap thread, the
//! stash object, built-in strings, longjmp value slots and debugger
//! breakpoints.
//!
//! Constructors push the new cell onto the heap thread's value stack, which
//! keeps it alive until the caller pops it or stores it somewhere reachable.
//! Any value passed into a heap operation must already be reachable this
//! way; a collection may run inside any allocating call.

use std::mem;
use std::rc::Rc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::arena::HeaderTable;
use crate::error::{HeapError, HeapResult};
use crate::hbuffer::HBuffer;
use crate::header::{HeapHeader, HeapType, flags, object_flags};
use crate::hobject::{HArray, HBoundFunc, HBufObj, HCompFunc, HDecEnv, HNatFunc, HObjEnv, HObject, ObjectKind};
use crate::hstring::{HString, hash_bytes};
use crate::list::ListKind;
use crate::mark_sweep::MsFlags;
use crate::memory::{Allocator, HeapBlock, LimitAllocator, SystemAllocator};
use crate::props::PropPolicy;
use crate::ptr::{HeapRef, PtrRepr, Wide};
use crate::strcache::StringCache;
use crate::strtab::{StringTable, StrtabPolicy};
use crate::thread::{Activation, Builtin, HThread, ThreadState};
use crate::value::{NativeFnId, TaggedValue};

/// Bytes accounted for every cell on top of its body
pub const CELL_OVERHEAD: usize = mem::size_of::<HeapHeader>();

/// Value stack slots added on each growth step
const VALSTACK_GROW: usize = 64;

/// Maximum number of debugger breakpoints
pub const MAX_BREAKPOINTS: usize = 16;

/// Cell body
#[derive(Debug)]
pub enum HeapBody<P: PtrRepr = Wide> {
    /// Interned string
    String(HString),
    /// Object
    Object(HObject<P>),
    /// Buffer
    Buffer(HBuffer),
}

/// Heap configuration
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Marking recursion depth before falling back to temp roots (default: 32)
    pub mark_recursion_limit: u32,
    /// Voluntary GC trigger multiplier, .8 fixed point (default: 12800)
    pub trigger_mult: i64,
    /// Voluntary GC trigger constant (default: 1024)
    pub trigger_add: i64,
    /// Collections attempted before an allocation fails (default: 5)
    pub alloc_retry_limit: u32,
    /// Retry attempt from which collections run in emergency mode (default: 3)
    pub emergency_retry_limit: u32,
    /// Hard byte limit; `None` for unbounded accounting
    pub memory_limit: Option<usize>,
    /// String table sizing
    pub strtab: StrtabPolicy,
    /// String cache entries (default: 4)
    pub strcache_size: usize,
    /// Strings up to this many chars bypass the cache (default: 16)
    pub strcache_no_cache_limit: u32,
    /// Create built-in strings read-only, outside the string table
    pub rom_strings: bool,
    /// Run collections from the allocation trigger
    pub voluntary_gc: bool,
    /// String hash seed
    pub hash_seed: u32,
    /// Property table tuning
    pub props: PropPolicy,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            mark_recursion_limit: 32,
            trigger_mult: 12800, // 50.0
            trigger_add: 1024,
            alloc_retry_limit: 5,
            emergency_retry_limit: 3,
            memory_limit: None,
            strtab: StrtabPolicy::default(),
            strcache_size: 4,
            strcache_no_cache_limit: 16,
            rom_strings: false,
            voluntary_gc: true,
            hash_seed: 0x5eed_1e55,
            props: PropPolicy::default(),
        }
    }
}

/// Heap statistics
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    /// Completed mark-and-sweep cycles
    pub collections: u64,
    /// Cycles run in emergency mode
    pub emergency_collections: u64,
    /// Objects and buffers kept by the last cycle
    pub last_kept_objects: usize,
    /// Strings kept by the last cycle
    pub last_kept_strings: usize,
    /// Cells freed by the last cycle
    pub last_freed: usize,
    /// Cells freed by refcounting
    pub refzero_frees: u64,
    /// Property storage reallocations
    pub prop_resizes: u64,
    /// Array items parts abandoned
    pub array_abandons: u64,
    /// Finalizers invoked
    pub finalizers_run: u64,
    /// Finalizers that returned an error
    pub finalizer_errors: u64,
    /// Time spent in mark-and-sweep
    pub total_gc_time: Duration,
    /// Duration of the last cycle
    pub last_gc_time: Duration,
    /// Bytes accounted by the allocator when the snapshot was taken
    pub bytes_in_use: usize,
}

/// Native function callable from the heap (finalizers, native function
/// objects, light functions). Receives the `this` object.
pub type NativeFn<P = Wide> = Rc<dyn Fn(&mut Heap<P>, HeapRef<P>) -> HeapResult<()>>;

/// Built-in strings kept alive by the heap
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinStr {
    /// `""`
    Empty = 0,
    /// `length`
    Length,
    /// `prototype`
    Prototype,
    /// `constructor`
    Constructor,
    /// `callee`
    Callee,
    /// `caller`
    Caller,
    /// Hidden finalizer key
    Finalizer,
    /// Hidden internal value key
    Value,
    /// Hidden bound target key
    Target,
    /// Hidden variable map key
    Varmap,
}

impl BuiltinStr {
    /// Every built-in string, in slot order
    pub const ALL: [BuiltinStr; 10] = [
        BuiltinStr::Empty,
        BuiltinStr::Length,
        BuiltinStr::Prototype,
        BuiltinStr::Constructor,
        BuiltinStr::Callee,
        BuiltinStr::Caller,
        BuiltinStr::Finalizer,
        BuiltinStr::Value,
        BuiltinStr::Target,
        BuiltinStr::Varmap,
    ];

    /// String contents
    pub fn bytes(self) -> &'static [u8] {
        match self {
            BuiltinStr::Empty => b"",
            BuiltinStr::Length => b"length",
            BuiltinStr::Prototype => b"prototype",
            BuiltinStr::Constructor => b"constructor",
            BuiltinStr::Callee => b"callee",
            BuiltinStr::Caller => b"caller",
            BuiltinStr::Finalizer => b"\xffFinalizer",
            BuiltinStr::Value => b"\xffValue",
            BuiltinStr::Target => b"\xffTarget",
            BuiltinStr::Varmap => b"\xffVarmap",
        }
    }
}

/// Kind of the pending non-local transfer held in the longjmp slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LongjmpKind {
    /// Nothing pending
    #[default]
    Unknown,
    /// Error throw
    Throw,
    /// Coroutine yield
    Yield,
    /// Coroutine resume
    Resume,
    /// Loop break
    Break,
    /// Loop continue
    Continue,
    /// Function return
    Return,
}

/// Longjmp state: two value slots that are GC roots
#[derive(Debug, Clone, Default)]
pub(crate) struct LongjmpState<P: PtrRepr> {
    pub(crate) kind: LongjmpKind,
    pub(crate) value1: TaggedValue<P>,
    pub(crate) value2: TaggedValue<P>,
}

/// Debugger breakpoint; the file name string is a GC root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint<P: PtrRepr = Wide> {
    /// File name string
    pub filename: HeapRef<P>,
    /// Line number
    pub line: u32,
}

/// The heap
pub struct Heap<P: PtrRepr = Wide> {
    pub(crate) config: HeapConfig,
    pub(crate) allocator: Box<dyn Allocator>,
    pub(crate) headers: HeaderTable<P>,
    pub(crate) bodies: Vec<Option<HeapBody<P>>>,
    pub(crate) strtab: StringTable<P>,
    pub(crate) strcache: StringCache<P>,
    pub(crate) rom_strings: FxHashMap<Box<[u8]>, HeapRef<P>>,
    pub(crate) natives: Vec<NativeFn<P>>,

    /// Voluntary GC countdown
    pub(crate) ms_trigger_counter: i64,
    /// Nonzero disables mark-and-sweep
    pub(crate) ms_prevent_count: u32,
    /// Nonzero disables finalizer execution
    pub(crate) pf_prevent_count: u32,
    /// Flags OR'd into every cycle
    pub(crate) ms_base_flags: MsFlags,
    pub(crate) refzero_running: bool,
    pub(crate) finalizers_running: bool,

    pub(crate) heap_thread: HeapRef<P>,
    pub(crate) heap_object: HeapRef<P>,
    pub(crate) builtin_strings: Vec<HeapRef<P>>,
    pub(crate) lj: LongjmpState<P>,
    pub(crate) breakpoints: Vec<Breakpoint<P>>,
    /// Property keys held across a store; marked as roots
    pub(crate) pinned_keys: SmallVec<[HeapRef<P>; 4]>,

    pub(crate) stats: HeapStats,
    shut_down: bool,
}

impl Heap {
    /// Create a heap with native-width handles
    pub fn new(config: HeapConfig) -> HeapResult<Self> {
        Self::with_config(config)
    }
}

impl<P: PtrRepr> Heap<P> {
    /// Create a heap for any handle representation
    pub fn with_config(config: HeapConfig) -> HeapResult<Self> {
        let allocator: Box<dyn Allocator> = match config.memory_limit {
            Some(limit) => Box::new(LimitAllocator::new(limit)),
            None => Box::new(SystemAllocator::default()),
        };
        Self::with_allocator(config, allocator)
    }

    /// Create a heap on top of a custom accounting allocator
    pub fn with_allocator(config: HeapConfig, mut allocator: Box<dyn Allocator>) -> HeapResult<Self> {
        let mut headers = HeaderTable::new();
        let mut bodies = Vec::new();

        // The heap thread and stash exist before the heap does, so they are
        // installed directly; nothing can be collected at this point.
        let thread = HObject::new(None, ObjectKind::Thread(Box::default()));
        let heap_thread = bootstrap_object(&mut headers, &mut bodies, allocator.as_mut(), thread)?;
        let stash = HObject::new(None, ObjectKind::Plain);
        let heap_object = bootstrap_object(&mut headers, &mut bodies, allocator.as_mut(), stash)?;
        headers.incref(heap_thread);
        headers.incref(heap_object);

        let mut heap = Self {
            allocator,
            headers,
            bodies,
            strtab: StringTable::new(config.strtab.clone()),
            strcache: StringCache::new(config.strcache_size, config.strcache_no_cache_limit),
            rom_strings: FxHashMap::default(),
            natives: Vec::new(),
            ms_trigger_counter: config.trigger_add,
            ms_prevent_count: 1,
            pf_prevent_count: 0,
            ms_base_flags: MsFlags::empty(),
            refzero_running: false,
            finalizers_running: false,
            heap_thread,
            heap_object,
            builtin_strings: Vec::with_capacity(BuiltinStr::ALL.len()),
            lj: LongjmpState::default(),
            breakpoints: Vec::new(),
            pinned_keys: SmallVec::new(),
            stats: HeapStats::default(),
            shut_down: false,
            config,
        };
        heap.init_builtins()?;
        heap.ms_prevent_count = 0;

        tracing::debug!(
            target: "otter::heap",
            cells = heap.headers.live_count(),
            bytes = heap.memory_in_use(),
            rom_strings = heap.config.rom_strings,
            "heap initialized"
        );
        Ok(heap)
    }

    fn init_builtins(&mut self) -> HeapResult<()> {
        for b in BuiltinStr::ALL {
            let r = if self.config.rom_strings {
                self.alloc_rom_string(b.bytes())?
            } else {
                let r = self.intern(b.bytes())?;
                self.headers.incref(r);
                r
            };
            self.builtin_strings.push(r);
        }

        let object_proto = self.alloc_object_with_proto(None)?;
        self.set_builtin(Builtin::ObjectPrototype, object_proto)?;
        for which in [Builtin::ArrayPrototype, Builtin::FunctionPrototype, Builtin::ThreadPrototype] {
            let proto = self.alloc_object_with_proto(Some(object_proto))?;
            self.set_builtin(which, proto)?;
        }
        self.set_top(0)?;

        if let Some(thread_proto) = self.builtin(Builtin::ThreadPrototype) {
            self.set_prototype(self.heap_thread, Some(thread_proto))?;
        }
        Ok(())
    }

    /// Heap configuration
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Cell access
    // ---------------------------------------------------------------------

    pub(crate) fn body(&self, r: HeapRef<P>) -> HeapResult<&HeapBody<P>> {
        let slot = self.headers.resolve(r).ok_or(HeapError::InvalidRef)?;
        self.bodies[slot].as_ref().ok_or(HeapError::InvalidRef)
    }

    /// True if `r` refers to a live cell
    pub fn is_live(&self, r: HeapRef<P>) -> bool {
        self.headers
            .resolve(r)
            .is_some_and(|slot| self.bodies[slot].is_some())
    }

    /// Header of a live cell
    pub fn header(&self, r: HeapRef<P>) -> HeapResult<&HeapHeader> {
        self.headers.get(r).ok_or(HeapError::InvalidRef)
    }

    /// Refcount of a live cell
    pub fn refcount(&self, r: HeapRef<P>) -> HeapResult<usize> {
        Ok(self.header(r)?.refcount())
    }

    /// Object body
    pub fn object(&self, r: HeapRef<P>) -> HeapResult<&HObject<P>> {
        match self.body(r)? {
            HeapBody::Object(o) => Ok(o),
            _ => Err(HeapError::type_error("not an object")),
        }
    }

    /// Mutable object body
    pub(crate) fn object_mut(&mut self, r: HeapRef<P>) -> HeapResult<&mut HObject<P>> {
        Ok(self.split_object_mut(r)?.0)
    }

    /// Object body together with the header table, for refcounted writes
    pub(crate) fn split_object_mut(&mut self, r: HeapRef<P>) -> HeapResult<(&mut HObject<P>, &mut HeaderTable<P>)> {
        let slot = self.headers.resolve(r).ok_or(HeapError::InvalidRef)?;
        match self.bodies[slot].as_mut() {
            Some(HeapBody::Object(o)) => Ok((o, &mut self.headers)),
            Some(_) => Err(HeapError::type_error("not an object")),
            None => Err(HeapError::InvalidRef),
        }
    }

    /// String body
    pub fn string(&self, r: HeapRef<P>) -> HeapResult<&HString> {
        match self.body(r)? {
            HeapBody::String(s) => Ok(s),
            _ => Err(HeapError::type_error("not a string")),
        }
    }

    /// Buffer body
    pub fn buffer(&self, r: HeapRef<P>) -> HeapResult<&HBuffer> {
        match self.body(r)? {
            HeapBody::Buffer(b) => Ok(b),
            _ => Err(HeapError::type_error("not a buffer")),
        }
    }

    /// Mutable buffer body
    pub fn buffer_mut(&mut self, r: HeapRef<P>) -> HeapResult<&mut HBuffer> {
        let slot = self.headers.resolve(r).ok_or(HeapError::InvalidRef)?;
        match self.bodies[slot].as_mut() {
            Some(HeapBody::Buffer(b)) => Ok(b),
            Some(_) => Err(HeapError::type_error("not a buffer")),
            None => Err(HeapError::InvalidRef),
        }
    }

    /// Thread payload
    pub fn thread(&self, t: HeapRef<P>) -> HeapResult<&HThread<P>> {
        self.object(t)?
            .kind
            .thread()
            .ok_or_else(|| HeapError::type_error("not a thread"))
    }

    pub(crate) fn thread_parts_mut(&mut self, t: HeapRef<P>) -> HeapResult<(&mut HThread<P>, &mut HeaderTable<P>)> {
        let (obj, headers) = self.split_object_mut(t)?;
        let thread = obj
            .kind
            .thread_mut()
            .ok_or_else(|| HeapError::type_error("not a thread"))?;
        Ok((thread, headers))
    }

    /// String contents as UTF-8 text, if valid
    pub fn string_text(&self, r: HeapRef<P>) -> HeapResult<Option<&str>> {
        Ok(self.string(r)?.as_str())
    }

    /// Byte offset of a character offset, using the string cache
    pub fn char_offset_to_byte(&mut self, r: HeapRef<P>, char_offset: u32) -> HeapResult<usize> {
        let slot = self.headers.resolve(r).ok_or(HeapError::InvalidRef)?;
        match self.bodies[slot].as_ref() {
            Some(HeapBody::String(s)) => self
                .strcache
                .char_to_byte(r, s, char_offset)
                .ok_or_else(|| HeapError::range_error("char offset out of range")),
            _ => Err(HeapError::type_error("not a string")),
        }
    }

    // ---------------------------------------------------------------------
    // Cell allocation
    // ---------------------------------------------------------------------

    /// Allocate a cell and link it into the heap. Objects and buffers go on
    /// the allocated list; strings are linked by the caller.
    pub(crate) fn alloc_cell(
        &mut self,
        htype: HeapType,
        user_flags: u32,
        body: HeapBody<P>,
        bytes: usize,
    ) -> HeapResult<HeapRef<P>> {
        // Dynamic buffers arrive with their data block already accounted.
        let detached = match &body {
            HeapBody::Buffer(b) => b.detached_bytes(),
            _ => 0,
        };
        if let Err(e) = self.reserve_bytes(bytes) {
            self.release_bytes(detached);
            return Err(e);
        }
        let r = match self.alloc_slot(htype, user_flags) {
            Ok(r) => r,
            Err(e) => {
                self.release_bytes(bytes + detached);
                return Err(e);
            }
        };
        install_cell(&mut self.headers, &mut self.bodies, r, body, bytes);
        Ok(r)
    }

    /// Take a header slot, collecting garbage if the handle space is full
    fn alloc_slot(&mut self, htype: HeapType, user_flags: u32) -> HeapResult<HeapRef<P>> {
        if let Ok(r) = self.headers.alloc(htype, user_flags) {
            return Ok(r);
        }
        if self.headers.ms_running {
            return Err(HeapError::OutOfMemory);
        }
        for attempt in 0..self.config.alloc_retry_limit {
            let flags = if attempt + 1 >= self.config.emergency_retry_limit {
                MsFlags::EMERGENCY
            } else {
                MsFlags::empty()
            };
            self.mark_and_sweep(flags);
            if let Ok(r) = self.headers.alloc(htype, user_flags) {
                return Ok(r);
            }
        }
        Err(HeapError::OutOfMemory)
    }

    /// Unlink and free a cell, returning its bytes to the allocator
    pub(crate) fn free_cell(&mut self, slot: u32) {
        let r = self.headers.handle(slot);
        let size = self.headers.slot(slot).alloc_size();
        let body = self.bodies[slot as usize].take();
        let extra = match &body {
            Some(HeapBody::Buffer(b)) => b.detached_bytes(),
            Some(HeapBody::String(_)) => {
                self.strcache.remove_string(r);
                0
            }
            _ => 0,
        };
        drop(body);
        self.headers.unlink(slot);
        self.headers.release(slot);
        self.release_bytes(size + extra);
    }

    /// Adjust a cell's accounted size after its body grew or shrank
    pub(crate) fn adjust_alloc_size(&mut self, slot: u32, old_bytes: usize, new_bytes: usize) {
        let h = self.headers.slot_mut(slot);
        let size = h.alloc_size() + new_bytes;
        h.set_alloc_size(size.saturating_sub(old_bytes));
    }

    /// Intern a string. The result is not rooted: push it or store it before
    /// the next allocating call.
    pub fn intern(&mut self, bytes: &[u8]) -> HeapResult<HeapRef<P>> {
        if let Some(&r) = self.rom_strings.get(bytes) {
            return Ok(r);
        }
        let hash = hash_bytes(self.config.hash_seed, bytes);
        let bodies = &self.bodies;
        let found = self.strtab.find(hash, |r| {
            matches!(&bodies[r.slot() as usize], Some(HeapBody::String(s)) if s.bytes() == bytes)
        });
        if let Some(r) = found {
            return Ok(r);
        }

        let s = HString::new(bytes, hash);
        let user_flags = s.derived_flags();
        let size = CELL_OVERHEAD + mem::size_of::<HString>() + bytes.len();
        let r = self.alloc_cell(HeapType::String, user_flags, HeapBody::String(s), size)?;
        self.strtab.insert(hash, r);
        tracing::trace!(target: "otter::heap", len = bytes.len(), "string interned");
        Ok(r)
    }

    /// Intern a string and push it onto the value stack
    pub fn push_string(&mut self, text: &str) -> HeapResult<HeapRef<P>> {
        self.reserve_stack(1)?;
        let r = self.intern(text.as_bytes())?;
        self.push_unchecked(self.heap_thread, TaggedValue::String(r))?;
        Ok(r)
    }

    fn alloc_rom_string(&mut self, bytes: &[u8]) -> HeapResult<HeapRef<P>> {
        let hash = hash_bytes(self.config.hash_seed, bytes);
        let s = HString::new(bytes, hash);
        let user_flags = s.derived_flags();
        let size = CELL_OVERHEAD + mem::size_of::<HString>() + bytes.len();
        let r = self.alloc_cell(HeapType::String, user_flags, HeapBody::String(s), size)?;
        self.headers.slot_mut(r.slot()).set(flags::READONLY);
        self.rom_strings.insert(bytes.into(), r);
        Ok(r)
    }

    /// Built-in string handle
    pub fn builtin_string(&self, which: BuiltinStr) -> HeapRef<P> {
        self.builtin_strings[which as usize]
    }

    // ---------------------------------------------------------------------
    // Object constructors
    // ---------------------------------------------------------------------

    fn push_new_object(&mut self, proto: Option<HeapRef<P>>, kind: ObjectKind<P>, extra_flags: u32) -> HeapResult<HeapRef<P>> {
        self.reserve_stack(1)?;
        let user_flags = object_flags::EXTENSIBLE | kind.subtype_flags() | extra_flags;
        let obj = HObject::new(proto, kind);
        let size = CELL_OVERHEAD + obj.body_bytes();
        let r = self.alloc_cell(HeapType::Object, user_flags, HeapBody::Object(obj), size)?;
        self.incref_children(r.slot());
        self.push_unchecked(self.heap_thread, TaggedValue::Object(r))?;
        tracing::trace!(target: "otter::heap", obj = ?r, "object allocated");
        Ok(r)
    }

    fn incref_children(&mut self, slot: u32) {
        if let Some(HeapBody::Object(o)) = &self.bodies[slot as usize] {
            let headers = &mut self.headers;
            o.for_each_child(|c| headers.incref(c));
        }
    }

    fn alloc_object_with_proto(&mut self, proto: Option<HeapRef<P>>) -> HeapResult<HeapRef<P>> {
        self.push_new_object(proto, ObjectKind::Plain, 0)
    }

    /// Plain object inheriting from `Object.prototype`
    pub fn alloc_object(&mut self) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::ObjectPrototype);
        self.push_new_object(proto, ObjectKind::Plain, 0)
    }

    /// Plain object with an explicit prototype
    pub fn alloc_object_with(&mut self, proto: Option<HeapRef<P>>) -> HeapResult<HeapRef<P>> {
        self.push_new_object(proto, ObjectKind::Plain, 0)
    }

    /// Empty array with an active items part
    pub fn alloc_array(&mut self) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::ArrayPrototype);
        self.push_new_object(
            proto,
            ObjectKind::Array(HArray::default()),
            object_flags::ARRAY_ITEMS | object_flags::EXOTIC_ARRAY,
        )
    }

    /// Empty arguments object
    pub fn alloc_arguments(&mut self) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::ObjectPrototype);
        self.push_new_object(proto, ObjectKind::Arguments(HArray::default()), object_flags::ARRAY_ITEMS)
    }

    /// Compiled function; the payload's references are increfed
    pub fn alloc_compfunc(&mut self, func: HCompFunc<P>) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::FunctionPrototype);
        self.push_new_object(
            proto,
            ObjectKind::CompFunc(func),
            object_flags::CALLABLE | object_flags::CONSTRUCTABLE,
        )
    }

    /// Native function object
    pub fn alloc_natfunc(&mut self, func: NativeFnId, nargs: i16) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::FunctionPrototype);
        self.push_new_object(
            proto,
            ObjectKind::NatFunc(HNatFunc { func, nargs, magic: 0 }),
            object_flags::CALLABLE,
        )
    }

    /// Bound function
    pub fn alloc_boundfunc(&mut self, bound: HBoundFunc<P>) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::FunctionPrototype);
        self.push_new_object(proto, ObjectKind::BoundFunc(bound), object_flags::CALLABLE)
    }

    /// Buffer object viewing `buf`
    pub fn alloc_bufobj(&mut self, buf: HeapRef<P>, offset: u32, length: u32) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::ObjectPrototype);
        let payload = HBufObj {
            buf: Some(buf),
            buf_prop: None,
            offset,
            length,
        };
        self.push_new_object(proto, ObjectKind::BufObj(payload), 0)
    }

    /// Declarative environment record
    pub fn alloc_declarative_env(
        &mut self,
        thread: Option<HeapRef<P>>,
        varmap: Option<HeapRef<P>>,
        regbase: u32,
    ) -> HeapResult<HeapRef<P>> {
        let payload = HDecEnv { thread, varmap, regbase };
        self.push_new_object(None, ObjectKind::DecEnv(payload), 0)
    }

    /// Object environment record bound to `target`
    pub fn alloc_object_env(&mut self, target: HeapRef<P>, has_this: bool) -> HeapResult<HeapRef<P>> {
        let payload = HObjEnv { target, has_this };
        self.push_new_object(None, ObjectKind::ObjEnv(payload), 0)
    }

    /// New thread sharing the heap thread's built-ins
    pub fn alloc_thread(&mut self) -> HeapResult<HeapRef<P>> {
        let proto = self.builtin(Builtin::ThreadPrototype);
        let mut thread: HThread<P> = HThread::default();
        thread.builtins = self.thread(self.heap_thread)?.builtins.clone();
        self.push_new_object(proto, ObjectKind::Thread(Box::new(thread)), 0)
    }

    /// Fixed-size zeroed buffer
    pub fn alloc_buffer(&mut self, size: usize) -> HeapResult<HeapRef<P>> {
        self.reserve_stack(1)?;
        let body = HBuffer::Fixed(vec![0; size].into_boxed_slice());
        let user_flags = body.derived_flags();
        let bytes = CELL_OVERHEAD + mem::size_of::<HBuffer>() + size;
        let r = self.alloc_cell(HeapType::Buffer, user_flags, HeapBody::Buffer(body), bytes)?;
        self.push_unchecked(self.heap_thread, TaggedValue::Buffer(r))?;
        Ok(r)
    }

    /// Resizable zeroed buffer
    pub fn alloc_dynamic_buffer(&mut self, size: usize) -> HeapResult<HeapRef<P>> {
        self.reserve_stack(1)?;
        let block = self.alloc_zeroed(size)?;
        let body = HBuffer::Dynamic(block);
        let user_flags = body.derived_flags();
        let bytes = CELL_OVERHEAD + mem::size_of::<HBuffer>();
        let r = self.alloc_cell(HeapType::Buffer, user_flags, HeapBody::Buffer(body), bytes)?;
        self.push_unchecked(self.heap_thread, TaggedValue::Buffer(r))?;
        Ok(r)
    }

    /// Buffer over embedder-owned memory
    pub fn alloc_external_buffer(&mut self, ptr: *mut std::ffi::c_void, len: usize) -> HeapResult<HeapRef<P>> {
        self.reserve_stack(1)?;
        let body = HBuffer::External { ptr, len };
        let user_flags = body.derived_flags();
        let bytes = CELL_OVERHEAD + mem::size_of::<HBuffer>();
        let r = self.alloc_cell(HeapType::Buffer, user_flags, HeapBody::Buffer(body), bytes)?;
        self.push_unchecked(self.heap_thread, TaggedValue::Buffer(r))?;
        Ok(r)
    }

    /// Resize a dynamic buffer; new bytes are zero
    pub fn resize_buffer(&mut self, buf: HeapRef<P>, new_size: usize) -> HeapResult<()> {
        if !matches!(self.buffer(buf)?, HBuffer::Dynamic(_)) {
            return Err(HeapError::type_error("buffer is not dynamic"));
        }
        self.realloc_indirect(|heap| heap.dynamic_block_mut(buf), new_size)
    }

    fn dynamic_block_mut(&mut self, buf: HeapRef<P>) -> Option<&mut HeapBlock> {
        match self.buffer_mut(buf).ok()? {
            HBuffer::Dynamic(block) => Some(block),
            _ => None,
        }
    }

    /// Replace an object's subtype payload, keeping refcounts and the
    /// subtype header flags (including `FASTREFS`) in sync. References in
    /// `kind` must already be reachable.
    pub fn set_object_kind(&mut self, obj: HeapRef<P>, kind: ObjectKind<P>) -> HeapResult<()> {
        let slot = self.headers.resolve(obj).ok_or(HeapError::InvalidRef)? as u32;
        let old_bytes = {
            let o = self.object(obj)?;
            if o.kind.harray().is_some() != kind.harray().is_some() && !o.items.is_empty() {
                return Err(HeapError::type_error("cannot change array-likeness of an object with items"));
            }
            o.kind.payload_bytes()
        };
        let new_bytes = kind.payload_bytes();
        if new_bytes > old_bytes {
            self.reserve_bytes(new_bytes - old_bytes)?;
        }
        let new_flags = kind.subtype_flags();
        let (o, headers) = match self.split_object_mut(obj) {
            Ok(parts) => parts,
            Err(e) => {
                self.release_bytes(new_bytes.saturating_sub(old_bytes));
                return Err(e);
            }
        };
        kind.for_each_ref(|r| headers.incref(r));
        let old = mem::replace(&mut o.kind, kind);
        let mut queued = false;
        old.for_each_ref(|r| queued |= headers.decref_norz(r));
        drop(old);

        let h = self.headers.slot_mut(slot);
        h.clear(object_flags::SUBTYPE_MASK);
        h.set(new_flags);
        if new_flags & object_flags::HARRAY == 0 {
            h.clear(object_flags::ARRAY_ITEMS | object_flags::EXOTIC_ARRAY);
        }
        if new_bytes < old_bytes {
            self.release_bytes(old_bytes - new_bytes);
        }
        self.adjust_alloc_size(slot, old_bytes, new_bytes);
        if queued {
            self.refzero_free_pending();
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Value stack
    // ---------------------------------------------------------------------

    /// Ensure room for `n` more values on the heap thread's value stack
    pub fn reserve_stack(&mut self, n: usize) -> HeapResult<()> {
        self.reserve_stack_on(self.heap_thread, n)
    }

    /// Ensure room for `n` more values on a thread's value stack
    pub fn reserve_stack_on(&mut self, t: HeapRef<P>, n: usize) -> HeapResult<()> {
        let (len, reserved) = {
            let th = self.thread(t)?;
            (th.valstack.len(), th.valstack_reserved)
        };
        let needed = len.checked_add(n).ok_or(HeapError::OutOfMemory)?;
        if needed <= reserved {
            return Ok(());
        }
        let extra = needed + VALSTACK_GROW - reserved;
        let bytes = extra * mem::size_of::<TaggedValue<P>>();
        self.reserve_bytes(bytes)?;
        match self.thread_parts_mut(t) {
            Ok((th, _)) => {
                // A finalizer run by the collection above may have grown the
                // stack meanwhile; the reservation is added on top regardless.
                th.valstack_reserved += extra;
                let want = th.valstack_reserved - th.valstack.len();
                th.valstack.reserve(want);
            }
            Err(e) => {
                self.release_bytes(bytes);
                return Err(e);
            }
        }
        self.adjust_alloc_size(t.slot(), 0, bytes);
        Ok(())
    }

    pub(crate) fn push_unchecked(&mut self, t: HeapRef<P>, v: TaggedValue<P>) -> HeapResult<()> {
        let (th, headers) = self.thread_parts_mut(t)?;
        debug_assert!(th.valstack.len() < th.valstack_reserved, "push without reserve");
        headers.incref_value(&v);
        th.valstack.push(v);
        Ok(())
    }

    /// Push a value onto the heap thread's value stack. Heap values must
    /// already be reachable.
    pub fn push(&mut self, v: TaggedValue<P>) -> HeapResult<()> {
        self.push_to(self.heap_thread, v)
    }

    /// Push a value onto a thread's value stack
    pub fn push_to(&mut self, t: HeapRef<P>, v: TaggedValue<P>) -> HeapResult<()> {
        self.reserve_stack_on(t, 1)?;
        self.push_unchecked(t, v)
    }

    /// Pop the top of the heap thread's value stack
    pub fn pop(&mut self) -> HeapResult<()> {
        self.pop_from(self.heap_thread)
    }

    /// Pop the top of a thread's value stack
    pub fn pop_from(&mut self, t: HeapRef<P>) -> HeapResult<()> {
        let (th, headers) = self.thread_parts_mut(t)?;
        let v = th
            .valstack
            .pop()
            .ok_or_else(|| HeapError::range_error("value stack underflow"))?;
        if headers.decref_value_norz(&v) {
            self.refzero_free_pending();
        }
        Ok(())
    }

    /// Value at `idx` on the heap thread's value stack
    pub fn get(&self, idx: usize) -> Option<TaggedValue<P>> {
        self.thread(self.heap_thread)
            .ok()
            .and_then(|th| th.valstack.get(idx).copied())
    }

    /// Heap thread value stack depth
    pub fn stack_len(&self) -> usize {
        self.thread(self.heap_thread).map_or(0, |th| th.valstack.len())
    }

    /// Truncate the heap thread's value stack to `top`
    pub fn set_top(&mut self, top: usize) -> HeapResult<()> {
        self.set_top_on(self.heap_thread, top)
    }

    /// Truncate a thread's value stack to `top`
    pub fn set_top_on(&mut self, t: HeapRef<P>, top: usize) -> HeapResult<()> {
        let (th, headers) = self.thread_parts_mut(t)?;
        if top > th.valstack.len() {
            return Err(HeapError::range_error("set_top above current top"));
        }
        let mut queued = false;
        for v in th.valstack.drain(top..) {
            queued |= headers.decref_value_norz(&v);
        }
        if queued {
            self.refzero_free_pending();
        }
        Ok(())
    }

    /// Overwrite a value stack slot of the heap thread
    pub fn replace(&mut self, idx: usize, v: TaggedValue<P>) -> HeapResult<()> {
        let (th, headers) = self.thread_parts_mut(self.heap_thread)?;
        let slot = th
            .valstack
            .get_mut(idx)
            .ok_or_else(|| HeapError::range_error("value stack index out of range"))?;
        if slot.set_and_update_refs(v, headers) {
            self.refzero_free_pending();
        }
        Ok(())
    }

    /// Push an activation record onto a thread's call stack
    pub fn push_activation(&mut self, t: HeapRef<P>, act: Activation<P>) -> HeapResult<()> {
        let bytes = mem::size_of::<Activation<P>>();
        self.reserve_bytes(bytes)?;
        match self.thread_parts_mut(t) {
            Ok((th, headers)) => {
                act.for_each_ref(|r| headers.incref(r));
                th.callstack.push(act);
            }
            Err(e) => {
                self.release_bytes(bytes);
                return Err(e);
            }
        }
        self.adjust_alloc_size(t.slot(), 0, bytes);
        Ok(())
    }

    /// Pop the innermost activation record
    pub fn pop_activation(&mut self, t: HeapRef<P>) -> HeapResult<()> {
        let (th, headers) = self.thread_parts_mut(t)?;
        let act = th
            .callstack
            .pop()
            .ok_or_else(|| HeapError::range_error("call stack underflow"))?;
        let mut queued = false;
        act.for_each_ref(|r| queued |= headers.decref_norz(r));
        let bytes = mem::size_of::<Activation<P>>();
        self.adjust_alloc_size(t.slot(), bytes, 0);
        self.release_bytes(bytes);
        if queued {
            self.refzero_free_pending();
        }
        Ok(())
    }

    /// Set the thread that resumed `t`
    pub fn set_resumer(&mut self, t: HeapRef<P>, resumer: Option<HeapRef<P>>) -> HeapResult<()> {
        let (th, headers) = self.thread_parts_mut(t)?;
        if let Some(r) = resumer {
            headers.incref(r);
        }
        let old = mem::replace(&mut th.resumer, resumer);
        if old.is_some_and(|r| headers.decref_norz(r)) {
            self.refzero_free_pending();
        }
        Ok(())
    }

    /// Set a thread's coroutine state
    pub fn set_thread_state(&mut self, t: HeapRef<P>, state: ThreadState) -> HeapResult<()> {
        self.thread_parts_mut(t)?.0.state = state;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    /// The heap thread
    pub fn heap_thread(&self) -> HeapRef<P> {
        self.heap_thread
    }

    /// The heap stash object, a root for embedder-owned values
    pub fn stash(&self) -> HeapRef<P> {
        self.heap_object
    }

    /// Built-in object from the heap thread's built-ins table
    pub fn builtin(&self, which: Builtin) -> Option<HeapRef<P>> {
        self.thread(self.heap_thread).ok()?.builtin(which)
    }

    fn set_builtin(&mut self, which: Builtin, r: HeapRef<P>) -> HeapResult<()> {
        let (th, headers) = self.thread_parts_mut(self.heap_thread)?;
        headers.incref(r);
        let old = th.builtins[which as usize].replace(r);
        if old.is_some_and(|o| headers.decref_norz(o)) {
            self.refzero_free_pending();
        }
        Ok(())
    }

    /// Store the pending longjmp values; both slots are roots
    pub fn set_lj_values(&mut self, kind: LongjmpKind, value1: TaggedValue<P>, value2: TaggedValue<P>) {
        self.lj.kind = kind;
        let mut queued = self.lj.value1.set_and_update_refs(value1, &mut self.headers);
        queued |= self.lj.value2.set_and_update_refs(value2, &mut self.headers);
        if queued {
            self.refzero_free_pending();
        }
    }

    /// Pending longjmp state
    pub fn lj_values(&self) -> (LongjmpKind, TaggedValue<P>, TaggedValue<P>) {
        (self.lj.kind, self.lj.value1, self.lj.value2)
    }

    /// Clear the longjmp slots
    pub fn clear_lj(&mut self) {
        self.set_lj_values(LongjmpKind::Unknown, TaggedValue::Undefined, TaggedValue::Undefined);
    }

    /// Add a debugger breakpoint; returns its index
    pub fn add_breakpoint(&mut self, filename: HeapRef<P>, line: u32) -> HeapResult<usize> {
        if self.breakpoints.len() >= MAX_BREAKPOINTS {
            return Err(HeapError::range_error("too many breakpoints"));
        }
        if self.header(filename)?.htype() != HeapType::String {
            return Err(HeapError::type_error("breakpoint file name must be a string"));
        }
        self.headers.incref(filename);
        self.breakpoints.push(Breakpoint { filename, line });
        Ok(self.breakpoints.len() - 1)
    }

    /// Remove a debugger breakpoint by index
    pub fn remove_breakpoint(&mut self, idx: usize) -> HeapResult<()> {
        if idx >= self.breakpoints.len() {
            return Err(HeapError::range_error("invalid breakpoint index"));
        }
        let bp = self.breakpoints.remove(idx);
        self.decref(bp.filename);
        Ok(())
    }

    /// Current breakpoints
    pub fn breakpoints(&self) -> &[Breakpoint<P>] {
        &self.breakpoints
    }

    // ---------------------------------------------------------------------
    // Native functions
    // ---------------------------------------------------------------------

    /// Register a native function
    pub fn register_native<F>(&mut self, f: F) -> NativeFnId
    where
        F: Fn(&mut Heap<P>, HeapRef<P>) -> HeapResult<()> + 'static,
    {
        self.natives.push(Rc::new(f));
        NativeFnId(self.natives.len() as u32 - 1)
    }

    /// Call a registered native function with `this`
    pub fn call_native(&mut self, id: NativeFnId, this: HeapRef<P>) -> HeapResult<()> {
        let f = self
            .natives
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| HeapError::type_error("unknown native function"))?;
        f(self, this)
    }

    // ---------------------------------------------------------------------
    // Counters and statistics
    // ---------------------------------------------------------------------

    /// Disable mark-and-sweep until the matching [`Heap::allow_gc`]
    pub fn prevent_gc(&mut self) {
        self.ms_prevent_count += 1;
    }

    /// Undo one [`Heap::prevent_gc`]
    pub fn allow_gc(&mut self) {
        debug_assert!(self.ms_prevent_count > 0);
        self.ms_prevent_count = self.ms_prevent_count.saturating_sub(1);
    }

    /// Disable finalizer execution until the matching [`Heap::allow_finalizers`]
    pub fn prevent_finalizers(&mut self) {
        self.pf_prevent_count += 1;
    }

    /// Undo one [`Heap::prevent_finalizers`]
    pub fn allow_finalizers(&mut self) {
        debug_assert!(self.pf_prevent_count > 0);
        self.pf_prevent_count = self.pf_prevent_count.saturating_sub(1);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> HeapStats {
        let mut stats = self.stats.clone();
        stats.bytes_in_use = self.allocator.in_use();
        stats
    }

    /// Objects and buffers on the heap lists
    pub fn object_count(&self) -> usize {
        self.headers.allocated.len() + self.headers.finalize.len() + self.headers.refzero.len()
    }

    /// Interned plus read-only strings
    pub fn string_count(&self) -> usize {
        self.strtab.len() + self.rom_strings.len()
    }

    /// Objects waiting for their finalizer
    pub fn finalize_pending(&self) -> usize {
        self.headers.finalize.len()
    }

    /// List a live cell is on
    pub fn list_of(&self, r: HeapRef<P>) -> Option<ListKind> {
        self.headers.get(r).and_then(|h| h.list())
    }

    /// Voluntary GC countdown
    pub fn trigger_counter(&self) -> i64 {
        self.ms_trigger_counter
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Destroy the heap: collect garbage with finalizers, run the remaining
    /// finalizers once, then free everything. Returns final statistics.
    pub fn shutdown(mut self) -> HeapStats {
        self.teardown();
        self.stats()
    }

    fn teardown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        tracing::debug!(target: "otter::heap", objects = self.object_count(), strings = self.string_count(), "heap teardown");

        self.mark_and_sweep(MsFlags::empty());
        self.run_remaining_finalizers();

        self.ms_prevent_count += 1;
        self.pf_prevent_count += 1;
        self.headers.ms_running = true;
        for slot in 0..self.bodies.len() as u32 {
            if self.bodies[slot as usize].is_some() {
                self.free_cell(slot);
            }
        }
        self.strtab.drain_all();
        self.rom_strings.clear();
        self.strcache.clear();
        self.headers.pending_strings.clear();
        self.builtin_strings.clear();
        self.breakpoints.clear();
        self.lj = LongjmpState::default();
        self.natives.clear();
        tracing::debug!(target: "otter::heap", bytes = self.allocator.in_use(), "heap freed");
    }
}

impl<P: PtrRepr> Drop for Heap<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn install_cell<P: PtrRepr>(
    headers: &mut HeaderTable<P>,
    bodies: &mut Vec<Option<HeapBody<P>>>,
    r: HeapRef<P>,
    body: HeapBody<P>,
    bytes: usize,
) {
    let slot = r.slot() as usize;
    if slot >= bodies.len() {
        bodies.resize_with(slot + 1, || None);
    }
    let is_string = matches!(body, HeapBody::String(_));
    bodies[slot] = Some(body);
    headers.slot_mut(r.slot()).set_alloc_size(bytes);
    if !is_string {
        headers.link_allocated(r);
    }
}

fn bootstrap_object<P: PtrRepr>(
    headers: &mut HeaderTable<P>,
    bodies: &mut Vec<Option<HeapBody<P>>>,
    allocator: &mut dyn Allocator,
    obj: HObject<P>,
) -> HeapResult<HeapRef<P>> {
    let bytes = CELL_OVERHEAD + obj.body_bytes();
    if !allocator.try_reserve(bytes) {
        return Err(HeapError::OutOfMemory);
    }
    let user_flags = object_flags::EXTENSIBLE | obj.kind().subtype_flags();
    let r = headers.alloc(HeapType::Object, user_flags)?;
    install_cell(headers, bodies, r, HeapBody::Object(obj), bytes);
    Ok(r)
}
