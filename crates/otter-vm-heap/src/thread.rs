//! Thread (coroutine) objects
//!
//! The executor owns the meaning of a thread's stacks. The heap only needs
//! to walk them: the value stack up to its top, every activation record, the
//! resumer, and the built-ins table.

use crate::ptr::{HeapRef, PtrRepr, Wide};
use crate::value::TaggedValue;

/// Built-in objects stored in a thread's built-ins table
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `Object.prototype`
    ObjectPrototype = 0,
    /// `Array.prototype`
    ArrayPrototype = 1,
    /// `Function.prototype`
    FunctionPrototype = 2,
    /// Prototype of thread objects
    ThreadPrototype = 3,
}

impl Builtin {
    /// Number of built-in slots
    pub const COUNT: usize = 4;
}

/// Coroutine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// Created, never resumed
    #[default]
    Inactive,
    /// Currently executing
    Running,
    /// Resumed another thread and is waiting for it
    Resumed,
    /// Yielded to its resumer
    Yielded,
    /// Finished
    Terminated,
}

/// Call stack entry
#[derive(Debug, Clone, Default)]
pub struct Activation<P: PtrRepr = Wide> {
    /// Function being executed
    pub func: Option<HeapRef<P>>,
    /// Variable environment record
    pub var_env: Option<HeapRef<P>>,
    /// Lexical environment record
    pub lex_env: Option<HeapRef<P>>,
    /// Previous value of the function's `caller` backlink
    pub prev_caller: Option<HeapRef<P>>,
}

impl<P: PtrRepr> Activation<P> {
    /// Visit every heap reference in the record
    pub fn for_each_ref(&self, mut f: impl FnMut(HeapRef<P>)) {
        for r in [self.func, self.var_env, self.lex_env, self.prev_caller].into_iter().flatten() {
            f(r);
        }
    }
}

/// Thread payload
#[derive(Debug, Clone)]
pub struct HThread<P: PtrRepr = Wide> {
    pub(crate) valstack: Vec<TaggedValue<P>>,
    /// Value stack slots accounted against the allocator
    pub(crate) valstack_reserved: usize,
    pub(crate) callstack: Vec<Activation<P>>,
    pub(crate) resumer: Option<HeapRef<P>>,
    pub(crate) builtins: Vec<Option<HeapRef<P>>>,
    pub(crate) state: ThreadState,
}

impl<P: PtrRepr> Default for HThread<P> {
    fn default() -> Self {
        Self {
            valstack: Vec::new(),
            valstack_reserved: 0,
            callstack: Vec::new(),
            resumer: None,
            builtins: vec![None; Builtin::COUNT],
            state: ThreadState::Inactive,
        }
    }
}

impl<P: PtrRepr> HThread<P> {
    /// Values in `[0, top)`
    pub fn valstack(&self) -> &[TaggedValue<P>] {
        &self.valstack
    }

    /// Activation records, outermost first
    pub fn callstack(&self) -> &[Activation<P>] {
        &self.callstack
    }

    /// Thread that resumed this one
    pub fn resumer(&self) -> Option<HeapRef<P>> {
        self.resumer
    }

    /// Built-in object slot
    pub fn builtin(&self, which: Builtin) -> Option<HeapRef<P>> {
        self.builtins.get(which as usize).copied().flatten()
    }

    /// Coroutine state
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Visit every heap reference reachable from the thread
    pub fn for_each_ref(&self, mut f: impl FnMut(HeapRef<P>)) {
        for v in &self.valstack {
            if let Some(r) = v.heap_ref() {
                f(r);
            }
        }
        for act in &self.callstack {
            act.for_each_ref(&mut f);
        }
        if let Some(r) = self.resumer {
            f(r);
        }
        for r in self.builtins.iter().flatten() {
            f(*r);
        }
    }
}
