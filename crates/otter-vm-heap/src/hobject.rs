//! Heap objects
//!
//! [`HObject`] carries the property storage shared by every object and a
//! subtype payload in [`ObjectKind`]. Child enumeration is split into base
//! children (properties, items, prototype) and subtype children so the
//! marker can skip the subtype walk for `FASTREFS` objects.

use std::mem;

use crate::header::object_flags;
use crate::props::{PropPart, StrKey};
use crate::ptr::{HeapRef, PtrRepr, Wide};
use crate::thread::HThread;
use crate::value::{NativeFnId, TaggedValue};

/// Array payload
#[derive(Debug, Clone, Copy, Default)]
pub struct HArray {
    /// `length` property value
    pub length: u32,
}

/// Compiled function payload
#[derive(Debug, Clone)]
pub struct HCompFunc<P: PtrRepr = Wide> {
    /// Bytecode buffer
    pub data: Option<HeapRef<P>>,
    /// Constant table
    pub consts: Vec<TaggedValue<P>>,
    /// Inner function templates
    pub funcs: Vec<HeapRef<P>>,
    /// Closure lexical environment
    pub lex_env: Option<HeapRef<P>>,
    /// Closure variable environment
    pub var_env: Option<HeapRef<P>>,
}

/// Native function payload
#[derive(Debug, Clone, Copy)]
pub struct HNatFunc {
    /// Registered native function
    pub func: NativeFnId,
    /// Declared argument count (-1 for varargs)
    pub nargs: i16,
    /// Magic value passed through to the callee
    pub magic: i16,
}

/// Bound function payload
#[derive(Debug, Clone)]
pub struct HBoundFunc<P: PtrRepr = Wide> {
    /// Target function
    pub target: TaggedValue<P>,
    /// Bound `this`
    pub this: TaggedValue<P>,
    /// Bound leading arguments
    pub args: Vec<TaggedValue<P>>,
}

/// Buffer object (typed array view) payload
#[derive(Debug, Clone)]
pub struct HBufObj<P: PtrRepr = Wide> {
    /// Backing buffer
    pub buf: Option<HeapRef<P>>,
    /// Backing `ArrayBuffer` object, if any
    pub buf_prop: Option<HeapRef<P>>,
    /// Byte offset into the buffer
    pub offset: u32,
    /// Byte length of the view
    pub length: u32,
}

/// Declarative environment record payload
#[derive(Debug, Clone)]
pub struct HDecEnv<P: PtrRepr = Wide> {
    /// Thread whose registers back open variables
    pub thread: Option<HeapRef<P>>,
    /// Name to register map
    pub varmap: Option<HeapRef<P>>,
    /// Register base in the thread's value stack
    pub regbase: u32,
}

/// Object environment record payload
#[derive(Debug, Clone)]
pub struct HObjEnv<P: PtrRepr = Wide> {
    /// Binding object
    pub target: HeapRef<P>,
    /// `with` statement style `this` binding
    pub has_this: bool,
}

/// Object subtype
#[derive(Debug, Clone)]
pub enum ObjectKind<P: PtrRepr = Wide> {
    /// Ordinary object
    Plain,
    /// Array with exotic `length`
    Array(HArray),
    /// Arguments object (array-like items, no exotic length)
    Arguments(HArray),
    /// Compiled function
    CompFunc(HCompFunc<P>),
    /// Native function
    NatFunc(HNatFunc),
    /// Bound function
    BoundFunc(HBoundFunc<P>),
    /// Buffer object
    BufObj(HBufObj<P>),
    /// Declarative environment record
    DecEnv(HDecEnv<P>),
    /// Object environment record
    ObjEnv(HObjEnv<P>),
    /// Coroutine
    Thread(Box<HThread<P>>),
}

impl<P: PtrRepr> ObjectKind<P> {
    /// Header flags implied by the subtype
    pub fn subtype_flags(&self) -> u32 {
        use object_flags::*;
        match self {
            ObjectKind::Plain => FASTREFS,
            ObjectKind::Array(_) | ObjectKind::Arguments(_) => FASTREFS | HARRAY,
            ObjectKind::CompFunc(_) => COMPFUNC,
            ObjectKind::NatFunc(_) => FASTREFS | NATFUNC,
            ObjectKind::BoundFunc(_) => BOUNDFUNC,
            ObjectKind::BufObj(_) => BUFOBJ,
            ObjectKind::DecEnv(_) | ObjectKind::ObjEnv(_) => ENV,
            ObjectKind::Thread(_) => THREAD,
        }
    }

    /// Array payload for array-like subtypes
    pub fn harray(&self) -> Option<&HArray> {
        match self {
            ObjectKind::Array(a) | ObjectKind::Arguments(a) => Some(a),
            _ => None,
        }
    }

    /// Mutable array payload for array-like subtypes
    pub fn harray_mut(&mut self) -> Option<&mut HArray> {
        match self {
            ObjectKind::Array(a) | ObjectKind::Arguments(a) => Some(a),
            _ => None,
        }
    }

    /// Thread payload
    pub fn thread(&self) -> Option<&HThread<P>> {
        match self {
            ObjectKind::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable thread payload
    pub fn thread_mut(&mut self) -> Option<&mut HThread<P>> {
        match self {
            ObjectKind::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// Native function id for native function objects
    pub fn native_fn(&self) -> Option<NativeFnId> {
        match self {
            ObjectKind::NatFunc(n) => Some(n.func),
            _ => None,
        }
    }

    /// Visit heap references owned by the subtype payload
    pub fn for_each_ref(&self, mut f: impl FnMut(HeapRef<P>)) {
        match self {
            ObjectKind::Plain | ObjectKind::Array(_) | ObjectKind::Arguments(_) | ObjectKind::NatFunc(_) => {}
            ObjectKind::CompFunc(c) => {
                if let Some(r) = c.data {
                    f(r);
                }
                for v in &c.consts {
                    visit_value(v, &mut f);
                }
                for r in &c.funcs {
                    f(*r);
                }
                for r in [c.lex_env, c.var_env].into_iter().flatten() {
                    f(r);
                }
            }
            ObjectKind::BoundFunc(b) => {
                visit_value(&b.target, &mut f);
                visit_value(&b.this, &mut f);
                for v in &b.args {
                    visit_value(v, &mut f);
                }
            }
            ObjectKind::BufObj(b) => {
                for r in [b.buf, b.buf_prop].into_iter().flatten() {
                    f(r);
                }
            }
            ObjectKind::DecEnv(e) => {
                for r in [e.thread, e.varmap].into_iter().flatten() {
                    f(r);
                }
            }
            ObjectKind::ObjEnv(e) => f(e.target),
            ObjectKind::Thread(t) => t.for_each_ref(f),
        }
    }

    /// Accounted bytes owned by the payload beyond the object itself
    pub fn payload_bytes(&self) -> usize {
        let tv = mem::size_of::<TaggedValue<P>>();
        match self {
            ObjectKind::CompFunc(c) => c.consts.len() * tv + c.funcs.len() * mem::size_of::<HeapRef<P>>(),
            ObjectKind::BoundFunc(b) => b.args.len() * tv,
            ObjectKind::Thread(t) => {
                mem::size_of::<HThread<P>>() + t.builtins.len() * mem::size_of::<Option<HeapRef<P>>>()
            }
            _ => 0,
        }
    }
}

#[inline]
fn visit_value<P: PtrRepr>(v: &TaggedValue<P>, f: &mut impl FnMut(HeapRef<P>)) {
    if let Some(r) = v.heap_ref() {
        f(r);
    }
}

/// Object body
#[derive(Debug, Clone)]
pub struct HObject<P: PtrRepr = Wide> {
    pub(crate) proto: Option<HeapRef<P>>,
    pub(crate) strprops: PropPart<StrKey<P>, P>,
    pub(crate) idxprops: PropPart<u32, P>,
    pub(crate) items: Vec<TaggedValue<P>>,
    pub(crate) kind: ObjectKind<P>,
}

impl<P: PtrRepr> HObject<P> {
    /// Empty object of the given subtype
    pub fn new(proto: Option<HeapRef<P>>, kind: ObjectKind<P>) -> Self {
        Self {
            proto,
            strprops: PropPart::default(),
            idxprops: PropPart::default(),
            items: Vec::new(),
            kind,
        }
    }

    /// Internal prototype
    pub fn proto(&self) -> Option<HeapRef<P>> {
        self.proto
    }

    /// Subtype payload
    pub fn kind(&self) -> &ObjectKind<P> {
        &self.kind
    }

    /// Mutable subtype payload
    pub fn kind_mut(&mut self) -> &mut ObjectKind<P> {
        &mut self.kind
    }

    /// String-keyed entries part
    pub fn strprops(&self) -> &PropPart<StrKey<P>, P> {
        &self.strprops
    }

    /// Sparse index part
    pub fn idxprops(&self) -> &PropPart<u32, P> {
        &self.idxprops
    }

    /// Dense array items (allocated size, gaps are `Unused`)
    pub fn items(&self) -> &[TaggedValue<P>] {
        &self.items
    }

    /// Visit base children: live entry keys and values, array items, index
    /// part values, and the prototype
    pub fn for_each_base_child(&self, mut f: impl FnMut(HeapRef<P>)) {
        for (_, key, value, _) in self.strprops.iter() {
            f(key.string);
            value.for_each_ref(&mut f);
        }
        for v in &self.items {
            if let Some(r) = v.heap_ref() {
                f(r);
            }
        }
        for value in self.idxprops.live_values() {
            value.for_each_ref(&mut f);
        }
        if let Some(r) = self.proto {
            f(r);
        }
    }

    /// Visit subtype children
    pub fn for_each_subtype_child(&self, f: impl FnMut(HeapRef<P>)) {
        self.kind.for_each_ref(f);
    }

    /// Visit every child
    pub fn for_each_child(&self, mut f: impl FnMut(HeapRef<P>)) {
        self.for_each_base_child(&mut f);
        self.for_each_subtype_child(&mut f);
    }

    /// Accounted bytes for the property storage
    pub fn props_bytes(&self) -> usize {
        self.strprops.byte_size()
            + self.idxprops.byte_size()
            + self.items.len() * mem::size_of::<TaggedValue<P>>()
    }

    /// Accounted bytes for the whole object body
    pub fn body_bytes(&self) -> usize {
        mem::size_of::<Self>() + self.props_bytes() + self.kind.payload_bytes()
    }
}
