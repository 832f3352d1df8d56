// Heap object variants. Every value a `Value::Obj` can point at lives here,
// keyed by the `ObjRef` handle minted by `gc::Heap`.

use crate::chunk::Chunk;
use crate::gc::ObjRef;
use crate::table::Table;
use crate::value::Value;
use crate::vm::NativeFn;

/// An immutable byte string with its hash precomputed at construction time,
/// so the table never has to rehash a key.
#[derive(Clone)]
pub struct LString {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl LString {
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A compiled function body. Never called directly — the VM only ever
/// invokes it wrapped in a `Closure`, even for functions with no captures.
#[derive(Clone)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

impl ObjFunction {
    pub fn new() -> Self {
        ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }
    }
}

#[derive(Clone, Copy)]
pub enum UpvalueState {
    /// Still points at a live stack slot of a currently-executing frame.
    Open(usize),
    Closed,
}

/// A cell capturing a variable that outlives the scope that declared it.
/// Open upvalues form a descending-address singly linked list rooted in the
/// VM; `next_open` is that list's `next` pointer, expressed as an index into
/// the same arena rather than a raw pointer.
#[derive(Clone)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
    pub closed: Value,
    pub next_open: Option<ObjRef>,
}

#[derive(Clone)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Clone)]
pub struct NativeObj {
    pub name: ObjRef,
    pub function: NativeFn,
}

#[derive(Clone)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table<Value>,
}

impl ObjClass {
    pub fn new(name: ObjRef) -> Self {
        ObjClass { name, methods: Table::new() }
    }
}

#[derive(Clone)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table<Value>,
}

impl ObjInstance {
    pub fn new(class: ObjRef) -> Self {
        ObjInstance { class, fields: Table::new() }
    }
}

/// A method closure already bound to its receiver. `GET_PROPERTY` allocates
/// one of these when a method is read without being called in the same
/// expression; `INVOKE`/`SUPER_INVOKE` are a fast path that calls the method
/// directly and skips this allocation (§4.3).
#[derive(Clone)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Clone)]
pub enum Obj {
    String(LString),
    Function(ObjFunction),
    Native(NativeObj),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native fn",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }

    pub fn as_string(&self) -> Option<&LString> {
        match self {
            Obj::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ObjClosure> {
        match self {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ObjClass> {
        match self {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ObjInstance> {
        match self {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&ObjBoundMethod> {
        match self {
            Obj::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    /// Rough heap footprint, used only for GC accounting/thresholds.
    pub fn approx_size(&self) -> usize {
        match self {
            Obj::String(s) => std::mem::size_of::<LString>() + s.bytes.len(),
            Obj::Function(f) => {
                std::mem::size_of::<ObjFunction>()
                    + f.chunk.code.len()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Obj::Native(_) => std::mem::size_of::<NativeObj>(),
            Obj::Closure(c) => {
                std::mem::size_of::<ObjClosure>() + c.upvalues.len() * std::mem::size_of::<ObjRef>()
            }
            Obj::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
            Obj::Class(_) => std::mem::size_of::<ObjClass>(),
            Obj::Instance(_) => std::mem::size_of::<ObjInstance>(),
            Obj::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
        }
    }
}
