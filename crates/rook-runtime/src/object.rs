//! Heap object variants
//!
//! Everything with identity lives behind a [`Handle`] in the [`Heap`]
//! arena. The eight variants here are the engine's entire object model.

use std::rc::Rc;

use crate::bytecode::Chunk;
use crate::heap::{Handle, Heap};
use crate::table::Table;
use crate::value::Value;

/// Host callback. Receives the heap (for allocation and string access) and
/// the argument window on the VM stack; the engine does not check arity.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Value;

/// A heap object
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
}

/// An interned string: at most one live instance per byte sequence.
#[derive(Debug)]
pub struct ObjString {
    pub chars: String,
    /// FNV-1a hash of `chars`, cached for table probing
    pub hash: u32,
}

/// A compiled function. Immutable after compilation; the chunk sits behind
/// an `Rc` so call frames can execute it without borrowing the heap.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
    /// Interned name; `None` for the top-level script
    pub name: Option<Handle>,
}

/// A function paired with its captured upvalues.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// An indirection cell for a variable captured by a closure.
#[derive(Debug)]
pub struct ObjUpvalue {
    pub location: UpvalueLocation,
    /// Link in the VM's open-upvalue list (descending stack slot order)
    pub next: Option<Handle>,
}

/// Where an upvalue's variable currently lives
#[derive(Debug, Clone, Copy)]
pub enum UpvalueLocation {
    /// Still on the VM stack, at this slot
    Open(usize),
    /// Hoisted into the upvalue's own cell
    Closed(Value),
}

/// A class: a name, a method table, and an optional superclass.
/// The superclass reference is set once by `Inherit` and never changes;
/// method dispatch walks the chain at lookup time.
#[derive(Debug)]
pub struct ObjClass {
    pub name: Handle,
    pub methods: Table,
    pub superclass: Option<Handle>,
}

/// An instance: a class reference and a field table. Field lookup never
/// consults the class; method lookup never consults the fields.
#[derive(Debug)]
pub struct ObjInstance {
    pub class: Handle,
    pub fields: Table,
}

/// A method closure bound to a receiver.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

/// A host callback registered under a global name.
#[derive(Debug)]
pub struct ObjNative {
    pub function: NativeFn,
}
