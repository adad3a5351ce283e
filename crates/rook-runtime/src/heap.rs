//! Object heap and garbage collector
//!
//! A handle-indexed arena owns every heap object; values and objects refer
//! to each other through [`Handle`]s, and the collector walks the arena
//! instead of chasing pointers. Collection is stop-the-world mark-and-sweep:
//! the VM marks its roots, `trace_references` drains the gray worklist, and
//! `sweep` frees whatever stayed white. The string intern set is weak: the
//! sweep drops unmarked keys from it before freeing the slots they name.

use crate::object::{Obj, ObjString, UpvalueLocation};
use crate::table::{hash_str, Table};
use crate::value::{format_number, Value};

/// Heap size multiplier applied after each collection
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Default first-collection threshold in bytes
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Index of an object in the heap arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    obj: Obj,
}

/// The object heap
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Weakly-held canonical strings
    strings: Table,
    /// Gray worklist for the mark phase
    gray: Vec<Handle>,
    bytes_allocated: usize,
    next_gc: usize,
    gc_stress: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(false, DEFAULT_GC_THRESHOLD)
    }
}

impl Heap {
    pub fn new(gc_stress: bool, gc_threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: gc_threshold,
            gc_stress,
        }
    }

    /// Allocate an object and return its handle. Never collects; callers
    /// with live roots check [`Heap::should_collect`] first.
    pub fn alloc(&mut self, obj: Obj) -> Handle {
        self.bytes_allocated += obj_size(&obj);
        let slot = Some(Slot { marked: false, obj });
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                Handle::new(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(slot);
                Handle::new(index)
            }
        }
    }

    /// Whether the next allocation safe point should collect first.
    pub fn should_collect(&self) -> bool {
        self.gc_stress || self.bytes_allocated > self.next_gc
    }

    /// Return the canonical handle for a string, allocating and interning
    /// it on first sight.
    pub fn intern(&mut self, text: &str) -> Handle {
        let hash = hash_str(text);
        let slots = &self.slots;
        let found = self.strings.find_string(hash, |candidate| {
            matches!(
                &slots[candidate.index()],
                Some(slot) if matches!(&slot.obj, Obj::String(s) if s.chars == text)
            )
        });
        if let Some(handle) = found {
            return handle;
        }
        let handle = self.alloc(Obj::String(ObjString {
            chars: text.to_string(),
            hash,
        }));
        self.strings.set(handle, hash, Value::Nil);
        handle
    }

    /// Look up an already-interned string without allocating.
    pub fn find_interned(&self, text: &str) -> Option<Handle> {
        let hash = hash_str(text);
        let slots = &self.slots;
        self.strings.find_string(hash, |candidate| {
            matches!(
                &slots[candidate.index()],
                Some(slot) if matches!(&slot.obj, Obj::String(s) if s.chars == text)
            )
        })
    }

    pub fn get(&self, handle: Handle) -> &Obj {
        match &self.slots[handle.index()] {
            Some(slot) => &slot.obj,
            None => panic!("use of freed object"),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        match &mut self.slots[handle.index()] {
            Some(slot) => &mut slot.obj,
            None => panic!("use of freed object"),
        }
    }

    /// The interned string behind a handle. Panics on a non-string handle;
    /// name handles are produced by the compiler and always strings.
    pub fn string(&self, handle: Handle) -> &ObjString {
        match self.get(handle) {
            Obj::String(s) => s,
            other => panic!("expected string object, found {:?}", other),
        }
    }

    /// Number of live objects (tests and diagnostics).
    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    // ---- Mark phase ----------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: Handle) {
        if let Some(slot) = &mut self.slots[handle.index()] {
            if slot.marked {
                return;
            }
            slot.marked = true;
            self.gray.push(handle);
        }
    }

    /// Mark every key and value of a table held outside the heap (globals).
    pub fn mark_table_root(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, marking everything reachable.
    pub fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
    }

    /// Mark the objects and values one object refers to.
    fn blacken(&mut self, handle: Handle) {
        let mut handles: Vec<Handle> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        match self.get(handle) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Upvalue(upvalue) => {
                // An open upvalue's slot is marked with the stack roots.
                if let UpvalueLocation::Closed(value) = upvalue.location {
                    values.push(value);
                }
            }
            Obj::Function(function) => {
                if let Some(name) = function.name {
                    handles.push(name);
                }
                values.extend_from_slice(&function.chunk.constants);
            }
            Obj::Closure(closure) => {
                handles.push(closure.function);
                handles.extend_from_slice(&closure.upvalues);
            }
            Obj::Class(class) => {
                handles.push(class.name);
                if let Some(superclass) = class.superclass {
                    handles.push(superclass);
                }
                for (key, value) in class.methods.iter() {
                    handles.push(key);
                    values.push(value);
                }
            }
            Obj::Instance(instance) => {
                handles.push(instance.class);
                for (key, value) in instance.fields.iter() {
                    handles.push(key);
                    values.push(value);
                }
            }
            Obj::BoundMethod(bound) => {
                values.push(bound.receiver);
                handles.push(bound.method);
            }
        }

        for h in handles {
            self.mark_object(h);
        }
        for v in values {
            self.mark_value(v);
        }
    }

    // ---- Sweep phase ---------------------------------------------------

    /// Free every unmarked object and clear surviving marks. The intern set
    /// drops dead keys first, before their slots are reclaimed; that order
    /// keeps the weak table from ever holding a freed handle.
    pub fn sweep(&mut self) {
        let slots = &self.slots;
        self.strings
            .retain_keys(|key| matches!(&slots[key.index()], Some(slot) if slot.marked));

        for index in 0..self.slots.len() {
            let dead = matches!(&self.slots[index], Some(slot) if !slot.marked);
            if dead {
                if let Some(slot) = self.slots[index].take() {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(obj_size(&slot.obj));
                    self.free.push(index as u32);
                }
            } else if let Some(slot) = &mut self.slots[index] {
                slot.marked = false;
            }
        }

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    // ---- Display -------------------------------------------------------

    /// Render a value for `print`, the REPL, and string concatenation.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Bool(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(handle) => match self.get(handle) {
                Obj::String(s) => s.chars.clone(),
                Obj::Function(_) => self.function_label(handle),
                Obj::Closure(closure) => self.function_label(closure.function),
                Obj::Upvalue(_) => "upvalue".to_string(),
                Obj::Class(class) => self.string(class.name).chars.clone(),
                Obj::Instance(instance) => {
                    let class = match self.get(instance.class) {
                        Obj::Class(c) => c,
                        _ => panic!("instance of a non-class"),
                    };
                    format!("{} instance", self.string(class.name).chars)
                }
                Obj::BoundMethod(bound) => match self.get(bound.method) {
                    Obj::Closure(closure) => self.function_label(closure.function),
                    _ => panic!("bound method of a non-closure"),
                },
                Obj::Native(_) => "<native fn>".to_string(),
            },
        }
    }

    fn function_label(&self, function: Handle) -> String {
        match self.get(function) {
            Obj::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.string(name).chars),
                None => "<script>".to_string(),
            },
            _ => panic!("expected function object"),
        }
    }
}

/// Rough byte cost of an object, for the collection threshold.
fn obj_size(obj: &Obj) -> usize {
    let payload = match obj {
        Obj::String(s) => s.chars.len(),
        Obj::Function(f) => {
            f.chunk.code.len()
                + f.chunk.lines.len() * std::mem::size_of::<u32>()
                + f.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        Obj::Closure(c) => c.upvalues.len() * std::mem::size_of::<Handle>(),
        Obj::Upvalue(_) | Obj::Native(_) | Obj::BoundMethod(_) => 0,
        Obj::Class(_) | Obj::Instance(_) => std::mem::size_of::<Table>(),
    };
    std::mem::size_of::<Slot>() + payload
}
