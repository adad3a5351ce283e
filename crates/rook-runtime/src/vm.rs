//! Stack-based virtual machine
//!
//! Executes bytecode with a value stack, a call frame array, and an
//! intrusive list of open upvalues ordered by descending stack slot. The
//! VM owns the heap; collection happens only at its allocation safe points,
//! where every live object is reachable from the stack, the globals, the
//! frames, the open upvalue list, or the host pins (the retained result
//! and host-created strings).
//!
//! Runtime errors unwind every frame, reset the stack, and surface as
//! [`RuntimeError`]; the VM remains usable afterwards.

use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use crate::bytecode::{disassemble_instruction, Chunk, OpCode};
use crate::heap::{Handle, Heap};
use crate::object::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjUpvalue, UpvalueLocation,
};
use crate::table::Table;
use crate::value::Value;

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;
/// Fixed value stack ceiling
pub const STACK_MAX: usize = 16 * 1024;

/// What went wrong at runtime
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeErrorKind {
    #[error("Operands must be numbers.")]
    NumberOperands,
    #[error("Operand must be a number.")]
    NumberOperand,
    #[error("Operands must be numbers or strings.")]
    AddOperands,
    #[error("Division by zero.")]
    DivisionByZero,
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Can only call functions and classes.")]
    NotCallable,
    #[error("Expected {expected} arguments but got {got}.")]
    Arity { expected: u8, got: u8 },
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Only instances have properties.")]
    NoProperties,
    #[error("Only instances have fields.")]
    NoFields,
    #[error("Only instances have methods.")]
    NoMethods,
    #[error("Superclass must be a class.")]
    SuperclassNotClass,
    #[error("Right operand of 'instanceof' must be a class.")]
    InstanceofOperand,
    #[error("Unknown opcode {0:#04x}.")]
    UnknownOpcode(u8),
}

/// A runtime failure with its source line and call trace
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    /// Line of the faulting instruction
    pub line: u32,
    /// One entry per unwound frame, innermost first: `[line N] in f()`
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for entry in &self.trace {
            write!(f, "\n{}", entry)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// One record in the call stack. The chunk rides along behind its `Rc` so
/// the dispatch loop never borrows the heap just to fetch bytes.
struct CallFrame {
    closure: Handle,
    chunk: Rc<Chunk>,
    ip: usize,
    base: usize,
}

/// Virtual machine state
pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Head of the open-upvalue list, descending by stack slot
    open_upvalues: Option<Handle>,
    /// Canonical "init" string, pinned as a GC root
    init_string: Handle,
    /// Result of the most recent successful interpret, rooted so the host
    /// can still read it after later collections
    last_value: Value,
    /// Strings created through the embedding surface, pinned for the
    /// engine's lifetime
    host_strings: Vec<Handle>,
    /// Print each instruction and the stack while executing
    trace_execution: bool,
}

impl Vm {
    pub fn new(gc_stress: bool, gc_threshold: usize, trace_execution: bool) -> Self {
        let mut heap = Heap::new(gc_stress, gc_threshold);
        let init_string = heap.intern("init");
        Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            last_value: Value::Nil,
            host_strings: Vec::new(),
            trace_execution,
        }
    }

    /// Run a compiled script function to completion.
    ///
    /// Returns the script's result value: the value of a trailing
    /// top-level expression statement, nil otherwise. The result is also
    /// retained as a GC root until the next successful interpret replaces
    /// it, so the host can read it back after later collections.
    pub fn interpret(&mut self, script: Handle) -> Result<Value, RuntimeError> {
        let closure = self.heap.alloc(Obj::Closure(ObjClosure {
            function: script,
            upvalues: Vec::new(),
        }));
        self.push(Value::Obj(closure))?;
        self.call_closure(closure, 0)?;
        self.run()?;
        let result = self.stack.pop().unwrap_or(Value::Nil);
        self.last_value = result;
        Ok(result)
    }

    /// The retained result of the most recent successful interpret.
    pub fn last_value(&self) -> Value {
        self.last_value
    }

    /// Define or overwrite a global from the host.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let handle = self.heap.intern(name);
        let hash = self.heap.string(handle).hash;
        self.globals.set(handle, hash, value);
    }

    /// Read a global from the host. Never allocates: an un-interned name
    /// cannot name a global.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let handle = self.heap.find_interned(name)?;
        let hash = self.heap.string(handle).hash;
        self.globals.get(handle, hash)
    }

    /// Register a native callback under a global name.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let native = self.heap.alloc(Obj::Native(crate::object::ObjNative { function }));
        self.define_global(name, Value::Obj(native));
    }

    /// Create an interned string for the host. The handle is pinned for
    /// the engine's lifetime, so the returned value never dangles even if
    /// nothing in the program refers to it.
    pub fn create_string(&mut self, text: &str) -> Value {
        let handle = self.heap.intern(text);
        if !self.host_strings.contains(&handle) {
            self.host_strings.push(handle);
        }
        Value::Obj(handle)
    }

    // ---- Dispatch -------------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace_execution {
                self.trace();
            }

            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(bad) => return Err(self.error(RuntimeErrorKind::UnknownOpcode(bad))),
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let value = self.stack[base + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value)?,
                        None => {
                            let text = self.heap.string(name).chars.clone();
                            return Err(self.error(RuntimeErrorKind::UndefinedVariable(text)));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment cannot create a global; roll back.
                        self.globals.delete(name, hash);
                        let text = self.heap.string(name).chars.clone();
                        return Err(self.error(RuntimeErrorKind::UndefinedVariable(text)));
                    }
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.closure_upvalue(slot);
                    let value = match self.upvalue_location(upvalue) {
                        UpvalueLocation::Open(index) => self.stack[index],
                        UpvalueLocation::Closed(value) => value,
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = self.closure_upvalue(slot);
                    match self.upvalue_location(upvalue) {
                        UpvalueLocation::Open(index) => self.stack[index] = value,
                        UpvalueLocation::Closed(_) => {
                            if let Obj::Upvalue(u) = self.heap.get_mut(upvalue) {
                                u.location = UpvalueLocation::Closed(value);
                            }
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance = self.as_instance(receiver);
                    let instance = match instance {
                        Some(handle) => handle,
                        None => return Err(self.error(RuntimeErrorKind::NoProperties)),
                    };
                    let hash = self.heap.string(name).hash;
                    let (class, field) = match self.heap.get(instance) {
                        Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
                        _ => unreachable!("instance check above"),
                    };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value)?;
                        }
                        None => self.bind_method(class, name)?,
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let target = self.peek(1);
                    let instance = match self.as_instance(target) {
                        Some(handle) => handle,
                        None => return Err(self.error(RuntimeErrorKind::NoFields)),
                    };
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    if let Obj::Instance(i) = self.heap.get_mut(instance) {
                        i.fields.set(name, hash, value);
                    }
                    let value = self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = match self.pop().as_obj() {
                        Some(handle) if matches!(self.heap.get(handle), Obj::Class(_)) => handle,
                        _ => return Err(self.error(RuntimeErrorKind::SuperclassNotClass)),
                    };
                    self.bind_method(superclass, name)?;
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Greater => self.comparison_op(|a, b| a > b)?,
                OpCode::Less => self.comparison_op(|a, b| a < b)?,

                OpCode::Add => self.add_op()?,
                OpCode::Subtract => self.arithmetic_op(|a, b| a - b, false)?,
                OpCode::Multiply => self.arithmetic_op(|a, b| a * b, false)?,
                OpCode::Divide => self.arithmetic_op(|a, b| a / b, true)?,

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n))?;
                    }
                    None => return Err(self.error(RuntimeErrorKind::NumberOperand)),
                },

                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", self.heap.format_value(value));
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = match self.pop().as_obj() {
                        Some(handle) if matches!(self.heap.get(handle), Obj::Class(_)) => handle,
                        _ => return Err(self.error(RuntimeErrorKind::SuperclassNotClass)),
                    };
                    self.invoke_from_class(superclass, name, argc)?;
                }

                OpCode::Closure => {
                    let function = match self.read_constant() {
                        Value::Obj(handle) => handle,
                        _ => panic!("closure operand must be a function constant"),
                    };
                    let upvalue_count = match self.heap.get(function) {
                        Obj::Function(f) => f.upvalue_count,
                        _ => panic!("closure operand must be a function constant"),
                    };
                    let closure = self.alloc_gc(Obj::Closure(ObjClosure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure))?;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        let captured = if is_local {
                            let base = self.frame().base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.closure_upvalue(index)
                        };
                        if let Obj::Closure(c) = self.heap.get_mut(closure) {
                            c.upvalues.push(captured);
                        }
                    }
                }

                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    self.stack.truncate(base);
                    self.push(result)?;
                    if self.frames.is_empty() {
                        // The script's result stays on the stack for the host.
                        return Ok(());
                    }
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc_gc(Obj::Class(ObjClass {
                        name,
                        methods: Table::new(),
                        superclass: None,
                    }));
                    self.push(Value::Obj(class))?;
                }
                OpCode::Inherit => {
                    let superclass = match self.peek(1).as_obj() {
                        Some(handle) if matches!(self.heap.get(handle), Obj::Class(_)) => handle,
                        _ => return Err(self.error(RuntimeErrorKind::SuperclassNotClass)),
                    };
                    let subclass = match self.peek(0).as_obj() {
                        Some(handle) => handle,
                        None => panic!("inherit target must be a class"),
                    };
                    if let Obj::Class(class) = self.heap.get_mut(subclass) {
                        class.superclass = Some(superclass);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let method = self.peek(0);
                    let class = match self.peek(1).as_obj() {
                        Some(handle) => handle,
                        None => panic!("method target must be a class"),
                    };
                    if let Obj::Class(c) = self.heap.get_mut(class) {
                        c.methods.set(name, hash, method);
                    }
                    self.pop();
                }

                OpCode::InstanceOf => {
                    let class_value = self.pop();
                    let target = self.pop();
                    let class = match class_value.as_obj() {
                        Some(handle) if matches!(self.heap.get(handle), Obj::Class(_)) => handle,
                        _ => return Err(self.error(RuntimeErrorKind::InstanceofOperand)),
                    };
                    let mut current = match target.as_obj() {
                        Some(handle) => match self.heap.get(handle) {
                            Obj::Instance(instance) => Some(instance.class),
                            _ => None,
                        },
                        None => None,
                    };
                    let mut result = false;
                    while let Some(candidate) = current {
                        if candidate == class {
                            result = true;
                            break;
                        }
                        current = match self.heap.get(candidate) {
                            Obj::Class(c) => c.superclass,
                            _ => None,
                        };
                    }
                    self.push(Value::Bool(result))?;
                }
            }
        }
    }

    // ---- Calls ----------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        enum Callee {
            Closure,
            Native(NativeFn),
            Bound(Value, Handle),
            Class,
            NotCallable,
        }

        let handle = match callee.as_obj() {
            Some(handle) => handle,
            None => return Err(self.error(RuntimeErrorKind::NotCallable)),
        };
        let kind = match self.heap.get(handle) {
            Obj::Closure(_) => Callee::Closure,
            Obj::Native(native) => Callee::Native(native.function),
            Obj::BoundMethod(bound) => Callee::Bound(bound.receiver, bound.method),
            Obj::Class(_) => Callee::Class,
            _ => Callee::NotCallable,
        };

        match kind {
            Callee::Closure => self.call_closure(handle, argc),
            Callee::Native(function) => {
                let start = self.stack.len() - argc as usize;
                let result = function(&mut self.heap, &self.stack[start..]);
                self.stack.truncate(start - 1);
                self.push(result)
            }
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Callee::Class => {
                let instance = self.alloc_gc(Obj::Instance(ObjInstance {
                    class: handle,
                    fields: Table::new(),
                }));
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Obj(instance);
                match self.find_method(handle, self.init_string) {
                    Some(initializer) => self.call_closure(initializer, argc),
                    None if argc != 0 => Err(self.error(RuntimeErrorKind::Arity {
                        expected: 0,
                        got: argc,
                    })),
                    None => Ok(()),
                }
            }
            Callee::NotCallable => Err(self.error(RuntimeErrorKind::NotCallable)),
        }
    }

    fn call_closure(&mut self, closure: Handle, argc: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => panic!("call target must be a closure"),
        };
        let (arity, chunk) = match self.heap.get(function) {
            Obj::Function(f) => (f.arity, f.chunk.clone()),
            _ => panic!("closure must wrap a function"),
        };
        if argc != arity {
            return Err(self.error(RuntimeErrorKind::Arity {
                expected: arity,
                got: argc,
            }));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.error(RuntimeErrorKind::StackOverflow));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Fused property-load-and-call: fields can shadow methods with any
    /// callable value, otherwise the class chain resolves the method.
    fn invoke(&mut self, name: Handle, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let instance = match self.as_instance(receiver) {
            Some(handle) => handle,
            None => return Err(self.error(RuntimeErrorKind::NoMethods)),
        };
        let hash = self.heap.string(name).hash;
        let (class, field) = match self.heap.get(instance) {
            Obj::Instance(i) => (i.class, i.fields.get(name, hash)),
            _ => unreachable!("instance check above"),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - argc as usize - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: Handle,
        name: Handle,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        match self.find_method(class, name) {
            Some(method) => self.call_closure(method, argc),
            None => {
                let text = self.heap.string(name).chars.clone();
                Err(self.error(RuntimeErrorKind::UndefinedProperty(text)))
            }
        }
    }

    /// Walk the class chain for a method, nearest class first.
    fn find_method(&self, class: Handle, name: Handle) -> Option<Handle> {
        let hash = self.heap.string(name).hash;
        let mut current = Some(class);
        while let Some(handle) = current {
            let class = match self.heap.get(handle) {
                Obj::Class(c) => c,
                _ => return None,
            };
            if let Some(method) = class.methods.get(name, hash) {
                return method.as_obj();
            }
            current = class.superclass;
        }
        None
    }

    /// Wrap a chain-resolved method around the receiver on top of the stack.
    fn bind_method(&mut self, class: Handle, name: Handle) -> Result<(), RuntimeError> {
        let method = match self.find_method(class, name) {
            Some(method) => method,
            None => {
                let text = self.heap.string(name).chars.clone();
                return Err(self.error(RuntimeErrorKind::UndefinedProperty(text)));
            }
        };
        let receiver = self.peek(0);
        let bound = self.alloc_gc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound))
    }

    // ---- Upvalues -------------------------------------------------------

    /// Capture a stack slot, reusing the existing open upvalue if one
    /// already points there. The list stays sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut prev: Option<Handle> = None;
        let mut current = self.open_upvalues;
        while let Some(handle) = current {
            let (location, next) = match self.heap.get(handle) {
                Obj::Upvalue(u) => (u.location, u.next),
                _ => panic!("open upvalue list holds a non-upvalue"),
            };
            match location {
                UpvalueLocation::Open(index) if index > slot => {
                    prev = Some(handle);
                    current = next;
                }
                UpvalueLocation::Open(index) if index == slot => return handle,
                _ => break,
            }
        }

        let created = self.alloc_gc(Obj::Upvalue(ObjUpvalue {
            location: UpvalueLocation::Open(slot),
            next: current,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev_handle) => {
                if let Obj::Upvalue(u) = self.heap.get_mut(prev_handle) {
                    u.next = Some(created);
                }
            }
        }
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack value
    /// into the upvalue's own cell and unlink it from the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(handle) = self.open_upvalues {
            let (location, next) = match self.heap.get(handle) {
                Obj::Upvalue(u) => (u.location, u.next),
                _ => panic!("open upvalue list holds a non-upvalue"),
            };
            match location {
                UpvalueLocation::Open(index) if index >= last => {
                    let value = self.stack[index];
                    if let Obj::Upvalue(u) = self.heap.get_mut(handle) {
                        u.location = UpvalueLocation::Closed(value);
                        u.next = None;
                    }
                    self.open_upvalues = next;
                }
                _ => break,
            }
        }
    }

    fn closure_upvalue(&self, slot: usize) -> Handle {
        let closure = self.frame().closure;
        match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[slot],
            _ => panic!("frame closure must be a closure"),
        }
    }

    fn upvalue_location(&self, upvalue: Handle) -> UpvalueLocation {
        match self.heap.get(upvalue) {
            Obj::Upvalue(u) => u.location,
            _ => panic!("expected upvalue object"),
        }
    }

    // ---- Arithmetic -----------------------------------------------------

    fn arithmetic_op(
        &mut self,
        op: fn(f64, f64) -> f64,
        is_division: bool,
    ) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.error(RuntimeErrorKind::NumberOperands)),
        };
        if is_division && b == 0.0 {
            return Err(self.error(RuntimeErrorKind::DivisionByZero));
        }
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)))
    }

    fn comparison_op(&mut self, op: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.error(RuntimeErrorKind::NumberOperands)),
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)))
    }

    /// `Add` is overloaded: two numbers add; if either operand is a string,
    /// the other is coerced (numbers print without trailing zeros) and the
    /// operands concatenate into a new interned string.
    fn add_op(&mut self) -> Result<(), RuntimeError> {
        let a = self.peek(1);
        let b = self.peek(0);

        if self.is_string(a) || self.is_string(b) {
            let left = match self.coerce_for_concat(a) {
                Some(text) => text,
                None => return Err(self.error(RuntimeErrorKind::AddOperands)),
            };
            let right = match self.coerce_for_concat(b) {
                Some(text) => text,
                None => return Err(self.error(RuntimeErrorKind::AddOperands)),
            };
            // Operands stay on the stack across the allocation safe point.
            let handle = self.intern_gc(&format!("{}{}", left, right));
            self.pop();
            self.pop();
            return self.push(Value::Obj(handle));
        }

        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b))
            }
            _ => Err(self.error(RuntimeErrorKind::AddOperands)),
        }
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(handle) if matches!(self.heap.get(handle), Obj::String(_)))
    }

    fn coerce_for_concat(&self, value: Value) -> Option<String> {
        match value {
            Value::Number(_) => Some(self.heap.format_value(value)),
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::String(s) => Some(s.chars.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_instance(&self, value: Value) -> Option<Handle> {
        value
            .as_obj()
            .filter(|handle| matches!(self.heap.get(*handle), Obj::Instance(_)))
    }

    // ---- Allocation safe points ----------------------------------------

    fn alloc_gc(&mut self, obj: Obj) -> Handle {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    fn intern_gc(&mut self, text: &str) -> Handle {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    /// Stop-the-world mark-and-sweep. Roots: every stack value, the globals
    /// (keys and values), each frame's closure, the open upvalue list, the
    /// pinned "init" string, the retained last result, and host-created
    /// strings.
    fn collect_garbage(&mut self) {
        for index in 0..self.stack.len() {
            let value = self.stack[index];
            self.heap.mark_value(value);
        }
        self.heap.mark_table_root(&self.globals);
        for index in 0..self.frames.len() {
            let closure = self.frames[index].closure;
            self.heap.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(handle) = upvalue {
            let next = match self.heap.get(handle) {
                Obj::Upvalue(u) => u.next,
                _ => None,
            };
            self.heap.mark_object(handle);
            upvalue = next;
        }
        self.heap.mark_object(self.init_string);
        self.heap.mark_value(self.last_value);
        for index in 0..self.host_strings.len() {
            let handle = self.host_strings[index];
            self.heap.mark_object(handle);
        }

        self.heap.trace_references();
        self.heap.sweep();
    }

    // ---- Errors ---------------------------------------------------------

    /// Build a runtime error from the current frame state, then unwind:
    /// all frames dropped, stack reset, open upvalues abandoned. The VM is
    /// reusable afterwards.
    fn error(&mut self, kind: RuntimeErrorKind) -> RuntimeError {
        let line = self.current_line();
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = match self.heap.get(frame.closure) {
                Obj::Closure(c) => c.function,
                _ => continue,
            };
            let name = match self.heap.get(function) {
                Obj::Function(f) => f.name,
                _ => None,
            };
            let frame_line = frame
                .chunk
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            let label = match name {
                Some(handle) => format!("{}()", self.heap.string(handle).chars),
                None => "script".to_string(),
            };
            trace.push(format!("[line {}] in {}", frame_line, label));
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;

        RuntimeError { kind, line, trace }
    }

    fn current_line(&self) -> u32 {
        match self.frames.last() {
            Some(frame) => frame
                .chunk
                .lines
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or(0),
            None => 0,
        }
    }

    // ---- Frame and stack helpers ---------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("call frame stack")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("call frame stack")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("call frame stack");
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame().chunk.constants[index]
    }

    fn read_string(&mut self) -> Handle {
        match self.read_constant() {
            Value::Obj(handle) => handle,
            _ => panic!("name operand must be a string constant"),
        }
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.error(RuntimeErrorKind::StackOverflow));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn trace(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", self.heap.format_value(*value)));
        }
        eprintln!("{}", line);
        let frame = self.frame();
        let (text, _) = disassemble_instruction(&frame.chunk, frame.ip, &self.heap);
        eprintln!("{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::heap::DEFAULT_GC_THRESHOLD;
    use pretty_assertions::assert_eq;

    fn run_source(source: &str) -> Result<Value, RuntimeError> {
        let mut vm = Vm::new(false, DEFAULT_GC_THRESHOLD, false);
        let script = compiler::compile(source, &mut vm.heap, false).expect("compile failed");
        vm.interpret(script)
    }

    fn run_stressed(source: &str) -> Result<Value, RuntimeError> {
        // Collecting at every allocation safe point shakes out missing roots.
        let mut vm = Vm::new(true, DEFAULT_GC_THRESHOLD, false);
        let script = compiler::compile(source, &mut vm.heap, false).expect("compile failed");
        vm.interpret(script)
    }

    #[test]
    fn test_arithmetic_expression() {
        assert_eq!(run_source("1 + 2 * 3;"), Ok(Value::Number(7.0)));
        assert_eq!(run_source("(1 + 2) * 3;"), Ok(Value::Number(9.0)));
        assert_eq!(run_source("-1.2 + 3.4 * 5;"), Ok(Value::Number(15.8)));
    }

    #[test]
    fn test_comparison_and_equality() {
        assert_eq!(run_source("1 < 2;"), Ok(Value::Bool(true)));
        assert_eq!(run_source("2 <= 1;"), Ok(Value::Bool(false)));
        assert_eq!(run_source("\"a\" == \"a\";"), Ok(Value::Bool(true)));
        assert_eq!(run_source("\"a\" == \"b\";"), Ok(Value::Bool(false)));
        assert_eq!(run_source("nil == false;"), Ok(Value::Bool(false)));
    }

    #[test]
    fn test_division_by_zero_is_a_runtime_error() {
        let err = run_source("1 / 0;").unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_undefined_global() {
        let err = run_source("missing;").unwrap_err();
        assert_eq!(
            err.kind,
            RuntimeErrorKind::UndefinedVariable("missing".to_string())
        );
    }

    #[test]
    fn test_assignment_to_undefined_global() {
        let err = run_source("missing = 1;").unwrap_err();
        assert_eq!(
            err.kind,
            RuntimeErrorKind::UndefinedVariable("missing".to_string())
        );
    }

    #[test]
    fn test_calling_a_non_callable() {
        let err = run_source("var x = 3; x();").unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::NotCallable);
    }

    #[test]
    fn test_arity_mismatch() {
        let err = run_source("fun f(a, b) { return a; } f(1);").unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Arity { expected: 2, got: 1 });
    }

    #[test]
    fn test_frame_overflow_on_runaway_recursion() {
        let err = run_source("fun f() { f(); } f();").unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
        assert!(err.trace.len() > 1);
    }

    #[test]
    fn test_vm_usable_after_runtime_error() {
        let mut vm = Vm::new(false, DEFAULT_GC_THRESHOLD, false);
        let bad = compiler::compile("1 / 0;", &mut vm.heap, false).unwrap();
        assert!(vm.interpret(bad).is_err());
        let good = compiler::compile("40 + 2;", &mut vm.heap, false).unwrap();
        assert_eq!(vm.interpret(good), Ok(Value::Number(42.0)));
    }

    #[test]
    fn test_string_concatenation_coerces_numbers() {
        let mut vm = Vm::new(false, DEFAULT_GC_THRESHOLD, false);
        let script =
            compiler::compile("var s = \"n=\" + 5 + \"!\";", &mut vm.heap, false).unwrap();
        vm.interpret(script).unwrap();
        let value = vm.get_global("s").unwrap();
        assert_eq!(vm.heap.format_value(value), "n=5!");
    }

    #[test]
    fn test_closure_counter_shares_cell() {
        let source = "
            fun counter() {
                var i = 0;
                fun inc() { i = i + 1; return i; }
                return inc;
            }
            var c = counter();
            var c1 = c();
            var c2 = c();
        ";
        let mut vm = Vm::new(false, DEFAULT_GC_THRESHOLD, false);
        let script = compiler::compile(source, &mut vm.heap, false).unwrap();
        vm.interpret(script).unwrap();
        assert_eq!(vm.get_global("c1"), Some(Value::Number(1.0)));
        assert_eq!(vm.get_global("c2"), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_gc_stress_survives_allocation_heavy_program() {
        let source = "
            var s = \"\";
            for (var i = 0; i < 50; i = i + 1) {
                s = s + \"x\";
            }
        ";
        assert!(run_stressed(source).is_ok());
    }

    #[test]
    fn test_gc_reclaims_unreachable_closures() {
        let source = "
            fun spawn() {
                var big = \"payload\";
                fun hold() { return big; }
                return hold;
            }
            for (var i = 0; i < 10; i = i + 1) {
                spawn()();
            }
        ";
        let mut vm = Vm::new(true, DEFAULT_GC_THRESHOLD, false);
        let script = compiler::compile(source, &mut vm.heap, false).unwrap();
        vm.interpret(script).unwrap();
        let live_after_run = vm.heap.live_objects();
        // All the per-iteration closures and upvalues are unreachable; a
        // final collection leaves only globals-reachable objects.
        let before = live_after_run;
        vm.collect_garbage();
        assert!(vm.heap.live_objects() <= before);
    }

    #[test]
    fn test_retained_result_survives_collection() {
        let mut vm = Vm::new(true, DEFAULT_GC_THRESHOLD, false);
        let script = compiler::compile("\"keep\" + \"me\";", &mut vm.heap, false).unwrap();
        let value = vm.interpret(script).unwrap();
        assert_eq!(vm.last_value(), value);
        vm.collect_garbage();
        match value {
            Value::Obj(handle) => assert_eq!(vm.heap.string(handle).chars, "keepme"),
            other => panic!("expected string result, found {:?}", other),
        }
    }

    #[test]
    fn test_host_created_string_survives_collection() {
        let mut vm = Vm::new(true, DEFAULT_GC_THRESHOLD, false);
        let value = vm.create_string("host");
        vm.collect_garbage();
        match value {
            Value::Obj(handle) => assert_eq!(vm.heap.string(handle).chars, "host"),
            other => panic!("expected string value, found {:?}", other),
        }
    }

    #[test]
    fn test_native_function_dispatch() {
        let mut vm = Vm::new(false, DEFAULT_GC_THRESHOLD, false);
        vm.define_native("double", |_, args| match args.first() {
            Some(Value::Number(n)) => Value::Number(n * 2.0),
            _ => Value::Nil,
        });
        let script = compiler::compile("double(21);", &mut vm.heap, false).unwrap();
        assert_eq!(vm.interpret(script), Ok(Value::Number(42.0)));
    }

    #[test]
    fn test_host_globals_round_trip() {
        let mut vm = Vm::new(false, DEFAULT_GC_THRESHOLD, false);
        vm.define_global("x", Value::Number(42.0));
        let script = compiler::compile("var y = x + 1;", &mut vm.heap, false).unwrap();
        vm.interpret(script).unwrap();
        assert_eq!(vm.get_global("y"), Some(Value::Number(43.0)));
        assert_eq!(vm.get_global("nope"), None);
    }
}
