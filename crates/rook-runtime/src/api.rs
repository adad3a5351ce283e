//! Host-facing embedding surface
//!
//! [`Rook`] bundles a VM with the compile-and-run pipeline: feed it source,
//! read globals back out, push values in, and register native callbacks.
//! One engine owns one heap; scripts interpreted on the same engine share
//! globals and interned strings.

use crate::compiler;
use crate::diagnostic::Diagnostic;
use crate::heap::DEFAULT_GC_THRESHOLD;
use crate::object::NativeFn;
use crate::stdlib;
use crate::value::Value;
use crate::vm::{RuntimeError, Vm};

/// Outcome of one `interpret` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Engine tunables
///
/// # Examples
///
/// ```
/// use rook_runtime::api::EngineConfig;
///
/// let config = EngineConfig::new()
///     .with_print_code(true)
///     .with_gc_stress(true);
/// assert!(config.print_code);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Print each instruction and the stack while executing
    pub trace_execution: bool,
    /// Disassemble every function as it finishes compiling
    pub print_code: bool,
    /// Collect at every allocation safe point (for shaking out GC bugs)
    pub gc_stress: bool,
    /// First collection threshold in bytes
    pub gc_threshold: usize,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            trace_execution: false,
            print_code: false,
            gc_stress: false,
            gc_threshold: DEFAULT_GC_THRESHOLD,
        }
    }

    pub fn with_trace_execution(mut self, on: bool) -> Self {
        self.trace_execution = on;
        self
    }

    pub fn with_print_code(mut self, on: bool) -> Self {
        self.print_code = on;
        self
    }

    pub fn with_gc_stress(mut self, on: bool) -> Self {
        self.gc_stress = on;
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = bytes;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// An embedded Rook engine
pub struct Rook {
    vm: Vm,
    print_code: bool,
    /// Mirrors the VM's rooted copy of the retained last-expression value
    last_value: Option<Value>,
    diagnostics: Vec<Diagnostic>,
    runtime_error: Option<RuntimeError>,
}

impl Rook {
    /// A fresh engine with the built-in library installed.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut vm = Vm::new(
            config.gc_stress,
            config.gc_threshold,
            config.trace_execution,
        );
        stdlib::install(&mut vm);
        Self {
            vm,
            print_code: config.print_code,
            last_value: None,
            diagnostics: Vec::new(),
            runtime_error: None,
        }
    }

    /// Compile and run a source string.
    ///
    /// On a compile error the VM is never entered and [`Rook::diagnostics`]
    /// holds every collected diagnostic. On a runtime error the stack is
    /// unwound, [`Rook::runtime_error`] holds the failure, and the engine
    /// stays usable. On success the value of a trailing top-level
    /// expression statement (if any) is retained, and kept rooted, for the
    /// `last_*` accessors.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        self.diagnostics.clear();
        self.runtime_error = None;

        let script = match compiler::compile(source, &mut self.vm.heap, self.print_code) {
            Ok(handle) => handle,
            Err(diagnostics) => {
                self.diagnostics = diagnostics;
                return InterpretResult::CompileError;
            }
        };

        match self.vm.interpret(script) {
            Ok(value) => {
                self.last_value = match value {
                    Value::Nil => None,
                    other => Some(other),
                };
                InterpretResult::Ok
            }
            Err(error) => {
                self.runtime_error = Some(error);
                InterpretResult::RuntimeError
            }
        }
    }

    /// The retained last-expression value as a number; `None` for
    /// declaration-only programs and non-number results.
    pub fn last_number(&self) -> Option<f64> {
        self.last_value?.as_number()
    }

    /// The retained last-expression value as a boolean.
    pub fn last_bool(&self) -> Option<bool> {
        match self.last_value? {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// The retained last-expression value rendered the way `print` would
    /// show it; `None` for declaration-only programs.
    ///
    /// Results come back as owned data, never as raw object handles: the
    /// VM keeps the current result rooted, and the host only ever sees a
    /// copy it can hold for as long as it likes.
    pub fn last_display(&self) -> Option<String> {
        Some(self.vm.heap.format_value(self.last_value?))
    }

    /// Compile diagnostics of the most recent interpret.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Runtime failure of the most recent interpret, if any.
    pub fn runtime_error(&self) -> Option<&RuntimeError> {
        self.runtime_error.as_ref()
    }

    /// Read a global as a number.
    pub fn global_number(&self, name: &str) -> Option<f64> {
        self.vm.get_global(name)?.as_number()
    }

    /// Read a global as a boolean.
    pub fn global_bool(&self, name: &str) -> Option<bool> {
        match self.vm.get_global(name)? {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Define or overwrite a global.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.vm.define_global(name, value);
    }

    /// Create an interned string value. The string is pinned for the
    /// engine's lifetime, so the returned value stays safe to hold across
    /// later interprets and collections.
    pub fn create_string(&mut self, text: &str) -> Value {
        self.vm.create_string(text)
    }

    /// Register a native callback under a global name.
    pub fn register_native(&mut self, name: &str, function: NativeFn) {
        self.vm.define_native(name, function);
    }
}

impl Default for Rook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interpret_ok() {
        let mut rook = Rook::new();
        assert_eq!(rook.interpret("var x = 1 + 2;"), InterpretResult::Ok);
        assert_eq!(rook.global_number("x"), Some(3.0));
    }

    #[test]
    fn test_compile_error_reports_diagnostics() {
        let mut rook = Rook::new();
        assert_eq!(rook.interpret("var = 3;"), InterpretResult::CompileError);
        assert!(!rook.diagnostics().is_empty());
        assert!(rook.runtime_error().is_none());
    }

    #[test]
    fn test_runtime_error_keeps_engine_usable() {
        let mut rook = Rook::new();
        assert_eq!(rook.interpret("1 / 0;"), InterpretResult::RuntimeError);
        assert!(rook.runtime_error().is_some());
        assert_eq!(rook.interpret("var ok = true;"), InterpretResult::Ok);
        assert_eq!(rook.global_bool("ok"), Some(true));
    }

    #[test]
    fn test_last_value_retained_for_trailing_expression() {
        let mut rook = Rook::new();
        rook.interpret("1 + 2;");
        assert_eq!(rook.last_number(), Some(3.0));
        // Declaration-only programs leave nothing behind.
        rook.interpret("var x = 9;");
        assert_eq!(rook.last_number(), None);
        assert_eq!(rook.last_display(), None);
    }

    #[test]
    fn test_last_bool() {
        let mut rook = Rook::new();
        rook.interpret("1 < 2;");
        assert_eq!(rook.last_bool(), Some(true));
        assert_eq!(rook.last_number(), None);
    }

    #[test]
    fn test_retained_value_stays_rooted_across_collections() {
        let mut rook = Rook::with_config(EngineConfig::new().with_gc_stress(true));
        rook.interpret("\"keep\" + \"me\";");
        // The next interpret allocates (collecting at every safe point)
        // and then fails; the previous result must still be readable.
        assert_eq!(
            rook.interpret("var s = \"x\" + \"y\"; 1 / 0;"),
            InterpretResult::RuntimeError
        );
        assert_eq!(rook.last_display().as_deref(), Some("keepme"));
    }

    #[test]
    fn test_created_string_survives_interpret_between_uses() {
        let mut rook = Rook::with_config(EngineConfig::new().with_gc_stress(true));
        let s = rook.create_string("pinned");
        // Nothing in the program refers to the string yet; collections
        // during this interpret must not reclaim it.
        rook.interpret("var t = \"a\" + \"b\";");
        rook.set_global("s", s);
        rook.interpret("var n = len(s);");
        assert_eq!(rook.global_number("n"), Some(6.0));
    }

    #[test]
    fn test_globals_persist_across_interprets() {
        let mut rook = Rook::new();
        rook.interpret("var count = 1;");
        rook.interpret("count = count + 1;");
        assert_eq!(rook.global_number("count"), Some(2.0));
    }

    #[test]
    fn test_set_global_visible_to_scripts() {
        let mut rook = Rook::new();
        rook.set_global("x", Value::Number(42.0));
        rook.interpret("var y = x + 1;");
        assert_eq!(rook.global_number("y"), Some(43.0));
    }

    #[test]
    fn test_create_string_and_len() {
        let mut rook = Rook::new();
        let s = rook.create_string("hello");
        rook.set_global("s", s);
        rook.interpret("var n = len(s);");
        assert_eq!(rook.global_number("n"), Some(5.0));
    }

    #[test]
    fn test_register_native() {
        let mut rook = Rook::new();
        rook.register_native("inc", |_, args| match args.first() {
            Some(Value::Number(n)) => Value::Number(n + 1.0),
            _ => Value::Nil,
        });
        rook.set_global("x", Value::Number(42.0));
        rook.interpret("var y = inc(x);");
        assert_eq!(rook.global_number("y"), Some(43.0));
    }

    #[test]
    fn test_last_display_matches_print_formatting() {
        let mut rook = Rook::new();
        rook.interpret("15.8;");
        assert_eq!(rook.last_display().as_deref(), Some("15.8"));
        rook.interpret("\"n=\" + 5;");
        assert_eq!(rook.last_display().as_deref(), Some("n=5"));
    }
}
