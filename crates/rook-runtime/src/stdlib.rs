//! Built-in native functions
//!
//! The standard library is tiny: a clock, string length, and string
//! indexing. Natives receive the heap and their argument window; a misused
//! built-in answers nil rather than raising.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::heap::Heap;
use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;

/// Register the built-ins on a fresh VM.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", clock);
    vm.define_native("len", len);
    vm.define_native("strAt", str_at);
}

/// `clock()`: seconds since the Unix epoch, as a number.
fn clock(_heap: &mut Heap, _args: &[Value]) -> Value {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => Value::Number(elapsed.as_secs_f64()),
        Err(_) => Value::Number(0.0),
    }
}

/// `len(s)`: number of characters in a string.
fn len(heap: &mut Heap, args: &[Value]) -> Value {
    match args.first().and_then(|value| value.as_obj()) {
        Some(handle) => match heap.get(handle) {
            Obj::String(s) => Value::Number(s.chars.chars().count() as f64),
            _ => Value::Nil,
        },
        None => Value::Nil,
    }
}

/// `strAt(s, i)`: the one-character string at index `i`, nil out of range.
fn str_at(heap: &mut Heap, args: &[Value]) -> Value {
    let (string, index) = match (args.first(), args.get(1)) {
        (Some(&Value::Obj(handle)), Some(&Value::Number(index))) => (handle, index),
        _ => return Value::Nil,
    };
    if index < 0.0 || index.fract() != 0.0 {
        return Value::Nil;
    }
    let picked = match heap.get(string) {
        Obj::String(s) => s.chars.chars().nth(index as usize),
        _ => return Value::Nil,
    };
    match picked {
        Some(ch) => {
            let text = ch.to_string();
            Value::Obj(heap.intern(&text))
        }
        None => Value::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_len_of_string() {
        let mut heap = Heap::default();
        let s = Value::Obj(heap.intern("hello"));
        assert_eq!(len(&mut heap, &[s]), Value::Number(5.0));
    }

    #[test]
    fn test_len_of_non_string_is_nil() {
        let mut heap = Heap::default();
        assert_eq!(len(&mut heap, &[Value::Number(3.0)]), Value::Nil);
        assert_eq!(len(&mut heap, &[]), Value::Nil);
    }

    #[test]
    fn test_str_at_picks_characters() {
        let mut heap = Heap::default();
        let s = Value::Obj(heap.intern("abc"));
        let picked = str_at(&mut heap, &[s, Value::Number(1.0)]);
        match picked {
            Value::Obj(handle) => assert_eq!(heap.string(handle).chars, "b"),
            other => panic!("expected string, found {:?}", other),
        }
    }

    #[test]
    fn test_str_at_out_of_range_is_nil() {
        let mut heap = Heap::default();
        let s = Value::Obj(heap.intern("abc"));
        assert_eq!(str_at(&mut heap, &[s, Value::Number(3.0)]), Value::Nil);
        assert_eq!(str_at(&mut heap, &[s, Value::Number(-1.0)]), Value::Nil);
        assert_eq!(str_at(&mut heap, &[s, Value::Number(0.5)]), Value::Nil);
    }

    #[test]
    fn test_clock_is_positive() {
        let mut heap = Heap::default();
        match clock(&mut heap, &[]) {
            Value::Number(n) => assert!(n > 0.0),
            other => panic!("expected number, found {:?}", other),
        }
    }
}
