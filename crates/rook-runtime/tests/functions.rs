//! Functions, calls, recursion, and the arithmetic scenario suite

use pretty_assertions::assert_eq;
use rook_runtime::{InterpretResult, Rook};

fn eval(source: &str) -> Rook {
    let mut rook = Rook::new();
    assert_eq!(rook.interpret(source), InterpretResult::Ok, "script failed");
    rook
}

fn number(rook: &Rook, name: &str) -> f64 {
    rook.global_number(name)
        .unwrap_or_else(|| panic!("global '{}' is not a number", name))
}

#[test]
fn test_unary_and_binary_arithmetic() {
    let rook = eval("var r = -1.2 + 3.4 * 5;");
    assert!((number(&rook, "r") - 15.8).abs() < 1e-9);
}

#[test]
fn test_grouping_changes_precedence() {
    let rook = eval("var a = 2 + 3 * 4; var b = (2 + 3) * 4;");
    assert_eq!(number(&rook, "a"), 14.0);
    assert_eq!(number(&rook, "b"), 20.0);
}

#[test]
fn test_function_declaration_and_call() {
    let rook = eval(
        "fun add(a, b) { return a + b; }
         var r = add(40, 2);",
    );
    assert_eq!(number(&rook, "r"), 42.0);
}

#[test]
fn test_function_without_return_yields_nil() {
    let rook = eval(
        "fun noop() {}
         var isNil = noop() == nil;",
    );
    assert_eq!(rook.global_bool("isNil"), Some(true));
}

#[test]
fn test_recursion() {
    let rook = eval(
        "fun fib(n) {
             if (n < 2) return n;
             return fib(n - 1) + fib(n - 2);
         }
         var r = fib(12);",
    );
    assert_eq!(number(&rook, "r"), 144.0);
}

#[test]
fn test_functions_are_first_class() {
    let rook = eval(
        "fun twice(f, x) { return f(f(x)); }
         fun inc(n) { return n + 1; }
         var r = twice(inc, 40);",
    );
    assert_eq!(number(&rook, "r"), 42.0);
}

#[test]
fn test_shadowing_in_blocks() {
    let rook = eval(
        "var x = 1;
         var inner = 0;
         {
             var x = 2;
             inner = x;
         }
         var outer = x;",
    );
    assert_eq!(number(&rook, "inner"), 2.0);
    assert_eq!(number(&rook, "outer"), 1.0);
}

#[test]
fn test_global_redefinition_is_allowed() {
    let rook = eval("var x = 1; var x = 2;");
    assert_eq!(number(&rook, "x"), 2.0);
}

#[test]
fn test_clock_native_advances() {
    let rook = eval("var t = clock();");
    assert!(number(&rook, "t") > 0.0);
}

#[test]
fn test_not_operator() {
    let rook = eval(
        "var a = !true;
         var b = !nil;
         var c = !0;",
    );
    assert_eq!(rook.global_bool("a"), Some(false));
    assert_eq!(rook.global_bool("b"), Some(true));
    // 0 is truthy; only nil and false are falsey.
    assert_eq!(rook.global_bool("c"), Some(false));
}

#[test]
fn test_comparison_chain_results() {
    let rook = eval(
        "var a = 1 <= 1;
         var b = 2 >= 3;
         var c = 1 != 2;",
    );
    assert_eq!(rook.global_bool("a"), Some(true));
    assert_eq!(rook.global_bool("b"), Some(false));
    assert_eq!(rook.global_bool("c"), Some(true));
}
