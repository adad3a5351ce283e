//! Control flow semantics: loops, break/continue, switch

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
fn test_if_else() {
    let rook = eval(
        "var a = 0;
         if (1 < 2) { a = 1; } else { a = 2; }
         var b = 0;
         if (1 > 2) { b = 1; } else { b = 2; }",
    );
    assert_eq!(number(&rook, "a"), 1.0);
    assert_eq!(number(&rook, "b"), 2.0);
}

#[test]
fn test_logical_operators_short_circuit() {
    let rook = eval(
        "var calls = 0;
         fun bump() { calls = calls + 1; return true; }
         var a = false and bump();
         var b = true or bump();
         var c = true and bump();",
    );
    assert_eq!(number(&rook, "calls"), 1.0);
    assert_eq!(rook.global_bool("a"), Some(false));
    assert_eq!(rook.global_bool("b"), Some(true));
    assert_eq!(rook.global_bool("c"), Some(true));
}

#[test]
fn test_while_loop() {
    let rook = eval(
        "var sum = 0;
         var i = 0;
         while (i < 5) {
             sum = sum + i;
             i = i + 1;
         }",
    );
    assert_eq!(number(&rook, "sum"), 10.0);
}

#[test]
fn test_for_loop_with_increment() {
    let rook = eval(
        "var sum = 0;
         for (var i = 1; i <= 4; i = i + 1) {
             sum = sum + i;
         }",
    );
    assert_eq!(number(&rook, "sum"), 10.0);
}

#[test]
fn test_nested_loops_break() {
    // Inner loop runs once per outer iteration before breaking.
    let rook = eval(
        "var result = 0;
         var i = 0;
         while (i < 3) {
             var j = 0;
             while (j < 3) {
                 if (j == 1) {
                     j = j + 1;
                     break;
                 }
                 result = result + 1;
                 j = j + 1;
             }
             i = i + 1;
         }",
    );
    assert_eq!(number(&rook, "result"), 3.0);
}

#[test]
fn test_nested_loops_continue() {
    // The inner loop skips exactly one of its three iterations.
    let rook = eval(
        "var result = 0;
         var i = 0;
         while (i < 3) {
             i = i + 1;
             var j = 0;
             while (j < 3) {
                 j = j + 1;
                 if (j == 2) continue;
                 result = result + 1;
             }
         }",
    );
    assert_eq!(number(&rook, "result"), 6.0);
}

#[test]
fn test_continue_in_for_targets_increment() {
    // Without the increment as the continue target this never terminates.
    let rook = eval(
        "var sum = 0;
         for (var i = 0; i < 5; i = i + 1) {
             if (i == 2) continue;
             sum = sum + i;
         }",
    );
    assert_eq!(number(&rook, "sum"), 8.0);
}

#[test]
fn test_switch_selects_matching_case() {
    let rook = eval(
        "var out = 0;
         switch (2) {
             case 1: out = 10;
             case 2: out = 20;
             case 3: out = 30;
         }",
    );
    assert_eq!(number(&rook, "out"), 20.0);
}

#[test]
fn test_switch_has_no_fallthrough() {
    let rook = eval(
        "var out = 0;
         switch (1) {
             case 1: out = out + 1;
             case 2: out = out + 10;
             default: out = out + 100;
         }",
    );
    assert_eq!(number(&rook, "out"), 1.0);
}

#[test]
fn test_switch_default() {
    let rook = eval(
        "var out = 0;
         switch (99) {
             case 1: out = 1;
             default: out = 42;
         }",
    );
    assert_eq!(number(&rook, "out"), 42.0);
}

#[test]
fn test_switch_on_strings() {
    let rook = eval(
        "var out = 0;
         switch (\"b\") {
             case \"a\": out = 1;
             case \"b\": out = 2;
         }",
    );
    assert_eq!(number(&rook, "out"), 2.0);
}

#[test]
fn test_switch_nested_in_for() {
    // i=0: case 0 adds 1, break leaves the switch.
    // i=1: case 1 adds 10, continue targets the loop increment.
    // i=2: default adds 100.
    let rook = eval(
        "var res = 0;
         for (var i = 0; i < 3; i = i + 1) {
             switch (i) {
                 case 0:
                     res = res + 1;
                     break;
                 case 1:
                     res = res + 10;
                     continue;
                 default:
                     res = res + 100;
             }
         }",
    );
    assert_eq!(number(&rook, "res"), 111.0);
}

#[test]
fn test_break_pops_block_locals() {
    // The local declared inside the loop body must be gone when the loop
    // exits through break; `probe` would otherwise read garbage.
    let rook = eval(
        "var probe = 0;
         var i = 0;
         while (i < 10) {
             var inner = 99;
             if (i == 2) { break; }
             i = i + inner / 99;
         }
         probe = i;",
    );
    assert_eq!(number(&rook, "probe"), 2.0);
}

#[test]
fn test_ternary_condition() {
    let rook = eval(
        "var a = true ? 1 : 2;
         var b = false ? 1 : 2;
         var c = true ? (false ? 1 : 2) : 3;",
    );
    assert_eq!(number(&rook, "a"), 1.0);
    assert_eq!(number(&rook, "b"), 2.0);
    assert_eq!(number(&rook, "c"), 2.0);
}
