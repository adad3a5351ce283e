//! Assignment sugar: compound operators, prefix/postfix step, ternary

use pretty_assertions::assert_eq;
use rook_runtime::{InterpretResult, Rook};
use rstest::rstest;

fn eval(source: &str) -> Rook {
    let mut rook = Rook::new();
    assert_eq!(rook.interpret(source), InterpretResult::Ok, "script failed");
    rook
}

#[rstest]
#[case("var a = 1; a += 2;", 3.0)]
#[case("var a = 5; a -= 2;", 3.0)]
#[case("var a = 2; a *= 3;", 6.0)]
#[case("var a = 6; a /= 2;", 3.0)]
#[case("var a = 1; ++a;", 2.0)]
#[case("var a = 2; --a;", 1.0)]
#[case("var a = 1; a++;", 2.0)]
#[case("var a = 2; a--;", 1.0)]
fn test_sugar_on_globals(#[case] source: &str, #[case] expected: f64) {
    let rook = eval(source);
    assert_eq!(rook.global_number("a"), Some(expected));
}

#[rstest]
#[case("var a = 1; var r = a++;", 1.0, 2.0)]
#[case("var a = 1; var r = ++a;", 2.0, 2.0)]
#[case("var a = 2; var r = a--;", 2.0, 1.0)]
#[case("var a = 2; var r = --a;", 1.0, 1.0)]
fn test_step_expression_values(
    #[case] source: &str,
    #[case] expected_result: f64,
    #[case] expected_var: f64,
) {
    let rook = eval(source);
    assert_eq!(rook.global_number("r"), Some(expected_result));
    assert_eq!(rook.global_number("a"), Some(expected_var));
}

#[test]
fn test_sugar_on_locals_and_upvalues() {
    let rook = eval(
        "var fromLocal = 0;
         var fromUpvalue = 0;
         {
             var a = 10;
             a += 5;
             a++;
             fromLocal = a;
         }
         fun outer() {
             var n = 1;
             fun bump() { n *= 10; n--; }
             bump();
             return n;
         }
         fromUpvalue = outer();",
    );
    assert_eq!(rook.global_number("fromLocal"), Some(16.0));
    assert_eq!(rook.global_number("fromUpvalue"), Some(9.0));
}

#[test]
fn test_compound_divide_by_zero_is_a_runtime_error() {
    let mut rook = Rook::new();
    assert_eq!(
        rook.interpret("var a = 1; a /= 0;"),
        InterpretResult::RuntimeError
    );
}

#[test]
fn test_compound_assignment_is_right_associative() {
    let rook = eval("var a = 1; var b = 2; a += b = 5;");
    assert_eq!(rook.global_number("b"), Some(5.0));
    assert_eq!(rook.global_number("a"), Some(6.0));
}

#[rstest]
#[case("var v = true ? 1 : 2;", 1.0)]
#[case("var v = false ? 1 : 2;", 2.0)]
#[case("var v = true ? (false ? 1 : 2) : 3;", 2.0)]
#[case("var v = false ? 1 : false ? 2 : 3;", 3.0)]
#[case("var v = 1 < 2 ? 10 + 1 : 20 + 2;", 11.0)]
fn test_ternary(#[case] source: &str, #[case] expected: f64) {
    let rook = eval(source);
    assert_eq!(rook.global_number("v"), Some(expected));
}
