//! End-to-end tests for the `rook` binary: exit codes and output

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn rook() -> Command {
    Command::cargo_bin("rook").expect("rook binary")
}

fn script(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    write!(file, "{}", contents).expect("write script");
    file
}

#[test]
fn test_print_script_succeeds() {
    let file = script("print 1 + 2;\nprint \"done\";\n");
    rook()
        .arg(file.path())
        .assert()
        .success()
        .stdout("3\ndone\n");
}

#[test]
fn test_compile_error_exits_65() {
    let file = script("var = 3;\n");
    rook()
        .arg(file.path())
        .assert()
        .code(65)
        .stderr(predicate::str::contains("[line 1] Error"));
}

#[test]
fn test_runtime_error_exits_70() {
    let file = script("var a = 1 / 0;\n");
    rook()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(predicate::str::contains("Division by zero."));
}

#[test]
fn test_missing_file_exits_74() {
    rook()
        .arg("no-such-script.rk")
        .assert()
        .code(74)
        .stderr(predicate::str::contains("could not open file"));
}

#[test]
fn test_extra_arguments_exit_64() {
    rook().args(["a.rk", "b.rk"]).assert().code(64);
}

#[test]
fn test_json_diagnostics() {
    let file = script("var = 3;\n");
    rook()
        .arg("--json")
        .arg(file.path())
        .assert()
        .code(65)
        .stdout(predicate::str::contains("\"level\":\"error\""));
}

#[test]
fn test_disasm_flag_prints_listing() {
    let file = script("print 1;\n");
    rook()
        .arg("--disasm")
        .arg(file.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("== <script> =="));
}

#[test]
fn test_classes_end_to_end() {
    let file = script(
        "class A { method() { return 10; } }\n\
         class B < A { method() { return super.method() + 5; } }\n\
         print B().method();\n",
    );
    rook().arg(file.path()).assert().success().stdout("15\n");
}
