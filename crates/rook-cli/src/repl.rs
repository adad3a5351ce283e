//! Interactive line-at-a-time REPL
//!
//! Each line is a full program interpreted on the shared engine, so
//! declarations persist between lines. After a successful line the
//! retained last-expression value (if any) is echoed.

use anyhow::{Context, Result};
use rook_runtime::{InterpretResult, Rook};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub fn run(rook: &mut Rook) -> Result<()> {
    println!("rook {}", rook_runtime::VERSION);
    let mut editor = DefaultEditor::new().context("failed to initialize line editor")?;

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                match rook.interpret(&line) {
                    InterpretResult::Ok => {
                        if let Some(text) = rook.last_display() {
                            println!("{}", text);
                        }
                    }
                    InterpretResult::CompileError => {
                        for diagnostic in rook.diagnostics() {
                            eprintln!("{}", diagnostic);
                        }
                    }
                    InterpretResult::RuntimeError => {
                        if let Some(error) = rook.runtime_error() {
                            eprintln!("{}", error);
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => return Err(error).context("failed to read line"),
        }
    }
    Ok(())
}
