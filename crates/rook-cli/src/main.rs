//! The `rook` executable: script runner and interactive REPL

mod repl;

use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use rook_runtime::{EngineConfig, InterpretResult, Rook};

// sysexits-style codes
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "rook", version, about = "The Rook scripting language")]
struct Cli {
    /// Script to run; starts the REPL when omitted
    script: Option<PathBuf>,

    /// Disassemble each function after compilation
    #[arg(long)]
    disasm: bool,

    /// Print each instruction and the stack while executing
    #[arg(long)]
    trace: bool,

    /// Emit diagnostics as JSON, one object per line
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = match error.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = error.print();
            std::process::exit(code);
        }
    };

    let config = EngineConfig::new()
        .with_print_code(cli.disasm)
        .with_trace_execution(cli.trace);
    let mut rook = Rook::with_config(config);

    match cli.script {
        Some(path) => {
            let code = run_file(&mut rook, &path, cli.json);
            std::process::exit(code);
        }
        None => {
            if let Err(error) = repl::run(&mut rook) {
                eprintln!("{}: {:#}", "error".red().bold(), error);
                std::process::exit(EX_IOERR);
            }
        }
    }
}

fn run_file(rook: &mut Rook, path: &Path, json: bool) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!(
                "{}: could not open file \"{}\": {}",
                "error".red().bold(),
                path.display(),
                error
            );
            return EX_IOERR;
        }
    };

    match rook.interpret(&source) {
        InterpretResult::Ok => 0,
        InterpretResult::CompileError => {
            print_diagnostics(rook, json);
            EX_DATAERR
        }
        InterpretResult::RuntimeError => {
            if let Some(error) = rook.runtime_error() {
                eprintln!("{}", error);
            }
            EX_SOFTWARE
        }
    }
}

fn print_diagnostics(rook: &Rook, json: bool) {
    for diagnostic in rook.diagnostics() {
        if json {
            match diagnostic.to_json_string() {
                Ok(line) => println!("{}", line),
                Err(_) => eprintln!("{}", diagnostic),
            }
        } else {
            eprintln!("{}", diagnostic);
        }
    }
}
