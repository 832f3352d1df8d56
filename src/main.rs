// Command-line entry point (§6, external collaborator). Compiles and runs a
// source file, or drops into a REPL when given none; exit codes follow the
// original source's convention exactly (0 success, 64 usage, 65 compile
// error, 70 runtime error, 74 I/O error).

mod chunk;
mod compiler;
mod errors;
mod gc;
mod native;
mod object;
mod repl;
mod scanner;
mod table;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use vm::{InterpretResult, Vm};

#[derive(ClapParser)]
#[command(
    name = "ruff",
    about = "Ruff: a small dynamically-typed, class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Print each executed instruction before it runs.
    #[arg(long, global = true)]
    trace_exec: bool,

    /// Run a full collection before every allocation.
    #[arg(long, global = true)]
    stress_gc: bool,

    /// Log heap size before/after every collection.
    #[arg(long, global = true)]
    log_gc: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a source file.
    Run {
        file: PathBuf,

        /// Arguments passed to the script, retrievable via `__argv`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        script_args: Vec<String>,
    },
    /// Launch the interactive REPL.
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut vm = Vm::new();
    vm.trace_exec = cli.trace_exec;
    vm.set_stress_gc(cli.stress_gc);
    vm.set_log_gc(cli.log_gc);

    match cli.command {
        Some(Commands::Run { file, script_args }) => run_file(vm, file, script_args),
        Some(Commands::Repl) | None => {
            if let Err(e) = repl::run(vm) {
                eprintln!("REPL error: {e}");
                return ExitCode::from(1);
            }
            ExitCode::SUCCESS
        }
    }
}

fn run_file(mut vm: Vm, path: PathBuf, script_args: Vec<String>) -> ExitCode {
    let source = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {e}", path.display());
            return ExitCode::from(74);
        }
    };
    vm.set_script_args(script_args);
    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(65),
        InterpretResult::RuntimeError => ExitCode::from(70),
    }
}
