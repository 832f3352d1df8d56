// Library interface for the Ruff interpreter: a bytecode compiler and a
// stack-based virtual machine with a tracing mark-sweep garbage collector.

pub mod chunk;
pub mod compiler;
pub mod errors;
pub mod gc;
pub mod native;
pub mod object;
pub mod repl;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;
