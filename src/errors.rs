// Structured error reporting, kept in the teacher's `RuffError`/`ErrorKind`
// shape but scoped to the four kinds spec.md §7 names.

use colored::Colorize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexical,
    Syntax,
    CompileSemantic,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Lexical => "Lexical Error",
            ErrorKind::Syntax => "Syntax Error",
            ErrorKind::CompileSemantic => "Compile Error",
            ErrorKind::Runtime => "Runtime Error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub line: u32,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: u32) -> Self {
        SourceLocation { line, file: None }
    }

    pub fn with_file(line: u32, file: String) -> Self {
        SourceLocation { line, file: Some(file) }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{file}:{}", self.line),
            None => write!(f, "[line {}]", self.line),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuffError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
}

impl RuffError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        RuffError { kind, message: message.into(), location }
    }

    /// Printed by the compiler when it reports a parse/compile diagnostic.
    pub fn print_compile(&self) {
        eprintln!(
            "{} {}: {}",
            self.location.to_string().bold(),
            self.kind.to_string().red(),
            self.message
        );
    }
}

impl fmt::Display for RuffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.location, self.kind, self.message)
    }
}

impl std::error::Error for RuffError {}
