// Interactive REPL (§6, external collaborator): reads one line at a time
// from stdin until EOF, compiling and running each line against a single
// persistent `Vm` so top-level `var` declarations survive across lines.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

pub fn run(mut vm: Vm) -> Result<(), Box<dyn std::error::Error>> {
    let mut editor = DefaultEditor::new()?;
    println!("{}", "Ruff REPL — Ctrl-D to exit".bright_cyan());

    loop {
        match editor.readline(&"ruff> ".bright_green().to_string()) {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                if line.trim().is_empty() {
                    continue;
                }
                vm.interpret(&line);
            }
            Err(ReadlineError::Eof) => break,
            Err(ReadlineError::Interrupted) => continue,
            Err(e) => return Err(Box::new(e)),
        }
    }
    Ok(())
}
