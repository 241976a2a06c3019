//! # Interactive REPL
//!
//! Read–compile–execute–print loop. Tracks paren depth (ignoring parens
//! inside string literals) so multi-line forms can be entered before
//! anything runs, and catches errors at top level so a typo does not end
//! the session.

use std::io::{self, BufRead, Write};

use crate::compiler::compile;
use crate::printer::to_repr;
use crate::reader::read;
use crate::stream::ByteStream;
use crate::value::Value;
use crate::vm::Vm;

/// Run the interactive loop until EOF or an explicit `exit`/`quit`.
pub fn repl(vm: &mut Vm) {
    println!("Bug Lisp - REPL");
    println!("Type `exit` or `quit` to leave.");

    let stdin = io::stdin();
    // Buffer for building a multi-line form when parens are unbalanced.
    let mut buffer = String::new();
    let mut depth: i32 = 0;

    loop {
        let prompt = if buffer.is_empty() { "b> " } else { "... " };
        print!("{prompt}");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                break;
            }
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if buffer.is_empty() && (trimmed == "exit" || trimmed == "quit") {
            break;
        }
        if buffer.is_empty() && trimmed.is_empty() {
            continue;
        }

        depth += paren_delta(&line);
        buffer.push_str(&line);

        // Parens still open: keep reading before executing.
        if depth > 0 {
            continue;
        }

        let block = std::mem::take(&mut buffer);
        depth = 0;
        if let Err(e) = eval_block(vm, &block) {
            eprintln!("{e}");
        }
    }
}

/// Read, compile, and run every form in the block, printing each result.
fn eval_block(vm: &mut Vm, block: &str) -> crate::error::Result<()> {
    let stream = ByteStream::from_bytes(block.as_bytes());
    loop {
        if !has_content(&stream)? {
            return Ok(());
        }
        let package = vm.current_package();
        let ast = read(&stream, &package, vm)?;
        let f = compile(&ast, None, &Value::Nil, &Value::Nil, vm)?;
        let result = vm.eval(&f, &[])?;
        println!("{}", to_repr(&result));
    }
}

fn has_content(stream: &ByteStream) -> crate::error::Result<bool> {
    while stream.has_more()? {
        if !matches!(stream.peek_byte()?, b' ' | b'\t' | b'\r' | b'\n') {
            return Ok(true);
        }
        stream.read_byte()?;
    }
    Ok(false)
}

/// Net change in paren depth across a line, skipping parens inside string
/// literals and honoring backslash escapes.
fn paren_delta(line: &str) -> i32 {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paren_tracking_ignores_strings() {
        assert_eq!(paren_delta("(let ((a 2))"), 3);
        assert_eq!(paren_delta("))"), -2);
        assert_eq!(paren_delta("\"(((\""), 0);
        assert_eq!(paren_delta("\"\\\"(\" ("), 1);
    }
}
