//! Bug Lisp entry point.
//!
//! Modes:
//! - no arguments → interactive REPL;
//! - `bug FILE` → interpret: run a bytecode file directly, or compile and
//!   run a source file;
//! - `bug -c IN -o OUT` → compile a source file to a bytecode file;
//! - `bug --run-tests` → run the built-in property suite.
//!
//! Exits 0 on success and 1 on any fatal error (the error is printed to
//! stderr first).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use bug_runtime::compiler::compile_stream;
use bug_runtime::error::Result;
use bug_runtime::marshal::{bytecode_file_bytes, read_bytecode_file, BC_MAGIC, IMAGE_MAGIC};
use bug_runtime::repl::repl;
use bug_runtime::selftest::run_tests;
use bug_runtime::stream::{ByteStream, FileStream};
use bug_runtime::vm::Vm;

#[derive(Parser)]
#[command(
    name = "bug",
    version,
    about = "Bug Lisp: reader, bytecode compiler, and VM",
    arg_required_else_help = false
)]
struct Cli {
    /// File to interpret: a bytecode file, or a source file to compile and
    /// run.
    input: Option<PathBuf>,

    /// Compile this source file instead of interpreting.
    #[arg(short = 'c', value_name = "FILE", conflicts_with = "input")]
    compile: Option<PathBuf>,

    /// Where to write the compiled bytecode file (with -c).
    #[arg(short = 'o', value_name = "FILE", requires = "compile")]
    output: Option<PathBuf>,

    /// Run the built-in property tests and exit.
    #[arg(long)]
    run_tests: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = if cli.run_tests {
        run_tests()
    } else if let Some(input) = &cli.compile {
        match &cli.output {
            Some(output) => compile_to_file(input, output),
            None => {
                eprintln!("-c requires an output file via -o");
                return ExitCode::FAILURE;
            }
        }
    } else if let Some(input) = &cli.input {
        interpret(input)
    } else {
        let mut vm = Vm::new();
        repl(&mut vm);
        Ok(())
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Compile a source file and write it out as a bytecode file.
fn compile_to_file(input: &PathBuf, output: &PathBuf) -> Result<()> {
    let mut vm = Vm::new();
    let source = std::fs::read(input)?;
    let f = compile_stream(&ByteStream::from_bytes(&source), &mut vm)?;
    debug!(input = %input.display(), output = %output.display(), "writing bytecode file");
    std::fs::write(output, bytecode_file_bytes(&f)?)?;
    Ok(())
}

/// Run a file: bytecode files execute directly, anything else is compiled
/// first. The distinction is made by sniffing the magic.
fn interpret(input: &PathBuf) -> Result<()> {
    let mut vm = Vm::new();
    let path = input.display().to_string();
    let head = std::fs::read(input)?;

    let f = if head.starts_with(BC_MAGIC) && !head.starts_with(IMAGE_MAGIC) {
        debug!(%path, "running bytecode file");
        read_bytecode_file(&ByteStream::from_bytes(&head), &vm)?
    } else {
        debug!(%path, "compiling source file");
        let file = FileStream::open(&path, "rb")?;
        compile_stream(&ByteStream::lift(&file)?, &mut vm)?
    };
    vm.eval(&f, &[])?;
    Ok(())
}
