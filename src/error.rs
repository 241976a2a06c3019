//! # Error Handling for the Bug Runtime
//!
//! One crate-wide [`Error`] enum covering the four fault classes the
//! runtime can surface:
//!
//! - **Read** — lexical faults: unterminated strings or lists, bad escape
//!   sequences, malformed package prefixes.
//! - **Compile** — bad special-form arity, jump range overflow, attempts to
//!   compile uncompilable values, faults raised during macro expansion.
//! - **Marshal** — bad magic or version, unknown tag bytes, truncated input.
//! - **Runtime** — type mismatches, stack underflow, unset symbol slots,
//!   unknown opcodes; these carry the instruction index where the VM was
//!   when the fault occurred.
//!
//! The binary prints the `Display` form to stderr and exits non-zero; the
//! REPL catches errors at top level and keeps the session alive.

use thiserror::Error;

/// Errors surfaced by the reader, compiler, marshal codec, and VM.
#[derive(Debug, Error)]
pub enum Error {
    /// Lexical fault while reading source text.
    #[error("read error: {0}")]
    Read(String),

    /// Fault while lowering an s-expression to bytecode.
    #[error("compile error: {0}")]
    Compile(String),

    /// Fault while encoding or decoding the binary format.
    #[error("marshal error: {operation}: {message}")]
    Marshal {
        /// The codec operation that failed (e.g. `"unmarshal_symbol"`).
        operation: &'static str,
        message: String,
    },

    /// Fault raised by the VM while executing bytecode.
    #[error("runtime error: {operation}: {message} (at instruction {index})")]
    Runtime {
        /// The opcode or builtin that faulted.
        operation: &'static str,
        message: String,
        /// Instruction index within the current function's code.
        index: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an [`Error::Marshal`] with a formatted message.
    pub fn marshal(operation: &'static str, message: impl Into<String>) -> Error {
        Error::Marshal {
            operation,
            message: message.into(),
        }
    }

    /// Shorthand for an [`Error::Runtime`] with a formatted message.
    pub fn runtime(operation: &'static str, message: impl Into<String>, index: u64) -> Error {
        Error::Runtime {
            operation,
            message: message.into(),
            index,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
