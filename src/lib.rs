//! # Bug Lisp Runtime
//!
//! A small Lisp-family language: a reader producing s-expressions, a
//! single-pass compiler lowering them to stack bytecode, a bytecode VM, and
//! a portable binary format that persists compiled functions between
//! invocations.
//!
//! The usual flow is reader → compiler → VM:
//!
//! ```
//! use bug_runtime::{compiler, reader, stream::ByteStream, value::Value, vm::Vm};
//!
//! let mut vm = Vm::new();
//! let source = ByteStream::from_bytes(b"(+ 1 2)");
//! let ast = reader::read(&source, &vm.current_package(), &vm).unwrap();
//! let f = compiler::compile(&ast, None, &Value::Nil, &Value::Nil, &mut vm).unwrap();
//! let result = vm.eval(&f, &[]).unwrap();
//! assert!(bug_runtime::value::equals(&result, &Value::Fixnum(3)));
//! ```

pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod marshal;
pub mod printer;
pub mod reader;
pub mod repl;
pub mod selftest;
pub mod stream;
pub mod symbols;
pub mod value;
pub mod vm;

pub use error::{Error, Result};
pub use value::Value;
pub use vm::Vm;
