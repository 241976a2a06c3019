//! # Built-In Property Suite
//!
//! Run by `--run-tests`. Exercises the container laws, the marshal
//! round-trip laws, the reader's numeric boundaries, and the end-to-end
//! read→compile→execute path through the same public API embedders use.
//! Kept separate from the unit tests so a release binary can check itself.

use crate::compiler::compile;
use crate::error::{Error, Result};
use crate::marshal::{bytecode_file_bytes, marshal, read_bytecode_file, unmarshal};
use crate::printer::to_repr;
use crate::reader::read;
use crate::stream::ByteStream;
use crate::value::{equals, grow_capacity, Value};
use crate::vm::Vm;

fn check(name: &str, ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Runtime {
            operation: "self-test",
            message: format!("check \"{name}\" failed"),
            index: 0,
        })
    }
}

fn eval_source(vm: &mut Vm, src: &str) -> Result<Value> {
    let s = ByteStream::from_bytes(src.as_bytes());
    let package = vm.current_package();
    let ast = read(&s, &package, vm)?;
    let f = compile(&ast, None, &Value::Nil, &Value::Nil, vm)?;
    vm.eval(&f, &[])
}

fn marshal_round_trip(vm: &Vm, v: &Value) -> Result<Value> {
    let mut bytes = Vec::new();
    marshal(v, &mut bytes, None)?;
    unmarshal(&ByteStream::from_bytes(&bytes), None, vm)
}

/// Run every check, printing a summary. Any failure aborts the suite.
pub fn run_tests() -> Result<()> {
    println!("============ Running tests... =============");
    let mut vm = Vm::new();

    // Container laws.
    check("growth is ceil((n+1)*1.5)", grow_capacity(2) == 5 && grow_capacity(4) == 8)?;

    // Integer encoding bounds.
    for n in [0i64, 9, -23, 256, 2049, 123456789, -123456789, i64::MIN, i64::MAX] {
        let v = Value::Fixnum(n);
        check("fixnum round-trip", equals(&marshal_round_trip(&vm, &v)?, &v))?;
    }
    let v = Value::Ufixnum(u64::MAX);
    check("ufixnum round-trip", equals(&marshal_round_trip(&vm, &v)?, &v))?;

    // Aggregate round-trip.
    let v = Value::list(&[
        Value::Fixnum(1),
        Value::string("hi"),
        Value::Vec2(0.5, -1.5),
        Value::array(vec![Value::Nil, Value::Flonum(0.001)]),
    ]);
    check("aggregate round-trip", equals(&marshal_round_trip(&vm, &v)?, &v))?;

    // Reader numeric boundaries.
    let package = vm.current_package();
    let one_e_minus_3 = read(&ByteStream::from_bytes(b"1e-3"), &package, &vm)?;
    check("1e-3 reads exactly", equals(&one_e_minus_3, &Value::Flonum(0.001)))?;
    let three_dot = read(&ByteStream::from_bytes(b"3."), &package, &vm)?;
    check("3. reads as a flonum", equals(&three_dot, &Value::Flonum(3.0)))?;
    for lone in ["+", "-", ".", "e"] {
        let v = read(&ByteStream::from_bytes(lone.as_bytes()), &package, &vm)?;
        check("lone char stays a symbol", matches!(v, Value::Symbol(_)))?;
    }

    // End-to-end scenarios.
    check(
        "(+ 1 2) is 3",
        equals(&eval_source(&mut vm, "(+ 1 2)")?, &Value::Fixnum(3)),
    )?;
    check(
        "(if nil 2 3) is 3",
        equals(&eval_source(&mut vm, "(if nil 2 3)")?, &Value::Fixnum(3)),
    )?;
    check(
        "(if 1 2 3) is 2",
        equals(&eval_source(&mut vm, "(if 1 2 3)")?, &Value::Fixnum(2)),
    )?;
    check(
        "(let ((a 2)) a) is 2",
        equals(&eval_source(&mut vm, "(let ((a 2)) a)")?, &Value::Fixnum(2)),
    )?;
    let pair = eval_source(&mut vm, "(cons 1 (cons 2 nil))")?;
    check("cons builds a list", to_repr(&pair) == "(1 2)")?;

    // Macro expansion during compilation.
    eval_source(&mut vm, "(macro m (x) (list 'quote x))")?;
    check(
        "macro expands to its quotation",
        equals(&eval_source(&mut vm, "(m 42)")?, &Value::Fixnum(42)),
    )?;

    // Bytecode file round-trip, in memory.
    let s = ByteStream::from_bytes(b"(print \"hi\")");
    let f = crate::compiler::compile_stream(&s, &mut vm)?;
    let bytes = bytecode_file_bytes(&f)?;
    let back = read_bytecode_file(&ByteStream::from_bytes(&bytes), &vm)?;
    check(
        "bytecode file round-trip",
        equals(&Value::Function(f), &Value::Function(back)),
    )?;

    println!("============ Tests were successful ========");
    Ok(())
}
