//! End-to-end scenarios through the public API: read → compile → execute,
//! bytecode files on disk, and image round trips.

use std::io::Write;

use bug_runtime::bytecode::disassemble;
use bug_runtime::compiler::{compile, compile_stream};
use bug_runtime::marshal::{
    bytecode_file_bytes, image_bytes, read_bytecode_file, read_image,
};
use bug_runtime::printer::to_repr;
use bug_runtime::reader::read;
use bug_runtime::stream::{ByteStream, FileStream};
use bug_runtime::value::{equals, Value};
use bug_runtime::vm::Vm;

fn eval_source(vm: &mut Vm, src: &str) -> Value {
    let s = ByteStream::from_bytes(src.as_bytes());
    let package = vm.current_package();
    let ast = read(&s, &package, vm).unwrap();
    let f = compile(&ast, None, &Value::Nil, &Value::Nil, vm).unwrap();
    vm.eval(&f, &[]).unwrap()
}

#[test]
fn addition_compiles_to_an_immediate_and_evaluates() {
    let mut vm = Vm::new();
    let s = ByteStream::from_bytes(b"(+ 1 2)");
    let package = vm.current_package();
    let ast = read(&s, &package, &vm).unwrap();
    let f = compile(&ast, None, &Value::Nil, &Value::Nil, &mut vm).unwrap();

    let listing = disassemble(&f.code.borrow());
    assert!(listing.contains("const-0"), "{listing}");
    assert!(listing.contains("addi 2"), "{listing}");
    let constants = f.constants.borrow();
    assert_eq!(constants.len(), 1);
    assert!(equals(&constants[0], &Value::Fixnum(1)));
    drop(constants);

    assert!(equals(&vm.eval(&f, &[]).unwrap(), &Value::Fixnum(3)));
}

#[test]
fn if_selects_by_nilness() {
    let mut vm = Vm::new();
    assert!(equals(&eval_source(&mut vm, "(if nil 2 3)"), &Value::Fixnum(3)));
    assert!(equals(&eval_source(&mut vm, "(if 1 2 3)"), &Value::Fixnum(2)));
}

#[test]
fn let_binds_a_stack_slot() {
    let mut vm = Vm::new();
    assert!(equals(&eval_source(&mut vm, "(let ((a 2)) a)"), &Value::Fixnum(2)));
    assert!(equals(
        &eval_source(&mut vm, "(let ((a 2) (b 3)) (+ a b))"),
        &Value::Fixnum(5)
    ));
}

#[test]
fn cons_builds_lists() {
    let mut vm = Vm::new();
    let v = eval_source(&mut vm, "(cons 1 (cons 2 nil))");
    assert!(equals(
        &v,
        &Value::list(&[Value::Fixnum(1), Value::Fixnum(2)])
    ));
    assert_eq!(to_repr(&v), "(1 2)");
}

#[test]
fn bytecode_files_round_trip_through_disk() {
    let mut vm = Vm::new();
    let s = ByteStream::from_bytes(b"(print \"hi\")");
    let f = compile_stream(&s, &mut vm).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hi.bug");
    std::fs::write(&path, bytecode_file_bytes(&f).unwrap()).unwrap();

    // Read back through the file byte-stream path.
    let file = FileStream::open(path.to_str().unwrap(), "rb").unwrap();
    let stream = ByteStream::lift(&file).unwrap();
    let back = read_bytecode_file(&stream, &vm).unwrap();
    assert!(equals(&Value::Function(f), &Value::Function(back)));
}

#[test]
fn macros_expand_during_compilation() {
    let mut vm = Vm::new();
    eval_source(&mut vm, "(macro m (x) (list 'quote x))");

    let s = ByteStream::from_bytes(b"(m 42)");
    let package = vm.current_package();
    let ast = read(&s, &package, &vm).unwrap();
    let f = compile(&ast, None, &Value::Nil, &Value::Nil, &mut vm).unwrap();
    // The expansion is (quote 42): one constant load, no call.
    let listing = disassemble(&f.code.borrow());
    assert!(listing.contains("const-0"), "{listing}");
    assert!(!listing.contains("call"), "{listing}");
    assert!(equals(&vm.eval(&f, &[]).unwrap(), &Value::Fixnum(42)));
}

#[test]
fn functions_define_and_call() {
    let mut vm = Vm::new();
    eval_source(&mut vm, "(function fib (n) (if (< n 2) n (+ (fib (- n 1)) (fib (- n 2)))))");
    assert!(equals(&eval_source(&mut vm, "(fib 10)"), &Value::Fixnum(55)));
    // Anonymous functions are first-class values for `call`.
    assert!(equals(
        &eval_source(&mut vm, "(call (function () 7))"),
        &Value::Fixnum(7)
    ));
}

#[test]
fn data_stack_is_balanced_across_calls() {
    let mut vm = Vm::new();
    eval_source(&mut vm, "(function id (x) x)");
    let before = vm.data_stack.len();
    let v = eval_source(&mut vm, "(id 5)");
    assert!(equals(&v, &Value::Fixnum(5)));
    assert_eq!(vm.data_stack.len(), before);
    assert!(vm.call_stack.is_empty());
}

#[test]
fn whole_files_compile_as_an_implicit_progn() {
    let mut vm = Vm::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("program.lisp");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "(function double (x) (+ x x))").unwrap();
    writeln!(file, "(set 'answer (double 21))").unwrap();
    drop(file);

    let file = FileStream::open(path.to_str().unwrap(), "rb").unwrap();
    let f = compile_stream(&ByteStream::lift(&file).unwrap(), &mut vm).unwrap();
    vm.eval(&f, &[]).unwrap();
    assert!(vm.data_stack.is_empty(), "trailing drop clears the file's value");

    assert!(equals(&eval_source(&mut vm, "answer"), &Value::Fixnum(42)));
}

#[test]
fn images_persist_symbol_slots() {
    let mut vm = Vm::new();
    eval_source(&mut vm, "(set 'greeting \"hello\")");
    eval_source(&mut vm, "(function double (x) (+ x x))");
    let bytes = image_bytes(&vm).unwrap();

    let mut fresh = Vm::new();
    read_image(&ByteStream::from_bytes(&bytes), &mut fresh).unwrap();
    assert!(equals(
        &eval_source(&mut fresh, "greeting"),
        &Value::string("hello")
    ));
    assert!(equals(&eval_source(&mut fresh, "(double 4)"), &Value::Fixnum(8)));
}

#[test]
fn print_forms_yield_nil() {
    let mut vm = Vm::new();
    assert!(eval_source(&mut vm, "(print 1 2)").is_nil());
}

#[test]
fn keywords_evaluate_to_themselves() {
    let mut vm = Vm::new();
    let v = eval_source(&mut vm, ":k");
    match v {
        Value::Symbol(ref s) => assert_eq!(s.name(), b"k"),
        _ => panic!("expected a symbol"),
    }
}
