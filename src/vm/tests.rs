use super::*;
use crate::bytecode::write_uint;
use crate::value::list_to_vec;

/// Hand-assemble a function from opcode bytes.
fn assemble(constants: Vec<Value>, stack_size: u64, build: impl FnOnce(&mut Vec<u8>)) -> Rc<Function> {
    let mut code = Vec::new();
    build(&mut code);
    Function::new(constants, code, stack_size)
}

#[test]
fn constants_and_addi_add_up() {
    let mut vm = Vm::new();
    let f = assemble(vec![Value::Fixnum(1)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Addi as u8);
        write_uint(code, 2);
    });
    let result = vm.eval(&f, &[]).unwrap();
    assert!(equals(&result, &Value::Fixnum(3)));
    assert!(vm.data_stack.is_empty());
    assert!(vm.call_stack.is_empty());
}

#[test]
fn arithmetic_promotes_to_flonum() {
    let mut vm = Vm::new();
    let f = assemble(vec![Value::Fixnum(1), Value::Flonum(0.5)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Const1 as u8);
        code.push(Op::Add as u8);
    });
    assert!(equals(&vm.eval(&f, &[]).unwrap(), &Value::Flonum(1.5)));
}

#[test]
fn division_truncates_and_rejects_zero() {
    let mut vm = Vm::new();
    let f = assemble(vec![Value::Fixnum(7), Value::Fixnum(-2)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Const1 as u8);
        code.push(Op::Div as u8);
    });
    assert!(equals(&vm.eval(&f, &[]).unwrap(), &Value::Fixnum(-3)));

    let f = assemble(vec![Value::Fixnum(7), Value::Fixnum(0)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Const1 as u8);
        code.push(Op::Div as u8);
    });
    let err = vm.eval(&f, &[]).unwrap_err();
    assert!(err.to_string().contains("division by zero"), "{err}");
}

#[test]
fn arithmetic_on_non_numbers_faults_with_the_index() {
    let mut vm = Vm::new();
    let f = assemble(vec![Value::string("x"), Value::Fixnum(1)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Const1 as u8);
        code.push(Op::Add as u8);
    });
    match vm.eval(&f, &[]).unwrap_err() {
        Error::Runtime { operation, index, .. } => {
            assert_eq!(operation, "add");
            assert_eq!(index, 2);
        }
        other => panic!("expected a runtime error, got {other}"),
    }
}

#[test]
fn stack_underflow_is_reported() {
    let mut vm = Vm::new();
    let f = assemble(Vec::new(), 0, |code| code.push(Op::Drop as u8));
    let err = vm.eval(&f, &[]).unwrap_err();
    assert!(err.to_string().contains("underflow"), "{err}");
}

#[test]
fn unknown_opcodes_are_rejected() {
    let mut vm = Vm::new();
    let f = assemble(Vec::new(), 0, |code| code.push(0xEE));
    let err = vm.eval(&f, &[]).unwrap_err();
    assert!(err.to_string().contains("unknown opcode"), "{err}");
}

#[test]
fn out_of_range_constants_are_rejected() {
    let mut vm = Vm::new();
    let f = assemble(Vec::new(), 0, |code| code.push(Op::Const2 as u8));
    let err = vm.eval(&f, &[]).unwrap_err();
    assert!(err.to_string().contains("out of bounds"), "{err}");
}

#[test]
fn jump_when_nil_selects_the_branch() {
    // Offsets are relative to the second offset byte, matching the
    // compiler's patching convention.
    let build = |cond: Value| {
        assemble(vec![cond, Value::Fixnum(2), Value::Fixnum(3)], 0, |code| {
            code.push(Op::Const0 as u8);
            code.push(Op::JumpWhenNil as u8);
            code.extend_from_slice(&5i16.to_be_bytes());
            code.push(Op::Const1 as u8);
            code.push(Op::Jump as u8);
            code.extend_from_slice(&2i16.to_be_bytes());
            code.push(Op::Const2 as u8);
        })
    };
    let mut vm = Vm::new();
    let taken = vm.eval(&build(Value::Nil), &[]).unwrap();
    assert!(equals(&taken, &Value::Fixnum(3)));
    let not_taken = vm.eval(&build(Value::Fixnum(1)), &[]).unwrap();
    assert!(equals(&not_taken, &Value::Fixnum(2)));
}

#[test]
fn out_of_range_jumps_fault() {
    let mut vm = Vm::new();
    let f = assemble(Vec::new(), 0, |code| {
        code.push(Op::Jump as u8);
        code.extend_from_slice(&100i16.to_be_bytes());
    });
    let err = vm.eval(&f, &[]).unwrap_err();
    assert!(err.to_string().contains("outside the code"), "{err}");
}

#[test]
fn calls_balance_the_data_stack() {
    // Callee: one parameter, returns it doubled.
    let callee = assemble(Vec::new(), 1, |code| {
        code.push(Op::LoadFromStack0 as u8);
        code.push(Op::LoadFromStack0 as u8);
        code.push(Op::Add as u8);
        code.push(Op::ReturnFunction as u8);
    });
    callee.nargs.set(1);
    // Caller: push 21, call, return.
    let caller = assemble(vec![Value::Fixnum(21), Value::Function(callee)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Const1 as u8);
        code.push(Op::CallFunction as u8);
        write_uint(code, 1);
        code.push(Op::ReturnFunction as u8);
    });
    let mut vm = Vm::new();
    let result = vm.eval(&caller, &[]).unwrap();
    assert!(equals(&result, &Value::Fixnum(42)));
    // Both stacks drain completely once the top-level frame unwinds.
    assert!(vm.data_stack.is_empty());
    assert!(vm.call_stack.is_empty());
}

#[test]
fn calling_with_the_wrong_arity_faults() {
    let callee = assemble(Vec::new(), 1, |code| {
        code.push(Op::LoadFromStack0 as u8);
        code.push(Op::ReturnFunction as u8);
    });
    callee.nargs.set(1);
    let caller = assemble(vec![Value::Function(callee)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::CallFunction as u8);
        write_uint(code, 0);
    });
    let mut vm = Vm::new();
    let err = vm.eval(&caller, &[]).unwrap_err();
    assert!(err.to_string().contains("argument"), "{err}");
}

#[test]
fn let_locals_live_on_the_call_stack() {
    let f = assemble(vec![Value::Fixnum(2)], 1, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::StoreToStack as u8);
        write_uint(code, 0);
        code.push(Op::LoadFromStack0 as u8);
    });
    let mut vm = Vm::new();
    assert!(equals(&vm.eval(&f, &[]).unwrap(), &Value::Fixnum(2)));
}

#[test]
fn symbol_slots_read_and_write() {
    let mut vm = Vm::new();
    let sym = vm.intern_in("box", &vm.user_package());
    let f = assemble(
        vec![Value::Symbol(sym.clone()), Value::Fixnum(9)],
        0,
        |code| {
            code.push(Op::Const0 as u8);
            code.push(Op::Const1 as u8);
            code.push(Op::SetSymbolValue as u8);
            // set-symbol-value leaves the symbol; read it back.
            code.push(Op::SymbolValue as u8);
        },
    );
    assert!(equals(&vm.eval(&f, &[]).unwrap(), &Value::Fixnum(9)));
    assert!(equals(&sym.value().unwrap(), &Value::Fixnum(9)));
}

#[test]
fn unset_slots_fault_with_the_symbol_name() {
    let mut vm = Vm::new();
    let sym = vm.intern_in("unbound-thing", &vm.user_package());
    let f = assemble(vec![Value::Symbol(sym)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::SymbolValue as u8);
    });
    let err = vm.eval(&f, &[]).unwrap_err();
    assert!(err.to_string().contains("unbound-thing"), "{err}");
}

#[test]
fn list_collects_in_order() {
    let f = assemble(
        vec![Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)],
        0,
        |code| {
            code.push(Op::Const0 as u8);
            code.push(Op::Const1 as u8);
            code.push(Op::Const2 as u8);
            code.push(Op::List as u8);
            write_uint(code, 3);
        },
    );
    let mut vm = Vm::new();
    let result = vm.eval(&f, &[]).unwrap();
    let items = list_to_vec(&result).unwrap();
    assert_eq!(items.len(), 3);
    assert!(equals(&items[0], &Value::Fixnum(1)));
    assert!(equals(&items[2], &Value::Fixnum(3)));
}

#[test]
fn dup_duplicates_the_top_operand() {
    let f = assemble(vec![Value::Fixnum(4)], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Dup as u8);
        code.push(Op::Mul as u8);
    });
    let mut vm = Vm::new();
    assert!(equals(&vm.eval(&f, &[]).unwrap(), &Value::Fixnum(16)));
}

#[test]
fn comparisons_yield_t_or_nil() {
    let build = |a: i64, b: i64, op: Op| {
        assemble(vec![Value::Fixnum(a), Value::Fixnum(b)], 0, move |code| {
            code.push(Op::Const0 as u8);
            code.push(Op::Const1 as u8);
            code.push(op as u8);
        })
    };
    let mut vm = Vm::new();
    match vm.eval(&build(1, 2, Op::Lt), &[]).unwrap() {
        Value::Symbol(s) => assert_eq!(s.name(), b"t"),
        other => panic!("expected t, got {}", other.type_name()),
    }
    assert!(vm.eval(&build(2, 1, Op::Lt), &[]).unwrap().is_nil());
    assert!(!vm.eval(&build(2, 2, Op::Gte), &[]).unwrap().is_nil());
    assert!(!vm.eval(&build(2, 2, Op::Lte), &[]).unwrap().is_nil());
    assert!(vm.eval(&build(1, 2, Op::Gt), &[]).unwrap().is_nil());
}

#[test]
fn intern_op_uses_the_current_package() {
    let f = assemble(vec![Value::string("fresh-name")], 0, |code| {
        code.push(Op::Const0 as u8);
        code.push(Op::Intern as u8);
    });
    let mut vm = Vm::new();
    match vm.eval(&f, &[]).unwrap() {
        Value::Symbol(s) => {
            assert_eq!(s.name(), b"fresh-name");
            assert_eq!(s.home_package().unwrap().name(), b"user");
        }
        other => panic!("expected a symbol, got {}", other.type_name()),
    }
}

#[test]
fn builtin_type_of_names_types() {
    let mut vm = Vm::new();
    let sym = vm.intern_in("type-of", &vm.impl_package());
    let Some(Value::Function(type_of)) = sym.function() else {
        panic!("type-of builtin is not bound");
    };
    match vm.eval(&type_of, &[Value::Flonum(1.0)]).unwrap() {
        Value::Symbol(s) => assert_eq!(s.name(), b"flonum"),
        other => panic!("expected a symbol, got {}", other.type_name()),
    }
}

#[test]
fn builtin_find_package_and_package_symbols() {
    let mut vm = Vm::new();
    let find = vm.intern_in("find-package", &vm.impl_package());
    let Some(Value::Function(find)) = find.function() else {
        panic!("find-package builtin is not bound");
    };
    match vm.eval(&find, &[Value::string("lisp")]).unwrap() {
        Value::Package(p) => assert_eq!(p.name(), b"lisp"),
        other => panic!("expected a package, got {}", other.type_name()),
    }
    assert!(vm.eval(&find, &[Value::string("no-such")]).unwrap().is_nil());

    let symbols = vm.intern_in("package-symbols", &vm.impl_package());
    let Some(Value::Function(symbols)) = symbols.function() else {
        panic!("package-symbols builtin is not bound");
    };
    let result = vm
        .eval(&symbols, &[Value::Package(vm.lisp_package())])
        .unwrap();
    let listed = list_to_vec(&result).unwrap();
    assert!(listed
        .iter()
        .any(|v| matches!(v, Value::Symbol(s) if s.name() == b"nil")));
}
