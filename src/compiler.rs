//! # Single-Pass Compiler
//!
//! Lowers one s-expression at a time into a [`Function`]: constants vector,
//! code bytes, and declared stack size. Compilation is driven by the shape
//! of the expression:
//!
//! - Literals and non-symbol atoms load themselves as constants.
//! - Symbol references consult the lexical table (an association list from
//!   symbol to stack slot) and either load from the frame or defer to a
//!   run-time `symbol-value` lookup.
//! - Special forms get dedicated lowering (see [`SpecialForm`]).
//! - Anything else is a function application: arguments in order, callee
//!   symbol as a constant, `call-symbol-function`.
//!
//! ## Macros
//! When the head symbol's function slot holds a macro, the compiler calls
//! the VM to run the macro body on the raw argument list and compiles the
//! expansion in its place. This is the one place the compiler depends on
//! the VM, which must therefore be reentrant.
//!
//! ## Jumps
//! `if` emits 16-bit placeholder offsets and patches them once the branch
//! lengths are known. A branch longer than 32,767 bytes is a compile error.

use std::rc::Rc;

use tracing::debug;

use crate::bytecode::{patch_s16, write_s16, write_uint, Op};
use crate::error::{Error, Result};
use crate::stream::ByteStream;
use crate::symbols::Symbol;
use crate::value::{
    alist_extend, alist_get, container_push, list_to_vec, Function, Value,
};
use crate::vm::Vm;

/// Maximum forward jump reach of the signed 16-bit offset encoding.
const MAX_JUMP: usize = 32_767;

/// Syntactic heads the compiler lowers directly.
enum SpecialForm {
    Quote,
    Cons,
    Car,
    Cdr,
    Progn,
    Drop,
    If,
    Let,
    Function,
    Macro,
    SymbolValue,
    SymbolFunction,
    Set,
    SetSymbolFunction,
    List,
    Call,
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Lte,
    Gte,
    Equals,
    And,
    Or,
    Print,
}

/// Compile one expression, extending `f` (or a fresh function when `None`).
///
/// `st` is the lexical symbol table: an association list from symbol to
/// stack slot. `fst` is the function symbol table, reserved for lexical
/// function bindings; it is threaded through but not yet consulted.
pub fn compile(
    ast: &Value,
    f: Option<Rc<Function>>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<Rc<Function>> {
    let f = f.unwrap_or_else(|| Function::new(Vec::new(), Vec::new(), 0));
    compile_expr(ast, &f, st, fst, vm)?;
    Ok(f)
}

/// Read every expression in the stream and compile the whole file as one
/// implicit `progn` whose final value is dropped.
pub fn compile_stream(s: &ByteStream, vm: &mut Vm) -> Result<Rc<Function>> {
    let package = vm.current_package();
    let forms = crate::reader::read_all(s, &package, vm)?;
    debug!(forms = forms.len(), "compiling top-level forms");
    let f = Function::new(Vec::new(), Vec::new(), 0);
    let progn = Value::cons(Value::Symbol(vm.syms.progn.clone()), Value::list(&forms));
    compile_expr(&progn, &f, &Value::Nil, &Value::Nil, vm)?;
    // The file's last value would otherwise linger on the data stack.
    if !forms.is_empty() {
        emit(&f, Op::Drop);
    }
    Ok(f)
}

fn emit(f: &Function, op: Op) {
    container_push(&mut f.code.borrow_mut(), op as u8);
}

fn emit_uint(f: &Function, n: u64) {
    write_uint(&mut f.code.borrow_mut(), n);
}

/// Add a constant and emit the load for it, using the short forms for the
/// first four slots.
fn gen_load_constant(f: &Function, value: Value) {
    let index = {
        let mut constants = f.constants.borrow_mut();
        container_push(&mut constants, value);
        constants.len() - 1
    };
    match index {
        0 => emit(f, Op::Const0),
        1 => emit(f, Op::Const1),
        2 => emit(f, Op::Const2),
        3 => emit(f, Op::Const3),
        _ => {
            emit(f, Op::Const);
            emit_uint(f, index as u64);
        }
    }
}

fn special_form(vm: &Vm, sym: &Rc<Symbol>) -> Option<SpecialForm> {
    use SpecialForm::*;
    let s = &vm.syms;
    let eq = Rc::ptr_eq;
    Some(if eq(sym, &s.quote) {
        Quote
    } else if eq(sym, &s.cons) {
        Cons
    } else if eq(sym, &s.car) {
        Car
    } else if eq(sym, &s.cdr) {
        Cdr
    } else if eq(sym, &s.progn) {
        Progn
    } else if eq(sym, &s.drop) {
        Drop
    } else if eq(sym, &s.if_) {
        If
    } else if eq(sym, &s.let_) {
        Let
    } else if eq(sym, &s.function) {
        Function
    } else if eq(sym, &s.macro_) {
        Macro
    } else if eq(sym, &s.symbol_value) {
        SymbolValue
    } else if eq(sym, &s.symbol_function) {
        SymbolFunction
    } else if eq(sym, &s.set) {
        Set
    } else if eq(sym, &s.set_symbol_function) {
        SetSymbolFunction
    } else if eq(sym, &s.list) {
        List
    } else if eq(sym, &s.call) {
        Call
    } else if eq(sym, &s.add) {
        Add
    } else if eq(sym, &s.sub) {
        Sub
    } else if eq(sym, &s.mul) {
        Mul
    } else if eq(sym, &s.div) {
        Div
    } else if eq(sym, &s.lt) {
        Lt
    } else if eq(sym, &s.gt) {
        Gt
    } else if eq(sym, &s.lte) {
        Lte
    } else if eq(sym, &s.gte) {
        Gte
    } else if eq(sym, &s.equals) {
        Equals
    } else if eq(sym, &s.and) {
        And
    } else if eq(sym, &s.or) {
        Or
    } else if eq(sym, &s.print) {
        Print
    } else {
        return None;
    })
}

fn want(form: &str, args: &[Value], n: usize) -> Result<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(Error::Compile(format!(
            "special form \"{form}\" takes {n} argument(s), was given {}",
            args.len()
        )))
    }
}

fn form_args(form: &str, ast: &Value) -> Result<Vec<Value>> {
    match ast {
        Value::Cons(c) => list_to_vec(&c.cdr).ok_or_else(|| {
            Error::Compile(format!("\"{form}\" form is an improper list"))
        }),
        _ => Ok(Vec::new()),
    }
}

fn compile_expr(ast: &Value, f: &Rc<Function>, st: &Value, fst: &Value, vm: &mut Vm) -> Result<()> {
    match ast {
        Value::Nil
        | Value::Fixnum(_)
        | Value::Ufixnum(_)
        | Value::Flonum(_)
        | Value::Str(_)
        | Value::ByteArray(_)
        | Value::Array(_)
        | Value::Package(_)
        | Value::Vec2(_, _)
        | Value::Enumerator(_)
        | Value::Pointer(_) => {
            gen_load_constant(f, ast.clone());
            Ok(())
        }
        Value::Symbol(sym) => {
            compile_symbol_ref(sym, f, st);
            Ok(())
        }
        Value::File(_) | Value::Function(_) => Err(Error::Compile(format!(
            "a value of type {} cannot be compiled",
            ast.type_name()
        ))),
        Value::Cons(cell) => match &cell.car {
            Value::Symbol(head) => compile_form(ast, head, f, st, fst, vm),
            other => Err(Error::Compile(format!(
                "an expression cannot start with a {}",
                other.type_name()
            ))),
        },
    }
}

/// Lexical hit: load from the frame. Miss: defer to a run-time
/// `symbol-value` lookup.
fn compile_symbol_ref(sym: &Rc<Symbol>, f: &Function, st: &Value) {
    match alist_get(st, &Value::Symbol(sym.clone())) {
        Some(Value::Ufixnum(0)) => emit(f, Op::LoadFromStack0),
        Some(Value::Ufixnum(1)) => emit(f, Op::LoadFromStack1),
        Some(Value::Ufixnum(j)) => {
            emit(f, Op::LoadFromStack);
            emit_uint(f, j);
        }
        _ => {
            gen_load_constant(f, Value::Symbol(sym.clone()));
            emit(f, Op::SymbolValue);
        }
    }
}

fn compile_form(
    ast: &Value,
    head: &Rc<Symbol>,
    f: &Rc<Function>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<()> {
    use SpecialForm::*;
    let Some(form) = special_form(vm, head) else {
        return compile_application(ast, head, f, st, fst, vm);
    };
    let args = form_args(&head.name_string(), ast)?;
    match form {
        Quote => {
            want("quote", &args, 1)?;
            gen_load_constant(f, args[0].clone());
        }
        Cons => {
            want("cons", &args, 2)?;
            compile_expr(&args[0], f, st, fst, vm)?;
            compile_expr(&args[1], f, st, fst, vm)?;
            emit(f, Op::Cons);
        }
        Car => {
            want("car", &args, 1)?;
            compile_expr(&args[0], f, st, fst, vm)?;
            emit(f, Op::Car);
        }
        Cdr => {
            want("cdr", &args, 1)?;
            compile_expr(&args[0], f, st, fst, vm)?;
            emit(f, Op::Cdr);
        }
        Progn => compile_progn(&args, f, st, fst, vm)?,
        Drop => emit(f, Op::Drop),
        If => compile_if(&args, f, st, fst, vm)?,
        Let => compile_let(&args, f, st, fst, vm)?,
        Function => compile_function_form(&args, false, f, st, fst, vm)?,
        Macro => compile_function_form(&args, true, f, st, fst, vm)?,
        SymbolValue => {
            want("symbol-value", &args, 1)?;
            compile_expr(&args[0], f, st, fst, vm)?;
            emit(f, Op::SymbolValue);
        }
        SymbolFunction => {
            want("symbol-function", &args, 1)?;
            compile_expr(&args[0], f, st, fst, vm)?;
            emit(f, Op::SymbolFunction);
        }
        Set => compile_two_arg("set", &args, Op::SetSymbolValue, f, st, fst, vm)?,
        SetSymbolFunction => {
            compile_two_arg("set-symbol-function", &args, Op::SetSymbolFunction, f, st, fst, vm)?
        }
        List => {
            for arg in &args {
                compile_expr(arg, f, st, fst, vm)?;
            }
            emit(f, Op::List);
            emit_uint(f, args.len() as u64);
        }
        Call => {
            if args.is_empty() {
                return Err(Error::Compile("\"call\" needs a callee".to_string()));
            }
            for arg in &args[1..] {
                compile_expr(arg, f, st, fst, vm)?;
            }
            compile_expr(&args[0], f, st, fst, vm)?;
            emit(f, Op::CallFunction);
            emit_uint(f, (args.len() - 1) as u64);
        }
        Add => compile_add_sub(&args, true, f, st, fst, vm)?,
        Sub => compile_add_sub(&args, false, f, st, fst, vm)?,
        Mul => compile_pairwise("*", &args, Op::Mul, f, st, fst, vm)?,
        Div => compile_pairwise("/", &args, Op::Div, f, st, fst, vm)?,
        Lt => compile_lt(&args, f, st, fst, vm)?,
        Gt => compile_two_arg(">", &args, Op::Gt, f, st, fst, vm)?,
        Lte => compile_two_arg("<=", &args, Op::Lte, f, st, fst, vm)?,
        Gte => compile_two_arg(">=", &args, Op::Gte, f, st, fst, vm)?,
        Equals => compile_two_arg("=", &args, Op::Eq, f, st, fst, vm)?,
        And => compile_two_arg("and", &args, Op::And, f, st, fst, vm)?,
        Or => compile_two_arg("or", &args, Op::Or, f, st, fst, vm)?,
        Print => {
            for arg in &args {
                compile_expr(arg, f, st, fst, vm)?;
                emit(f, Op::Print);
            }
            emit(f, Op::PrintNl);
            emit(f, Op::LoadNil);
        }
    }
    Ok(())
}

fn compile_two_arg(
    name: &str,
    args: &[Value],
    op: Op,
    f: &Rc<Function>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<()> {
    want(name, args, 2)?;
    compile_expr(&args[0], f, st, fst, vm)?;
    compile_expr(&args[1], f, st, fst, vm)?;
    emit(f, op);
    Ok(())
}

/// Children in order with `drop` between them, so only the last value
/// remains.
fn compile_progn(
    args: &[Value],
    f: &Rc<Function>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<()> {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            emit(f, Op::Drop);
        }
        compile_expr(arg, f, st, fst, vm)?;
    }
    Ok(())
}

/// Reserve a 16-bit placeholder; returns the index of its second byte,
/// which is what jump offsets are measured from.
fn emit_jump_placeholder(f: &Function, op: Op) -> usize {
    emit(f, op);
    write_s16(&mut f.code.borrow_mut(), 0);
    f.code.borrow().len() - 1
}

fn patch_jump(f: &Function, at: usize, branch: &str) -> Result<()> {
    let offset = f.code.borrow().len() - at;
    if offset > MAX_JUMP {
        return Err(Error::Compile(format!(
            "\"{branch}\" branch of \"if\" exceeds the maximum jump range"
        )));
    }
    patch_s16(&mut f.code.borrow_mut(), at, offset as i16);
    Ok(())
}

fn compile_if(args: &[Value], f: &Rc<Function>, st: &Value, fst: &Value, vm: &mut Vm) -> Result<()> {
    if args.len() < 2 {
        return Err(Error::Compile(format!(
            "\"if\" takes a condition and a consequent, was given {} argument(s)",
            args.len()
        )));
    }
    compile_expr(&args[0], f, st, fst, vm)?;
    let to_else = emit_jump_placeholder(f, Op::JumpWhenNil);
    compile_expr(&args[1], f, st, fst, vm)?;
    let to_end = emit_jump_placeholder(f, Op::Jump);
    patch_jump(f, to_else, "then")?;
    compile_progn(&args[2..], f, st, fst, vm)?;
    patch_jump(f, to_end, "else")
}

fn compile_let(args: &[Value], f: &Rc<Function>, st: &Value, fst: &Value, vm: &mut Vm) -> Result<()> {
    let Some(bindings) = args.first().map(|b| list_to_vec(b)).unwrap_or(None) else {
        return Err(Error::Compile("\"let\" takes a binding list".to_string()));
    };
    // Binding initializers see the scope outside the let.
    let outer = st.clone();
    let mut st = st.clone();
    for binding in &bindings {
        let pair = list_to_vec(binding).filter(|p| p.len() == 2).ok_or_else(|| {
            Error::Compile("\"let\" bindings are (name value) pairs".to_string())
        })?;
        let Value::Symbol(_) = &pair[0] else {
            return Err(Error::Compile("\"let\" binding names must be symbols".to_string()));
        };
        let slot = f.stack_size.get();
        f.stack_size.set(slot + 1);
        compile_expr(&pair[1], f, &outer, fst, vm)?;
        emit(f, Op::StoreToStack);
        emit_uint(f, slot);
        st = alist_extend(&st, pair[0].clone(), Value::Ufixnum(slot));
    }
    compile_progn(&args[1..], f, &st, fst, vm)
}

/// `(function name (params) body...)`, `(function (params) body...)` for an
/// anonymous function, or `(macro name (params) body...)`.
fn compile_function_form(
    args: &[Value],
    is_macro: bool,
    f: &Rc<Function>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<()> {
    if args.is_empty() {
        return Err(Error::Compile("\"function\" needs a parameter list".to_string()));
    }
    let (name, params, body) = match &args[0] {
        Value::Symbol(name) => {
            if args.len() < 2 {
                return Err(Error::Compile(format!(
                    "function \"{}\" has no parameter list",
                    name.name_string()
                )));
            }
            (Some(name.clone()), args[1].clone(), &args[2..])
        }
        Value::Cons(_) | Value::Nil => (None, args[0].clone(), &args[1..]),
        other => {
            return Err(Error::Compile(format!(
                "functions must be named by a symbol, not a {}",
                other.type_name()
            )))
        }
    };

    let params = list_to_vec(&params)
        .ok_or_else(|| Error::Compile("parameter list is improper".to_string()))?;
    let mut tst = st.clone();
    for (i, param) in params.iter().enumerate() {
        let Value::Symbol(_) = param else {
            return Err(Error::Compile("parameters must be symbols".to_string()));
        };
        tst = alist_extend(&tst, param.clone(), Value::Ufixnum(i as u64));
    }

    let fun = Function::new(Vec::new(), Vec::new(), params.len() as u64);
    fun.nargs.set(params.len() as u64);
    *fun.name.borrow_mut() = name.clone();
    fun.is_macro.set(is_macro);
    // Bind the name before the body compiles so recursive and mutually
    // recursive definitions resolve.
    if let Some(name) = &name {
        name.set_function(Value::Function(fun.clone()));
    }

    for (i, form) in body.iter().enumerate() {
        if i > 0 {
            container_push(&mut fun.code.borrow_mut(), Op::Drop as u8);
        }
        compile_expr(form, &fun, &tst, fst, vm)?;
    }
    container_push(&mut fun.code.borrow_mut(), Op::ReturnFunction as u8);

    match (is_macro, name) {
        (true, None) => return Err(Error::Compile("macros must have a name".to_string())),
        (true, Some(_)) => {
            // Macros exist at compile time only; the form itself is nil.
            gen_load_constant(f, Value::Nil);
        }
        (false, None) => gen_load_constant(f, Value::Function(fun)),
        (false, Some(name)) => {
            gen_load_constant(f, Value::Symbol(name));
            gen_load_constant(f, Value::Function(fun));
            emit(f, Op::SetSymbolFunction);
        }
    }
    Ok(())
}

/// Left-to-right reduction for `+` and `-` with the immediate-operand
/// peephole: a literal fixnum operand becomes `addi`/`subi` (sign flipped
/// as needed) instead of a constant load plus `add`/`sub`.
fn compile_add_sub(
    args: &[Value],
    is_add: bool,
    f: &Rc<Function>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<()> {
    let name = if is_add { "+" } else { "-" };
    match args.len() {
        0 => return Err(Error::Compile(format!("\"{name}\" needs at least one argument"))),
        1 => return compile_expr(&args[0], f, st, fst, vm),
        _ => {}
    }

    // First pair.
    if let Value::Fixnum(rhs) = args[1] {
        compile_expr(&args[0], f, st, fst, vm)?;
        emit_immediate(f, is_add, rhs);
    } else if is_add && matches!(args[0], Value::Fixnum(_)) {
        let Value::Fixnum(lhs) = args[0] else { unreachable!() };
        compile_expr(&args[1], f, st, fst, vm)?;
        emit_immediate(f, true, lhs);
    } else {
        compile_expr(&args[0], f, st, fst, vm)?;
        compile_expr(&args[1], f, st, fst, vm)?;
        emit(f, if is_add { Op::Add } else { Op::Sub });
    }

    // Remaining operands fold into the running value one at a time.
    for arg in &args[2..] {
        if let Value::Fixnum(rhs) = arg {
            emit_immediate(f, is_add, *rhs);
        } else {
            compile_expr(arg, f, st, fst, vm)?;
            emit(f, if is_add { Op::Add } else { Op::Sub });
        }
    }
    Ok(())
}

/// `addi`/`subi` with the operand's sign folded into the opcode choice.
fn emit_immediate(f: &Function, is_add: bool, n: i64) {
    let subtract = is_add == (n < 0);
    emit(f, if subtract { Op::Subi } else { Op::Addi });
    emit_uint(f, n.unsigned_abs());
}

/// `*` and `/` reduce pairwise: compile the first two operands, emit the
/// op, then once more per additional operand.
fn compile_pairwise(
    name: &str,
    args: &[Value],
    op: Op,
    f: &Rc<Function>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<()> {
    if args.len() < 2 {
        return Err(Error::Compile(format!("\"{name}\" needs at least two arguments")));
    }
    for (i, arg) in args.iter().enumerate() {
        compile_expr(arg, f, st, fst, vm)?;
        if i >= 1 {
            emit(f, op);
        }
    }
    Ok(())
}

/// `<` folds a positive literal right operand into `lti`.
fn compile_lt(args: &[Value], f: &Rc<Function>, st: &Value, fst: &Value, vm: &mut Vm) -> Result<()> {
    want("<", args, 2)?;
    if let Value::Fixnum(k) = args[1] {
        if k > 0 {
            compile_expr(&args[0], f, st, fst, vm)?;
            emit(f, Op::Lti);
            emit_uint(f, k as u64);
            return Ok(());
        }
    }
    compile_expr(&args[0], f, st, fst, vm)?;
    compile_expr(&args[1], f, st, fst, vm)?;
    emit(f, Op::Lt);
    Ok(())
}

/// An ordinary application: expand macros at compile time, otherwise emit
/// a `call-symbol-function` through the head symbol.
fn compile_application(
    ast: &Value,
    head: &Rc<Symbol>,
    f: &Rc<Function>,
    st: &Value,
    fst: &Value,
    vm: &mut Vm,
) -> Result<()> {
    if let Some(Value::Function(candidate)) = head.function() {
        if candidate.is_macro.get() {
            let raw_args = form_args(&head.name_string(), ast)?;
            debug!(name = %head.name_string(), "expanding macro");
            let expansion = vm.eval(&candidate, &raw_args).map_err(|e| {
                Error::Compile(format!(
                    "macro \"{}\" raised during expansion: {e}",
                    head.name_string()
                ))
            })?;
            return compile_expr(&expansion, f, st, fst, vm);
        }
    }
    let args = form_args(&head.name_string(), ast)?;
    for arg in &args {
        compile_expr(arg, f, st, fst, vm)?;
    }
    gen_load_constant(f, Value::Symbol(head.clone()));
    emit(f, Op::CallSymbolFunction);
    emit_uint(f, args.len() as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::disassemble;
    use crate::value::equals;

    fn compile_source(vm: &mut Vm, src: &str) -> Rc<Function> {
        let s = ByteStream::from_bytes(src.as_bytes());
        let ast = crate::reader::read(&s, &vm.current_package(), vm).unwrap();
        compile(&ast, None, &Value::Nil, &Value::Nil, vm).unwrap()
    }

    #[test]
    fn addition_uses_the_immediate_form() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "(+ 1 2)");
        assert_eq!(&*f.code.borrow(), &[Op::Const0 as u8, Op::Addi as u8, 2]);
        let constants = f.constants.borrow();
        assert_eq!(constants.len(), 1);
        assert!(equals(&constants[0], &Value::Fixnum(1)));
    }

    #[test]
    fn negative_immediates_flip_the_opcode() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "(+ x -3)");
        let listing = disassemble(&f.code.borrow());
        assert!(listing.contains("subi 3"), "{listing}");
        let f = compile_source(&mut vm, "(- x -3)");
        let listing = disassemble(&f.code.borrow());
        assert!(listing.contains("addi 3"), "{listing}");
    }

    #[test]
    fn let_reserves_stack_slots() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "(let ((a 2)) a)");
        assert_eq!(
            &*f.code.borrow(),
            &[
                Op::Const0 as u8,
                Op::StoreToStack as u8,
                0,
                Op::LoadFromStack0 as u8,
            ]
        );
        assert_eq!(f.stack_size.get(), 1);
        let constants = f.constants.borrow();
        assert_eq!(constants.len(), 1);
        assert!(equals(&constants[0], &Value::Fixnum(2)));
    }

    #[test]
    fn if_patches_both_jumps() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "(if 1 2 3)");
        let listing = disassemble(&f.code.borrow());
        assert!(listing.contains("jump-when-nil"), "{listing}");
        assert!(listing.contains("jump"), "{listing}");
        // No placeholder zeros survive patching.
        assert!(!listing.contains("jump-when-nil 0 "), "{listing}");
    }

    #[test]
    fn free_symbols_defer_to_symbol_value() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "x");
        assert_eq!(&*f.code.borrow(), &[Op::Const0 as u8, Op::SymbolValue as u8]);
    }

    #[test]
    fn quoting_loads_the_form_itself() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "'(1 2)");
        assert_eq!(&*f.code.borrow(), &[Op::Const0 as u8]);
        let constants = f.constants.borrow();
        assert!(equals(
            &constants[0],
            &Value::list(&[Value::Fixnum(1), Value::Fixnum(2)])
        ));
    }

    #[test]
    fn application_compiles_args_then_callee() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "(frobnicate 1 2)");
        let listing = disassemble(&f.code.borrow());
        assert!(listing.contains("call-symbol-function 2"), "{listing}");
    }

    #[test]
    fn named_functions_bind_their_symbol_at_compile_time() {
        let mut vm = Vm::new();
        let _ = compile_source(&mut vm, "(function twice (x) (+ x x))");
        let package = vm.current_package();
        let sym = crate::symbols::find_symbol(b"twice", &package, true).unwrap();
        match sym.function() {
            Some(Value::Function(fun)) => {
                assert_eq!(fun.nargs.get(), 1);
                assert_eq!(fun.stack_size.get(), 1);
                assert!(!fun.is_macro.get());
                let listing = disassemble(&fun.code.borrow());
                assert!(listing.contains("return-function"), "{listing}");
            }
            other => panic!("function slot held {:?}", other.map(|v| v.type_name())),
        }
    }

    #[test]
    fn bare_drop_emits_the_opcode() {
        let mut vm = Vm::new();
        let f = compile_source(&mut vm, "(drop)");
        assert_eq!(&*f.code.borrow(), &[Op::Drop as u8]);
    }

    #[test]
    fn bad_arity_is_a_compile_error() {
        let mut vm = Vm::new();
        let s = ByteStream::from_bytes(b"(cons 1)");
        let ast = crate::reader::read(&s, &vm.current_package(), &vm).unwrap();
        assert!(compile(&ast, None, &Value::Nil, &Value::Nil, &mut vm).is_err());
    }
}
