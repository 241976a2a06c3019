//! # Stack-Based Bytecode Virtual Machine
//!
//! Executes compiled [`Function`]s over two disjoint stacks:
//!
//! - the **data stack**: operands consumed and produced by instructions;
//! - the **call stack**: one frame per active call, laid out as the
//!   function's local slots followed by the saved instruction index and the
//!   saved caller function.
//!
//! The "current function" and "current instruction index" live in the value
//! slots of two distinguished symbols (`impl:current-function` and
//! `impl:instruction-index`) so the language's own reflection can read
//! them; the dispatch loop mirrors the index into a local between calls.
//!
//! ## Calls and returns
//! Entering a call to `F` with `n` stack arguments: pop the `n` arguments
//! onto the call stack in order, reserve `stack_size(F) − arity(F)` nil
//! slots, push the saved index and function, and restart dispatch inside
//! `F`. `return-function` reverses the layout, restoring the caller.
//! Top-level evaluation pushes a sentinel frame whose saved index and
//! function are both nil; seeing that pair is how `eval` knows to stop,
//! which also makes the machine reentrant — the compiler calls back into
//! [`Vm::eval`] to expand macros mid-compilation.
//!
//! ## Builtins
//! Builtin functions get an ordinary frame, then route by their
//! [`Builtin`] tag to a native handler instead of bytecode.

use std::rc::Rc;

use tracing::trace;

use crate::bytecode::{read_s16, read_uint, Op};
use crate::error::{Error, Result};
use crate::printer::to_string;
use crate::symbols::{intern, Package, Symbol};
use crate::value::{equals, Function, Value};

pub mod builtins;
mod ops;

#[cfg(test)]
mod tests;

use builtins::Builtin;

/// Symbols the reader and compiler recognize by identity. All are interned
/// in the lisp package and exported, so any package that uses lisp resolves
/// them.
pub struct Syms {
    pub quote: Rc<Symbol>,
    pub quasiquote: Rc<Symbol>,
    pub unquote: Rc<Symbol>,
    pub unquote_splicing: Rc<Symbol>,
    pub cons: Rc<Symbol>,
    pub car: Rc<Symbol>,
    pub cdr: Rc<Symbol>,
    pub progn: Rc<Symbol>,
    pub drop: Rc<Symbol>,
    pub let_: Rc<Symbol>,
    pub function: Rc<Symbol>,
    pub macro_: Rc<Symbol>,
    pub symbol_value: Rc<Symbol>,
    pub symbol_function: Rc<Symbol>,
    pub set: Rc<Symbol>,
    pub set_symbol_function: Rc<Symbol>,
    pub if_: Rc<Symbol>,
    pub print: Rc<Symbol>,
    pub list: Rc<Symbol>,
    pub call: Rc<Symbol>,
    pub add: Rc<Symbol>,
    pub sub: Rc<Symbol>,
    pub mul: Rc<Symbol>,
    pub div: Rc<Symbol>,
    pub lt: Rc<Symbol>,
    pub lte: Rc<Symbol>,
    pub gt: Rc<Symbol>,
    pub gte: Rc<Symbol>,
    pub equals: Rc<Symbol>,
    pub and: Rc<Symbol>,
    pub or: Rc<Symbol>,
    /// The canonical truth symbol; its value slot is itself.
    pub t: Rc<Symbol>,
    /// The nil symbol; its value slot is the nil value.
    pub nil: Rc<Symbol>,
}

/// The interpreter: package registry, the two stacks, and the distinguished
/// state symbols. There is exactly one execution context per `Vm`.
pub struct Vm {
    pub data_stack: Vec<Value>,
    pub call_stack: Vec<Value>,
    packages: Vec<Rc<Package>>,
    current_package: Rc<Package>,
    lisp_package: Rc<Package>,
    keyword_package: Rc<Package>,
    user_package: Rc<Package>,
    impl_package: Rc<Package>,
    /// `impl:current-function` — value slot holds the executing function.
    f_sym: Rc<Symbol>,
    /// `impl:instruction-index` — value slot holds the instruction index.
    i_sym: Rc<Symbol>,
    pub syms: Syms,
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

impl Vm {
    /// Bootstrap the registry: the lisp/keyword/user/impl packages, nil and
    /// t, the special-form symbols, the distinguished state symbols, and
    /// the builtin functions.
    pub fn new() -> Vm {
        let lisp = Package::new("lisp", Vec::new());
        // nil comes first: everything else relies on it.
        let nil = intern(b"nil", &lisp);
        nil.export();
        nil.set_value(Value::Nil);

        let keyword = Package::new("keyword", Vec::new());
        let user = Package::new("user", vec![lisp.clone()]);
        let impl_ = Package::new("impl", Vec::new());

        let lisp_sym = |name: &str| {
            let sym = intern(name.as_bytes(), &lisp);
            sym.export();
            sym
        };
        let t = lisp_sym("t");
        t.set_value(Value::Symbol(t.clone()));
        let syms = Syms {
            quote: lisp_sym("quote"),
            quasiquote: lisp_sym("quasiquote"),
            unquote: lisp_sym("unquote"),
            unquote_splicing: lisp_sym("unquote-splicing"),
            cons: lisp_sym("cons"),
            car: lisp_sym("car"),
            cdr: lisp_sym("cdr"),
            progn: lisp_sym("progn"),
            drop: lisp_sym("drop"),
            let_: lisp_sym("let"),
            function: lisp_sym("function"),
            macro_: lisp_sym("macro"),
            symbol_value: lisp_sym("symbol-value"),
            symbol_function: lisp_sym("symbol-function"),
            set: lisp_sym("set"),
            set_symbol_function: lisp_sym("set-symbol-function"),
            if_: lisp_sym("if"),
            print: lisp_sym("print"),
            list: lisp_sym("list"),
            call: lisp_sym("call"),
            add: lisp_sym("+"),
            sub: lisp_sym("-"),
            mul: lisp_sym("*"),
            div: lisp_sym("/"),
            lt: lisp_sym("<"),
            lte: lisp_sym("<="),
            gt: lisp_sym(">"),
            gte: lisp_sym(">="),
            equals: lisp_sym("="),
            and: lisp_sym("and"),
            or: lisp_sym("or"),
            t,
            nil,
        };

        let impl_sym = |name: &str| {
            let sym = intern(name.as_bytes(), &impl_);
            sym.export();
            sym
        };
        let f_sym = impl_sym("current-function");
        f_sym.set_value(Value::Nil);
        let i_sym = impl_sym("instruction-index");
        i_sym.set_value(Value::Ufixnum(0));

        for builtin in Builtin::ALL {
            let sym = impl_sym(builtin.name());
            sym.set_function(Value::Function(Function::new_builtin(
                *builtin,
                builtin.nargs(),
            )));
        }

        Vm {
            data_stack: Vec::new(),
            call_stack: Vec::new(),
            packages: vec![user.clone(), lisp.clone(), keyword.clone(), impl_.clone()],
            current_package: user.clone(),
            lisp_package: lisp,
            keyword_package: keyword,
            user_package: user,
            impl_package: impl_,
            f_sym,
            i_sym,
            syms,
        }
    }

    //
    // --- Registry access ----------------------------------------------------
    //

    pub fn current_package(&self) -> Rc<Package> {
        self.current_package.clone()
    }

    pub fn lisp_package(&self) -> Rc<Package> {
        self.lisp_package.clone()
    }

    pub fn keyword_package(&self) -> Rc<Package> {
        self.keyword_package.clone()
    }

    pub fn user_package(&self) -> Rc<Package> {
        self.user_package.clone()
    }

    pub fn impl_package(&self) -> Rc<Package> {
        self.impl_package.clone()
    }

    pub fn packages(&self) -> &[Rc<Package>] {
        &self.packages
    }

    /// Search the process-wide package list by name.
    pub fn find_package(&self, name: &[u8]) -> Option<Rc<Package>> {
        self.packages.iter().find(|p| p.name() == name).cloned()
    }

    /// Find a package or create and register an empty one.
    pub fn find_or_create_package(&mut self, name: &[u8]) -> Rc<Package> {
        if let Some(p) = self.find_package(name) {
            return p;
        }
        let p = Package::new(&String::from_utf8_lossy(name), Vec::new());
        self.packages.push(p.clone());
        p
    }

    /// Convenience intern for host code and tests.
    pub fn intern_in(&self, name: &str, package: &Rc<Package>) -> Rc<Symbol> {
        intern(name.as_bytes(), package)
    }

    //
    // --- Execution state ----------------------------------------------------
    //

    fn current_function(&self) -> Result<Rc<Function>> {
        match self.f_sym.value() {
            Some(Value::Function(f)) => Ok(f),
            _ => Err(Error::runtime(
                "dispatch",
                "no current function is set",
                self.current_index(),
            )),
        }
    }

    /// The instruction index as last published to `impl:instruction-index`.
    pub fn current_index(&self) -> u64 {
        match self.i_sym.value() {
            Some(Value::Ufixnum(i)) => i,
            _ => 0,
        }
    }

    /// Read local slot `n` of the current frame.
    pub(crate) fn local(&self, n: u64) -> Result<Value> {
        let f = self.current_function()?;
        let frame = f.stack_size.get() + 2;
        let len = self.call_stack.len() as u64;
        if frame > len || n >= f.stack_size.get() {
            return Err(Error::runtime(
                "load-from-stack",
                format!("no local slot {n} in a frame of {}", f.stack_size.get()),
                self.current_index(),
            ));
        }
        Ok(self.call_stack[(len - frame + n) as usize].clone())
    }

    fn set_local(&mut self, n: u64, v: Value) -> Result<()> {
        let f = self.current_function()?;
        let frame = f.stack_size.get() + 2;
        let len = self.call_stack.len() as u64;
        if frame > len || n >= f.stack_size.get() {
            return Err(Error::runtime(
                "store-to-stack",
                format!("no local slot {n} in a frame of {}", f.stack_size.get()),
                self.current_index(),
            ));
        }
        self.call_stack[(len - frame + n) as usize] = v;
        Ok(())
    }

    fn truth(&self, b: bool) -> Value {
        if b {
            Value::Symbol(self.syms.t.clone())
        } else {
            Value::Nil
        }
    }

    //
    // --- Evaluation ---------------------------------------------------------
    //

    /// Run a function from instruction 0 with the given arguments; the
    /// result is the value its body leaves behind.
    pub fn eval(&mut self, f: &Rc<Function>, args: &[Value]) -> Result<Value> {
        self.eval_at_instruction(f, 0, args)
    }

    /// Run a function starting at an arbitrary instruction index.
    ///
    /// Pushes a frame whose saved index and function are both nil; the
    /// dispatch loop exits when `return-function` uncovers that sentinel
    /// (or the code runs out). The previous execution state is restored on
    /// the way out, so this nests freely.
    pub fn eval_at_instruction(&mut self, f: &Rc<Function>, index: u64, args: &[Value]) -> Result<Value> {
        let nargs = f.nargs.get() as usize;
        if args.len() < nargs {
            return Err(Error::runtime(
                "eval",
                format!("expected {} argument(s) but got {}", nargs, args.len()),
                index,
            ));
        }
        let saved_f = self.f_sym.value();
        let saved_i = self.i_sym.value();
        let saved_call_len = self.call_stack.len();
        let data_base = self.data_stack.len();

        for arg in &args[..nargs] {
            self.call_stack.push(arg.clone());
        }
        for _ in nargs..f.stack_size.get() as usize {
            self.call_stack.push(Value::Nil);
        }
        self.call_stack.push(Value::Nil); // sentinel saved index
        self.call_stack.push(Value::Nil); // sentinel saved function
        self.f_sym.set_value(Value::Function(f.clone()));
        self.i_sym.set_value(Value::Ufixnum(index));

        let result = match f.builtin.get() {
            Some(builtin) => {
                builtins::dispatch(self, builtin).map(|()| self.pop_result(data_base))
            }
            None => self.run(data_base),
        };

        if result.is_err() {
            // A fault can leave operands behind; do not let them leak into
            // the caller's view of the data stack.
            self.data_stack.truncate(data_base);
        }
        self.call_stack.truncate(saved_call_len);
        self.f_sym.set_value(saved_f.unwrap_or(Value::Nil));
        self.i_sym.set_value(saved_i.unwrap_or(Value::Ufixnum(0)));
        result
    }

    /// Pop the current frame. Returns the saved `(index, function)` pair,
    /// or `None` when the frame was a top-level sentinel.
    fn pop_frame(&mut self) -> Result<Option<(u64, Rc<Function>)>> {
        let f = self.current_function()?;
        let frame = f.stack_size.get() as usize + 2;
        let len = self.call_stack.len();
        if frame > len {
            return Err(Error::runtime(
                "return-function",
                "call stack underflow",
                self.current_index(),
            ));
        }
        let saved_f = self.call_stack[len - 1].clone();
        let saved_i = self.call_stack[len - 2].clone();
        self.call_stack.truncate(len - frame);
        match (saved_i, saved_f) {
            (Value::Nil, Value::Nil) => Ok(None),
            (Value::Ufixnum(i), Value::Function(f)) => Ok(Some((i, f))),
            _ => Err(Error::runtime(
                "return-function",
                "call stack frame is corrupt",
                self.current_index(),
            )),
        }
    }

    /// The result of this evaluation, without reaching below the data-stack
    /// height the caller started from.
    fn pop_result(&mut self, base: usize) -> Value {
        if self.data_stack.len() > base {
            self.data_stack.pop().unwrap_or(Value::Nil)
        } else {
            Value::Nil
        }
    }

    /// The fetch–decode–execute loop. Restarts from the distinguished
    /// symbols after every call or return; exits when a return uncovers the
    /// sentinel frame or the top-level code runs out.
    fn run(&mut self, base: usize) -> Result<Value> {
        'restart: loop {
            let f = self.current_function()?;
            let code = f.code.borrow().clone();
            let mut ip = self.current_index() as usize;

            while ip < code.len() {
                let at = ip as u64;
                let byte = code[ip];
                ip += 1;
                let op = Op::try_from(byte).map_err(|b| {
                    Error::runtime("dispatch", format!("unknown opcode {b}"), at)
                })?;
                match op {
                    Op::Drop => {
                        ops::pop(&mut self.data_stack, "drop", at)?;
                    }
                    Op::Dup => {
                        let v = ops::peek(&self.data_stack, "dup", at)?;
                        self.data_stack.push(v);
                    }
                    Op::Intern => {
                        let v = ops::pop(&mut self.data_stack, "intern", at)?;
                        let Value::Str(bytes) = &v else {
                            return Err(Error::runtime(
                                "intern",
                                format!("expected a string, was given a {}", v.type_name()),
                                at,
                            ));
                        };
                        let sym = intern(&bytes.borrow(), &self.current_package);
                        self.data_stack.push(Value::Symbol(sym));
                    }
                    Op::Cons => {
                        let cdr = ops::pop(&mut self.data_stack, "cons", at)?;
                        let car = ops::pop(&mut self.data_stack, "cons", at)?;
                        self.data_stack.push(Value::cons(car, cdr));
                    }
                    Op::Car => {
                        let v = ops::pop(&mut self.data_stack, "car", at)?;
                        self.data_stack.push(ops::car(&v, at)?);
                    }
                    Op::Cdr => {
                        let v = ops::pop(&mut self.data_stack, "cdr", at)?;
                        self.data_stack.push(ops::cdr(&v, at)?);
                    }
                    Op::Add => ops::binary_arith(&mut self.data_stack, ops::Arith::Add, at)?,
                    Op::Sub => ops::binary_arith(&mut self.data_stack, ops::Arith::Sub, at)?,
                    Op::Mul => ops::binary_arith(&mut self.data_stack, ops::Arith::Mul, at)?,
                    Op::Div => ops::binary_arith(&mut self.data_stack, ops::Arith::Div, at)?,
                    Op::Addi => {
                        let k = read_uint(&code, &mut ip)?;
                        ops::immediate_arith(&mut self.data_stack, ops::Arith::Add, k, at)?;
                    }
                    Op::Subi => {
                        let k = read_uint(&code, &mut ip)?;
                        ops::immediate_arith(&mut self.data_stack, ops::Arith::Sub, k, at)?;
                    }
                    Op::List => {
                        let n = read_uint(&code, &mut ip)?;
                        let mut out = Value::Nil;
                        for _ in 0..n {
                            let v = ops::pop(&mut self.data_stack, "list", at)?;
                            out = Value::cons(v, out);
                        }
                        self.data_stack.push(out);
                    }
                    Op::LoadNil => self.data_stack.push(Value::Nil),
                    Op::Const => {
                        let i = read_uint(&code, &mut ip)?;
                        self.data_stack.push(ops::constant(&f, i, at)?);
                    }
                    Op::Const0 => self.data_stack.push(ops::constant(&f, 0, at)?),
                    Op::Const1 => self.data_stack.push(ops::constant(&f, 1, at)?),
                    Op::Const2 => self.data_stack.push(ops::constant(&f, 2, at)?),
                    Op::Const3 => self.data_stack.push(ops::constant(&f, 3, at)?),
                    Op::PushArg => {
                        let v = ops::pop(&mut self.data_stack, "push-arg", at)?;
                        self.call_stack.push(v);
                    }
                    Op::PushArgs => {
                        let n = read_uint(&code, &mut ip)?;
                        for _ in 0..n {
                            let v = ops::pop(&mut self.data_stack, "push-args", at)?;
                            self.call_stack.push(v);
                        }
                    }
                    Op::Print => {
                        let v = ops::pop(&mut self.data_stack, "print", at)?;
                        print!("{}", to_string(&v));
                    }
                    Op::PrintNl => println!(),
                    Op::Eq => {
                        let b = ops::pop(&mut self.data_stack, "eq", at)?;
                        let a = ops::pop(&mut self.data_stack, "eq", at)?;
                        let t = self.truth(equals(&a, &b));
                        self.data_stack.push(t);
                    }
                    Op::And => {
                        let b = ops::pop(&mut self.data_stack, "and", at)?;
                        let a = ops::pop(&mut self.data_stack, "and", at)?;
                        let out = if !a.is_nil() && !b.is_nil() { b } else { Value::Nil };
                        self.data_stack.push(out);
                    }
                    Op::Or => {
                        let b = ops::pop(&mut self.data_stack, "or", at)?;
                        let a = ops::pop(&mut self.data_stack, "or", at)?;
                        let out = if !a.is_nil() { a } else if !b.is_nil() { b } else { Value::Nil };
                        self.data_stack.push(out);
                    }
                    Op::Gt => {
                        let t = ops::binary_compare(&mut self.data_stack, ops::Compare::Gt, at)?;
                        let t = self.truth(t);
                        self.data_stack.push(t);
                    }
                    Op::Gte => {
                        let t = ops::binary_compare(&mut self.data_stack, ops::Compare::Gte, at)?;
                        let t = self.truth(t);
                        self.data_stack.push(t);
                    }
                    Op::Lt => {
                        let t = ops::binary_compare(&mut self.data_stack, ops::Compare::Lt, at)?;
                        let t = self.truth(t);
                        self.data_stack.push(t);
                    }
                    Op::Lte => {
                        let t = ops::binary_compare(&mut self.data_stack, ops::Compare::Lte, at)?;
                        let t = self.truth(t);
                        self.data_stack.push(t);
                    }
                    Op::Lti => {
                        let k = read_uint(&code, &mut ip)?;
                        let x = ops::pop(&mut self.data_stack, "lti", at)?;
                        let b = ops::compare(&x, &Value::Fixnum(k as i64), ops::Compare::Lt, "lti", at)?;
                        let t = self.truth(b);
                        self.data_stack.push(t);
                    }
                    Op::SetSymbolValue => {
                        let val = ops::pop(&mut self.data_stack, "set-symbol-value", at)?;
                        let sym = ops::peek(&self.data_stack, "set-symbol-value", at)?;
                        let Value::Symbol(sym) = sym else {
                            return Err(Error::runtime(
                                "set-symbol-value",
                                format!("expected a symbol, was given a {}", sym.type_name()),
                                at,
                            ));
                        };
                        sym.set_value(val);
                    }
                    Op::SetSymbolFunction => {
                        let val = ops::pop(&mut self.data_stack, "set-symbol-function", at)?;
                        let sym = ops::pop(&mut self.data_stack, "set-symbol-function", at)?;
                        let Value::Symbol(sym) = sym else {
                            return Err(Error::runtime(
                                "set-symbol-function",
                                format!("expected a symbol, was given a {}", sym.type_name()),
                                at,
                            ));
                        };
                        sym.set_function(val.clone());
                        self.data_stack.push(val);
                    }
                    Op::SymbolValue => {
                        let v = ops::pop(&mut self.data_stack, "symbol-value", at)?;
                        self.data_stack.push(ops::symbol_value(&v, at)?);
                    }
                    Op::SymbolFunction => {
                        let v = ops::pop(&mut self.data_stack, "symbol-function", at)?;
                        self.data_stack.push(ops::symbol_function(&v, at)?);
                    }
                    Op::Jump => {
                        let (offset, base) = read_s16(&code, &mut ip)?;
                        ip = ops::jump_target(base, offset, code.len(), at)?;
                    }
                    Op::JumpWhenNil => {
                        let (offset, base) = read_s16(&code, &mut ip)?;
                        let cond = ops::pop(&mut self.data_stack, "jump-when-nil", at)?;
                        if cond.is_nil() {
                            ip = ops::jump_target(base, offset, code.len(), at)?;
                        }
                    }
                    Op::LoadFromStack => {
                        let j = read_uint(&code, &mut ip)?;
                        let v = self.local(j)?;
                        self.data_stack.push(v);
                    }
                    Op::LoadFromStack0 => {
                        let v = self.local(0)?;
                        self.data_stack.push(v);
                    }
                    Op::LoadFromStack1 => {
                        let v = self.local(1)?;
                        self.data_stack.push(v);
                    }
                    Op::StoreToStack => {
                        let j = read_uint(&code, &mut ip)?;
                        let v = ops::pop(&mut self.data_stack, "store-to-stack", at)?;
                        self.set_local(j, v)?;
                    }
                    Op::StoreToStack0 => {
                        let v = ops::pop(&mut self.data_stack, "store-to-stack", at)?;
                        self.set_local(0, v)?;
                    }
                    Op::StoreToStack1 => {
                        let v = ops::pop(&mut self.data_stack, "store-to-stack", at)?;
                        self.set_local(1, v)?;
                    }
                    Op::CallFunction | Op::CallSymbolFunction => {
                        let n = read_uint(&code, &mut ip)?;
                        let callee = ops::pop(&mut self.data_stack, op.name(), at)?;
                        let target = match (op, &callee) {
                            (Op::CallFunction, Value::Function(f)) => f.clone(),
                            (Op::CallSymbolFunction, Value::Symbol(_)) => {
                                match ops::symbol_function(&callee, at)? {
                                    Value::Function(f) => f,
                                    other => {
                                        return Err(Error::runtime(
                                            op.name(),
                                            format!(
                                                "function slot holds a {}, not a function",
                                                other.type_name()
                                            ),
                                            at,
                                        ))
                                    }
                                }
                            }
                            _ => {
                                return Err(Error::runtime(
                                    op.name(),
                                    format!("cannot call a {}", callee.type_name()),
                                    at,
                                ))
                            }
                        };
                        self.enter_call(&f, &target, n, ip, at)?;
                        if let Some(builtin) = target.builtin.get() {
                            builtins::dispatch(self, builtin)?;
                            match self.pop_frame()? {
                                Some((i, caller)) => {
                                    self.i_sym.set_value(Value::Ufixnum(i));
                                    self.f_sym.set_value(Value::Function(caller));
                                }
                                None => return Ok(self.pop_result(base)),
                            }
                        }
                        continue 'restart;
                    }
                    Op::ReturnFunction => match self.pop_frame()? {
                        Some((i, caller)) => {
                            self.i_sym.set_value(Value::Ufixnum(i));
                            self.f_sym.set_value(Value::Function(caller));
                            continue 'restart;
                        }
                        None => return Ok(self.pop_result(base)),
                    },
                }
            }

            // Ran off the end of the top-level code: the result (if any) is
            // whatever the code left on the data stack.
            self.i_sym.set_value(Value::Ufixnum(ip as u64));
            return Ok(self.pop_result(base));
        }
    }

    /// Build the callee's frame: move `n` arguments from the data stack to
    /// the call stack in order, reserve nil temporaries, save the return
    /// state, and publish the callee as current.
    fn enter_call(
        &mut self,
        caller: &Rc<Function>,
        target: &Rc<Function>,
        n: u64,
        resume_ip: usize,
        at: u64,
    ) -> Result<()> {
        let nargs = target.nargs.get();
        if n != nargs {
            return Err(Error::runtime(
                "call-function",
                format!(
                    "{} takes {} argument(s) but was called with {n}",
                    target
                        .name
                        .borrow()
                        .as_ref()
                        .map(|s| s.qualified_name())
                        .unwrap_or_else(|| "an anonymous function".to_string()),
                    nargs
                ),
                at,
            ));
        }
        trace!(
            nargs,
            stack_size = target.stack_size.get(),
            builtin = target.builtin.get().is_some(),
            "entering call"
        );
        let len = self.data_stack.len();
        if (n as usize) > len {
            return Err(Error::runtime("call-function", "data stack underflow", at));
        }
        // The n arguments sit in order below the (already popped) callee.
        self.call_stack.extend(self.data_stack.drain(len - n as usize..));
        for _ in nargs..target.stack_size.get() {
            self.call_stack.push(Value::Nil);
        }
        self.call_stack.push(Value::Ufixnum(resume_ip as u64));
        self.call_stack.push(Value::Function(caller.clone()));
        self.f_sym.set_value(Value::Function(target.clone()));
        self.i_sym.set_value(Value::Ufixnum(0));
        Ok(())
    }
}
