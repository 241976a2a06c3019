//! # Builtin Functions
//!
//! Builtins appear to the language as ordinary function values whose
//! builtin tag is set. The call path builds a normal frame for them, then
//! routes here instead of into bytecode; handlers read their arguments from
//! the frame's local slots and push one result onto the data stack.
//!
//! `compile` and `eval` re-enter the compiler and the VM, which is what
//! makes compile-time macro expansion work from inside running code.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::symbols::Package;
use crate::value::{Function, Value};
use crate::vm::Vm;

/// The builtin handlers, keyed into function values by this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    /// `(compile expr function symbol-table function-symbol-table)`
    Compile,
    /// `(eval function instruction-index)`
    Eval,
    /// `(type-of value)`
    TypeOf,
    /// `(find-package name)`
    FindPackage,
    /// `(package-symbols package)`
    PackageSymbols,
    /// `(call function-or-symbol)`
    Call,
    /// `(use-package package)`
    UsePackage,
}

impl Builtin {
    pub const ALL: &'static [Builtin] = &[
        Builtin::Compile,
        Builtin::Eval,
        Builtin::TypeOf,
        Builtin::FindPackage,
        Builtin::PackageSymbols,
        Builtin::Call,
        Builtin::UsePackage,
    ];

    /// The symbol this builtin is bound to in the impl package.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Compile => "compile",
            Builtin::Eval => "eval",
            Builtin::TypeOf => "type-of",
            Builtin::FindPackage => "find-package",
            Builtin::PackageSymbols => "package-symbols",
            Builtin::Call => "call",
            Builtin::UsePackage => "use-package",
        }
    }

    pub fn nargs(self) -> u64 {
        match self {
            Builtin::Compile => 4,
            Builtin::Eval => 2,
            Builtin::TypeOf
            | Builtin::FindPackage
            | Builtin::PackageSymbols
            | Builtin::Call
            | Builtin::UsePackage => 1,
        }
    }
}

/// A package name given as a string, or a symbol standing in for its name.
fn string_designator(v: &Value, operation: &'static str, at: u64) -> Result<Vec<u8>> {
    match v {
        Value::Str(b) => Ok(b.borrow().clone()),
        Value::Symbol(s) => Ok(s.name().to_vec()),
        other => Err(Error::runtime(
            operation,
            format!("expected a string designator, was given a {}", other.type_name()),
            at,
        )),
    }
}

fn package_arg(v: &Value, vm: &Vm, operation: &'static str, at: u64) -> Result<Rc<Package>> {
    match v {
        Value::Package(p) => Ok(p.clone()),
        other => {
            let name = string_designator(other, operation, at)?;
            vm.find_package(&name).ok_or_else(|| {
                Error::runtime(
                    operation,
                    format!("there is no package \"{}\"", String::from_utf8_lossy(&name)),
                    at,
                )
            })
        }
    }
}

/// Run a builtin against the current frame, pushing its result.
pub(super) fn dispatch(vm: &mut Vm, builtin: Builtin) -> Result<()> {
    let at = vm.current_index();
    let result = match builtin {
        Builtin::FindPackage => {
            let name = string_designator(&vm.local(0)?, "find-package", at)?;
            match vm.find_package(&name) {
                Some(p) => Value::Package(p),
                None => Value::Nil,
            }
        }
        Builtin::PackageSymbols => {
            let package = package_arg(&vm.local(0)?, vm, "package-symbols", at)?;
            let symbols: Vec<Value> = package
                .symbols()
                .into_iter()
                .map(Value::Symbol)
                .collect();
            Value::list(&symbols)
        }
        Builtin::TypeOf => {
            let name = vm.local(0)?.type_name();
            Value::Symbol(vm.intern_in(name, &vm.impl_package()))
        }
        Builtin::UsePackage => {
            let package = package_arg(&vm.local(0)?, vm, "use-package", at)?;
            vm.current_package().add_use(package);
            Value::Nil
        }
        Builtin::Call => {
            let callee = vm.local(0)?;
            let function = resolve_callee(&callee, at)?;
            vm.eval(&function, &[])?
        }
        Builtin::Eval => {
            let function = match vm.local(0)? {
                Value::Function(f) => f,
                other => {
                    return Err(Error::runtime(
                        "eval",
                        format!("expected a function, was given a {}", other.type_name()),
                        at,
                    ))
                }
            };
            let index = match vm.local(1)? {
                Value::Nil => 0,
                Value::Fixnum(i) if i >= 0 => i as u64,
                Value::Ufixnum(i) => i,
                other => {
                    return Err(Error::runtime(
                        "eval",
                        format!(
                            "expected an instruction index, was given a {}",
                            other.type_name()
                        ),
                        at,
                    ))
                }
            };
            vm.eval_at_instruction(&function, index, &[])?
        }
        Builtin::Compile => {
            let expr = vm.local(0)?;
            let function = match vm.local(1)? {
                Value::Nil => None,
                Value::Function(f) => Some(f),
                other => {
                    return Err(Error::runtime(
                        "compile",
                        format!(
                            "expected a function or nil, was given a {}",
                            other.type_name()
                        ),
                        at,
                    ))
                }
            };
            let st = vm.local(2)?;
            let fst = vm.local(3)?;
            let compiled = crate::compiler::compile(&expr, function, &st, &fst, vm)
                .map_err(|e| Error::runtime("compile", e.to_string(), at))?;
            Value::Function(compiled)
        }
    };
    vm.data_stack.push(result);
    Ok(())
}

fn resolve_callee(v: &Value, at: u64) -> Result<Rc<Function>> {
    match v {
        Value::Function(f) => Ok(f.clone()),
        Value::Symbol(s) => match s.function() {
            Some(Value::Function(f)) => Ok(f),
            Some(other) => Err(Error::runtime(
                "call",
                format!("function slot holds a {}, not a function", other.type_name()),
                at,
            )),
            None => Err(Error::runtime(
                "call",
                format!("symbol {} has no function", s.qualified_name()),
                at,
            )),
        },
        other => Err(Error::runtime(
            "call",
            format!("cannot call a {}", other.type_name()),
            at,
        )),
    }
}
