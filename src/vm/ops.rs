//! # Arithmetic, Comparison, and Accessor Operations
//!
//! Stack-machine semantics for the operand-consuming instructions. Each
//! helper pops its operands (right operand first), performs the operation,
//! and either pushes or returns the result, reporting faults as runtime
//! errors carrying the instruction index.
//!
//! ## Numeric promotion
//! Arithmetic and comparison operate on fixnums in the common case. When
//! either operand is a flonum the other is promoted and the operation runs
//! in floating point. A mixed fixnum/ufixnum pair runs signed unless the
//! ufixnum exceeds the signed range, in which case both sides promote to
//! flonums. Arithmetic on any non-number is a fatal error. Division is
//! truncated; integer division by zero is an error.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::value::{Function, Value};

/// Pop one operand, reporting underflow against the named operation.
pub(super) fn pop(stack: &mut Vec<Value>, operation: &'static str, at: u64) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| Error::runtime(operation, "data stack underflow", at))
}

/// Clone the top of the stack without removing it.
pub(super) fn peek(stack: &[Value], operation: &'static str, at: u64) -> Result<Value> {
    stack
        .last()
        .cloned()
        .ok_or_else(|| Error::runtime(operation, "data stack underflow", at))
}

/// Fetch constant `i` of the running function.
pub(super) fn constant(f: &Rc<Function>, i: u64, at: u64) -> Result<Value> {
    let constants = f.constants.borrow();
    constants.get(i as usize).cloned().ok_or_else(|| {
        Error::runtime(
            "const",
            format!(
                "constant index {i} is out of bounds ({} constants)",
                constants.len()
            ),
            at,
        )
    })
}

pub(super) fn car(v: &Value, at: u64) -> Result<Value> {
    match v {
        Value::Nil => Ok(Value::Nil),
        Value::Cons(c) => Ok(c.car.clone()),
        other => Err(Error::runtime(
            "car",
            format!("can only take the car of a list, was given a {}", other.type_name()),
            at,
        )),
    }
}

pub(super) fn cdr(v: &Value, at: u64) -> Result<Value> {
    match v {
        Value::Nil => Ok(Value::Nil),
        Value::Cons(c) => Ok(c.cdr.clone()),
        other => Err(Error::runtime(
            "cdr",
            format!("can only take the cdr of a list, was given a {}", other.type_name()),
            at,
        )),
    }
}

/// Read a symbol's value slot; an unset slot is a fatal error naming the
/// symbol.
pub(super) fn symbol_value(v: &Value, at: u64) -> Result<Value> {
    let Value::Symbol(sym) = v else {
        return Err(Error::runtime(
            "symbol-value",
            format!("expected a symbol, was given a {}", v.type_name()),
            at,
        ));
    };
    sym.value().ok_or_else(|| {
        Error::runtime(
            "symbol-value",
            format!("symbol {} has no value", sym.qualified_name()),
            at,
        )
    })
}

/// Read a symbol's function slot; an unset slot is a fatal error naming the
/// symbol.
pub(super) fn symbol_function(v: &Value, at: u64) -> Result<Value> {
    let Value::Symbol(sym) = v else {
        return Err(Error::runtime(
            "symbol-function",
            format!("expected a symbol, was given a {}", v.type_name()),
            at,
        ));
    };
    sym.function().ok_or_else(|| {
        Error::runtime(
            "symbol-function",
            format!("symbol {} has no function", sym.qualified_name()),
            at,
        )
    })
}

/// Bounds-checked jump resolution: the new instruction index must land
/// inside the code (one past the end halts cleanly).
pub(super) fn jump_target(base: usize, offset: i16, code_len: usize, at: u64) -> Result<usize> {
    let target = base as i64 + offset as i64;
    if target < 0 || target > code_len as i64 {
        return Err(Error::runtime(
            "jump",
            format!("jump to {target} is outside the code (length {code_len})"),
            at,
        ));
    }
    Ok(target as usize)
}

#[derive(Clone, Copy)]
pub(super) enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

impl Arith {
    fn name(self) -> &'static str {
        match self {
            Arith::Add => "add",
            Arith::Sub => "sub",
            Arith::Mul => "mul",
            Arith::Div => "div",
        }
    }
}

#[derive(Clone, Copy)]
pub(super) enum Compare {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Compare {
    fn name(self) -> &'static str {
        match self {
            Compare::Lt => "lt",
            Compare::Lte => "lte",
            Compare::Gt => "gt",
            Compare::Gte => "gte",
        }
    }
}

/// Both operands promoted to a common numeric representation.
enum Pair {
    Fix(i64, i64),
    Ufix(u64, u64),
    Flo(f64, f64),
}

fn promote(a: &Value, b: &Value, operation: &'static str, at: u64) -> Result<Pair> {
    let fault = |v: &Value| {
        Error::runtime(
            operation,
            format!("expected a number, was given a {}", v.type_name()),
            at,
        )
    };
    Ok(match (a, b) {
        (Value::Fixnum(x), Value::Fixnum(y)) => Pair::Fix(*x, *y),
        (Value::Ufixnum(x), Value::Ufixnum(y)) => Pair::Ufix(*x, *y),
        (Value::Fixnum(x), Value::Ufixnum(y)) => {
            if *y <= i64::MAX as u64 {
                Pair::Fix(*x, *y as i64)
            } else {
                Pair::Flo(*x as f64, *y as f64)
            }
        }
        (Value::Ufixnum(x), Value::Fixnum(y)) => {
            if *x <= i64::MAX as u64 {
                Pair::Fix(*x as i64, *y)
            } else {
                Pair::Flo(*x as f64, *y as f64)
            }
        }
        (Value::Flonum(x), Value::Flonum(y)) => Pair::Flo(*x, *y),
        (Value::Flonum(x), Value::Fixnum(y)) => Pair::Flo(*x, *y as f64),
        (Value::Flonum(x), Value::Ufixnum(y)) => Pair::Flo(*x, *y as f64),
        (Value::Fixnum(x), Value::Flonum(y)) => Pair::Flo(*x as f64, *y),
        (Value::Ufixnum(x), Value::Flonum(y)) => Pair::Flo(*x as f64, *y),
        (x, y) => {
            let offender = if matches!(
                x,
                Value::Fixnum(_) | Value::Ufixnum(_) | Value::Flonum(_)
            ) {
                y
            } else {
                x
            };
            return Err(fault(offender));
        }
    })
}

fn apply(pair: Pair, op: Arith, at: u64) -> Result<Value> {
    Ok(match (pair, op) {
        (Pair::Fix(x, y), Arith::Add) => Value::Fixnum(x.wrapping_add(y)),
        (Pair::Fix(x, y), Arith::Sub) => Value::Fixnum(x.wrapping_sub(y)),
        (Pair::Fix(x, y), Arith::Mul) => Value::Fixnum(x.wrapping_mul(y)),
        (Pair::Fix(x, y), Arith::Div) => {
            if y == 0 {
                return Err(Error::runtime("div", "division by zero", at));
            }
            Value::Fixnum(x.wrapping_div(y))
        }
        (Pair::Ufix(x, y), Arith::Add) => Value::Ufixnum(x.wrapping_add(y)),
        (Pair::Ufix(x, y), Arith::Sub) => Value::Ufixnum(x.wrapping_sub(y)),
        (Pair::Ufix(x, y), Arith::Mul) => Value::Ufixnum(x.wrapping_mul(y)),
        (Pair::Ufix(x, y), Arith::Div) => {
            if y == 0 {
                return Err(Error::runtime("div", "division by zero", at));
            }
            Value::Ufixnum(x / y)
        }
        (Pair::Flo(x, y), Arith::Add) => Value::Flonum(x + y),
        (Pair::Flo(x, y), Arith::Sub) => Value::Flonum(x - y),
        (Pair::Flo(x, y), Arith::Mul) => Value::Flonum(x * y),
        (Pair::Flo(x, y), Arith::Div) => Value::Flonum(x / y),
    })
}

/// `( x y -- x·y )` for the two-operand arithmetic opcodes.
pub(super) fn binary_arith(stack: &mut Vec<Value>, op: Arith, at: u64) -> Result<()> {
    let b = pop(stack, op.name(), at)?;
    let a = pop(stack, op.name(), at)?;
    let out = apply(promote(&a, &b, op.name(), at)?, op, at)?;
    stack.push(out);
    Ok(())
}

/// `addi`/`subi`: fold an unsigned immediate into the top of the stack.
pub(super) fn immediate_arith(stack: &mut Vec<Value>, op: Arith, k: u64, at: u64) -> Result<()> {
    let a = pop(stack, op.name(), at)?;
    let b = Value::Fixnum(k as i64);
    let out = apply(promote(&a, &b, op.name(), at)?, op, at)?;
    stack.push(out);
    Ok(())
}

/// Numeric comparison with the same promotion rules as arithmetic.
pub(super) fn compare(
    a: &Value,
    b: &Value,
    op: Compare,
    operation: &'static str,
    at: u64,
) -> Result<bool> {
    Ok(match (promote(a, b, operation, at)?, op) {
        (Pair::Fix(x, y), Compare::Lt) => x < y,
        (Pair::Fix(x, y), Compare::Lte) => x <= y,
        (Pair::Fix(x, y), Compare::Gt) => x > y,
        (Pair::Fix(x, y), Compare::Gte) => x >= y,
        (Pair::Ufix(x, y), Compare::Lt) => x < y,
        (Pair::Ufix(x, y), Compare::Lte) => x <= y,
        (Pair::Ufix(x, y), Compare::Gt) => x > y,
        (Pair::Ufix(x, y), Compare::Gte) => x >= y,
        (Pair::Flo(x, y), Compare::Lt) => x < y,
        (Pair::Flo(x, y), Compare::Lte) => x <= y,
        (Pair::Flo(x, y), Compare::Gt) => x > y,
        (Pair::Flo(x, y), Compare::Gte) => x >= y,
    })
}

/// `( x y -- bool )` for the two-operand comparison opcodes.
pub(super) fn binary_compare(stack: &mut Vec<Value>, op: Compare, at: u64) -> Result<bool> {
    let b = pop(stack, op.name(), at)?;
    let a = pop(stack, op.name(), at)?;
    compare(&a, &b, op, op.name(), at)
}
