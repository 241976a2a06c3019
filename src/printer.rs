//! # Value Printing
//!
//! Renders values back to text. [`to_string`] is the display form used by
//! the `print` opcode (strings appear raw); [`to_repr`] is the re-readable
//! form used by the REPL and inside aggregates (strings are quoted and
//! escaped, so `print(read(s))` agrees with `s` up to whitespace).
//!
//! Improper list tails use the dotted-pair presentation: `(1 2 . 3)`.

use crate::value::Value;

/// Display form: strings render as raw bytes.
pub fn to_string(v: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v, false);
    out
}

/// Re-readable form: strings render quoted with escapes.
pub fn to_repr(v: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, v, true);
    out
}

fn write_value(out: &mut String, v: &Value, repr: bool) {
    match v {
        Value::Nil => out.push_str("nil"),
        Value::Fixnum(n) => out.push_str(&n.to_string()),
        Value::Ufixnum(n) => out.push_str(&n.to_string()),
        Value::Flonum(f) => write_flonum(out, *f),
        Value::Cons(_) => write_list(out, v),
        Value::Str(b) => {
            if repr {
                write_quoted(out, &b.borrow());
            } else {
                out.push_str(&String::from_utf8_lossy(&b.borrow()));
            }
        }
        Value::ByteArray(b) => {
            out.push('[');
            for (i, byte) in b.borrow().iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(&format!("{byte:#04X}"));
            }
            out.push(']');
        }
        Value::Array(values) => {
            out.push('[');
            for (i, item) in values.borrow().iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_value(out, item, true);
            }
            out.push(']');
        }
        Value::Symbol(s) => out.push_str(&s.name_string()),
        Value::Package(p) => {
            out.push_str("<package \"");
            out.push_str(&p.name_string());
            out.push_str("\">");
        }
        Value::Function(f) => {
            out.push_str("<function ");
            write_value(out, &Value::Array(std::rc::Rc::new(std::cell::RefCell::new(
                f.constants.borrow().clone(),
            ))), true);
            out.push(' ');
            write_value(out, &Value::byte_array(f.code.borrow().clone()), true);
            out.push('>');
        }
        Value::Vec2(x, y) => {
            out.push('<');
            write_flonum(out, *x);
            out.push(' ');
            write_flonum(out, *y);
            out.push('>');
        }
        Value::File(f) => {
            out.push_str("<file \"");
            out.push_str(&f.borrow().path);
            out.push_str("\">");
        }
        Value::Enumerator(e) => {
            let e = e.borrow();
            out.push_str("<enumerator ");
            out.push_str(&e.index.to_string());
            out.push('>');
        }
        Value::Pointer(p) => out.push_str(&format!("<pointer {p:#x}>")),
    }
}

fn write_list(out: &mut String, v: &Value) {
    out.push('(');
    let mut cursor = v;
    let mut first = true;
    loop {
        match cursor {
            Value::Cons(c) => {
                if !first {
                    out.push(' ');
                }
                first = false;
                write_value(out, &c.car, true);
                cursor = &c.cdr;
            }
            Value::Nil => break,
            tail => {
                out.push_str(" . ");
                write_value(out, tail, true);
                break;
            }
        }
    }
    out.push(')');
}

fn write_quoted(out: &mut String, bytes: &[u8]) {
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            other => out.push(other as char),
        }
    }
    out.push('"');
}

/// Flonums always show a decimal point or exponent so they re-read as
/// flonums; non-finite values use the spelled-out forms.
fn write_flonum(out: &mut String, f: f64) {
    if f.is_nan() {
        out.push_str("NaN");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "Infinity" } else { "-Infinity" });
    } else {
        out.push_str(&format!("{f:?}"));
    }
}
