//! # S-Expression Reader
//!
//! Consumes a byte stream and produces one value per call. Whitespace
//! separates tokens; the priority characters `"`, `)`, and `'` terminate a
//! token even without surrounding whitespace.
//!
//! Dispatch on the first non-whitespace byte:
//! - `"` — string literal with `\\ \" \n \r \t` escapes
//! - `(` — list, read recursively until `)`
//! - `'`, `` ` ``, `,`, `,@` — reader macros for `quote`, `quasiquote`,
//!   `unquote`, `unquote-splicing`
//! - `:` — keyword: re-read the rest into the keyword package
//! - otherwise — a token, parsed speculatively as a number
//!
//! A token is a number iff it contains at least one digit and matches the
//! signed-integer or decimal patterns (optional fraction, optional
//! `e[±]exponent`). The lone characters `+` `-` `.` `e` stay symbols. An
//! unprefixed token interns into the supplied package; `pkg:name` looks up
//! an external symbol and `pkg::name` an internal one, both failing when
//! the symbol does not exist.
//!
//! Digits accumulate into a fixnum; on overflow the magnitude re-accumulates
//! as a flonum. Exponents apply as a final multiplication or division by a
//! power of ten.

use crate::error::{Error, Result};
use crate::stream::ByteStream;
use crate::symbols::find_symbol;
use crate::value::Value;
use crate::vm::Vm;

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\r' | b'\n')
}

/// Characters that end a token without being part of it.
fn is_priority(c: u8) -> bool {
    matches!(c, b'"' | b')' | b'\'')
}

fn skip_whitespace(s: &ByteStream) -> Result<()> {
    while s.has_more()? && is_whitespace(s.peek_byte()?) {
        s.read_byte()?;
    }
    Ok(())
}

/// Read one value from the stream, interning unprefixed symbols into
/// `package`. The stream cursor advances past the value.
pub fn read(s: &ByteStream, package: &std::rc::Rc<crate::symbols::Package>, vm: &Vm) -> Result<Value> {
    skip_whitespace(s)?;
    if !s.has_more()? {
        return Err(Error::Read("input ended before a value".to_string()));
    }
    let c = s.peek_byte()?;

    if c == b'"' {
        read_string_literal(s)
    } else if c == b'(' {
        read_list(s, package, vm)
    } else if c == b':' {
        s.read_byte()?;
        read(s, &vm.keyword_package(), vm)
    } else if c == b'\'' {
        s.read_byte()?;
        Ok(reader_macro(&vm.syms.quote, read(s, package, vm)?))
    } else if c == b'`' {
        s.read_byte()?;
        Ok(reader_macro(&vm.syms.quasiquote, read(s, package, vm)?))
    } else if c == b',' {
        s.read_byte()?;
        if s.has_more()? && s.peek_byte()? == b'@' {
            s.read_byte()?;
            Ok(reader_macro(&vm.syms.unquote_splicing, read(s, package, vm)?))
        } else {
            Ok(reader_macro(&vm.syms.unquote, read(s, package, vm)?))
        }
    } else {
        read_token(s, package, vm)
    }
}

/// Read every value in the stream until it is exhausted.
pub fn read_all(s: &ByteStream, package: &std::rc::Rc<crate::symbols::Package>, vm: &Vm) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    loop {
        skip_whitespace(s)?;
        if !s.has_more()? {
            return Ok(out);
        }
        out.push(read(s, package, vm)?);
    }
}

fn reader_macro(head: &std::rc::Rc<crate::symbols::Symbol>, arg: Value) -> Value {
    Value::cons(Value::Symbol(head.clone()), Value::cons(arg, Value::Nil))
}

fn read_string_literal(s: &ByteStream) -> Result<Value> {
    s.read_byte()?; // opening quote
    let mut buf = Vec::new();
    loop {
        if !s.has_more()? {
            return Err(Error::Read("input ended inside a string literal".to_string()));
        }
        let c = s.read_byte()?;
        match c {
            b'"' => break,
            b'\\' => {
                if !s.has_more()? {
                    return Err(Error::Read(
                        "input ended after a backslash in a string literal".to_string(),
                    ));
                }
                let e = s.read_byte()?;
                buf.push(match e {
                    b'\\' | b'"' => e,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    other => {
                        return Err(Error::Read(format!(
                            "invalid escape sequence \"\\{}\"",
                            other as char
                        )))
                    }
                });
            }
            other => buf.push(other),
        }
    }
    Ok(Value::string_from_bytes(buf))
}

fn read_list(s: &ByteStream, package: &std::rc::Rc<crate::symbols::Package>, vm: &Vm) -> Result<Value> {
    s.read_byte()?; // opening paren
    let mut items = Vec::new();
    loop {
        skip_whitespace(s)?;
        if !s.has_more()? {
            return Err(Error::Read("input ended inside a list".to_string()));
        }
        if s.peek_byte()? == b')' {
            s.read_byte()?;
            return Ok(Value::list(&items));
        }
        items.push(read(s, package, vm)?);
    }
}

/// Token state while scanning a candidate number.
struct NumberScan {
    is_numeric: bool,
    is_flo: bool,
    has_mantissa: bool,
    has_e: bool,
    negative: bool,
    exponent_negative: bool,
    integral: Vec<u8>,
    mantissa: Vec<u8>,
    exponent: Vec<u8>,
    digits_seen: bool,
}

fn read_token(s: &ByteStream, package: &std::rc::Rc<crate::symbols::Package>, vm: &Vm) -> Result<Value> {
    let mut buf: Vec<u8> = Vec::new();
    let mut package_prefix: Option<Vec<u8>> = None;
    let mut is_internal = false;
    let mut scan = NumberScan {
        is_numeric: true,
        is_flo: false,
        has_mantissa: false,
        has_e: false,
        negative: false,
        exponent_negative: false,
        integral: Vec::new(),
        mantissa: Vec::new(),
        exponent: Vec::new(),
        digits_seen: false,
    };

    while s.has_more()? {
        let c = s.peek_byte()?;
        if is_whitespace(c) || is_priority(c) {
            break;
        }
        if scan.is_numeric {
            scan_number_byte(&mut scan, c, buf.len());
        }
        if !scan.is_numeric && c == b':' {
            if package_prefix.is_some() {
                return Err(Error::Read("too many colons in symbol".to_string()));
            }
            s.read_byte()?;
            if s.has_more()? && s.peek_byte()? == b':' {
                s.read_byte()?;
                is_internal = true;
            }
            package_prefix = Some(std::mem::take(&mut buf));
            continue;
        }
        buf.push(c);
        s.read_byte()?;
    }

    if buf.is_empty() && package_prefix.is_none() {
        return Err(Error::Read(format!(
            "unexpected character '{}'",
            s.peek_byte()? as char
        )));
    }

    // A lone dot, sign, or `e` is a symbol, not a malformed number.
    if buf.len() == 1 && matches!(buf[0], b'.' | b'+' | b'-' | b'e') {
        scan.is_numeric = false;
    }
    if !scan.digits_seen {
        scan.is_numeric = false;
    }

    if scan.is_numeric {
        return Ok(number_from_scan(&scan));
    }

    if let Some(prefix) = package_prefix {
        let package = vm.find_package(&prefix).ok_or_else(|| {
            Error::Read(format!(
                "there is no package \"{}\"",
                String::from_utf8_lossy(&prefix)
            ))
        })?;
        let sym = find_symbol(&buf, &package, is_internal).ok_or_else(|| {
            Error::Read(format!(
                "package \"{}\" has no {} symbol named \"{}\"",
                String::from_utf8_lossy(&prefix),
                if is_internal { "internal" } else { "external" },
                String::from_utf8_lossy(&buf)
            ))
        })?;
        return Ok(Value::Symbol(sym));
    }
    Ok(Value::Symbol(crate::symbols::intern(&buf, package)))
}

/// Update the scan state for one byte. Flips `is_numeric` off the first
/// time the byte cannot extend a number.
fn scan_number_byte(scan: &mut NumberScan, c: u8, position: usize) {
    if position == 0 && c == b'+' {
        return;
    }
    if position == 0 && c == b'-' {
        scan.negative = true;
        return;
    }
    if scan.has_e && scan.exponent.is_empty() && c == b'-' {
        scan.exponent_negative = true;
        return;
    }
    if scan.has_e && scan.exponent.is_empty() && c == b'+' {
        return;
    }
    if is_digit(c) {
        scan.digits_seen = true;
        if scan.has_e {
            scan.exponent.push(c);
        } else if scan.has_mantissa {
            scan.mantissa.push(c);
        } else {
            scan.integral.push(c);
        }
        return;
    }
    if c == b'.' {
        if scan.has_e || scan.has_mantissa {
            scan.is_numeric = false;
        } else {
            scan.has_mantissa = true;
            scan.is_flo = true;
        }
        return;
    }
    if c == b'e' {
        if scan.has_e {
            scan.is_numeric = false;
        } else {
            scan.has_e = true;
            scan.is_flo = true;
        }
        return;
    }
    scan.is_numeric = false;
}

/// Convert an accepted scan into a fixnum or flonum. Digits accumulate as a
/// fixnum first; overflow re-accumulates the magnitude as a flonum.
fn number_from_scan(scan: &NumberScan) -> Value {
    if scan.is_flo {
        let mut flo = accumulate_f64(&scan.integral);
        for (i, d) in scan.mantissa.iter().enumerate() {
            flo += f64::from(d - b'0') * 10f64.powi(-(i as i32) - 1);
        }
        if !scan.exponent.is_empty() {
            let mut exp: i64 = 0;
            for d in &scan.exponent {
                exp = exp.saturating_mul(10).saturating_add(i64::from(d - b'0'));
            }
            let exp = i32::try_from(exp).unwrap_or(i32::MAX);
            if scan.exponent_negative {
                flo /= 10f64.powi(exp);
            } else {
                flo *= 10f64.powi(exp);
            }
        }
        return Value::Flonum(if scan.negative { -flo } else { flo });
    }

    let mut fix: i64 = 0;
    for (i, d) in scan.integral.iter().enumerate() {
        let digit = i64::from(d - b'0');
        match fix.checked_mul(10).and_then(|n| n.checked_add(digit)) {
            Some(next) => fix = next,
            None => {
                // Magnitude no longer fits a fixnum; rebuild it as a flonum
                // from the digits already consumed plus the rest.
                let mut flo = fix as f64;
                for d in &scan.integral[i..] {
                    flo = flo * 10.0 + f64::from(d - b'0');
                }
                return Value::Flonum(if scan.negative { -flo } else { flo });
            }
        }
    }
    Value::Fixnum(if scan.negative { -fix } else { fix })
}

fn accumulate_f64(digits: &[u8]) -> f64 {
    let mut out = 0.0;
    for d in digits {
        out = out * 10.0 + f64::from(d - b'0');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::to_repr;
    use crate::value::equals;

    fn read_one(vm: &Vm, src: &str) -> Value {
        let s = ByteStream::from_bytes(src.as_bytes());
        read(&s, &vm.current_package(), vm).unwrap()
    }

    #[test]
    fn numbers_and_symbols_disambiguate() {
        let vm = Vm::new();
        assert!(equals(&read_one(&vm, "42"), &Value::Fixnum(42)));
        assert!(equals(&read_one(&vm, "-23"), &Value::Fixnum(-23)));
        assert!(equals(&read_one(&vm, "+7"), &Value::Fixnum(7)));
        assert!(equals(&read_one(&vm, "3."), &Value::Flonum(3.0)));
        assert!(equals(&read_one(&vm, "1e-3"), &Value::Flonum(0.001)));
        assert!(equals(&read_one(&vm, "2.5e2"), &Value::Flonum(250.0)));
        for lone in ["+", "-", ".", "e"] {
            match read_one(&vm, lone) {
                Value::Symbol(s) => assert_eq!(s.name(), lone.as_bytes()),
                other => panic!("{lone:?} read as {}", other.type_name()),
            }
        }
        // Digits make it a number; trailing junk makes it a symbol again.
        match read_one(&vm, "1x") {
            Value::Symbol(s) => assert_eq!(s.name(), b"1x"),
            other => panic!("1x read as {}", other.type_name()),
        }
    }

    #[test]
    fn fixnum_overflow_falls_back_to_flonum() {
        let vm = Vm::new();
        match read_one(&vm, "123456789012345678901234567890") {
            Value::Flonum(f) => assert!((f - 1.2345678901234568e29).abs() < 1e15),
            other => panic!("read as {}", other.type_name()),
        }
    }

    #[test]
    fn strings_unescape() {
        let vm = Vm::new();
        let v = read_one(&vm, r#""a\n\t\"b\\""#);
        assert!(equals(&v, &Value::string("a\n\t\"b\\")));
        let s = ByteStream::from_bytes(b"\"oops");
        assert!(read(&s, &vm.current_package(), &vm).is_err());
        let s = ByteStream::from_bytes(b"\"\\q\"");
        assert!(read(&s, &vm.current_package(), &vm).is_err());
    }

    #[test]
    fn lists_nest_and_unterminated_lists_fail() {
        let vm = Vm::new();
        let v = read_one(&vm, "(1 (2 3) 4)");
        assert_eq!(to_repr(&v), "(1 (2 3) 4)");
        let s = ByteStream::from_bytes(b"(1 2");
        assert!(read(&s, &vm.current_package(), &vm).is_err());
    }

    #[test]
    fn reader_macros_expand() {
        let vm = Vm::new();
        assert_eq!(to_repr(&read_one(&vm, "'x")), "(quote x)");
        assert_eq!(to_repr(&read_one(&vm, "`x")), "(quasiquote x)");
        assert_eq!(to_repr(&read_one(&vm, ",x")), "(unquote x)");
        assert_eq!(to_repr(&read_one(&vm, ",@x")), "(unquote-splicing x)");
    }

    #[test]
    fn keywords_intern_self_valued() {
        let vm = Vm::new();
        match read_one(&vm, ":key") {
            Value::Symbol(s) => {
                assert!(s.is_external());
                assert_eq!(s.home_package().unwrap().name(), b"keyword");
            }
            other => panic!("read as {}", other.type_name()),
        }
    }

    #[test]
    fn package_prefixes_resolve_visibility() {
        let vm = Vm::new();
        // nil is external in lisp, reachable with a single colon.
        match read_one(&vm, "lisp:nil") {
            Value::Symbol(s) => assert_eq!(s.name(), b"nil"),
            other => panic!("read as {}", other.type_name()),
        }
        // A private symbol needs the double colon.
        let private = vm.intern_in("hidden", &vm.user_package());
        let _ = private;
        let s = ByteStream::from_bytes(b"user:hidden");
        assert!(read(&s, &vm.current_package(), &vm).is_err());
        match read_one(&vm, "user::hidden") {
            Value::Symbol(s) => assert_eq!(s.name(), b"hidden"),
            other => panic!("read as {}", other.type_name()),
        }
        // Unknown package.
        let s = ByteStream::from_bytes(b"nope:x");
        assert!(read(&s, &vm.current_package(), &vm).is_err());
    }

    #[test]
    fn print_of_read_is_stable() {
        let vm = Vm::new();
        for src in ["(1 2 3)", "(a (b \"c\") 4.5)", "(quote x)", "nil"] {
            assert_eq!(to_repr(&read_one(&vm, src)), src);
        }
    }
}
