//! # Marshal / Unmarshal Codec
//!
//! A self-describing, platform-independent binary encoding for every
//! marshalable value kind, plus the two on-disk formats built on it:
//!
//! - **Bytecode files** (`"bug"` magic): one compiled function with a
//!   string cache, the unit of separate compilation.
//! - **Image files** (`"bugi"` magic): the interpreter's package and symbol
//!   state.
//!
//! ## Encoding
//! Every value begins with a one-byte [`Tag`]. Integers carry their sign in
//! the tag and their magnitude as a 7-bits-per-byte little-endian
//! continuation varint. Flonums are split frexp-style into a mantissa
//! (scaled by 2^53, as a varint) and a 16-bit big-endian two's-complement
//! exponent, with the sign in the tag. Aggregates recurse on their fields.
//!
//! ## String cache
//! When a [`StringCache`] is supplied, strings encode as a single varint
//! index into it; the cache itself is written once per file. A default
//! cache preloads the package and symbol names common in bytecode so they
//! encode in one byte.
//!
//! Unmarshaling an integer that overflows 64 bits promotes the result to a
//! flonum (Σ byte·2^(7·position)); a non-negative value that fits a signed
//! fixnum comes back as a fixnum, otherwise as a ufixnum.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::stream::ByteStream;
use crate::symbols::{intern, Symbol};
use crate::value::{container_push, Function, Value};
use crate::vm::Vm;

/// Bytecode and image format version.
pub const BC_VERSION: u64 = 1;
/// Bytecode file magic.
pub const BC_MAGIC: &[u8] = b"bug";
/// Image file magic.
pub const IMAGE_MAGIC: &[u8] = b"bugi";

/// Number of bits in an IEEE-754 double mantissa (including the hidden bit).
const MANT_DIG: i32 = 53;

/// One-byte type tags. Values are stable; they appear in files.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tag {
    Integer = 0,
    NegativeInteger,
    Float,
    NegativeFloat,
    Symbol,
    UninternedSymbol,
    String,
    Nil,
    Cons,
    DynamicArray,
    DynamicStringArray,
    DynamicByteArray,
    Function,
    Vec2,
}

impl TryFrom<u8> for Tag {
    type Error = u8;
    fn try_from(v: u8) -> std::result::Result<Tag, u8> {
        use Tag::*;
        const TABLE: &[Tag] = &[
            Integer,
            NegativeInteger,
            Float,
            NegativeFloat,
            Symbol,
            UninternedSymbol,
            String,
            Nil,
            Cons,
            DynamicArray,
            DynamicStringArray,
            DynamicByteArray,
            Function,
            Vec2,
        ];
        TABLE.get(v as usize).copied().ok_or(v)
    }
}

//
// --- String cache -----------------------------------------------------------
//

/// Per-file cache of marshaled strings. Writing interns a string and emits
/// its index; reading resolves indexes back to bytes.
pub struct StringCache {
    entries: Vec<Vec<u8>>,
}

/// Names preloaded into every cache, so common package and symbol names
/// encode in one byte. Order matters: it fixes the first eight indexes.
const DEFAULT_CACHE: &[&str] = &["user", "lisp", "keyword", "impl", "t", "var", "list", "cons"];

impl StringCache {
    /// A cache primed with the default entries. Both the writer and the
    /// reader of a file start from this state.
    pub fn with_defaults() -> StringCache {
        StringCache {
            entries: DEFAULT_CACHE.iter().map(|s| s.as_bytes().to_vec()).collect(),
        }
    }

    /// Find-or-append, returning the index.
    pub fn intern(&mut self, s: &[u8]) -> usize {
        if let Some(i) = self.entries.iter().position(|e| e == s) {
            return i;
        }
        container_push(&mut self.entries, s.to_vec());
        self.entries.len() - 1
    }

    fn get(&self, index: usize) -> Result<&[u8]> {
        self.entries
            .get(index)
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                Error::marshal(
                    "string_cache",
                    format!("index {index} out of range ({} entries)", self.entries.len()),
                )
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries past the default prefix, in insertion order.
    fn extension(&self) -> &[Vec<u8>] {
        &self.entries[DEFAULT_CACHE.len()..]
    }
}

//
// --- Varints ----------------------------------------------------------------
//

fn write_uint(out: &mut Vec<u8>, mut n: u64) {
    loop {
        let mut byte = (n & 0x7F) as u8;
        n >>= 7;
        if n > 0 {
            byte |= 0x80;
        }
        container_push(out, byte);
        if n == 0 {
            break;
        }
    }
}

/// Read a headerless continuation varint that must fit in 64 bits (used for
/// lengths and counts; overflowing is a format error).
pub fn read_uint(s: &ByteStream) -> Result<u64> {
    let mut n: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = s.read_byte().map_err(truncated)?;
        if shift >= 64 {
            return Err(Error::marshal("read_uint", "varint does not fit in 64 bits"));
        }
        n |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(n);
        }
    }
}

fn truncated(e: Error) -> Error {
    match e {
        Error::Read(_) => Error::marshal("read", "truncated input"),
        other => other,
    }
}

fn write_s16(out: &mut Vec<u8>, n: i16) {
    let b = n.to_be_bytes();
    container_push(out, b[0]);
    container_push(out, b[1]);
}

fn read_s16(s: &ByteStream) -> Result<i16> {
    let hi = s.read_byte().map_err(truncated)?;
    let lo = s.read_byte().map_err(truncated)?;
    Ok(i16::from_be_bytes([hi, lo]))
}

//
// --- frexp / ldexp ----------------------------------------------------------
//

/// Split a finite `x` into `(m, e)` with `x = m·2^e` and `|m| ∈ [0.5, 1)`.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp_bits = ((bits >> 52) & 0x7FF) as i32;
    if exp_bits == 0 {
        // Subnormal: scale into the normal range first.
        let (m, e) = frexp(x * 2f64.powi(64));
        return (m, e - 64);
    }
    let e = exp_bits - 1022;
    let m = f64::from_bits((bits & !(0x7FFu64 << 52)) | (1022u64 << 52));
    (m, e)
}

/// `m·2^e`, stepping in safe chunks so large exponents do not overflow an
/// intermediate power.
fn ldexp(mut m: f64, mut e: i32) -> f64 {
    while e > 1023 {
        m *= 2f64.powi(1023);
        e -= 1023;
    }
    while e < -1022 {
        m *= 2f64.powi(-1022);
        e += 1022;
    }
    m * 2f64.powi(e)
}

//
// --- Marshal ----------------------------------------------------------------
//

fn marshal_fixnum(n: i64, out: &mut Vec<u8>) {
    let tag = if n < 0 { Tag::NegativeInteger } else { Tag::Integer };
    container_push(out, tag as u8);
    write_uint(out, n.unsigned_abs());
}

fn marshal_ufixnum(n: u64, out: &mut Vec<u8>, include_header: bool) {
    if include_header {
        container_push(out, Tag::Integer as u8);
    }
    write_uint(out, n);
}

fn marshal_flonum(n: f64, out: &mut Vec<u8>) {
    let tag = if n.is_sign_negative() { Tag::NegativeFloat } else { Tag::Float };
    container_push(out, tag as u8);
    let (m, e) = frexp(n.abs());
    let mantissa = (m * 2f64.powi(MANT_DIG)) as u64;
    write_uint(out, mantissa);
    write_s16(out, e as i16);
}

fn marshal_string(
    bytes: &[u8],
    out: &mut Vec<u8>,
    include_header: bool,
    cache: Option<&mut StringCache>,
) {
    if include_header {
        container_push(out, Tag::String as u8);
    }
    match cache {
        None => {
            write_uint(out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
        Some(cache) => {
            let index = cache.intern(bytes);
            write_uint(out, index as u64);
        }
    }
}

/// The header is never optional for symbols: it carries whether the symbol
/// has a home package.
fn marshal_symbol(sym: &Rc<Symbol>, out: &mut Vec<u8>, mut cache: Option<&mut StringCache>) {
    match sym.home_package() {
        Some(home) => {
            container_push(out, Tag::Symbol as u8);
            marshal_string(home.name(), out, false, cache.as_deref_mut());
        }
        None => container_push(out, Tag::UninternedSymbol as u8),
    }
    marshal_string(sym.name(), out, false, cache);
}

fn marshal_bytes(bytes: &[u8], out: &mut Vec<u8>, include_header: bool) {
    if include_header {
        container_push(out, Tag::DynamicByteArray as u8);
    }
    write_uint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn marshal_array(
    values: &[Value],
    out: &mut Vec<u8>,
    include_header: bool,
    mut cache: Option<&mut StringCache>,
) -> Result<()> {
    if include_header {
        container_push(out, Tag::DynamicArray as u8);
    }
    write_uint(out, values.len() as u64);
    for v in values {
        marshal(v, out, cache.as_deref_mut())?;
    }
    Ok(())
}

fn marshal_string_array(
    strings: &[Vec<u8>],
    out: &mut Vec<u8>,
    include_header: bool,
    mut cache: Option<&mut StringCache>,
) {
    if include_header {
        container_push(out, Tag::DynamicStringArray as u8);
    }
    write_uint(out, strings.len() as u64);
    for s in strings {
        marshal_string(s, out, false, cache.as_deref_mut());
    }
}

fn marshal_vec2(x: f64, y: f64, out: &mut Vec<u8>, include_header: bool) {
    if include_header {
        container_push(out, Tag::Vec2 as u8);
    }
    marshal_flonum(x, out);
    marshal_flonum(y, out);
}

/// Serialize a function: constants, declared stack size, code, presence bit
/// plus name, arity, accepts-rest flag.
pub fn marshal_function(
    f: &Rc<Function>,
    out: &mut Vec<u8>,
    include_header: bool,
    mut cache: Option<&mut StringCache>,
) -> Result<()> {
    if include_header {
        container_push(out, Tag::Function as u8);
    }
    marshal_array(&f.constants.borrow(), out, false, cache.as_deref_mut())?;
    write_uint(out, f.stack_size.get());
    marshal_bytes(&f.code.borrow(), out, false);
    match &*f.name.borrow() {
        Some(name) => {
            write_uint(out, 1);
            marshal_symbol(name, out, cache.as_deref_mut());
        }
        None => write_uint(out, 0),
    }
    write_uint(out, f.nargs.get());
    write_uint(out, u64::from(f.accepts_rest.get()));
    Ok(())
}

/// Encode any marshalable value, appending to `out`.
pub fn marshal(v: &Value, out: &mut Vec<u8>, cache: Option<&mut StringCache>) -> Result<()> {
    match v {
        Value::Nil => container_push(out, Tag::Nil as u8),
        Value::Fixnum(n) => marshal_fixnum(*n, out),
        Value::Ufixnum(n) => marshal_ufixnum(*n, out, true),
        Value::Flonum(f) => marshal_flonum(*f, out),
        Value::Str(b) => marshal_string(&b.borrow(), out, true, cache),
        Value::ByteArray(b) => marshal_bytes(&b.borrow(), out, true),
        Value::Cons(c) => {
            let mut cache = cache;
            container_push(out, Tag::Cons as u8);
            marshal(&c.car, out, cache.as_deref_mut())?;
            marshal(&c.cdr, out, cache)?;
        }
        Value::Array(values) => marshal_array(&values.borrow(), out, true, cache)?,
        Value::Symbol(s) => marshal_symbol(s, out, cache),
        Value::Function(f) => marshal_function(f, out, true, cache)?,
        Value::Vec2(x, y) => marshal_vec2(*x, *y, out, true),
        other => {
            return Err(Error::marshal(
                "marshal",
                format!("cannot marshal a {}", other.type_name()),
            ))
        }
    }
    Ok(())
}

/// Whether [`marshal`] can encode this value. Process-local values (files,
/// enumerators, pointers, packages) and builtin functions cannot cross an
/// image boundary.
pub fn marshalable(v: &Value) -> bool {
    match v {
        Value::Nil
        | Value::Fixnum(_)
        | Value::Ufixnum(_)
        | Value::Flonum(_)
        | Value::Str(_)
        | Value::ByteArray(_)
        | Value::Cons(_)
        | Value::Array(_)
        | Value::Symbol(_)
        | Value::Vec2(_, _) => true,
        Value::Function(f) => f.builtin.get().is_none(),
        Value::File(_) | Value::Enumerator(_) | Value::Pointer(_) | Value::Package(_) => false,
    }
}

//
// --- Unmarshal --------------------------------------------------------------
//

fn expect_tag(s: &ByteStream, operation: &'static str, want: &[Tag]) -> Result<Tag> {
    let byte = s.read_byte().map_err(truncated)?;
    let tag = Tag::try_from(byte)
        .map_err(|b| Error::marshal(operation, format!("unknown tag byte {b}")))?;
    if want.contains(&tag) {
        Ok(tag)
    } else {
        Err(Error::marshal(
            operation,
            format!("expected {want:?} but found {tag:?}"),
        ))
    }
}

/// Decode an integer, promoting to flonum when the magnitude overflows 64
/// bits. Non-negative results that fit a signed fixnum come back as
/// fixnums, larger ones as ufixnums.
fn unmarshal_integer(s: &ByteStream) -> Result<Value> {
    let tag = expect_tag(s, "unmarshal_integer", &[Tag::Integer, Tag::NegativeInteger])?;
    let negative = tag == Tag::NegativeInteger;

    let mut mag: u64 = 0;
    let mut flo: f64 = 0.0;
    let mut is_flo = false;
    let mut position: u32 = 0;
    loop {
        let byte = s.read_byte().map_err(truncated)?;
        let part = (byte & 0x7F) as u64;
        if !is_flo {
            let shift = 7 * position;
            let lost = if shift >= 64 {
                part != 0
            } else {
                (part << shift) >> shift != part
            };
            if lost {
                is_flo = true;
                flo = mag as f64;
            } else if shift < 64 {
                mag |= part << shift;
            }
        }
        if is_flo {
            flo += part as f64 * 2f64.powi(7 * position as i32);
        }
        position += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }

    if is_flo {
        return Ok(Value::Flonum(if negative { -flo } else { flo }));
    }
    if negative {
        if mag <= i64::MAX as u64 + 1 {
            Ok(Value::Fixnum((mag as i64).wrapping_neg()))
        } else {
            Ok(Value::Flonum(-(mag as f64)))
        }
    } else if mag <= i64::MAX as u64 {
        Ok(Value::Fixnum(mag as i64))
    } else {
        Ok(Value::Ufixnum(mag))
    }
}

fn unmarshal_flonum_value(s: &ByteStream) -> Result<f64> {
    let tag = expect_tag(s, "unmarshal_flonum", &[Tag::Float, Tag::NegativeFloat])?;
    let mantissa = read_uint(s)?;
    let exponent = read_s16(s)? as i32;
    let flo = ldexp(mantissa as f64 / 2f64.powi(MANT_DIG), exponent);
    Ok(if tag == Tag::NegativeFloat { -flo } else { flo })
}

fn unmarshal_string(
    s: &ByteStream,
    includes_header: bool,
    cache: Option<&StringCache>,
) -> Result<Vec<u8>> {
    if includes_header {
        expect_tag(s, "unmarshal_string", &[Tag::String])?;
    }
    match cache {
        None => {
            let length = read_uint(s)? as usize;
            s.read(length).map_err(truncated)
        }
        Some(cache) => {
            let index = read_uint(s)? as usize;
            Ok(cache.get(index)?.to_vec())
        }
    }
}

/// Decode a symbol, re-interning it into its named home package. The
/// package must already exist.
fn unmarshal_symbol(s: &ByteStream, cache: Option<&StringCache>, vm: &Vm) -> Result<Rc<Symbol>> {
    let tag = expect_tag(s, "unmarshal_symbol", &[Tag::Symbol, Tag::UninternedSymbol])?;
    if tag == Tag::Symbol {
        let package_name = unmarshal_string(s, false, cache)?;
        let name = unmarshal_string(s, false, cache)?;
        let package = vm.find_package(&package_name).ok_or_else(|| {
            Error::marshal(
                "unmarshal_symbol",
                format!(
                    "no package named \"{}\"",
                    String::from_utf8_lossy(&package_name)
                ),
            )
        })?;
        Ok(intern(&name, &package))
    } else {
        let name = unmarshal_string(s, false, cache)?;
        Ok(Symbol::new(&name))
    }
}

fn unmarshal_bytes(s: &ByteStream, includes_header: bool) -> Result<Vec<u8>> {
    if includes_header {
        expect_tag(s, "unmarshal_bytes", &[Tag::DynamicByteArray])?;
    }
    let length = read_uint(s)? as usize;
    s.read(length).map_err(truncated)
}

fn unmarshal_array(
    s: &ByteStream,
    includes_header: bool,
    cache: Option<&StringCache>,
    vm: &Vm,
) -> Result<Vec<Value>> {
    if includes_header {
        expect_tag(s, "unmarshal_array", &[Tag::DynamicArray])?;
    }
    let length = read_uint(s)? as usize;
    let mut out = Vec::with_capacity(length);
    for _ in 0..length {
        out.push(unmarshal(s, cache, vm)?);
    }
    Ok(out)
}

/// Decode a string array, appending each entry to the supplied cache (this
/// is how a reader primes its cache from a file's extension section).
fn unmarshal_string_array_into(
    s: &ByteStream,
    includes_header: bool,
    cache: &mut StringCache,
) -> Result<()> {
    if includes_header {
        expect_tag(s, "unmarshal_string_array", &[Tag::DynamicStringArray])?;
    }
    let length = read_uint(s)? as usize;
    for _ in 0..length {
        let entry = unmarshal_string(s, false, None)?;
        container_push(&mut cache.entries, entry);
    }
    Ok(())
}

/// Decode a function. Fails if the declared stack size is smaller than the
/// arity, which no well-formed compiler output produces.
pub fn unmarshal_function(
    s: &ByteStream,
    includes_header: bool,
    cache: Option<&StringCache>,
    vm: &Vm,
) -> Result<Rc<Function>> {
    if includes_header {
        expect_tag(s, "unmarshal_function", &[Tag::Function])?;
    }
    let constants = unmarshal_array(s, false, cache, vm)?;
    let stack_size = read_uint(s)?;
    let code = unmarshal_bytes(s, false)?;
    let f = Function::new(constants, code, stack_size);
    if read_uint(s)? != 0 {
        *f.name.borrow_mut() = Some(unmarshal_symbol(s, cache, vm)?);
    }
    f.nargs.set(read_uint(s)?);
    f.accepts_rest.set(read_uint(s)? != 0);
    if f.stack_size.get() < f.nargs.get() {
        return Err(Error::marshal(
            "unmarshal_function",
            format!(
                "declared stack size {} is below arity {}",
                f.stack_size.get(),
                f.nargs.get()
            ),
        ));
    }
    Ok(f)
}

/// Decode any marshaled value from a byte stream.
pub fn unmarshal(s: &ByteStream, cache: Option<&StringCache>, vm: &Vm) -> Result<Value> {
    let byte = s.peek_byte().map_err(truncated)?;
    let tag = Tag::try_from(byte)
        .map_err(|b| Error::marshal("unmarshal", format!("unknown tag byte {b}")))?;
    match tag {
        Tag::Integer | Tag::NegativeInteger => unmarshal_integer(s),
        Tag::Float | Tag::NegativeFloat => Ok(Value::Flonum(unmarshal_flonum_value(s)?)),
        Tag::Symbol | Tag::UninternedSymbol => {
            Ok(Value::Symbol(unmarshal_symbol(s, cache, vm)?))
        }
        Tag::String => Ok(Value::string_from_bytes(unmarshal_string(s, true, cache)?)),
        Tag::Nil => {
            s.read_byte()?;
            Ok(Value::Nil)
        }
        Tag::Cons => {
            s.read_byte()?;
            let car = unmarshal(s, cache, vm)?;
            let cdr = unmarshal(s, cache, vm)?;
            Ok(Value::cons(car, cdr))
        }
        Tag::DynamicArray => Ok(Value::array(unmarshal_array(s, true, cache, vm)?)),
        Tag::DynamicStringArray => {
            s.read_byte()?;
            let length = read_uint(s)? as usize;
            let mut out = Vec::with_capacity(length);
            for _ in 0..length {
                out.push(Value::string_from_bytes(unmarshal_string(s, false, cache)?));
            }
            Ok(Value::array(out))
        }
        Tag::DynamicByteArray => Ok(Value::byte_array(unmarshal_bytes(s, true)?)),
        Tag::Function => Ok(Value::Function(unmarshal_function(s, true, cache, vm)?)),
        Tag::Vec2 => {
            s.read_byte()?;
            let x = unmarshal_flonum_value(s)?;
            let y = unmarshal_flonum_value(s)?;
            Ok(Value::Vec2(x, y))
        }
    }
}

//
// --- Bytecode files ---------------------------------------------------------
//

/// Encode a compiled function as a complete bytecode file: magic, version,
/// cache extension, then the function without its type header.
pub fn bytecode_file_bytes(f: &Rc<Function>) -> Result<Vec<u8>> {
    let mut cache = StringCache::with_defaults();
    let mut body = Vec::new();
    marshal_function(f, &mut body, false, Some(&mut cache))?;

    let mut out = Vec::new();
    out.extend_from_slice(BC_MAGIC);
    write_uint(&mut out, BC_VERSION);
    marshal_string_array(cache.extension(), &mut out, false, None);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a bytecode file from a stream, verifying magic and version and
/// priming the cache with the default entries before the file's extension.
pub fn read_bytecode_file(s: &ByteStream, vm: &Vm) -> Result<Rc<Function>> {
    let magic = s.read(BC_MAGIC.len()).map_err(truncated)?;
    if magic != BC_MAGIC {
        return Err(Error::marshal("read_bytecode_file", "invalid magic string"));
    }
    let version = read_uint(s)?;
    if version != BC_VERSION {
        return Err(Error::marshal(
            "read_bytecode_file",
            format!("version mismatch (interpreter has {BC_VERSION}, file has {version})"),
        ));
    }
    let mut cache = StringCache::with_defaults();
    unmarshal_string_array_into(s, false, &mut cache)?;
    unmarshal_function(s, false, Some(&cache), vm)
}

//
// --- Image files ------------------------------------------------------------
//

/// Serialize the interpreter's package and symbol state: magic, version,
/// cache extension, the package list with each package's symbol names, and
/// the global symbol table with each symbol's three slots behind is-set
/// bits.
pub fn image_bytes(vm: &Vm) -> Result<Vec<u8>> {
    let mut cache = StringCache::with_defaults();
    let mut body = Vec::new();

    let packages = vm.packages();
    write_uint(&mut body, packages.len() as u64);
    for package in packages {
        marshal_string(package.name(), &mut body, false, Some(&mut cache));
        let symbols = package.symbols();
        write_uint(&mut body, symbols.len() as u64);
        for sym in &symbols {
            marshal_string(sym.name(), &mut body, false, Some(&mut cache));
        }
    }

    let mut table = Vec::new();
    let mut count: u64 = 0;
    for package in packages {
        for sym in package.symbols() {
            // Inherited symbols appear once, under their home package.
            let home = match sym.home_package() {
                Some(h) => h,
                None => continue,
            };
            if !Rc::ptr_eq(&home, package) {
                continue;
            }
            count += 1;
            marshal_string(package.name(), &mut table, false, Some(&mut cache));
            marshal_string(sym.name(), &mut table, false, Some(&mut cache));
            for slot in [sym.value(), sym.function(), sym.structure()] {
                match slot {
                    Some(v) if marshalable(&v) => {
                        write_uint(&mut table, 1);
                        marshal(&v, &mut table, Some(&mut cache))?;
                    }
                    _ => write_uint(&mut table, 0),
                }
            }
        }
    }
    write_uint(&mut body, count);
    body.extend_from_slice(&table);

    let mut out = Vec::new();
    out.extend_from_slice(IMAGE_MAGIC);
    write_uint(&mut out, BC_VERSION);
    marshal_string_array(cache.extension(), &mut out, false, None);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Load an image into a running interpreter, creating any packages it names
/// and re-interning their symbols with the saved slot values.
pub fn read_image(s: &ByteStream, vm: &mut Vm) -> Result<()> {
    let magic = s.read(IMAGE_MAGIC.len()).map_err(truncated)?;
    if magic != IMAGE_MAGIC {
        return Err(Error::marshal("read_image", "invalid magic string"));
    }
    let version = read_uint(s)?;
    if version != BC_VERSION {
        return Err(Error::marshal(
            "read_image",
            format!("version mismatch (interpreter has {BC_VERSION}, file has {version})"),
        ));
    }
    let mut cache = StringCache::with_defaults();
    unmarshal_string_array_into(s, false, &mut cache)?;

    let package_count = read_uint(s)?;
    for _ in 0..package_count {
        let name = unmarshal_string(s, false, Some(&cache))?;
        let package = vm.find_or_create_package(&name);
        let symbol_count = read_uint(s)?;
        for _ in 0..symbol_count {
            let symbol_name = unmarshal_string(s, false, Some(&cache))?;
            intern(&symbol_name, &package);
        }
    }

    let symbol_count = read_uint(s)?;
    for _ in 0..symbol_count {
        let package_name = unmarshal_string(s, false, Some(&cache))?;
        let symbol_name = unmarshal_string(s, false, Some(&cache))?;
        let package = vm.find_package(&package_name).ok_or_else(|| {
            Error::marshal(
                "read_image",
                format!(
                    "symbol table names unknown package \"{}\"",
                    String::from_utf8_lossy(&package_name)
                ),
            )
        })?;
        let sym = intern(&symbol_name, &package);
        let setters: [fn(&Symbol, Value); 3] =
            [Symbol::set_value, Symbol::set_function, Symbol::set_structure];
        for set in setters {
            if read_uint(s)? != 0 {
                set(&sym, unmarshal(s, Some(&cache), vm)?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::equals;

    fn round_trip(v: &Value) -> Value {
        let vm = Vm::new();
        let mut out = Vec::new();
        marshal(v, &mut out, None).unwrap();
        let s = ByteStream::from_bytes(&out);
        let back = unmarshal(&s, None, &vm).unwrap();
        assert!(!s.has_more().unwrap(), "trailing bytes after unmarshal");
        back
    }

    #[test]
    fn integers_round_trip_exactly() {
        for n in [0i64, 9, -23, -76, 256, 257, -342, 2049, 123456, -123499, 20422, 123456789,
            -123456789, i64::MIN, i64::MAX]
        {
            assert!(equals(&round_trip(&Value::Fixnum(n)), &Value::Fixnum(n)), "{n}");
        }
        assert!(equals(
            &round_trip(&Value::Ufixnum(u64::MAX)),
            &Value::Ufixnum(u64::MAX)
        ));
    }

    #[test]
    fn small_ufixnums_normalize_to_fixnums() {
        match round_trip(&Value::Ufixnum(5)) {
            Value::Fixnum(5) => {}
            other => panic!("expected fixnum 5, got {}", crate::printer::to_repr(&other)),
        }
    }

    #[test]
    fn oversized_integers_promote_to_flonums() {
        // Nine continuation bytes followed by a 0x7F top byte: 70 bits set.
        let mut bytes = vec![Tag::Integer as u8];
        bytes.extend_from_slice(&[0xFF; 9]);
        bytes.push(0x3F);
        let vm = Vm::new();
        let v = unmarshal(&ByteStream::from_bytes(&bytes), None, &vm).unwrap();
        match v {
            Value::Flonum(f) => assert!(f > u64::MAX as f64),
            other => panic!("expected flonum, got {}", other.type_name()),
        }
    }

    #[test]
    fn flonums_round_trip_exactly() {
        for f in [0.0f64, 1.0, -1.0, 0.001, 3.5, -12.75, 1e300, 5e-300, f64::MIN_POSITIVE] {
            assert!(equals(&round_trip(&Value::Flonum(f)), &Value::Flonum(f)), "{f}");
        }
    }

    #[test]
    fn aggregates_round_trip_structurally() {
        let v = Value::list(&[
            Value::Fixnum(1),
            Value::string("hi"),
            Value::byte_array(vec![1, 2, 3]),
            Value::array(vec![Value::Vec2(1.5, -2.5), Value::Nil]),
        ]);
        assert!(equals(&round_trip(&v), &v));
    }

    #[test]
    fn symbols_reintern_into_their_package() {
        let vm = Vm::new();
        let sym = vm.intern_in("dinkle", &vm.user_package());
        let mut out = Vec::new();
        marshal(&Value::Symbol(sym.clone()), &mut out, None).unwrap();
        let back = unmarshal(&ByteStream::from_bytes(&out), None, &vm).unwrap();
        match back {
            Value::Symbol(s) => assert!(Rc::ptr_eq(&s, &sym)),
            other => panic!("expected symbol, got {}", other.type_name()),
        }
    }

    #[test]
    fn uninterned_symbols_stay_homeless() {
        let vm = Vm::new();
        let sym = Symbol::new(b"gensym");
        let mut out = Vec::new();
        marshal(&Value::Symbol(sym), &mut out, None).unwrap();
        match unmarshal(&ByteStream::from_bytes(&out), None, &vm).unwrap() {
            Value::Symbol(s) => assert!(s.home_package().is_none()),
            other => panic!("expected symbol, got {}", other.type_name()),
        }
    }

    #[test]
    fn cached_strings_encode_as_one_byte() {
        let mut cache = StringCache::with_defaults();
        let mut out = Vec::new();
        marshal_string(b"lisp", &mut out, false, Some(&mut cache));
        assert_eq!(out, vec![1]);
        // A fresh string lands past the default prefix.
        out.clear();
        marshal_string(b"brand-new", &mut out, false, Some(&mut cache));
        assert_eq!(out, vec![8]);
        assert_eq!(cache.len(), 9);
    }

    #[test]
    fn bad_magic_and_version_are_rejected(){
        let vm = Vm::new();
        let err = read_bytecode_file(&ByteStream::from_bytes(b"bxg\x01"), &vm).unwrap_err();
        assert!(err.to_string().contains("magic"));

        let f = Function::new(Vec::new(), Vec::new(), 0);
        let mut bytes = bytecode_file_bytes(&f).unwrap();
        bytes[3] = 99; // version varint
        let err = read_bytecode_file(&ByteStream::from_bytes(&bytes), &vm).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn truncated_input_is_a_marshal_error() {
        let vm = Vm::new();
        let mut out = Vec::new();
        marshal(&Value::string("hello"), &mut out, None).unwrap();
        out.truncate(out.len() - 2);
        assert!(unmarshal(&ByteStream::from_bytes(&out), None, &vm).is_err());
    }
}
