//! # Byte-Stream Abstraction
//!
//! A uniform read/peek interface over the byte sources the reader and the
//! marshal codec consume: strings, dynamic byte arrays, open files, and
//! enumerators.
//!
//! [`ByteStream::lift`] idempotently wraps strings and byte arrays in a
//! fresh [`Enumerator`] and passes files and enumerators through unchanged.
//! For enumerators the cursor advances on read and stays put on peek. For
//! files a single-byte peek goes through a one-byte pushback buffer, and a
//! multi-byte peek reads then seeks back.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::value::Value;

/// Cursor over an in-memory byte sequence (a string or byte-array value).
#[derive(Debug)]
pub struct Enumerator {
    /// The underlying `Str` or `ByteArray` value.
    pub source: Value,
    /// Next byte to read.
    pub index: usize,
}

/// An open file with its path, mode, and a one-byte pushback buffer used to
/// implement single-byte peeks.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    pub path: String,
    pub mode: String,
    pushback: Option<u8>,
}

impl FileStream {
    /// Open a file in the given mode (`"rb"` or `"wb"`) and wrap it as a
    /// value.
    pub fn open(path: &str, mode: &str) -> Result<Value> {
        let file = match mode {
            "rb" => OpenOptions::new().read(true).open(path)?,
            "wb" => OpenOptions::new().write(true).create(true).truncate(true).open(path)?,
            other => {
                return Err(Error::Read(format!(
                    "unsupported file mode \"{other}\" for \"{path}\""
                )))
            }
        };
        Ok(Value::File(Rc::new(RefCell::new(FileStream {
            file,
            path: path.to_string(),
            mode: mode.to_string(),
            pushback: None,
        }))))
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.pushback.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        match self.file.read(&mut buf)? {
            0 => Ok(None),
            _ => Ok(Some(buf[0])),
        }
    }

    fn peek_byte(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.pushback {
            return Ok(Some(b));
        }
        let b = self.read_byte()?;
        self.pushback = b;
        Ok(b)
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        if n > 0 {
            if let Some(b) = self.pushback.take() {
                out.push(b);
            }
        }
        let remaining = n - out.len();
        if remaining > 0 {
            let mut buf = vec![0u8; remaining];
            self.file.read_exact(&mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    fn peek_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        // Read forward, then seek back past the bytes that came off disk
        // (the pushback byte never hit the file cursor).
        let from_pushback = if self.pushback.is_some() && n > 0 { 1 } else { 0 };
        let out = self.read_exact(n)?;
        let read_from_disk = (n - from_pushback) as i64;
        self.file.seek(SeekFrom::Current(-read_from_disk))?;
        if from_pushback == 1 {
            self.pushback = Some(out[0]);
        }
        Ok(out)
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        Ok(())
    }
}

/// A readable byte stream: always a `File` or `Enumerator` value inside.
pub struct ByteStream {
    inner: Value,
}

impl ByteStream {
    /// Idempotently lift a value into a byte stream. Strings and byte
    /// arrays get a fresh enumerator; files and enumerators pass through.
    pub fn lift(v: &Value) -> Result<ByteStream> {
        match v {
            Value::Str(_) | Value::ByteArray(_) => Ok(ByteStream {
                inner: Value::Enumerator(Rc::new(RefCell::new(Enumerator {
                    source: v.clone(),
                    index: 0,
                }))),
            }),
            Value::File(_) | Value::Enumerator(_) => Ok(ByteStream { inner: v.clone() }),
            other => Err(Error::Read(format!(
                "cannot lift a {} into a byte stream",
                other.type_name()
            ))),
        }
    }

    /// Lift a borrowed byte slice without copying it into a value.
    pub fn from_bytes(bytes: &[u8]) -> ByteStream {
        ByteStream::lift(&Value::byte_array(bytes.to_vec()))
            .expect("byte arrays always lift")
    }

    fn with_source<T>(
        &self,
        f: impl FnOnce(&[u8], &mut usize) -> T,
        g: impl FnOnce(&mut FileStream) -> Result<T>,
    ) -> Result<T> {
        match &self.inner {
            Value::Enumerator(e) => {
                let mut e = e.borrow_mut();
                // Source is pinned to Str/ByteArray by lift().
                match e.source.clone() {
                    Value::Str(b) | Value::ByteArray(b) => {
                        let bytes = b.borrow();
                        let mut i = e.index;
                        let out = f(&bytes, &mut i);
                        drop(bytes);
                        e.index = i;
                        Ok(out)
                    }
                    other => Err(Error::Read(format!(
                        "enumerator over unsupported source {}",
                        other.type_name()
                    ))),
                }
            }
            Value::File(file) => g(&mut file.borrow_mut()),
            _ => unreachable!("lift() only admits files and enumerators"),
        }
    }

    /// Whether at least one more byte can be read.
    pub fn has_more(&self) -> Result<bool> {
        self.with_source(
            |bytes, index| *index < bytes.len(),
            |file| Ok(file.peek_byte()?.is_some()),
        )
    }

    /// Read one byte, advancing the cursor. End of input is an error; the
    /// caller checks `has_more` when the end is an expected condition.
    pub fn read_byte(&self) -> Result<u8> {
        self.with_source(
            |bytes, index| {
                let b = bytes.get(*index).copied();
                if b.is_some() {
                    *index += 1;
                }
                b
            },
            |file| file.read_byte(),
        )?
        .ok_or_else(|| Error::Read("unexpected end of input".to_string()))
    }

    /// Peek one byte without advancing.
    pub fn peek_byte(&self) -> Result<u8> {
        self.with_source(|bytes, index| bytes.get(*index).copied(), |file| file.peek_byte())?
            .ok_or_else(|| Error::Read("unexpected end of input".to_string()))
    }

    /// Read exactly `n` bytes.
    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        self.with_source(
            |bytes, index| {
                let end = *index + n;
                if end > bytes.len() {
                    None
                } else {
                    let out = bytes[*index..end].to_vec();
                    *index = end;
                    Some(out)
                }
            },
            |file| file.read_exact(n).map(Some),
        )?
        .ok_or_else(|| Error::Read(format!("unexpected end of input reading {n} bytes")))
    }

    /// Peek exactly `n` bytes without advancing.
    pub fn peek(&self, n: usize) -> Result<Vec<u8>> {
        self.with_source(
            |bytes, index| {
                let end = *index + n;
                if end > bytes.len() {
                    None
                } else {
                    Some(bytes[*index..end].to_vec())
                }
            },
            |file| file.peek_exact(n).map(Some),
        )?
        .ok_or_else(|| Error::Read(format!("unexpected end of input peeking {n} bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerator_cursor_advances_on_read_only() {
        let s = ByteStream::from_bytes(b"abc");
        assert_eq!(s.peek_byte().unwrap(), b'a');
        assert_eq!(s.peek_byte().unwrap(), b'a');
        assert_eq!(s.read_byte().unwrap(), b'a');
        assert_eq!(s.read_byte().unwrap(), b'b');
        assert!(s.has_more().unwrap());
        assert_eq!(s.read(1).unwrap(), b"c");
        assert!(!s.has_more().unwrap());
        assert!(s.read_byte().is_err());
    }

    #[test]
    fn multi_byte_peek_leaves_cursor_alone() {
        let s = ByteStream::from_bytes(b"hello");
        assert_eq!(s.peek(3).unwrap(), b"hel");
        assert_eq!(s.read(5).unwrap(), b"hello");
    }

    #[test]
    fn lift_passes_streams_through() {
        let s = ByteStream::from_bytes(b"xy");
        let lifted = ByteStream::lift(&s.inner).unwrap();
        assert_eq!(lifted.read_byte().unwrap(), b'x');
        // Same enumerator: the original stream observes the advance.
        assert_eq!(s.read_byte().unwrap(), b'y');
    }

    #[test]
    fn lift_rejects_non_stream_values() {
        assert!(ByteStream::lift(&Value::Fixnum(1)).is_err());
    }
}
