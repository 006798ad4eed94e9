use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::ByteStr;

/// Checked narrowing for buffer lengths.
pub trait UsizeExt {
    /// Length is `usize` in rust, while the wire wants `i32`,
    /// this will panic when overflow instead of wrapping.
    fn to_i32(self) -> i32;
}

/// Cstring operation.
pub trait StrExt {
    /// String length plus nul (1).
    fn cstring_len(&self) -> i32;
}

/// Cstring operation in [`BufMut`].
pub trait BufMutExt {
    /// Write string and nul termination.
    fn put_cstring(&mut self, string: &str);
}

/// Cstring operation in [`Bytes`].
pub trait BytesExt {
    /// Try to read nul terminated string.
    ///
    /// Using [`ByteStr`] avoid allocating [`Vec`] as it required for [`String::from_utf8`].
    fn get_cstring(&mut self) -> Result<ByteStr, CstringError>;
}

/// Helper trait to [`Display`][std::fmt::Display] bytes.
pub trait FmtExt {
    /// Lossy [`Display`][std::fmt::Display] bytes.
    fn lossy(&self) -> LossyFmt<'_>;
}

/// Lossy [`Display`][std::fmt::Display] implementation for bytes.
pub struct LossyFmt<'a>(pub &'a [u8]);

/// Cstring missing its nul terminator, or is not utf8.
#[derive(Debug)]
pub struct CstringError;

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        self.try_into().expect("message size too large for protocol")
    }
}

impl StrExt for str {
    fn cstring_len(&self) -> i32 {
        self.len().to_i32() + 1/* nul */
    }
}

impl<B: BufMut> BufMutExt for B {
    fn put_cstring(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

impl BytesExt for Bytes {
    fn get_cstring(&mut self) -> Result<ByteStr, CstringError> {
        let end = self
            .iter()
            .position(|e| matches!(e, b'\0'))
            .ok_or(CstringError)?;
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        ByteStr::from_utf8(me).map_err(|_| CstringError)
    }
}

impl BytesExt for BytesMut {
    fn get_cstring(&mut self) -> Result<ByteStr, CstringError> {
        let end = self
            .iter()
            .position(|e| matches!(e, b'\0'))
            .ok_or(CstringError)?;
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        ByteStr::from_utf8(me.freeze()).map_err(|_| CstringError)
    }
}

impl FmtExt for [u8] {
    fn lossy(&self) -> LossyFmt<'_> {
        LossyFmt(self)
    }
}

impl std::error::Error for CstringError { }

impl std::fmt::Display for CstringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cstring missing nul terminator or not utf8")
    }
}

impl std::fmt::Display for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if b.is_ascii_graphic() || b.is_ascii_whitespace() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:x}")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LossyFmt<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b\"{self}\"")
    }
}
