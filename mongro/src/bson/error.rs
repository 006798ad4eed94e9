use std::{borrow::Cow, fmt};

use super::ElementType;

/// An error when encoding or decoding a document.
pub enum ValueError {
    /// Byte layout violates the document framing rules.
    MalformedDoc(Cow<'static, str>),
    /// A read was issued against a value of another type.
    TypeMismatch {
        expected: ElementType,
        found: ElementType,
    },
    /// Integer narrowing would lose the value.
    Overflow {
        value: i64,
        target: &'static str,
    },
    /// Lossy double to float conversion without opting in.
    Truncation(f64),
    /// An inlined record collided with an outer key.
    DuplicateInlineKey(String),
    /// Write issued against a closed document or array.
    Closed,
    /// Document key is empty or carries an embedded nul.
    InvalidKey(String),
    /// Decoding a record found no value for a required field.
    MissingKey(Cow<'static, str>),
    /// Extended json text could not be parsed.
    Json(String),
    /// No codec registered for the runtime type.
    Unregistered(&'static str),
}

impl std::error::Error for ValueError { }

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedDoc(why) => write!(f, "malformed document: {why}"),
            Self::TypeMismatch { expected, found } => {
                write!(f, "type missmatch: expected {expected:?}, found {found:?}")
            }
            Self::Overflow { value, target } => {
                write!(f, "value {value} overflow {target}")
            }
            Self::Truncation(value) => {
                write!(f, "double {value} does not fit f32 without truncation")
            }
            Self::DuplicateInlineKey(key) => write!(f, "duplicate inlined key: {key}"),
            Self::Closed => f.write_str("write past closed container"),
            Self::InvalidKey(key) => write!(f, "invalid document key: {key:?}"),
            Self::MissingKey(key) => write!(f, "missing field: {key}"),
            Self::Json(why) => write!(f, "invalid extended json: {why}"),
            Self::Unregistered(ty) => write!(f, "no codec registered for {ty}"),
        }
    }
}

impl fmt::Debug for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl From<crate::ext::CstringError> for ValueError {
    fn from(_: crate::ext::CstringError) -> Self {
        ValueError::MalformedDoc("unterminated cstring".into())
    }
}
