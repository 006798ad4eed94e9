//! `mongro` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    bson::ValueError,
    config::ParseError,
    connection::auth::AuthError,
    dispatch::{ServerError, WriteConcernError},
    wire::ProtocolError,
};

/// A specialized [`Result`] type for `mongro` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `mongro` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attach operation context shown ahead of the error message.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub(crate) fn pool_timeout() -> Self {
        ErrorKind::PoolTimeout.into()
    }

    pub(crate) fn selection_timeout(detail: impl Into<String>) -> Self {
        ErrorKind::SelectionTimeout(detail.into()).into()
    }

    pub(crate) fn incompatible(detail: impl Into<String>) -> Self {
        ErrorKind::IncompatibleServer(detail.into()).into()
    }

    pub(crate) fn message_too_large(size: usize, max: usize) -> Self {
        ErrorKind::MessageTooLarge { size, max }.into()
    }

    pub(crate) fn timeout() -> Self {
        ErrorKind::Timeout.into()
    }

    pub(crate) fn cursor_closed() -> Self {
        ErrorKind::CursorClosed.into()
    }

    /// Whether the error came from the transport rather than the server.
    pub fn is_network(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_))
    }
}

/// All possible error kind from `mongro` library.
pub enum ErrorKind {
    /// Connection string could not be parsed.
    Config(ParseError),
    /// Document encode/decode failure.
    Value(ValueError),
    /// Malformed or unexpected wire message.
    Protocol(ProtocolError),
    /// Transport error.
    Io(io::Error),
    /// Server replied `ok: 0`.
    Server(ServerError),
    /// Cluster acknowledged failure of the requested write concern.
    WriteConcern(WriteConcernError),
    /// Authentication conversation failed.
    Auth(AuthError),
    /// No pooled connection became available within the wait queue deadline.
    PoolTimeout,
    /// No eligible server within the server selection deadline.
    SelectionTimeout(String),
    /// A server's wire version range does not overlap the driver's.
    IncompatibleServer(String),
    /// Message exceeds the server advertised maximum, failed locally.
    MessageTooLarge { size: usize, max: usize },
    /// Operation deadline expired.
    Timeout,
    /// Operation context was cancelled.
    Cancelled,
    /// Cursor already closed.
    CursorClosed,
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ValueError>e => ErrorKind::Value(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ServerError>e => ErrorKind::Server(e));
from!(<WriteConcernError>e => ErrorKind::WriteConcern(e));
from!(<AuthError>e => ErrorKind::Auth(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Value(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Server(e) => e.fmt(f),
            Self::WriteConcern(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::PoolTimeout => f.write_str("timed out waiting for pooled connection"),
            Self::SelectionTimeout(detail) => write!(f, "server selection timed out: {detail}"),
            Self::IncompatibleServer(detail) => write!(f, "incompatible server: {detail}"),
            Self::MessageTooLarge { size, max } => {
                write!(f, "message of {size} bytes exceeds maximum of {max}")
            }
            Self::Timeout => f.write_str("operation timed out"),
            Self::Cancelled => f.write_str("operation cancelled"),
            Self::CursorClosed => f.write_str("cursor already closed"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
