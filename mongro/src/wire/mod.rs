//! Wire protocol messages.
//!
//! Four message kinds travel over a socket: `OP_MSG` carries every command
//! after the handshake, `OP_QUERY`/`OP_REPLY` exist only for the handshake
//! round trip, `OP_COMPRESSED` wraps any of them. Every message starts with
//! the same 16 byte header, all integers little-endian.
use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};

pub mod compress;
mod legacy;
mod op_msg;

pub use compress::Compressor;
pub use legacy::{OpQuery, OpReply};
pub use op_msg::{DocumentSequence, OpMsg};

pub const OP_REPLY: i32 = 1;
pub const OP_QUERY: i32 = 2004;
pub const OP_COMPRESSED: i32 = 2012;
pub const OP_MSG: i32 = 2013;

pub const HEADER_LEN: usize = 16;

/// Process-wide request id counter.
pub fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(1);
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Standard message header.
#[derive(Clone, Copy, Debug)]
pub struct MessageHeader {
    /// Total message size in bytes, including this header.
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub opcode: i32,
}

impl MessageHeader {
    pub fn decode(buf: &[u8]) -> MessageHeader {
        let mut buf = &buf[..HEADER_LEN];
        MessageHeader {
            length: buf.get_i32_le(),
            request_id: buf.get_i32_le(),
            response_to: buf.get_i32_le(),
            opcode: buf.get_i32_le(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.opcode);
    }
}

/// A type which can be encoded into a wire message body.
pub trait FrontendMessage {
    const OPCODE: i32;

    /// Size of the message body, excluding the header.
    fn size_hint(&self) -> usize;

    /// Write the message body.
    ///
    /// `buf` will grow by exactly `size_hint` bytes, writing less or past
    /// that length results in panic.
    fn encode(self, buf: &mut BytesMut);
}

/// Write a full message with header to `buf`, returns its request id.
pub fn write<F: FrontendMessage>(msg: F, buf: &mut BytesMut) -> i32 {
    let size = msg.size_hint();
    buf.reserve(HEADER_LEN + size);

    let offset = buf.len();
    let request_id = next_request_id();
    MessageHeader {
        length: (HEADER_LEN + size) as i32,
        request_id,
        response_to: 0,
        opcode: F::OPCODE,
    }
    .encode(buf);

    msg.encode(buf);

    assert_eq!(
        buf.len() - offset,
        HEADER_LEN + size,
        "[BUG] message body not equal to size hint",
    );

    // the checksum trails the message and covers everything before it
    if F::OPCODE == OP_MSG {
        let flags = (&buf[offset + HEADER_LEN..]).get_u32_le();
        if flags & OpMsg::CHECKSUM_PRESENT != 0 {
            let end = buf.len();
            let sum = crc32c::crc32c(&buf[offset..end - 4]);
            buf[end - 4..end].copy_from_slice(&sum.to_le_bytes());
        }
    }

    request_id
}

/// A type which can be decoded from a wire message body.
pub trait BackendMessage: Sized {
    fn decode(header: &MessageHeader, body: bytes::Bytes) -> Result<Self, ProtocolError>;
}

/// Malformed or unexpected wire message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown opcode: {0}")]
    UnknownOpcode(i32),
    #[error("unexpected opcode: expected {expected}, got {got}")]
    UnexpectedOpcode { expected: i32, got: i32 },
    #[error("unknown compressor id: {0}")]
    UnknownCompressor(u8),
    #[error("message checksum missmatch: expected {expected} got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("truncated message: {0}")]
    Truncated(&'static str),
    #[error("unknown section kind: {0}")]
    UnknownSection(u8),
    #[error("decompressed size missmatch: advertised {advertised} got {got}")]
    DecompressedSize { advertised: i32, got: usize },
    #[error("decompress failed: {0}")]
    Decompress(std::io::Error),
    #[error("malformed document in message: {0}")]
    Document(#[from] crate::bson::ValueError),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[test]
    fn header_round_trip() {
        let header = MessageHeader { length: 50, request_id: 7, response_to: 3, opcode: OP_MSG };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = MessageHeader::decode(&buf);
        assert_eq!(decoded.length, 50);
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.response_to, 3);
        assert_eq!(decoded.opcode, OP_MSG);
    }
}
