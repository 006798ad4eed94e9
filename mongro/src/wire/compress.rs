//! `OP_COMPRESSED` wrapping.
use std::io::{Read, Write};

use bytes::{Buf, Bytes, BytesMut};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use super::{
    BackendMessage, FrontendMessage, HEADER_LEN, MessageHeader, OP_COMPRESSED, ProtocolError,
};
use crate::ext::UsizeExt;

pub const NOOP_ID: u8 = 0;
pub const SNAPPY_ID: u8 = 1;
pub const ZLIB_ID: u8 = 2;
pub const ZSTD_ID: u8 = 3;

/// A negotiated wire compressor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compressor {
    Noop,
    Zlib {
        /// 0-9, or `None` for the library default.
        level: Option<u32>,
    },
}

impl Compressor {
    pub fn id(&self) -> u8 {
        match self {
            Compressor::Noop => NOOP_ID,
            Compressor::Zlib { .. } => ZLIB_ID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Noop => "noop",
            Compressor::Zlib { .. } => "zlib",
        }
    }

    /// Parse a `compressors` config entry.
    ///
    /// Snappy and zstd are advertised by servers but have no codec here,
    /// so they never negotiate.
    pub fn from_name(name: &str) -> Option<Compressor> {
        match name {
            "noop" => Some(Compressor::Noop),
            "zlib" => Some(Compressor::Zlib { level: None }),
            _ => None,
        }
    }

    /// First configured compressor the server also advertised.
    pub fn negotiate(ours: &[Compressor], server: &[String]) -> Option<Compressor> {
        ours.iter()
            .find(|c| server.iter().any(|name| name == c.name()))
            .copied()
    }

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Compressor::Noop => Ok(data.to_vec()),
            Compressor::Zlib { level } => {
                let level = level.map_or_else(Compression::default, Compression::new);
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

/// Decompress a payload by compressor id.
fn decompress(id: u8, data: &[u8], advertised: i32) -> Result<Bytes, ProtocolError> {
    let out = match id {
        NOOP_ID => data.to_vec(),
        ZLIB_ID => {
            let mut out = Vec::with_capacity(advertised.max(0) as usize);
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(ProtocolError::Decompress)?;
            out
        }
        // snappy and zstd carry known ids but no codec here
        id => return Err(ProtocolError::UnknownCompressor(id)),
    };
    if out.len() != advertised.max(0) as usize {
        return Err(ProtocolError::DecompressedSize { advertised, got: out.len() });
    }
    Ok(Bytes::from(out))
}

/// An inner message re-framed through a compressor.
#[derive(Debug)]
pub struct OpCompressed {
    original_opcode: i32,
    uncompressed_size: i32,
    compressor_id: u8,
    payload: Vec<u8>,
}

impl OpCompressed {
    /// Compress the body of an inner message.
    pub fn wrap<F: FrontendMessage>(msg: F, compressor: Compressor) -> std::io::Result<OpCompressed> {
        let mut body = BytesMut::with_capacity(msg.size_hint());
        let uncompressed_size = msg.size_hint().to_i32();
        msg.encode(&mut body);
        Ok(OpCompressed {
            original_opcode: F::OPCODE,
            uncompressed_size,
            compressor_id: compressor.id(),
            payload: compressor.compress(&body)?,
        })
    }
}

impl FrontendMessage for OpCompressed {
    const OPCODE: i32 = OP_COMPRESSED;

    fn size_hint(&self) -> usize {
        4 + 4 + 1 + self.payload.len()
    }

    fn encode(self, buf: &mut BytesMut) {
        use bytes::BufMut;
        buf.put_i32_le(self.original_opcode);
        buf.put_i32_le(self.uncompressed_size);
        buf.put_u8(self.compressor_id);
        buf.put_slice(&self.payload);
    }
}

/// Unwrap a received `OP_COMPRESSED` into its inner header and body.
///
/// Any other opcode passes through untouched.
pub fn unwrap_message(
    header: MessageHeader,
    mut body: Bytes,
) -> Result<(MessageHeader, Bytes), ProtocolError> {
    if header.opcode != OP_COMPRESSED {
        return Ok((header, body));
    }
    if body.len() < 9 {
        return Err(ProtocolError::Truncated("compressed prelude out of bounds"));
    }
    let original_opcode = body.get_i32_le();
    let uncompressed_size = body.get_i32_le();
    let compressor_id = body.get_u8();

    let inner = decompress(compressor_id, &body, uncompressed_size)?;
    let header = MessageHeader {
        length: (HEADER_LEN + inner.len()) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        opcode: original_opcode,
    };
    Ok((header, inner))
}

/// Decode a backend message, unwrapping compression first.
pub fn decode_unwrapped<B: BackendMessage>(
    header: MessageHeader,
    body: Bytes,
) -> Result<B, ProtocolError> {
    let (header, body) = unwrap_message(header, body)?;
    B::decode(&header, body)
}
