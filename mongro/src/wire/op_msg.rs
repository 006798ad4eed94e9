//! `OP_MSG`, the command message.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{BackendMessage, FrontendMessage, HEADER_LEN, MessageHeader, OP_MSG, ProtocolError};
use crate::ext::{BufMutExt, BytesExt, UsizeExt};

/// Command message, a body document plus optional document sequences.
#[derive(Debug)]
pub struct OpMsg {
    pub flags: u32,
    /// Section kind 0, the command document, already encoded.
    pub body: Bytes,
    /// Section kind 1 entries.
    pub sequences: Vec<DocumentSequence>,
}

/// A document sequence section.
///
/// The identifier names the field that, in an equivalent single body
/// encoding, would hold the array. Batches stream through here without
/// being copied into the command document.
#[derive(Debug)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Bytes>,
}

impl DocumentSequence {
    /// Section size on the wire: the size prefix counts itself, the
    /// identifier cstring and every document.
    fn size(&self) -> usize {
        4 + self.identifier.len() + 1 + self.documents.iter().map(Bytes::len).sum::<usize>()
    }
}

impl OpMsg {
    pub const CHECKSUM_PRESENT: u32 = 1 << 0;
    pub const MORE_TO_COME: u32 = 1 << 1;
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;

    pub fn new(body: Bytes) -> OpMsg {
        OpMsg { flags: 0, body, sequences: Vec::new() }
    }

    pub fn with_flags(mut self, flags: u32) -> OpMsg {
        self.flags |= flags;
        self
    }

    pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Bytes>) -> OpMsg {
        self.sequences.push(DocumentSequence { identifier: identifier.into(), documents });
        self
    }

    /// Command document materialized from the body section.
    pub fn document(&self) -> Result<crate::bson::Document, crate::bson::ValueError> {
        crate::bson::Document::from_bytes(self.body.clone())
    }
}

impl FrontendMessage for OpMsg {
    const OPCODE: i32 = OP_MSG;

    fn size_hint(&self) -> usize {
        4 // flags
            + 1 + self.body.len()
            + self.sequences.iter().map(|s| 1 + s.size()).sum::<usize>()
            + if self.flags & Self::CHECKSUM_PRESENT != 0 { 4 } else { 0 }
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_u32_le(self.flags);

        buf.put_u8(0); // body section
        buf.put_slice(&self.body);

        for sequence in &self.sequences {
            buf.put_u8(1); // document sequence section
            buf.put_i32_le(sequence.size().to_i32());
            buf.put_cstring(&sequence.identifier);
            for doc in &sequence.documents {
                buf.put_slice(doc);
            }
        }

        if self.flags & Self::CHECKSUM_PRESENT != 0 {
            // patched by `wire::write` once the whole message is in place
            buf.put_u32_le(0);
        }
    }
}

impl BackendMessage for OpMsg {
    fn decode(header: &MessageHeader, mut body: Bytes) -> Result<Self, ProtocolError> {
        if header.opcode != OP_MSG {
            return Err(ProtocolError::UnexpectedOpcode { expected: OP_MSG, got: header.opcode });
        }
        if body.len() < 4 {
            return Err(ProtocolError::Truncated("missing flag bits"));
        }
        let flags = body.get_u32_le();

        if flags & Self::CHECKSUM_PRESENT != 0 {
            if body.len() < 4 {
                return Err(ProtocolError::Truncated("missing checksum"));
            }
            let expected = (&body[body.len() - 4..]).get_u32_le();
            body.truncate(body.len() - 4);

            let mut covered = BytesMut::with_capacity(HEADER_LEN + 4);
            header.encode(&mut covered);
            covered.put_u32_le(flags);
            let mut sum = crc32c::crc32c(&covered);
            sum = crc32c::crc32c_append(sum, &body);
            if sum != expected {
                return Err(ProtocolError::ChecksumMismatch { expected, got: sum });
            }
        }

        let mut msg_body = None;
        let mut sequences = Vec::new();

        while !body.is_empty() {
            match body.get_u8() {
                0 => {
                    let len = doc_len(&body)?;
                    let doc = body.split_to(len);
                    if msg_body.is_some() {
                        return Err(ProtocolError::Truncated("multiple body sections"));
                    }
                    msg_body = Some(doc);
                }
                1 => {
                    if body.len() < 4 {
                        return Err(ProtocolError::Truncated("sequence size out of bounds"));
                    }
                    let size = (&body[..4]).get_i32_le() as usize;
                    if size < 4 || size > body.len() {
                        return Err(ProtocolError::Truncated("sequence overruns message"));
                    }
                    let mut section = body.split_to(size);
                    section.advance(4);
                    let identifier = section
                        .get_cstring()
                        .map_err(|_| ProtocolError::Truncated("sequence identifier"))?;
                    let mut documents = Vec::new();
                    while !section.is_empty() {
                        let len = doc_len(&section)?;
                        documents.push(section.split_to(len));
                    }
                    sequences.push(DocumentSequence {
                        identifier: identifier.as_str().into(),
                        documents,
                    });
                }
                kind => return Err(ProtocolError::UnknownSection(kind)),
            }
        }

        match msg_body {
            Some(body) => Ok(OpMsg { flags, body, sequences }),
            None => Err(ProtocolError::Truncated("missing body section")),
        }
    }
}

/// Length of the document starting at the head of `b`, bounds checked.
fn doc_len(b: &Bytes) -> Result<usize, ProtocolError> {
    if b.len() < 4 {
        return Err(ProtocolError::Truncated("document length out of bounds"));
    }
    let len = (&b[..4]).get_i32_le();
    if len < 5 || len as usize > b.len() {
        return Err(ProtocolError::Truncated("document overruns message"));
    }
    Ok(len as usize)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;
    use crate::wire;

    fn round_trip(msg: OpMsg) -> OpMsg {
        let mut buf = BytesMut::new();
        wire::write(msg, &mut buf);
        let header = MessageHeader::decode(&buf);
        assert_eq!(header.length as usize, buf.len());
        let body = Bytes::from(buf.to_vec()).slice(HEADER_LEN..);
        OpMsg::decode(&header, body).unwrap()
    }

    #[test]
    fn body_round_trip() {
        let body = doc! { "ping": 1, "$db": "admin" }.to_bytes().unwrap();
        let decoded = round_trip(OpMsg::new(body.clone()));
        assert_eq!(decoded.body, body);
        assert_eq!(decoded.flags, 0);
        assert!(decoded.sequences.is_empty());
    }

    #[test]
    fn sequence_round_trip() {
        let body = doc! { "insert": "users", "$db": "app" }.to_bytes().unwrap();
        let batch = vec![
            doc! { "n": 1 }.to_bytes().unwrap(),
            doc! { "n": 2 }.to_bytes().unwrap(),
        ];
        let decoded = round_trip(OpMsg::new(body).with_sequence("documents", batch.clone()));
        assert_eq!(decoded.sequences.len(), 1);
        assert_eq!(decoded.sequences[0].identifier, "documents");
        assert_eq!(decoded.sequences[0].documents, batch);
    }

    #[test]
    fn checksum_round_trip() {
        let body = doc! { "ping": 1 }.to_bytes().unwrap();
        let msg = OpMsg::new(body).with_flags(OpMsg::CHECKSUM_PRESENT);
        let decoded = round_trip(msg);
        assert_ne!(decoded.flags & OpMsg::CHECKSUM_PRESENT, 0);
    }

    #[test]
    fn corrupted_checksum_fails() {
        let body = doc! { "ping": 1 }.to_bytes().unwrap();
        let mut buf = BytesMut::new();
        wire::write(OpMsg::new(body).with_flags(OpMsg::CHECKSUM_PRESENT), &mut buf);
        let at = buf.len() - 20;
        buf[at] ^= 0xFF;
        let header = MessageHeader::decode(&buf);
        let body = Bytes::from(buf.to_vec()).slice(HEADER_LEN..);
        assert!(matches!(
            OpMsg::decode(&header, body),
            Err(ProtocolError::ChecksumMismatch { .. }),
        ));
    }

    #[test]
    fn more_to_come_flag() {
        let msg = OpMsg::new(Bytes::new()).with_flags(OpMsg::MORE_TO_COME);
        assert_ne!(msg.flags & OpMsg::MORE_TO_COME, 0);
        assert_eq!(msg.flags & OpMsg::EXHAUST_ALLOWED, 0);
    }
}
