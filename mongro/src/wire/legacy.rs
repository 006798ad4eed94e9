//! `OP_QUERY` and `OP_REPLY`, kept for the handshake only.
use bytes::{Buf, Bytes, BytesMut};

use super::{BackendMessage, FrontendMessage, MessageHeader, OP_QUERY, OP_REPLY, ProtocolError};
use crate::ext::{BufMutExt, StrExt};
use bytes::BufMut;

/// Legacy query message.
///
/// The first message on a fresh socket is an `isMaster`/`hello` sent this
/// way, before the server has told us it can speak `OP_MSG`. Nothing else
/// uses it.
#[derive(Debug)]
pub struct OpQuery<'a> {
    pub flags: u32,
    /// `db.$cmd` namespace.
    pub full_collection_name: &'a str,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    /// The command document, already encoded.
    pub query: Bytes,
}

impl OpQuery<'_> {
    /// Permit reads from a non-primary.
    pub const SLAVE_OK: u32 = 1 << 2;
}

impl FrontendMessage for OpQuery<'_> {
    const OPCODE: i32 = OP_QUERY;

    fn size_hint(&self) -> usize {
        4 + self.full_collection_name.cstring_len() as usize + 4 + 4 + self.query.len()
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_u32_le(self.flags);
        buf.put_cstring(self.full_collection_name);
        buf.put_i32_le(self.number_to_skip);
        buf.put_i32_le(self.number_to_return);
        buf.put_slice(&self.query);
    }
}

/// Legacy reply message.
#[derive(Debug)]
pub struct OpReply {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Bytes>,
}

impl OpReply {
    pub const QUERY_FAILURE: i32 = 1 << 1;

    /// The single reply document of a handshake round trip.
    pub fn into_document(mut self) -> Result<crate::bson::Document, ProtocolError> {
        match self.documents.pop() {
            Some(doc) => Ok(crate::bson::Document::from_bytes(doc)?),
            None => Err(ProtocolError::Truncated("reply carries no document")),
        }
    }
}

impl BackendMessage for OpReply {
    fn decode(header: &MessageHeader, mut body: Bytes) -> Result<Self, ProtocolError> {
        if header.opcode != OP_REPLY {
            return Err(ProtocolError::UnexpectedOpcode { expected: OP_REPLY, got: header.opcode });
        }
        if body.len() < 20 {
            return Err(ProtocolError::Truncated("reply prelude out of bounds"));
        }
        let flags = body.get_i32_le();
        let cursor_id = body.get_i64_le();
        let starting_from = body.get_i32_le();
        let number_returned = body.get_i32_le();

        let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(ProtocolError::Truncated("reply document out of bounds"));
            }
            let len = (&body[..4]).get_i32_le();
            if len < 5 || len as usize > body.len() {
                return Err(ProtocolError::Truncated("reply document overruns message"));
            }
            documents.push(body.split_to(len as usize));
        }

        Ok(OpReply { flags, cursor_id, starting_from, documents })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;
    use crate::wire::{self, HEADER_LEN};

    #[test]
    fn query_layout() {
        let query = doc! { "isMaster": 1 }.to_bytes().unwrap();
        let mut buf = BytesMut::new();
        wire::write(
            OpQuery {
                flags: OpQuery::SLAVE_OK,
                full_collection_name: "admin.$cmd",
                number_to_skip: 0,
                number_to_return: -1,
                query: query.clone(),
            },
            &mut buf,
        );

        let header = MessageHeader::decode(&buf);
        assert_eq!(header.opcode, OP_QUERY);
        assert_eq!(header.length as usize, buf.len());
        // flags
        assert_eq!((&buf[HEADER_LEN..]).get_u32_le(), OpQuery::SLAVE_OK);
        // namespace cstring follows
        assert_eq!(&buf[HEADER_LEN + 4..HEADER_LEN + 14], b"admin.$cmd");
        assert_eq!(buf[HEADER_LEN + 14], 0);
    }

    #[test]
    fn reply_decode() {
        let doc_bytes = doc! { "ok": 1.0f64 }.to_bytes().unwrap();
        let mut body = BytesMut::new();
        body.put_i32_le(0);
        body.put_i64_le(0);
        body.put_i32_le(0);
        body.put_i32_le(1);
        body.put_slice(&doc_bytes);

        let header = MessageHeader {
            length: (HEADER_LEN + body.len()) as i32,
            request_id: 2,
            response_to: 1,
            opcode: OP_REPLY,
        };
        let reply = OpReply::decode(&header, body.freeze()).unwrap();
        assert_eq!(reply.documents.len(), 1);
        assert_eq!(reply.into_document().unwrap().get_f64("ok"), Some(1.0));
    }
}
