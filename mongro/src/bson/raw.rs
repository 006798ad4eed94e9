//! Streaming reader and writer over the document byte layout.
//!
//! Layout recap: `document = int32 length || element* || 0x00` where
//! `element = type:uint8 || cstring key || value`. The length prefix counts
//! the whole document including itself and the trailing nul. Numeric
//! primitives are little-endian.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    Binary, Bson, CodeWithScope, DateTime, DbPointer, Decimal128, Document, ElementType, ObjectId,
    Regex, Timestamp, ValueError,
};
use crate::{
    common::ByteStr,
    ext::{BufMutExt, BytesExt, UsizeExt},
};

// ===== Reader =====

/// Yields `(key, ValueReader)` pairs in encounter order until exhausted.
pub struct DocumentReader {
    body: Bytes,
}

impl DocumentReader {
    /// Validate framing and position at the first element.
    ///
    /// `data` must be exactly one encoded document.
    pub fn new(data: Bytes) -> Result<DocumentReader, ValueError> {
        if data.len() < 5 {
            return Err(ValueError::MalformedDoc("shorter than the minimal document".into()));
        }
        let len = (&data[..4]).get_i32_le();
        if len < 5 || len as usize != data.len() {
            return Err(ValueError::MalformedDoc("length prefix does not match buffer".into()));
        }
        if data[data.len() - 1] != 0 {
            return Err(ValueError::MalformedDoc("missing trailing nul".into()));
        }
        Ok(DocumentReader { body: data.slice(4..data.len() - 1) })
    }

    /// Next element, or `None` when exhausted.
    ///
    /// A malformed element poisons the reader.
    #[allow(clippy::should_implement_trait, reason = "Iterator forbid borrowed item")]
    pub fn next(&mut self) -> Option<Result<(ByteStr, ValueReader), ValueError>> {
        if self.body.is_empty() {
            return None;
        }
        let next = self.next_element();
        if next.is_err() {
            self.body = Bytes::new();
        }
        Some(next)
    }

    fn next_element(&mut self) -> Result<(ByteStr, ValueReader), ValueError> {
        let tag = self.body.get_u8();
        let Some(ty) = ElementType::from_u8(tag) else {
            return Err(ValueError::MalformedDoc("unknown element type".into()));
        };
        let key = self.body.get_cstring()?;
        let len = value_len(ty, &self.body)?;
        if len > self.body.len() {
            return Err(ValueError::MalformedDoc("value overruns document".into()));
        }
        let data = self.body.split_to(len);
        Ok((key, ValueReader { ty, data }))
    }

    /// Materialize the remaining elements.
    pub fn read_document(mut self) -> Result<Document, ValueError> {
        let mut doc = Document::new();
        while let Some(entry) = self.next() {
            let (key, value) = entry?;
            doc.insert(key.as_str(), value.read_bson()?);
        }
        Ok(doc)
    }
}

/// Byte length of the value following an element header.
fn value_len(ty: ElementType, b: &Bytes) -> Result<usize, ValueError> {
    let prefix = |at: usize| -> Result<usize, ValueError> {
        if b.len() < at + 4 {
            return Err(ValueError::MalformedDoc("length prefix out of bounds".into()));
        }
        let len = (&b[at..at + 4]).get_i32_le();
        if len < 0 {
            return Err(ValueError::MalformedDoc("negative length prefix".into()));
        }
        Ok(len as usize)
    };
    let cstring = |from: usize| -> Result<usize, ValueError> {
        match b[from..].iter().position(|e| matches!(e, b'\0')) {
            Some(i) => Ok(from + i + 1),
            None => Err(ValueError::MalformedDoc("unterminated cstring".into())),
        }
    };

    Ok(match ty {
        ElementType::Double | ElementType::DateTime | ElementType::Timestamp | ElementType::Int64 => 8,
        ElementType::Int32 => 4,
        ElementType::Boolean => 1,
        ElementType::ObjectId => 12,
        ElementType::Decimal128 => 16,
        ElementType::Null
        | ElementType::Undefined
        | ElementType::MinKey
        | ElementType::MaxKey => 0,
        ElementType::String | ElementType::JavaScript | ElementType::Symbol => 4 + prefix(0)?,
        ElementType::Document | ElementType::Array | ElementType::CodeWithScope => prefix(0)?,
        ElementType::Binary => 4 + 1 + prefix(0)?,
        ElementType::Regex => cstring(cstring(0)?)?,
        ElementType::DbPointer => 4 + prefix(0)? + 12,
    })
}

/// Reader of a single value, discriminated on the element type byte.
///
/// Each `read_*` consumes the reader; calling one against a value of
/// another type fails with [`ValueError::TypeMismatch`].
pub struct ValueReader {
    ty: ElementType,
    data: Bytes,
}

impl ValueReader {
    /// View raw encoded document bytes as a document value.
    pub fn document(data: Bytes) -> ValueReader {
        ValueReader { ty: ElementType::Document, data }
    }

    /// Reader over a synthetic null, for absent keys.
    pub(crate) fn null() -> ValueReader {
        ValueReader { ty: ElementType::Null, data: Bytes::new() }
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    /// Consume the value without materializing it.
    pub fn skip(self) { }

    fn expect(self, expected: ElementType) -> Result<Bytes, ValueError> {
        if self.ty == expected {
            Ok(self.data)
        } else {
            Err(ValueError::TypeMismatch { expected, found: self.ty })
        }
    }

    pub fn read_double(self) -> Result<f64, ValueError> {
        Ok(self.expect(ElementType::Double)?.get_f64_le())
    }

    /// Lossless double to float read.
    pub fn read_f32(self) -> Result<f32, ValueError> {
        let v = self.read_double()?;
        let narrow = v as f32;
        if narrow as f64 != v {
            return Err(ValueError::Truncation(v));
        }
        Ok(narrow)
    }

    /// Lossy double to float read, for destinations opting in.
    pub fn read_f32_truncated(self) -> Result<f32, ValueError> {
        Ok(self.read_double()? as f32)
    }

    fn read_prefixed_str(mut data: Bytes) -> Result<ByteStr, ValueError> {
        let len = data.get_i32_le();
        if len < 1 || len as usize != data.len() {
            return Err(ValueError::MalformedDoc("string length prefix missmatch".into()));
        }
        if data[data.len() - 1] != 0 {
            return Err(ValueError::MalformedDoc("string missing trailing nul".into()));
        }
        data.truncate(len as usize - 1);
        ByteStr::from_utf8(data).map_err(|_| ValueError::MalformedDoc("string is not utf8".into()))
    }

    pub fn read_str(self) -> Result<ByteStr, ValueError> {
        Self::read_prefixed_str(self.expect(ElementType::String)?)
    }

    pub fn read_i32(self) -> Result<i32, ValueError> {
        Ok(self.expect(ElementType::Int32)?.get_i32_le())
    }

    pub fn read_i64(self) -> Result<i64, ValueError> {
        Ok(self.expect(ElementType::Int64)?.get_i64_le())
    }

    /// Integer of either width, widened.
    pub fn read_int(mut self) -> Result<i64, ValueError> {
        match self.ty {
            ElementType::Int32 => Ok(self.data.get_i32_le() as i64),
            ElementType::Int64 => Ok(self.data.get_i64_le()),
            found => Err(ValueError::TypeMismatch { expected: ElementType::Int64, found }),
        }
    }

    pub fn read_bool(self) -> Result<bool, ValueError> {
        match self.expect(ElementType::Boolean)?.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ValueError::MalformedDoc("boolean out of range".into())),
        }
    }

    pub fn read_datetime(self) -> Result<DateTime, ValueError> {
        Ok(DateTime(self.expect(ElementType::DateTime)?.get_i64_le()))
    }

    pub fn read_timestamp(self) -> Result<Timestamp, ValueError> {
        let mut data = self.expect(ElementType::Timestamp)?;
        // increment is the low word on the wire
        let increment = data.get_u32_le();
        let time = data.get_u32_le();
        Ok(Timestamp { time, increment })
    }

    pub fn read_object_id(self) -> Result<ObjectId, ValueError> {
        let data = self.expect(ElementType::ObjectId)?;
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&data);
        Ok(ObjectId::from_bytes(bytes))
    }

    pub fn read_binary(self) -> Result<Binary, ValueError> {
        let mut data = self.expect(ElementType::Binary)?;
        let len = data.get_i32_le();
        let subtype = data.get_u8();
        if len as usize != data.len() {
            return Err(ValueError::MalformedDoc("binary length prefix missmatch".into()));
        }
        Ok(Binary { subtype, bytes: data })
    }

    pub fn read_regex(self) -> Result<Regex, ValueError> {
        let mut data = self.expect(ElementType::Regex)?;
        let pattern = data.get_cstring()?;
        let options = data.get_cstring()?;
        Ok(Regex { pattern: pattern.as_str().into(), options: options.as_str().into() })
    }

    pub fn read_decimal128(self) -> Result<Decimal128, ValueError> {
        let data = self.expect(ElementType::Decimal128)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&data);
        Ok(Decimal128(bytes))
    }

    pub fn read_document(self) -> Result<DocumentReader, ValueError> {
        DocumentReader::new(self.expect(ElementType::Document)?)
    }

    pub fn read_array(self) -> Result<ArrayReader, ValueError> {
        Ok(ArrayReader { inner: DocumentReader::new(self.expect(ElementType::Array)?)? })
    }

    /// Document value as its raw encoded bytes, without materializing.
    pub fn read_raw_document(self) -> Result<Bytes, ValueError> {
        self.expect(ElementType::Document)
    }

    /// Materialize the value.
    pub fn read_bson(self) -> Result<Bson, ValueError> {
        Ok(match self.ty {
            ElementType::Double => Bson::Double(self.read_double()?),
            ElementType::String => Bson::String(self.read_str()?.as_str().into()),
            ElementType::Document => Bson::Document(self.read_document()?.read_document()?),
            ElementType::Array => {
                let mut reader = self.read_array()?;
                let mut items = Vec::new();
                while let Some(item) = reader.next() {
                    items.push(item?.read_bson()?);
                }
                Bson::Array(items)
            }
            ElementType::Binary => Bson::Binary(self.read_binary()?),
            ElementType::Undefined => Bson::Undefined,
            ElementType::ObjectId => Bson::ObjectId(self.read_object_id()?),
            ElementType::Boolean => Bson::Boolean(self.read_bool()?),
            ElementType::DateTime => Bson::DateTime(self.read_datetime()?),
            ElementType::Null => Bson::Null,
            ElementType::Regex => Bson::Regex(self.read_regex()?),
            ElementType::DbPointer => {
                let mut data = self.data;
                let namespace = Self::read_prefixed_str(data.split_to(data.len() - 12))?;
                let mut bytes = [0u8; 12];
                bytes.copy_from_slice(&data);
                Bson::DbPointer(DbPointer {
                    namespace: namespace.as_str().into(),
                    id: ObjectId::from_bytes(bytes),
                })
            }
            ElementType::JavaScript => {
                Bson::JavaScript(Self::read_prefixed_str(self.data)?.as_str().into())
            }
            ElementType::Symbol => Bson::Symbol(Self::read_prefixed_str(self.data)?.as_str().into()),
            ElementType::CodeWithScope => {
                let mut data = self.data;
                if data.len() < 8 {
                    return Err(ValueError::MalformedDoc("code with scope too short".into()));
                }
                let total = data.get_i32_le();
                if total as usize != data.len() + 4 {
                    return Err(ValueError::MalformedDoc("code with scope length missmatch".into()));
                }
                let code_len = 4 + (&data[..4]).get_i32_le() as usize;
                if code_len > data.len() {
                    return Err(ValueError::MalformedDoc("code overruns scope".into()));
                }
                let code = Self::read_prefixed_str(data.split_to(code_len))?;
                let scope = DocumentReader::new(data)?.read_document()?;
                Bson::CodeWithScope(CodeWithScope { code: code.as_str().into(), scope })
            }
            ElementType::Int32 => Bson::Int32(self.read_i32()?),
            ElementType::Timestamp => Bson::Timestamp(self.read_timestamp()?),
            ElementType::Int64 => Bson::Int64(self.read_i64()?),
            ElementType::Decimal128 => Bson::Decimal128(self.read_decimal128()?),
            ElementType::MinKey => Bson::MinKey,
            ElementType::MaxKey => Bson::MaxKey,
        })
    }
}

impl std::fmt::Debug for ValueReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use crate::ext::FmtExt;
        f.debug_struct("ValueReader")
            .field("type", &self.ty)
            .field("data", &self.data.lossy())
            .finish()
    }
}

/// Yields [`ValueReader`]s until exhausted.
///
/// Array keys are the decimal index strings, which the reader discards.
pub struct ArrayReader {
    inner: DocumentReader,
}

impl ArrayReader {
    #[allow(clippy::should_implement_trait, reason = "Iterator forbid borrowed item")]
    pub fn next(&mut self) -> Option<Result<ValueReader, ValueError>> {
        Some(self.inner.next()?.map(|(_, value)| value))
    }
}

// ===== Writer =====

/// Writes elements in insertion order, closed exactly once.
pub struct DocumentWriter<'a> {
    buf: &'a mut BytesMut,
    start: usize,
    keys: Option<Vec<String>>,
    closed: bool,
}

impl<'a> DocumentWriter<'a> {
    /// Open a document, reserving its length prefix.
    pub fn new(buf: &'a mut BytesMut) -> DocumentWriter<'a> {
        let start = buf.len();
        buf.put_i32_le(0);
        DocumentWriter { buf, start, keys: None, closed: false }
    }

    /// Record written keys so a collision can be detected when a record is
    /// inlined into this document.
    pub fn track_keys(&mut self) {
        if self.keys.is_none() {
            self.keys = Some(Vec::new());
        }
    }

    /// Open an element under `key`.
    pub fn key(&mut self, key: &str) -> Result<ValueWriter<'_>, ValueError> {
        if self.closed {
            return Err(ValueError::Closed);
        }
        if key.is_empty() || key.as_bytes().contains(&b'\0') {
            return Err(ValueError::InvalidKey(key.into()));
        }
        if let Some(keys) = &mut self.keys {
            if keys.iter().any(|k| k == key) {
                return Err(ValueError::DuplicateInlineKey(key.into()));
            }
            keys.push(key.into());
        }
        let tag_at = self.buf.len();
        self.buf.put_u8(0);
        self.buf.put_cstring(key);
        Ok(ValueWriter { buf: self.buf, tag_at })
    }

    /// Terminate the document and back-patch its length prefix.
    pub fn close(&mut self) -> Result<(), ValueError> {
        if self.closed {
            return Err(ValueError::Closed);
        }
        self.closed = true;
        self.buf.put_u8(0);
        let len = (self.buf.len() - self.start).to_i32();
        self.buf[self.start..self.start + 4].copy_from_slice(&len.to_le_bytes());
        Ok(())
    }
}

/// Writer of a single value under an already written key.
///
/// Consumed by exactly one `put_*` call, which stamps the element type
/// byte reserved by [`DocumentWriter::key`].
pub struct ValueWriter<'a> {
    buf: &'a mut BytesMut,
    tag_at: usize,
}

impl<'a> ValueWriter<'a> {
    /// Writer over a scratch buffer, for top-level encode.
    pub(crate) fn scratch(buf: &'a mut BytesMut) -> ValueWriter<'a> {
        let tag_at = buf.len();
        buf.put_u8(0);
        ValueWriter { buf, tag_at }
    }

    fn tag(self, ty: ElementType) -> &'a mut BytesMut {
        self.buf[self.tag_at] = ty as u8;
        self.buf
    }

    pub fn put_double(self, v: f64) {
        self.tag(ElementType::Double).put_f64_le(v);
    }

    pub fn put_str(self, v: &str) {
        let buf = self.tag(ElementType::String);
        buf.put_i32_le(v.len().to_i32() + 1);
        buf.put_cstring(v);
    }

    pub fn put_i32(self, v: i32) {
        self.tag(ElementType::Int32).put_i32_le(v);
    }

    pub fn put_i64(self, v: i64) {
        self.tag(ElementType::Int64).put_i64_le(v);
    }

    /// Int64 shrunk to int32 when the value fits.
    pub fn put_i64_min_size(self, v: i64) {
        match i32::try_from(v) {
            Ok(v) => self.put_i32(v),
            Err(_) => self.put_i64(v),
        }
    }

    pub fn put_bool(self, v: bool) {
        self.tag(ElementType::Boolean).put_u8(v as u8);
    }

    pub fn put_null(self) {
        self.tag(ElementType::Null);
    }

    pub fn put_undefined(self) {
        self.tag(ElementType::Undefined);
    }

    pub fn put_min_key(self) {
        self.tag(ElementType::MinKey);
    }

    pub fn put_max_key(self) {
        self.tag(ElementType::MaxKey);
    }

    pub fn put_datetime(self, v: DateTime) {
        self.tag(ElementType::DateTime).put_i64_le(v.0);
    }

    pub fn put_timestamp(self, v: Timestamp) {
        let buf = self.tag(ElementType::Timestamp);
        buf.put_u32_le(v.increment);
        buf.put_u32_le(v.time);
    }

    pub fn put_object_id(self, v: ObjectId) {
        self.tag(ElementType::ObjectId).put_slice(&v.bytes());
    }

    pub fn put_binary(self, subtype: u8, bytes: &[u8]) {
        let buf = self.tag(ElementType::Binary);
        buf.put_i32_le(bytes.len().to_i32());
        buf.put_u8(subtype);
        buf.put_slice(bytes);
    }

    pub fn put_regex(self, v: &Regex) {
        let buf = self.tag(ElementType::Regex);
        buf.put_cstring(&v.pattern);
        buf.put_cstring(&v.options);
    }

    pub fn put_javascript(self, v: &str) {
        let buf = self.tag(ElementType::JavaScript);
        buf.put_i32_le(v.len().to_i32() + 1);
        buf.put_cstring(v);
    }

    pub fn put_symbol(self, v: &str) {
        let buf = self.tag(ElementType::Symbol);
        buf.put_i32_le(v.len().to_i32() + 1);
        buf.put_cstring(v);
    }

    pub fn put_db_pointer(self, v: &DbPointer) {
        let buf = self.tag(ElementType::DbPointer);
        buf.put_i32_le(v.namespace.len().to_i32() + 1);
        buf.put_cstring(&v.namespace);
        buf.put_slice(&v.id.bytes());
    }

    pub fn put_code_with_scope(self, v: &CodeWithScope) -> Result<(), ValueError> {
        let buf = self.tag(ElementType::CodeWithScope);
        let start = buf.len();
        buf.put_i32_le(0);
        buf.put_i32_le(v.code.len().to_i32() + 1);
        buf.put_cstring(&v.code);
        v.scope.write_to(buf)?;
        let total = (buf.len() - start).to_i32();
        buf[start..start + 4].copy_from_slice(&total.to_le_bytes());
        Ok(())
    }

    pub fn put_decimal128(self, v: Decimal128) {
        self.tag(ElementType::Decimal128).put_slice(&v.0);
    }

    /// Splice an already encoded document.
    pub fn put_raw_document(self, raw: &[u8]) {
        self.tag(ElementType::Document).put_slice(raw);
    }

    pub fn put_document(self) -> DocumentWriter<'a> {
        DocumentWriter::new(self.tag(ElementType::Document))
    }

    pub fn put_array(self) -> ArrayWriter<'a> {
        ArrayWriter { inner: DocumentWriter::new(self.tag(ElementType::Array)), index: 0 }
    }
}

/// Writes elements keyed by their decimal index, starting at `"0"`.
pub struct ArrayWriter<'a> {
    inner: DocumentWriter<'a>,
    index: u32,
}

impl ArrayWriter<'_> {
    /// Open the next element.
    pub fn element(&mut self) -> Result<ValueWriter<'_>, ValueError> {
        let mut key = itoa::Buffer::new();
        let w = self.inner.key(key.format(self.index))?;
        self.index += 1;
        Ok(w)
    }

    pub fn close(&mut self) -> Result<(), ValueError> {
        self.inner.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    fn encode(doc: &Document) -> Vec<u8> {
        doc.to_bytes().unwrap().to_vec()
    }

    #[test]
    fn empty_document_is_five_bytes() {
        assert_eq!(encode(&Document::new()), [0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn null_fixture() {
        let doc = doc! { "foo": (Bson::Null) };
        assert_eq!(
            encode(&doc),
            [0x0A, 0, 0, 0, 0x0A, 0x66, 0x6F, 0x6F, 0x00, 0x00],
        );
    }

    #[test]
    fn string_fixture() {
        let doc = doc! { "hello": "world" };
        assert_eq!(
            encode(&doc),
            [
                0x16, 0, 0, 0, //
                0x02, 0x68, 0x65, 0x6C, 0x6C, 0x6F, 0x00, //
                0x06, 0, 0, 0, 0x77, 0x6F, 0x72, 0x6C, 0x64, 0x00, //
                0x00,
            ],
        );
    }

    #[test]
    fn int_widths_fixture() {
        let doc = doc! { "a": 1i32, "b": 2i64 };
        assert_eq!(
            encode(&doc),
            [
                0x15, 0, 0, 0, //
                0x10, 0x61, 0x00, 0x01, 0, 0, 0, //
                0x12, 0x62, 0x00, 0x02, 0, 0, 0, 0, 0, 0, 0, //
                0x00,
            ],
        );
    }

    #[test]
    fn write_past_close() {
        let mut buf = BytesMut::new();
        let mut w = DocumentWriter::new(&mut buf);
        w.key("a").unwrap().put_i32(1);
        w.close().unwrap();
        assert!(matches!(w.key("b"), Err(ValueError::Closed)));
        assert!(matches!(w.close(), Err(ValueError::Closed)));
    }

    #[test]
    fn rejects_bad_keys() {
        let mut buf = BytesMut::new();
        let mut w = DocumentWriter::new(&mut buf);
        assert!(matches!(w.key(""), Err(ValueError::InvalidKey(_))));
        assert!(matches!(w.key("a\0b"), Err(ValueError::InvalidKey(_))));
    }

    #[test]
    fn type_missmatch_read() {
        let bytes = doc! { "n": 42i32 }.to_bytes().unwrap();
        let mut reader = DocumentReader::new(bytes).unwrap();
        let (key, value) = reader.next().unwrap().unwrap();
        assert_eq!(key, "n");
        assert!(matches!(
            value.read_str(),
            Err(ValueError::TypeMismatch { .. }),
        ));
    }

    #[test]
    fn skip_without_materializing() {
        let bytes = doc! { "a": { "deep": [1, 2, 3] }, "b": 7i32 }.to_bytes().unwrap();
        let mut reader = DocumentReader::new(bytes).unwrap();
        let (_, value) = reader.next().unwrap().unwrap();
        value.skip();
        let (key, value) = reader.next().unwrap().unwrap();
        assert_eq!(key, "b");
        assert_eq!(value.read_i32().unwrap(), 7);
        assert!(reader.next().is_none());
    }

    #[test]
    fn timestamp_word_order() {
        let bytes = doc! { "ts": (Timestamp { time: 5, increment: 1 }) }.to_bytes().unwrap();
        // value starts after: len(4) + tag(1) + "ts\0"(3)
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes()); // increment low
        assert_eq!(&bytes[12..16], &5u32.to_le_bytes()); // time high
        let doc = Document::from_bytes(bytes).unwrap();
        assert_eq!(doc.get_timestamp("ts"), Some(Timestamp { time: 5, increment: 1 }));
    }

    #[test]
    fn truncated_buffer_fails() {
        let mut bytes = doc! { "hello": "world" }.to_bytes().unwrap().to_vec();
        bytes.pop();
        assert!(DocumentReader::new(Bytes::from(bytes)).is_err());
    }

    #[test]
    fn round_trip_every_variant() {
        let doc = doc! {
            "double": 3.5f64,
            "string": "text",
            "doc": { "inner": 1 },
            "array": [1, "two", { "three": 3 }],
            "binary": (Binary { subtype: 0, bytes: Bytes::from_static(b"\x01\x02") }),
            "undefined": (Bson::Undefined),
            "oid": (ObjectId::from_bytes(*b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c")),
            "bool": true,
            "datetime": (DateTime(1234567890123)),
            "null": (Bson::Null),
            "regex": (Regex { pattern: "^a".into(), options: "i".into() }),
            "js": (Bson::JavaScript("function() {}".into())),
            "symbol": (Bson::Symbol("sym".into())),
            "code_w_s": (CodeWithScope { code: "x".into(), scope: doc! { "x": 1 } }),
            "int32": 42i32,
            "timestamp": (Timestamp { time: 4, increment: 9 }),
            "int64": 99i64,
            "decimal": (Decimal128([7u8; 16])),
            "min": (Bson::MinKey),
            "max": (Bson::MaxKey),
        };
        let decoded = Document::from_bytes(doc.to_bytes().unwrap()).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn round_trip_depth_four() {
        let mut doc = doc! { "leaf": 1 };
        for depth in 0..4 {
            let mut outer = Document::new();
            outer.insert("level", depth);
            outer.insert("nested", doc);
            outer.insert("items", vec![Bson::Int32(depth), Bson::Null]);
            doc = outer;
        }
        let decoded = Document::from_bytes(doc.to_bytes().unwrap()).unwrap();
        assert_eq!(doc, decoded);
    }
}
