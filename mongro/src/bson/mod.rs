//! Document value model and codec.
//!
//! - [`Bson`], [`Document`]
//! - [`DocumentReader`], [`DocumentWriter`] streaming layer
//! - [`Encode`], [`Decode`] user type mapping
//! - [`Registry`] runtime codec overrides
use bytes::{Bytes, BytesMut};

mod error;
mod oid;
mod raw;

pub mod decode;
pub mod encode;
pub mod extjson;
pub mod registry;

pub use decode::Decode;
pub use encode::Encode;
pub use error::ValueError;
pub use oid::ObjectId;
pub use raw::{ArrayReader, ArrayWriter, DocumentReader, DocumentWriter, ValueReader, ValueWriter};
pub use registry::Registry;

/// Element type byte of a document value.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    Double = 0x01,
    String = 0x02,
    Document = 0x03,
    Array = 0x04,
    Binary = 0x05,
    Undefined = 0x06,
    ObjectId = 0x07,
    Boolean = 0x08,
    DateTime = 0x09,
    Null = 0x0A,
    Regex = 0x0B,
    DbPointer = 0x0C,
    JavaScript = 0x0D,
    Symbol = 0x0E,
    CodeWithScope = 0x0F,
    Int32 = 0x10,
    Timestamp = 0x11,
    Int64 = 0x12,
    Decimal128 = 0x13,
    MaxKey = 0x7F,
    MinKey = 0xFF,
}

impl ElementType {
    pub fn from_u8(tag: u8) -> Option<ElementType> {
        Some(match tag {
            0x01 => Self::Double,
            0x02 => Self::String,
            0x03 => Self::Document,
            0x04 => Self::Array,
            0x05 => Self::Binary,
            0x06 => Self::Undefined,
            0x07 => Self::ObjectId,
            0x08 => Self::Boolean,
            0x09 => Self::DateTime,
            0x0A => Self::Null,
            0x0B => Self::Regex,
            0x0C => Self::DbPointer,
            0x0D => Self::JavaScript,
            0x0E => Self::Symbol,
            0x0F => Self::CodeWithScope,
            0x10 => Self::Int32,
            0x11 => Self::Timestamp,
            0x12 => Self::Int64,
            0x13 => Self::Decimal128,
            0x7F => Self::MaxKey,
            0xFF => Self::MinKey,
            _ => return None,
        })
    }
}

impl std::fmt::Debug for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Document => "document",
            Self::Array => "array",
            Self::Binary => "binary",
            Self::Undefined => "undefined",
            Self::ObjectId => "objectId",
            Self::Boolean => "boolean",
            Self::DateTime => "dateTime",
            Self::Null => "null",
            Self::Regex => "regex",
            Self::DbPointer => "dbPointer",
            Self::JavaScript => "javascript",
            Self::Symbol => "symbol",
            Self::CodeWithScope => "codeWithScope",
            Self::Int32 => "int32",
            Self::Timestamp => "timestamp",
            Self::Int64 => "int64",
            Self::Decimal128 => "decimal128",
            Self::MaxKey => "maxKey",
            Self::MinKey => "minKey",
        };
        f.write_str(name)
    }
}

/// Milliseconds since unix epoch, signed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTime(pub i64);

impl DateTime {
    pub fn now() -> DateTime {
        use std::time::{SystemTime, UNIX_EPOCH};
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => DateTime(d.as_millis() as i64),
            Err(e) => DateTime(-(e.duration().as_millis() as i64)),
        }
    }
}

/// Two unsigned 32-bit words, ordered seconds first.
///
/// This is the cluster ordering signal, not a wall clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

/// Binary value with its subtype byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binary {
    pub subtype: u8,
    pub bytes: Bytes,
}

impl Binary {
    pub const SUBTYPE_GENERIC: u8 = 0x00;
    pub const SUBTYPE_UUID: u8 = 0x04;
}

/// Regular expression pattern with options.
///
/// Options are stored sorted, as the wire requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

/// Deprecated namespace + object id pair, kept for decode completeness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbPointer {
    pub namespace: String,
    pub id: ObjectId,
}

/// Javascript code with its scope document.
#[derive(Clone, Debug, PartialEq)]
pub struct CodeWithScope {
    pub code: String,
    pub scope: Document,
}

/// 16 bytes IEEE 754-2008 decimal, carried opaque.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Decimal128(pub [u8; 16]);

impl std::fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Decimal128(")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// A document value.
#[derive(Clone, Debug, PartialEq)]
pub enum Bson {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Bson>),
    Binary(Binary),
    Undefined,
    ObjectId(ObjectId),
    Boolean(bool),
    DateTime(DateTime),
    Null,
    Regex(Regex),
    DbPointer(DbPointer),
    JavaScript(String),
    Symbol(String),
    CodeWithScope(CodeWithScope),
    Int32(i32),
    Timestamp(Timestamp),
    Int64(i64),
    Decimal128(Decimal128),
    MinKey,
    MaxKey,
}

impl Bson {
    pub fn element_type(&self) -> ElementType {
        match self {
            Bson::Double(_) => ElementType::Double,
            Bson::String(_) => ElementType::String,
            Bson::Document(_) => ElementType::Document,
            Bson::Array(_) => ElementType::Array,
            Bson::Binary(_) => ElementType::Binary,
            Bson::Undefined => ElementType::Undefined,
            Bson::ObjectId(_) => ElementType::ObjectId,
            Bson::Boolean(_) => ElementType::Boolean,
            Bson::DateTime(_) => ElementType::DateTime,
            Bson::Null => ElementType::Null,
            Bson::Regex(_) => ElementType::Regex,
            Bson::DbPointer(_) => ElementType::DbPointer,
            Bson::JavaScript(_) => ElementType::JavaScript,
            Bson::Symbol(_) => ElementType::Symbol,
            Bson::CodeWithScope(_) => ElementType::CodeWithScope,
            Bson::Int32(_) => ElementType::Int32,
            Bson::Timestamp(_) => ElementType::Timestamp,
            Bson::Int64(_) => ElementType::Int64,
            Bson::Decimal128(_) => ElementType::Decimal128,
            Bson::MinKey => ElementType::MinKey,
            Bson::MaxKey => ElementType::MaxKey,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Bson::Int32(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Bson::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value widened to `i64`, if losslessly possible.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bson::Int32(i) => Some(*i as i64),
            Bson::Int64(i) => Some(*i),
            Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Bson::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Bson::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Bson]> {
        match self {
            Bson::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Bson::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Bson::ObjectId(o) => Some(*o),
            _ => None,
        }
    }
}

macro_rules! bson_from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Bson {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

bson_from!(<f64>v => Bson::Double(v));
bson_from!(<&str>v => Bson::String(v.into()));
bson_from!(<String>v => Bson::String(v));
bson_from!(<Document>v => Bson::Document(v));
bson_from!(<Vec<Bson>>v => Bson::Array(v));
bson_from!(<Binary>v => Bson::Binary(v));
bson_from!(<ObjectId>v => Bson::ObjectId(v));
bson_from!(<bool>v => Bson::Boolean(v));
bson_from!(<DateTime>v => Bson::DateTime(v));
bson_from!(<Regex>v => Bson::Regex(v));
bson_from!(<i32>v => Bson::Int32(v));
bson_from!(<Timestamp>v => Bson::Timestamp(v));
bson_from!(<i64>v => Bson::Int64(v));
bson_from!(<Decimal128>v => Bson::Decimal128(v));
bson_from!(<CodeWithScope>v => Bson::CodeWithScope(v));

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Bson::Null,
        }
    }
}

/// An ordered sequence of key/value pairs.
#[derive(Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    pub const fn new() -> Document {
        Document { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a key/value pair, keeping insertion order.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> &mut Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let at = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(at).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bson)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key)?.as_i32()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_i64()
    }

    /// Numeric value under `key` widened to `i64`.
    ///
    /// Servers are loose about integer width in replies, so lookups of
    /// counters and sizes go through this.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_int()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key)?.as_document()
    }

    pub fn get_array(&self, key: &str) -> Option<&[Bson]> {
        self.get(key)?.as_array()
    }

    pub fn get_timestamp(&self, key: &str) -> Option<Timestamp> {
        self.get(key)?.as_timestamp()
    }

    /// Encode self into `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ValueError> {
        let mut w = DocumentWriter::new(buf);
        for (key, value) in self.iter() {
            encode::write_bson(w.key(key)?, value)?;
        }
        w.close()
    }

    /// Encode self into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ValueError> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a document, materializing every value.
    pub fn from_bytes(bytes: Bytes) -> Result<Document, ValueError> {
        let mut reader = DocumentReader::new(bytes)?;
        let mut doc = Document::new();
        while let Some(entry) = reader.next() {
            let (key, value) = entry?;
            doc.insert(key.as_str(), value.read_bson()?);
        }
        Ok(doc)
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);

    type IntoIter = std::vec::IntoIter<(String, Bson)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Bson)>>(iter: I) -> Self {
        Document { entries: iter.into_iter().collect() }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_map();
        for (k, v) in self.iter() {
            dbg.key(&k);
            dbg.value(v);
        }
        dbg.finish()
    }
}

/// Build a [`Document`] in place.
///
/// ```
/// use mongro::bson::doc;
///
/// let filter = doc! { "age": { "$gt": 21 }, "active": true };
/// assert_eq!(filter.get_document("age").unwrap().get_i32("$gt"), Some(21));
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::bson::Document::new() };
    ($($key:tt : $value:tt),* $(,)?) => {{
        let mut doc = $crate::bson::Document::new();
        $(doc.insert($key, $crate::doc!(@value $value));)*
        doc
    }};
    (@value { $($tt:tt)* }) => { $crate::doc! { $($tt)* } };
    (@value [ $($item:tt),* $(,)? ]) => {
        $crate::bson::Bson::Array(vec![$($crate::bson::Bson::from($crate::doc!(@value $item))),*])
    };
    (@value $expr:expr) => { $expr };
}

pub use crate::doc;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insertion_order() {
        let doc = doc! { "b": 1, "a": 2, "c": 3 };
        let keys = doc.iter().map(|(k, _)| k).collect::<Vec<_>>();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn nested_macro() {
        let doc = doc! { "find": "users", "filter": { "tags": ["a", "b"] } };
        let filter = doc.get_document("filter").unwrap();
        let tags = filter.get_array("tags").unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].as_str(), Some("a"));
    }

    #[test]
    fn widened_int_lookup() {
        let mut doc = Document::new();
        doc.insert("a", 1i32);
        doc.insert("b", 2i64);
        doc.insert("c", 3.0f64);
        assert_eq!(doc.get_int("a"), Some(1));
        assert_eq!(doc.get_int("b"), Some(2));
        assert_eq!(doc.get_int("c"), Some(3));
    }
}
