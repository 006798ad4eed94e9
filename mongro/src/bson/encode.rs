//! The [`Encode`] trait.
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};

use super::{
    Binary, Bson, DateTime, Decimal128, Document, DocumentWriter, ElementType, ObjectId, Regex,
    Timestamp, ValueError, ValueWriter,
};
use crate::common::ByteStr;

/// A type that can be encoded as a document value.
pub trait Encode {
    /// Write self through `w`.
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError>;

    /// Whether self is the empty value for its type.
    ///
    /// Fields marked `omit_empty` are dropped when this returns `true`.
    fn is_empty_value(&self) -> bool {
        false
    }
}

/// A record whose fields can be expanded into an enclosing document.
///
/// Derived alongside [`Encode`]; required by fields marked `inline`.
pub trait EncodeFields {
    fn encode_fields(&self, doc: &mut DocumentWriter<'_>) -> Result<(), ValueError>;
}

/// Integer encode that shrinks to int32 when the value fits.
///
/// Used by fields marked `min_size`.
pub trait EncodeMinSize {
    fn encode_min_size(&self, w: ValueWriter<'_>) -> Result<(), ValueError>;
}

/// Encode `value` to a standalone document byte buffer.
///
/// The value must encode itself as a document, anything else fails with
/// [`ValueError::TypeMismatch`].
pub fn to_bytes<T: Encode + ?Sized>(value: &T) -> Result<Bytes, ValueError> {
    let mut buf = BytesMut::new();
    let w = ValueWriter::scratch(&mut buf);
    value.encode(w)?;
    if buf[0] != ElementType::Document as u8 {
        let found = ElementType::from_u8(buf[0]).unwrap_or(ElementType::Undefined);
        return Err(ValueError::TypeMismatch { expected: ElementType::Document, found });
    }
    Ok(buf.freeze().slice(1..))
}

/// Encode `value` to a materialized [`Document`].
pub fn to_document<T: Encode + ?Sized>(value: &T) -> Result<Document, ValueError> {
    Document::from_bytes(to_bytes(value)?)
}

/// Write a [`Bson`] value through `w`.
pub fn write_bson(w: ValueWriter<'_>, value: &Bson) -> Result<(), ValueError> {
    match value {
        Bson::Double(v) => w.put_double(*v),
        Bson::String(v) => w.put_str(v),
        Bson::Document(v) => {
            let mut doc = w.put_document();
            for (key, value) in v.iter() {
                write_bson(doc.key(key)?, value)?;
            }
            doc.close()?;
        }
        Bson::Array(v) => {
            let mut array = w.put_array();
            for item in v {
                write_bson(array.element()?, item)?;
            }
            array.close()?;
        }
        Bson::Binary(v) => w.put_binary(v.subtype, &v.bytes),
        Bson::Undefined => w.put_undefined(),
        Bson::ObjectId(v) => w.put_object_id(*v),
        Bson::Boolean(v) => w.put_bool(*v),
        Bson::DateTime(v) => w.put_datetime(*v),
        Bson::Null => w.put_null(),
        Bson::Regex(v) => w.put_regex(v),
        Bson::DbPointer(v) => w.put_db_pointer(v),
        Bson::JavaScript(v) => w.put_javascript(v),
        Bson::Symbol(v) => w.put_symbol(v),
        Bson::CodeWithScope(v) => w.put_code_with_scope(v)?,
        Bson::Int32(v) => w.put_i32(*v),
        Bson::Timestamp(v) => w.put_timestamp(*v),
        Bson::Int64(v) => w.put_i64(*v),
        Bson::Decimal128(v) => w.put_decimal128(*v),
        Bson::MinKey => w.put_min_key(),
        Bson::MaxKey => w.put_max_key(),
    }
    Ok(())
}

impl Encode for Bson {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        write_bson(w, self)
    }

    fn is_empty_value(&self) -> bool {
        matches!(self, Bson::Null)
    }
}

impl Encode for Document {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        let mut doc = w.put_document();
        for (key, value) in self.iter() {
            write_bson(doc.key(key)?, value)?;
        }
        doc.close()
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl EncodeFields for Document {
    fn encode_fields(&self, doc: &mut DocumentWriter<'_>) -> Result<(), ValueError> {
        for (key, value) in self.iter() {
            write_bson(doc.key(key)?, value)?;
        }
        Ok(())
    }
}

macro_rules! encode {
    (<$ty:ty>($v:ident, $w:ident) => $body:expr) => {
        impl Encode for $ty {
            fn encode(&self, $w: ValueWriter<'_>) -> Result<(), ValueError> {
                let $v = *self;
                $body;
                Ok(())
            }

            fn is_empty_value(&self) -> bool {
                *self == <$ty>::default()
            }
        }
    };
}

encode!(<f64>(v, w) => w.put_double(v));
encode!(<f32>(v, w) => w.put_double(v as f64));
encode!(<i32>(v, w) => w.put_i32(v));
encode!(<i64>(v, w) => w.put_i64(v));
encode!(<bool>(v, w) => w.put_bool(v));
encode!(<DateTime>(v, w) => w.put_datetime(v));
encode!(<Timestamp>(v, w) => w.put_timestamp(v));

impl Encode for u32 {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_i64_min_size(*self as i64);
        Ok(())
    }

    fn is_empty_value(&self) -> bool {
        *self == 0
    }
}

impl Encode for u64 {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        match i64::try_from(*self) {
            Ok(v) => {
                w.put_i64(v);
                Ok(())
            }
            Err(_) => Err(ValueError::Overflow { value: i64::MAX, target: "i64" }),
        }
    }

    fn is_empty_value(&self) -> bool {
        *self == 0
    }
}

impl Encode for str {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_str(self);
        Ok(())
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Encode for String {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_str(self);
        Ok(())
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Encode for ByteStr {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_str(self);
        Ok(())
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl Encode for ObjectId {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_object_id(*self);
        Ok(())
    }
}

impl Encode for Binary {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_binary(self.subtype, &self.bytes);
        Ok(())
    }
}

impl Encode for Regex {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_regex(self);
        Ok(())
    }
}

impl Encode for Decimal128 {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_decimal128(*self);
        Ok(())
    }
}

impl Encode for uuid::Uuid {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_binary(Binary::SUBTYPE_UUID, self.as_bytes());
        Ok(())
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        match self {
            Some(v) => v.encode(w),
            None => {
                w.put_null();
                Ok(())
            }
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_none()
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        let mut array = w.put_array();
        for item in self {
            item.encode(array.element()?)?;
        }
        array.close()
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        self.as_slice().encode(w)
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        T::encode(self, w)
    }

    fn is_empty_value(&self) -> bool {
        T::is_empty_value(self)
    }
}

impl<V: Encode> Encode for BTreeMap<String, V> {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        let mut doc = w.put_document();
        for (key, value) in self {
            value.encode(doc.key(key)?)?;
        }
        doc.close()
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<V: Encode> Encode for HashMap<String, V> {
    fn encode(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        let mut doc = w.put_document();
        for (key, value) in self {
            value.encode(doc.key(key)?)?;
        }
        doc.close()
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl EncodeMinSize for i64 {
    fn encode_min_size(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_i64_min_size(*self);
        Ok(())
    }
}

impl EncodeMinSize for u64 {
    fn encode_min_size(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        match i64::try_from(*self) {
            Ok(v) => {
                w.put_i64_min_size(v);
                Ok(())
            }
            Err(_) => Err(ValueError::Overflow { value: i64::MAX, target: "i64" }),
        }
    }
}

impl EncodeMinSize for i32 {
    fn encode_min_size(&self, w: ValueWriter<'_>) -> Result<(), ValueError> {
        w.put_i32(*self);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn min_size_shrinks() {
        let mut buf = BytesMut::new();
        let mut w = DocumentWriter::new(&mut buf);
        3i64.encode_min_size(w.key("small").unwrap()).unwrap();
        i64::MAX.encode_min_size(w.key("large").unwrap()).unwrap();
        w.close().unwrap();

        let doc = Document::from_bytes(buf.freeze()).unwrap();
        assert_eq!(doc.get("small"), Some(&Bson::Int32(3)));
        assert_eq!(doc.get("large"), Some(&Bson::Int64(i64::MAX)));
    }

    #[test]
    fn top_level_must_be_document() {
        assert!(matches!(
            to_bytes(&42i32),
            Err(ValueError::TypeMismatch { .. }),
        ));
    }

    #[test]
    fn document_to_bytes_matches_value_path() {
        let doc = doc! { "a": 1, "b": ["x", "y"] };
        assert_eq!(to_bytes(&doc).unwrap(), doc.to_bytes().unwrap());
    }
}
