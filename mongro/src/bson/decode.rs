//! The [`Decode`] trait.
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

use super::{
    Binary, Bson, DateTime, Decimal128, Document, ElementType, ObjectId, Regex, Timestamp,
    ValueError, ValueReader,
};
use crate::common::ByteStr;

/// A type that can be decoded from a document value.
pub trait Decode: Sized {
    fn decode(r: ValueReader) -> Result<Self, ValueError>;
}

/// Float decode permitting the lossy 64 to 32 conversion.
///
/// Used by fields marked `truncate`.
pub trait DecodeTruncated: Sized {
    fn decode_truncated(r: ValueReader) -> Result<Self, ValueError>;
}

/// Decode a standalone document byte buffer into `T`.
pub fn from_bytes<T: Decode>(data: Bytes) -> Result<T, ValueError> {
    T::decode(ValueReader::document(data))
}

/// Decode a missing key: `Option` destinations become `None`, anything
/// else fails with [`ValueError::MissingKey`].
pub fn missing<T: Decode>(key: &'static str) -> Result<T, ValueError> {
    T::decode(ValueReader::null()).map_err(|_| ValueError::MissingKey(key.into()))
}

impl Decode for Bson {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_bson()
    }
}

impl Decode for Document {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_document()?.read_document()
    }
}

impl Decode for f64 {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_double()
    }
}

impl Decode for f32 {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_f32()
    }
}

impl DecodeTruncated for f32 {
    fn decode_truncated(r: ValueReader) -> Result<Self, ValueError> {
        r.read_f32_truncated()
    }
}

impl DecodeTruncated for f64 {
    fn decode_truncated(r: ValueReader) -> Result<Self, ValueError> {
        r.read_double()
    }
}

impl Decode for i64 {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_int()
    }
}

macro_rules! decode_narrow {
    ($ty:ty) => {
        impl Decode for $ty {
            fn decode(r: ValueReader) -> Result<Self, ValueError> {
                let value = r.read_int()?;
                <$ty>::try_from(value)
                    .map_err(|_| ValueError::Overflow { value, target: stringify!($ty) })
            }
        }
    };
}

decode_narrow!(i32);
decode_narrow!(u32);
decode_narrow!(u64);

impl Decode for bool {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_bool()
    }
}

impl Decode for String {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        Ok(r.read_str()?.as_str().into())
    }
}

impl Decode for ByteStr {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_str()
    }
}

impl Decode for DateTime {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_datetime()
    }
}

impl Decode for Timestamp {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_timestamp()
    }
}

impl Decode for ObjectId {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_object_id()
    }
}

impl Decode for Binary {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_binary()
    }
}

impl Decode for Regex {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_regex()
    }
}

impl Decode for Decimal128 {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        r.read_decimal128()
    }
}

impl Decode for uuid::Uuid {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        let binary = r.read_binary()?;
        let bytes: [u8; 16] = binary.bytes[..]
            .try_into()
            .map_err(|_| ValueError::MalformedDoc("uuid binary must be 16 bytes".into()))?;
        Ok(uuid::Uuid::from_bytes(bytes))
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        match r.element_type() {
            ElementType::Null | ElementType::Undefined => Ok(None),
            _ => T::decode(r).map(Some),
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        let mut reader = r.read_array()?;
        let mut items = Vec::new();
        while let Some(item) = reader.next() {
            items.push(T::decode(item?)?);
        }
        Ok(items)
    }
}

impl<V: Decode> Decode for BTreeMap<String, V> {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        let mut reader = r.read_document()?;
        let mut map = BTreeMap::new();
        while let Some(entry) = reader.next() {
            let (key, value) = entry?;
            map.insert(key.as_str().into(), V::decode(value)?);
        }
        Ok(map)
    }
}

impl<V: Decode> Decode for HashMap<String, V> {
    fn decode(r: ValueReader) -> Result<Self, ValueError> {
        let mut reader = r.read_document()?;
        let mut map = HashMap::new();
        while let Some(entry) = reader.next() {
            let (key, value) = entry?;
            map.insert(key.as_str().into(), V::decode(value)?);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::{doc, encode};

    #[test]
    fn narrowing_overflow() {
        let bytes = doc! { "n": (i64::from(i32::MAX) + 1) }.to_bytes().unwrap();
        let err = from_bytes::<HashMap<String, i32>>(bytes).unwrap_err();
        assert!(matches!(err, ValueError::Overflow { target: "i32", .. }));
    }

    #[test]
    fn narrowing_fits() {
        let bytes = doc! { "n": 7i64 }.to_bytes().unwrap();
        let map = from_bytes::<HashMap<String, i32>>(bytes).unwrap();
        assert_eq!(map["n"], 7);
    }

    #[test]
    fn float_truncation_guard() {
        let bytes = doc! { "f": 1.1f64 }.to_bytes().unwrap();
        let err = from_bytes::<HashMap<String, f32>>(bytes).unwrap_err();
        assert!(matches!(err, ValueError::Truncation(_)));

        let bytes = doc! { "f": 1.5f64 }.to_bytes().unwrap();
        let map = from_bytes::<HashMap<String, f32>>(bytes).unwrap();
        assert_eq!(map["f"], 1.5);
    }

    #[test]
    fn uuid_round_trip() {
        let id = uuid::Uuid::new_v4();
        let mut doc = Document::new();
        doc.insert("id", Binary {
            subtype: Binary::SUBTYPE_UUID,
            bytes: Bytes::copy_from_slice(id.as_bytes()),
        });
        let bytes = encode::to_bytes(&doc).unwrap();
        let map = from_bytes::<HashMap<String, uuid::Uuid>>(bytes).unwrap();
        assert_eq!(map["id"], id);
    }
}
