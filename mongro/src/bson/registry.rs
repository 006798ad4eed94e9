//! Runtime codec dispatch.
//!
//! The static [`Encode`]/[`Decode`] traits cover the usual path. The
//! registry exists for values that only surface as `&dyn Any`, and for
//! swapping the wire representation of a type without touching its impl.
//! Lookup runs exact type match first, then the fallback chain in
//! registration order.
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use super::{Bson, Decode, Document, Encode, ObjectId, Timestamp, ValueError, ValueReader, ValueWriter};

type EncodeFn = Arc<dyn Fn(&dyn Any, ValueWriter<'_>) -> Result<(), ValueError> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(ValueReader) -> Result<Box<dyn Any>, ValueError> + Send + Sync>;
type Probe = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// A codec fallback entry: a probe deciding whether the entry takes the
/// value, and the encoder run when it does.
struct Fallback {
    probe: Probe,
    encode: EncodeFn,
}

/// Maps runtime type identity to an encoder/decoder pair.
pub struct Registry {
    encoders: HashMap<TypeId, EncodeFn>,
    decoders: HashMap<TypeId, DecodeFn>,
    fallbacks: Vec<Fallback>,
}

impl Registry {
    /// Registry preloaded with the built-in value types.
    pub fn new() -> Registry {
        let mut registry = Registry {
            encoders: HashMap::new(),
            decoders: HashMap::new(),
            fallbacks: Vec::new(),
        };
        registry.register::<Bson>();
        registry.register::<Document>();
        registry.register::<ObjectId>();
        registry.register::<Timestamp>();
        registry.register::<String>();
        registry.register::<bool>();
        registry.register::<i32>();
        registry.register::<i64>();
        registry.register::<f64>();
        registry
    }

    /// Register `T` under its own [`Encode`]/[`Decode`] impls.
    pub fn register<T: Encode + Decode + Any>(&mut self) {
        self.register_encoder::<T, _>(T::encode);
        self.register_decoder::<T, _>(T::decode);
    }

    /// Register an exact-type encoder, replacing any previous one.
    pub fn register_encoder<T, F>(&mut self, encode: F)
    where
        T: Any,
        F: Fn(&T, ValueWriter<'_>) -> Result<(), ValueError> + Send + Sync + 'static,
    {
        self.encoders.insert(
            TypeId::of::<T>(),
            Arc::new(move |value, w| {
                // exact lookup guarantees the downcast
                encode(value.downcast_ref::<T>().unwrap(), w)
            }),
        );
    }

    /// Register an exact-type decoder, replacing any previous one.
    pub fn register_decoder<T, F>(&mut self, decode: F)
    where
        T: Any,
        F: Fn(ValueReader) -> Result<T, ValueError> + Send + Sync + 'static,
    {
        self.decoders.insert(
            TypeId::of::<T>(),
            Arc::new(move |r| Ok(Box::new(decode(r)?) as Box<dyn Any>)),
        );
    }

    /// Append a fallback entry, probed in registration order after exact
    /// lookup misses.
    pub fn register_fallback<P, F>(&mut self, probe: P, encode: F)
    where
        P: Fn(&dyn Any) -> bool + Send + Sync + 'static,
        F: Fn(&dyn Any, ValueWriter<'_>) -> Result<(), ValueError> + Send + Sync + 'static,
    {
        self.fallbacks.push(Fallback {
            probe: Arc::new(probe),
            encode: Arc::new(encode),
        });
    }

    /// Encode a dynamically typed value.
    pub fn encode_any(&self, value: &dyn Any, w: ValueWriter<'_>) -> Result<(), ValueError> {
        if let Some(encode) = self.encoders.get(&value.type_id()) {
            return encode(value, w);
        }
        for fallback in &self.fallbacks {
            if (fallback.probe)(value) {
                return (fallback.encode)(value, w);
            }
        }
        Err(ValueError::Unregistered(std::any::type_name_of_val(value)))
    }

    /// Decode into the registered type `T`.
    pub fn decode_as<T: Any>(&self, r: ValueReader) -> Result<T, ValueError> {
        let Some(decode) = self.decoders.get(&TypeId::of::<T>()) else {
            return Err(ValueError::Unregistered(std::any::type_name::<T>()));
        };
        // registration keys the box by T
        Ok(*decode(r)?.downcast::<T>().unwrap())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("encoders", &self.encoders.len())
            .field("decoders", &self.decoders.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::{DocumentWriter, doc};
    use bytes::BytesMut;

    fn encode_with(registry: &Registry, value: &dyn Any) -> Document {
        let mut buf = BytesMut::new();
        let mut w = DocumentWriter::new(&mut buf);
        registry.encode_any(value, w.key("v").unwrap()).unwrap();
        w.close().unwrap();
        Document::from_bytes(buf.freeze()).unwrap()
    }

    #[test]
    fn exact_match_wins() {
        let registry = Registry::new();
        let doc = encode_with(&registry, &42i32);
        assert_eq!(doc.get_i32("v"), Some(42));
    }

    #[test]
    fn override_replaces_builtin() {
        let mut registry = Registry::new();
        // wrap ints in a document to prove the override runs
        registry.register_encoder::<i32, _>(|value, w| {
            let mut doc = w.put_document();
            value.encode(doc.key("wrapped").unwrap())?;
            doc.close()
        });
        let doc = encode_with(&registry, &7i32);
        assert_eq!(doc.get_document("v").unwrap().get_i32("wrapped"), Some(7));
    }

    #[test]
    fn fallback_chain_order() {
        struct Celsius(f64);
        struct Fahrenheit(f64);

        let mut registry = Registry::new();
        registry.register_fallback(
            |v| v.is::<Celsius>(),
            |v, w| v.downcast_ref::<Celsius>().unwrap().0.encode(w),
        );
        registry.register_fallback(
            |v| v.is::<Celsius>() || v.is::<Fahrenheit>(),
            |_, w| {
                w.put_null();
                Ok(())
            },
        );

        // first entry takes Celsius, second only sees Fahrenheit
        let doc = encode_with(&registry, &Celsius(21.5));
        assert_eq!(doc.get_f64("v"), Some(21.5));
        let doc = encode_with(&registry, &Fahrenheit(70.0));
        assert_eq!(doc.get("v"), Some(&Bson::Null));
    }

    #[test]
    fn unregistered_type_errors() {
        struct Unknown;
        let registry = Registry::new();
        let mut buf = BytesMut::new();
        let mut w = DocumentWriter::new(&mut buf);
        let err = registry
            .encode_any(&Unknown, w.key("v").unwrap())
            .unwrap_err();
        assert!(matches!(err, ValueError::Unregistered(_)));
    }

    #[test]
    fn decode_round_trip() {
        let registry = Registry::new();
        let bytes = doc! { "n": 9i64 }.to_bytes().unwrap();
        let mut reader = crate::bson::DocumentReader::new(bytes).unwrap();
        let (_, value) = reader.next().unwrap().unwrap();
        let n: i64 = registry.decode_as(value).unwrap();
        assert_eq!(n, 9);
    }
}
