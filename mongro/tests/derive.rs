//! Derived struct mapping.
use mongro::bson::{Bson, Document, ValueError, decode, doc, encode};
use mongro::{Decode, Encode};

#[derive(Encode, Decode, Debug, PartialEq)]
struct Account {
    name: String,
    #[bson(rename = "visitCount", min_size)]
    visits: i64,
    #[bson(omit_empty)]
    nickname: Option<String>,
    #[bson(skip)]
    cached: i32,
    #[bson(rename = "-")]
    scratch: i32,
}

#[derive(Encode, Decode, Debug, PartialEq)]
struct Audit {
    created_by: String,
}

#[derive(Encode, Decode, Debug, PartialEq)]
struct Post {
    title: String,
    #[bson(inline)]
    audit: Audit,
}

#[derive(Encode, Decode, Debug, PartialEq)]
struct Clashing {
    created_by: String,
    #[bson(inline)]
    audit: Audit,
}

#[derive(Encode, Decode, Debug, PartialEq)]
struct Reading {
    #[bson(truncate)]
    value: f32,
}

#[test]
fn rename_and_min_size() {
    let account = Account {
        name: "ada".into(),
        visits: 7,
        nickname: None,
        cached: 99,
        scratch: 42,
    };
    let raw = encode::to_document(&account).unwrap();

    assert_eq!(raw.get_str("name"), Some("ada"));
    // min_size shrank a small i64 to int32
    assert_eq!(raw.get("visitCount"), Some(&Bson::Int32(7)));
    // omit_empty dropped the None, skip and "-" never encode
    assert!(!raw.contains_key("nickname"));
    assert!(!raw.contains_key("cached"));
    assert!(!raw.contains_key("scratch"));
}

#[test]
fn decode_round_trip() {
    let account = Account {
        name: "grace".into(),
        visits: i64::MAX,
        nickname: Some("admiral".into()),
        cached: 1,
        scratch: 2,
    };
    let bytes = encode::to_bytes(&account).unwrap();
    let decoded: Account = decode::from_bytes(bytes).unwrap();

    // skipped fields come back as defaults
    let expected = Account { cached: 0, scratch: 0, ..account };
    assert_eq!(decoded, expected);
}

#[test]
fn missing_required_key_fails() {
    let bytes = doc! { "visitCount": 1 }.to_bytes().unwrap();
    let err = decode::from_bytes::<Account>(bytes).unwrap_err();
    assert!(matches!(err, ValueError::MissingKey(key) if key == "name"));
}

#[test]
fn missing_optional_key_is_none() {
    let bytes = doc! { "name": "x", "visitCount": 1 }.to_bytes().unwrap();
    let account: Account = decode::from_bytes(bytes).unwrap();
    assert_eq!(account.nickname, None);
}

#[test]
fn inline_expands_into_outer_keys() {
    let post = Post {
        title: "hello".into(),
        audit: Audit { created_by: "ada".into() },
    };
    let raw = encode::to_document(&post).unwrap();
    assert_eq!(raw.get_str("title"), Some("hello"));
    // no nested document; the inner record's key sits at the top level
    assert_eq!(raw.get_str("created_by"), Some("ada"));
    assert!(raw.get_document("audit").is_none());

    let decoded: Post = decode::from_bytes(encode::to_bytes(&post).unwrap()).unwrap();
    assert_eq!(decoded, post);
}

#[test]
fn inline_collision_is_detected() {
    let clashing = Clashing {
        created_by: "outer".into(),
        audit: Audit { created_by: "inner".into() },
    };
    let err = encode::to_bytes(&clashing).unwrap_err();
    assert!(matches!(err, ValueError::DuplicateInlineKey(key) if key == "created_by"));
}

#[test]
fn truncate_permits_lossy_floats() {
    let bytes = doc! { "value": 1.1f64 }.to_bytes().unwrap();
    let reading: Reading = decode::from_bytes(bytes).unwrap();
    assert_eq!(reading.value, 1.1f32);
}

#[test]
fn unknown_keys_are_skipped() {
    let bytes = doc! {
        "name": "x",
        "visitCount": 3,
        "future_field": { "nested": [1, 2, 3] },
    }
    .to_bytes()
    .unwrap();
    let account: Account = decode::from_bytes(bytes).unwrap();
    assert_eq!(account.visits, 3);
}

#[test]
fn registry_dispatches_derived_types() {
    let mut registry = mongro::bson::Registry::new();
    registry.register::<Audit>();

    let mut buf = bytes::BytesMut::new();
    let mut w = mongro::bson::DocumentWriter::new(&mut buf);
    registry
        .encode_any(&Audit { created_by: "ada".into() }, w.key("audit").unwrap())
        .unwrap();
    w.close().unwrap();

    let doc = Document::from_bytes(buf.freeze()).unwrap();
    assert_eq!(doc.get_document("audit").unwrap().get_str("created_by"), Some("ada"));
}
