//! Extended json representation.
//!
//! Two modes: *canonical* keeps every value type-explicit under `$` wrapper
//! keys and round-trips byte-for-byte; *relaxed* emits native json numbers
//! when they are range-safe. The parser accepts both.
use std::fmt::Write;

use bytes::Bytes;

use super::{
    Binary, Bson, CodeWithScope, DateTime, DbPointer, Decimal128, Document, ObjectId, Regex,
    Timestamp, ValueError,
};

/// Emit mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Canonical,
    Relaxed,
}

/// Emit `doc` as extended json in canonical mode.
pub fn emit_canonical(doc: &Document) -> String {
    let mut out = String::new();
    write_document(&mut out, doc, Mode::Canonical);
    out
}

/// Emit `doc` as extended json in relaxed mode.
pub fn emit_relaxed(doc: &Document) -> String {
    let mut out = String::new();
    write_document(&mut out, doc, Mode::Relaxed);
    out
}

/// Parse extended json text into a document.
///
/// The text must be a single json object.
pub fn parse(text: &str) -> Result<Document, ValueError> {
    let mut parser = Parser { data: text.as_bytes(), pos: 0 };
    parser.skip_ws();
    let value = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos != parser.data.len() {
        return Err(parser.err("trailing characters"));
    }
    match value {
        Bson::Document(doc) => Ok(doc),
        _ => Err(ValueError::Json("top level must be an object".into())),
    }
}

// ===== Emitter =====

fn write_document(out: &mut String, doc: &Document, mode: Mode) {
    out.push('{');
    for (i, (key, value)) in doc.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        write_value(out, value, mode);
    }
    out.push('}');
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_double(out: &mut String, v: f64, mode: Mode) {
    if v.is_nan() {
        out.push_str("{\"$numberDouble\":\"NaN\"}");
    } else if v.is_infinite() {
        if v.is_sign_positive() {
            out.push_str("{\"$numberDouble\":\"Infinity\"}");
        } else {
            out.push_str("{\"$numberDouble\":\"-Infinity\"}");
        }
    } else if matches!(mode, Mode::Relaxed) {
        let _ = write!(out, "{v:?}");
    } else {
        let _ = write!(out, "{{\"$numberDouble\":\"{v:?}\"}}");
    }
}

fn write_value(out: &mut String, value: &Bson, mode: Mode) {
    match value {
        Bson::Double(v) => write_double(out, *v, mode),
        Bson::String(v) => write_string(out, v),
        Bson::Document(v) => write_document(out, v, mode),
        Bson::Array(v) => {
            out.push('[');
            for (i, item) in v.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item, mode);
            }
            out.push(']');
        }
        Bson::Binary(v) => {
            use base64::Engine;
            let payload = base64::engine::general_purpose::STANDARD.encode(&v.bytes);
            let _ = write!(
                out,
                "{{\"$binary\":{{\"base64\":\"{payload}\",\"subType\":\"{:02x}\"}}}}",
                v.subtype,
            );
        }
        Bson::Undefined => out.push_str("{\"$undefined\":true}"),
        Bson::ObjectId(v) => {
            let _ = write!(out, "{{\"$oid\":\"{v}\"}}");
        }
        Bson::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        Bson::DateTime(v) => {
            let _ = write!(out, "{{\"$date\":{{\"$numberLong\":\"{}\"}}}}", v.0);
        }
        Bson::Null => out.push_str("null"),
        Bson::Regex(v) => {
            out.push_str("{\"$regularExpression\":{\"pattern\":");
            write_string(out, &v.pattern);
            out.push_str(",\"options\":");
            write_string(out, &v.options);
            out.push_str("}}");
        }
        Bson::DbPointer(v) => {
            out.push_str("{\"$dbPointer\":{\"$ref\":");
            write_string(out, &v.namespace);
            let _ = write!(out, ",\"$id\":{{\"$oid\":\"{}\"}}}}}}", v.id);
        }
        Bson::JavaScript(v) => {
            out.push_str("{\"$code\":");
            write_string(out, v);
            out.push('}');
        }
        Bson::Symbol(v) => {
            out.push_str("{\"$symbol\":");
            write_string(out, v);
            out.push('}');
        }
        Bson::CodeWithScope(v) => {
            out.push_str("{\"$code\":");
            write_string(out, &v.code);
            out.push_str(",\"$scope\":");
            write_document(out, &v.scope, mode);
            out.push('}');
        }
        Bson::Int32(v) => match mode {
            Mode::Canonical => {
                let _ = write!(out, "{{\"$numberInt\":\"{v}\"}}");
            }
            Mode::Relaxed => {
                let _ = write!(out, "{v}");
            }
        },
        Bson::Timestamp(v) => {
            let _ = write!(out, "{{\"$timestamp\":{{\"t\":{},\"i\":{}}}}}", v.time, v.increment);
        }
        Bson::Int64(v) => match mode {
            Mode::Canonical => {
                let _ = write!(out, "{{\"$numberLong\":\"{v}\"}}");
            }
            Mode::Relaxed => {
                let _ = write!(out, "{v}");
            }
        },
        Bson::Decimal128(v) => {
            let _ = write!(out, "{{\"$numberDecimal\":\"{}\"}}", decimal::to_string(v));
        }
        Bson::MinKey => out.push_str("{\"$minKey\":1}"),
        Bson::MaxKey => out.push_str("{\"$maxKey\":1}"),
    }
}

// ===== Parser =====

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn err(&self, why: &str) -> ValueError {
        ValueError::Json(format!("{why} at offset {}", self.pos))
    }

    fn skip_ws(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.data.get(self.pos) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), ValueError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err("unexpected character"))
        }
    }

    fn eat_literal(&mut self, literal: &str) -> bool {
        if self.data[self.pos..].starts_with(literal.as_bytes()) {
            self.pos += literal.len();
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Result<Bson, ValueError> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => Ok(Bson::String(self.parse_string()?)),
            Some(b't') if self.eat_literal("true") => Ok(Bson::Boolean(true)),
            Some(b'f') if self.eat_literal("false") => Ok(Bson::Boolean(false)),
            Some(b'n') if self.eat_literal("null") => Ok(Bson::Null),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            _ => Err(self.err("expected a value")),
        }
    }

    fn parse_array(&mut self) -> Result<Bson, ValueError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Bson::Array(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Bson::Array(items));
                }
                _ => return Err(self.err("expected ',' or ']'")),
            }
        }
    }

    fn parse_object(&mut self) -> Result<Bson, ValueError> {
        self.expect(b'{')?;
        let mut entries = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return interpret_object(entries);
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(b':')?;
            let value = self.parse_value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    return interpret_object(entries);
                }
                _ => return Err(self.err("expected ',' or '}'")),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String, ValueError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'"') => out.push('"'),
                        Some(b'\\') => out.push('\\'),
                        Some(b'/') => out.push('/'),
                        Some(b'b') => out.push('\u{8}'),
                        Some(b'f') => out.push('\u{c}'),
                        Some(b'n') => out.push('\n'),
                        Some(b'r') => out.push('\r'),
                        Some(b't') => out.push('\t'),
                        Some(b'u') => {
                            self.pos += 1;
                            let first = self.parse_hex4()?;
                            let c = if (0xD800..0xDC00).contains(&first) {
                                // surrogate pair
                                if !self.eat_literal("\\u") {
                                    return Err(self.err("unpaired surrogate"));
                                }
                                let second = self.parse_hex4()?;
                                let c = 0x10000
                                    + ((first - 0xD800) << 10)
                                    + second.checked_sub(0xDC00).ok_or_else(|| self.err("invalid surrogate"))?;
                                char::from_u32(c)
                            } else {
                                char::from_u32(first)
                            };
                            out.push(c.ok_or_else(|| self.err("invalid unicode escape"))?);
                            // parse_hex4 leaves pos after the digits
                            continue;
                        }
                        _ => return Err(self.err("invalid escape")),
                    }
                    self.pos += 1;
                }
                Some(_) => {
                    let start = self.pos;
                    while let Some(b) = self.peek() {
                        if matches!(b, b'"' | b'\\') || b < 0x20 {
                            break;
                        }
                        self.pos += 1;
                    }
                    let chunk = std::str::from_utf8(&self.data[start..self.pos])
                        .map_err(|_| ValueError::Json("string is not utf8".into()))?;
                    out.push_str(chunk);
                }
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u32, ValueError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let digit = match self.peek() {
                Some(b @ b'0'..=b'9') => (b - b'0') as u32,
                Some(b @ b'a'..=b'f') => (b - b'a' + 10) as u32,
                Some(b @ b'A'..=b'F') => (b - b'A' + 10) as u32,
                _ => return Err(self.err("invalid hex escape")),
            };
            value = (value << 4) | digit;
            self.pos += 1;
        }
        Ok(value)
    }

    fn parse_number(&mut self) -> Result<Bson, ValueError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' | b'e' | b'E' | b'+' | b'-' => {
                    float = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.data[start..self.pos]).unwrap();
        if float {
            return match text.parse::<f64>() {
                Ok(v) => Ok(Bson::Double(v)),
                Err(_) => Err(self.err("invalid number")),
            };
        }
        match text.parse::<i64>() {
            Ok(v) => match i32::try_from(v) {
                Ok(v) => Ok(Bson::Int32(v)),
                Err(_) => Ok(Bson::Int64(v)),
            },
            Err(_) => text
                .parse::<f64>()
                .map(Bson::Double)
                .map_err(|_| self.err("invalid number")),
        }
    }
}

/// Turn a parsed object into a value, unwrapping `$` type wrappers.
fn interpret_object(entries: Vec<(String, Bson)>) -> Result<Bson, ValueError> {
    let wrapper = entries.first().map(|(k, _)| k.as_str()).unwrap_or("");
    if !wrapper.starts_with('$') {
        return Ok(Bson::Document(entries.into_iter().collect()));
    }
    let invalid = |why: &str| ValueError::Json(format!("invalid {wrapper} wrapper: {why}"));
    let str_arg = |value: &Bson| -> Result<String, ValueError> {
        match value {
            Bson::String(s) => Ok(s.clone()),
            _ => Err(ValueError::Json(format!("{wrapper} expects a string"))),
        }
    };

    let value = match (wrapper, entries.len()) {
        ("$numberInt", 1) => {
            let arg = str_arg(&entries[0].1)?;
            Bson::Int32(arg.parse().map_err(|_| invalid("not an int32"))?)
        }
        ("$numberLong", 1) => {
            let arg = str_arg(&entries[0].1)?;
            Bson::Int64(arg.parse().map_err(|_| invalid("not an int64"))?)
        }
        ("$numberDouble", 1) => {
            let arg = str_arg(&entries[0].1)?;
            Bson::Double(match arg.as_str() {
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                "NaN" => f64::NAN,
                other => other.parse().map_err(|_| invalid("not a double"))?,
            })
        }
        ("$numberDecimal", 1) => {
            let arg = str_arg(&entries[0].1)?;
            Bson::Decimal128(decimal::from_str(&arg).ok_or_else(|| invalid("not a decimal128"))?)
        }
        ("$oid", 1) => {
            let arg = str_arg(&entries[0].1)?;
            Bson::ObjectId(arg.parse().map_err(|_| invalid("not an object id"))?)
        }
        ("$date", 1) => match &entries[0].1 {
            Bson::Document(inner) => {
                let ms = inner
                    .get_str("$numberLong")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| invalid("expected $numberLong millis"))?;
                Bson::DateTime(DateTime(ms))
            }
            Bson::Int32(ms) => Bson::DateTime(DateTime(*ms as i64)),
            Bson::Int64(ms) => Bson::DateTime(DateTime(*ms)),
            _ => return Err(invalid("expected millis")),
        },
        ("$binary", 1) => {
            use base64::Engine;
            let Bson::Document(inner) = &entries[0].1 else {
                return Err(invalid("expected base64 and subType"));
            };
            let payload = inner.get_str("base64").ok_or_else(|| invalid("missing base64"))?;
            let subtype = inner.get_str("subType").ok_or_else(|| invalid("missing subType"))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|_| invalid("bad base64"))?;
            let subtype = u8::from_str_radix(subtype, 16).map_err(|_| invalid("bad subType"))?;
            Bson::Binary(Binary { subtype, bytes: Bytes::from(bytes) })
        }
        ("$regularExpression", 1) => {
            let Bson::Document(inner) = &entries[0].1 else {
                return Err(invalid("expected pattern and options"));
            };
            Bson::Regex(Regex {
                pattern: inner.get_str("pattern").ok_or_else(|| invalid("missing pattern"))?.into(),
                options: inner.get_str("options").ok_or_else(|| invalid("missing options"))?.into(),
            })
        }
        ("$timestamp", 1) => {
            let Bson::Document(inner) = &entries[0].1 else {
                return Err(invalid("expected t and i"));
            };
            let time = inner.get_int("t").ok_or_else(|| invalid("missing t"))?;
            let increment = inner.get_int("i").ok_or_else(|| invalid("missing i"))?;
            Bson::Timestamp(Timestamp { time: time as u32, increment: increment as u32 })
        }
        ("$undefined", 1) => Bson::Undefined,
        ("$minKey", 1) => Bson::MinKey,
        ("$maxKey", 1) => Bson::MaxKey,
        ("$symbol", 1) => Bson::Symbol(str_arg(&entries[0].1)?),
        ("$code", 1) => Bson::JavaScript(str_arg(&entries[0].1)?),
        ("$code", 2) if entries[1].0 == "$scope" => {
            let Bson::Document(scope) = &entries[1].1 else {
                return Err(invalid("scope must be an object"));
            };
            Bson::CodeWithScope(CodeWithScope {
                code: str_arg(&entries[0].1)?,
                scope: scope.clone(),
            })
        }
        ("$dbPointer", 1) => {
            let Bson::Document(inner) = &entries[0].1 else {
                return Err(invalid("expected $ref and $id"));
            };
            let id = match inner.get("$id") {
                Some(Bson::ObjectId(id)) => *id,
                _ => return Err(invalid("missing $id")),
            };
            Bson::DbPointer(DbPointer {
                namespace: inner.get_str("$ref").ok_or_else(|| invalid("missing $ref"))?.into(),
                id,
            })
        }
        // unknown dollar keys pass through as a plain document
        _ => Bson::Document(entries.into_iter().collect()),
    };
    Ok(value)
}

/// Decimal128 string conversion, BID layout.
mod decimal {
    use super::Decimal128;

    const EXPONENT_BIAS: i32 = 6176;

    pub fn to_string(v: &Decimal128) -> String {
        let bits = u128::from_le_bytes(v.0);
        let sign = if bits >> 127 != 0 { "-" } else { "" };
        let combination = ((bits >> 122) & 0x1F) as u32;

        if combination >= 0x1E {
            return match combination {
                0x1E => format!("{sign}Infinity"),
                _ => "NaN".into(),
            };
        }

        let (exponent, coefficient) = if combination >> 3 == 0b11 {
            // large form, implicit (100)b significand prefix
            let exponent = ((bits >> 111) & 0x3FFF) as i32 - EXPONENT_BIAS;
            let coefficient = (bits & ((1u128 << 111) - 1)) | (1u128 << 113);
            (exponent, coefficient)
        } else {
            let exponent = ((bits >> 113) & 0x3FFF) as i32 - EXPONENT_BIAS;
            let coefficient = bits & ((1u128 << 113) - 1);
            (exponent, coefficient)
        };

        if exponent == 0 {
            format!("{sign}{coefficient}")
        } else {
            format!("{sign}{coefficient}E{exponent:+}")
        }
    }

    pub fn from_str(s: &str) -> Option<Decimal128> {
        match s {
            "Infinity" => return Some(special(false)),
            "-Infinity" => return Some(special(true)),
            "NaN" => return Some(nan()),
            _ => {}
        }

        let (sign, rest) = match s.strip_prefix('-') {
            Some(rest) => (1u128, rest),
            None => (0u128, s),
        };

        let (mantissa, exp_part) = match rest.split_once(['E', 'e']) {
            Some((m, e)) => (m, e.parse::<i32>().ok()?),
            None => (rest, 0),
        };

        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((i, f)) => (i, f),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }

        let mut coefficient = 0u128;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            if !b.is_ascii_digit() {
                return None;
            }
            coefficient = coefficient.checked_mul(10)?.checked_add((b - b'0') as u128)?;
        }
        if coefficient >= 1u128 << 113 {
            return None;
        }

        let exponent = exp_part.checked_sub(frac_part.len() as i32)?;
        let biased = exponent.checked_add(EXPONENT_BIAS)?;
        if !(0..1 << 14).contains(&biased) {
            return None;
        }

        let bits = (sign << 127) | ((biased as u128) << 113) | coefficient;
        Some(Decimal128(bits.to_le_bytes()))
    }

    fn special(negative: bool) -> Decimal128 {
        let bits = ((negative as u128) << 127) | (0x1Eu128 << 122);
        Decimal128(bits.to_le_bytes())
    }

    fn nan() -> Decimal128 {
        Decimal128((0x1Fu128 << 122).to_le_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn canonical_round_trip() {
        let doc = doc! {
            "int": 42i32,
            "long": 99i64,
            "double": 1.5f64,
            "str": "text \"quoted\"",
            "nested": { "a": [1, 2, { "deep": (Bson::Null) }] },
            "oid": (ObjectId::from_bytes(*b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c")),
            "date": (DateTime(1234567890123)),
            "ts": (Timestamp { time: 4, increment: 2 }),
            "bin": (Binary { subtype: 4, bytes: Bytes::from_static(b"\x00\x01\x02") }),
            "regex": (Regex { pattern: "^a+".into(), options: "im".into() }),
            "bool": true,
            "min": (Bson::MinKey),
            "max": (Bson::MaxKey),
        };
        let text = emit_canonical(&doc);
        let parsed = parse(&text).unwrap();
        assert_eq!(doc, parsed);
        // byte-for-byte under stable key order
        assert_eq!(text, emit_canonical(&parsed));
    }

    #[test]
    fn relaxed_numbers_are_native() {
        let doc = doc! { "a": 1i32, "b": 2i64, "c": 1.5f64 };
        assert_eq!(emit_relaxed(&doc), r#"{"a":1,"b":2,"c":1.5}"#);
    }

    #[test]
    fn canonical_numbers_are_wrapped() {
        let doc = doc! { "a": 1i32, "b": 2i64 };
        assert_eq!(
            emit_canonical(&doc),
            r#"{"a":{"$numberInt":"1"},"b":{"$numberLong":"2"}}"#,
        );
    }

    #[test]
    fn non_finite_doubles() {
        let doc = doc! { "inf": (f64::INFINITY), "ninf": (f64::NEG_INFINITY) };
        let parsed = parse(&emit_relaxed(&doc)).unwrap();
        assert_eq!(parsed.get_f64("inf"), Some(f64::INFINITY));
        assert_eq!(parsed.get_f64("ninf"), Some(f64::NEG_INFINITY));

        let nan = parse(r#"{"v":{"$numberDouble":"NaN"}}"#).unwrap();
        assert!(nan.get_f64("v").unwrap().is_nan());
    }

    #[test]
    fn plain_dollar_document_passes_through() {
        let parsed = parse(r#"{"q":{"$gt":{"$numberInt":"3"}}}"#).unwrap();
        assert_eq!(parsed.get_document("q").unwrap().get_i32("$gt"), Some(3));
    }

    #[test]
    fn unicode_escapes() {
        let parsed = parse(r#"{"s":"aé😀b"}"#).unwrap();
        assert_eq!(parsed.get_str("s"), Some("aé😀b"));
    }

    #[test]
    fn decimal_round_trip() {
        for text in ["0", "1", "-5", "1234567890123456789", "15E+2", "101E-3", "Infinity", "-Infinity"] {
            let wrapped = format!(r#"{{"v":{{"$numberDecimal":"{text}"}}}}"#);
            let doc = parse(&wrapped).unwrap();
            assert_eq!(emit_canonical(&doc), wrapped, "{text}");
        }
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse("{").is_err());
        assert!(parse(r#"{"a":}"#).is_err());
        assert!(parse(r#"{"a":1} extra"#).is_err());
        assert!(parse("[1,2]").is_err());
        assert!(parse(r#"{"v":{"$numberInt":"abc"}}"#).is_err());
    }
}
