//! PackStream value encoding and decoding.
//!
//! PackStream is the tagged binary serialization carried inside chunked
//! transport messages. Every value starts with a one-byte marker that either
//! contains the value itself (tiny ints, tiny collection sizes) or announces
//! the width of a following size field.
//!
//! Decoding is bounds-checked and depth-limited; malformed input surfaces as
//! a [`DecodeError`], never a panic.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::value::{Node, Path, Relationship, UnboundRelationship, Value};

/// Maximum nesting depth accepted when decoding collections.
pub const MAX_NESTING_DEPTH: usize = 64;

const TINY_STRING: u8 = 0x80;
const TINY_LIST: u8 = 0x90;
const TINY_MAP: u8 = 0xA0;
const TINY_STRUCT: u8 = 0xB0;

const NULL: u8 = 0xC0;
const FLOAT64: u8 = 0xC1;
const FALSE: u8 = 0xC2;
const TRUE: u8 = 0xC3;

const INT8: u8 = 0xC8;
const INT16: u8 = 0xC9;
const INT32: u8 = 0xCA;
const INT64: u8 = 0xCB;

const BYTES8: u8 = 0xCC;
const BYTES16: u8 = 0xCD;
const BYTES32: u8 = 0xCE;

const STRING8: u8 = 0xD0;
const STRING16: u8 = 0xD1;
const STRING32: u8 = 0xD2;

const LIST8: u8 = 0xD4;
const LIST16: u8 = 0xD5;
const LIST32: u8 = 0xD6;

const MAP8: u8 = 0xD8;
const MAP16: u8 = 0xD9;
const MAP32: u8 = 0xDA;

const STRUCT8: u8 = 0xDC;
const STRUCT16: u8 = 0xDD;

/// Structure signature for a node.
pub const SIG_NODE: u8 = 0x4E;
/// Structure signature for a relationship with endpoints.
pub const SIG_RELATIONSHIP: u8 = 0x52;
/// Structure signature for a relationship as it appears inside a path.
pub const SIG_UNBOUND_RELATIONSHIP: u8 = 0x72;
/// Structure signature for a path.
pub const SIG_PATH: u8 = 0x50;

/// An error produced while decoding PackStream data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unknown marker byte 0x{0:02X}")]
    UnknownMarker(u8),
    #[error("unknown structure signature 0x{0:02X}")]
    UnknownSignature(u8),
    #[error("collection nesting exceeds {MAX_NESTING_DEPTH} levels")]
    DepthExceeded,
    #[error("string value is not valid UTF-8")]
    InvalidUtf8,
    #[error("map key is not a string")]
    NonStringKey,
    #[error("malformed {0} structure")]
    InvalidStructure(&'static str),
}

impl From<DecodeError> for std::io::Error {
    fn from(err: DecodeError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// Encodes a value into `buf`.
pub fn encode(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(NULL),
        Value::Bool(true) => buf.put_u8(TRUE),
        Value::Bool(false) => buf.put_u8(FALSE),
        Value::Int(i) => encode_int(*i, buf),
        Value::Float(f) => {
            buf.put_u8(FLOAT64);
            buf.put_f64(*f);
        }
        Value::String(s) => encode_string(s, buf),
        Value::Bytes(b) => {
            match b.len() {
                n if n <= u8::MAX as usize => {
                    buf.put_u8(BYTES8);
                    buf.put_u8(n as u8);
                }
                n if n <= u16::MAX as usize => {
                    buf.put_u8(BYTES16);
                    buf.put_u16(n as u16);
                }
                n => {
                    buf.put_u8(BYTES32);
                    buf.put_u32(n as u32);
                }
            }
            buf.put_slice(b);
        }
        Value::List(items) => {
            encode_size(items.len(), TINY_LIST, LIST8, LIST16, LIST32, buf);
            for item in items {
                encode(item, buf);
            }
        }
        Value::Map(entries) => {
            encode_map(entries, buf);
        }
        Value::Node(node) => {
            encode_struct_header(3, SIG_NODE, buf);
            encode_int(node.identity, buf);
            encode_size(node.labels.len(), TINY_LIST, LIST8, LIST16, LIST32, buf);
            for label in &node.labels {
                encode_string(label, buf);
            }
            encode_map(&node.properties, buf);
        }
        Value::Relationship(rel) => {
            encode_struct_header(5, SIG_RELATIONSHIP, buf);
            encode_int(rel.identity, buf);
            encode_int(rel.start, buf);
            encode_int(rel.end, buf);
            encode_string(&rel.reltype, buf);
            encode_map(&rel.properties, buf);
        }
        Value::UnboundRelationship(rel) => {
            encode_struct_header(3, SIG_UNBOUND_RELATIONSHIP, buf);
            encode_int(rel.identity, buf);
            encode_string(&rel.reltype, buf);
            encode_map(&rel.properties, buf);
        }
        Value::Path(path) => {
            encode_struct_header(3, SIG_PATH, buf);
            encode_size(path.nodes.len(), TINY_LIST, LIST8, LIST16, LIST32, buf);
            for node in &path.nodes {
                encode(&Value::Node(node.clone()), buf);
            }
            encode_size(
                path.relationships.len(),
                TINY_LIST,
                LIST8,
                LIST16,
                LIST32,
                buf,
            );
            for rel in &path.relationships {
                encode(&Value::UnboundRelationship(rel.clone()), buf);
            }
            encode_size(path.sequence.len(), TINY_LIST, LIST8, LIST16, LIST32, buf);
            for idx in &path.sequence {
                encode_int(*idx, buf);
            }
        }
    }
}

/// Encodes an integer using the smallest representation that holds it.
pub fn encode_int(i: i64, buf: &mut BytesMut) {
    match i {
        -16..=127 => buf.put_i8(i as i8),
        n if i8::try_from(n).is_ok() => {
            buf.put_u8(INT8);
            buf.put_i8(n as i8);
        }
        n if i16::try_from(n).is_ok() => {
            buf.put_u8(INT16);
            buf.put_i16(n as i16);
        }
        n if i32::try_from(n).is_ok() => {
            buf.put_u8(INT32);
            buf.put_i32(n as i32);
        }
        n => {
            buf.put_u8(INT64);
            buf.put_i64(n);
        }
    }
}

/// Encodes a UTF-8 string with the smallest size header that holds it.
pub fn encode_string(s: &str, buf: &mut BytesMut) {
    encode_size(s.len(), TINY_STRING, STRING8, STRING16, STRING32, buf);
    buf.put_slice(s.as_bytes());
}

/// Encodes a map of string keys to values.
pub(crate) fn encode_map(entries: &HashMap<String, Value>, buf: &mut BytesMut) {
    encode_size(entries.len(), TINY_MAP, MAP8, MAP16, MAP32, buf);
    for (key, val) in entries {
        encode_string(key, buf);
        encode(val, buf);
    }
}

/// Writes the marker header for a structure of `n_fields` fields.
pub fn encode_struct_header(n_fields: usize, signature: u8, buf: &mut BytesMut) {
    match n_fields {
        n if n < 16 => buf.put_u8(TINY_STRUCT | n as u8),
        n if n <= u8::MAX as usize => {
            buf.put_u8(STRUCT8);
            buf.put_u8(n as u8);
        }
        n => {
            buf.put_u8(STRUCT16);
            buf.put_u16(n as u16);
        }
    }
    buf.put_u8(signature);
}

fn encode_size(len: usize, tiny: u8, m8: u8, m16: u8, m32: u8, buf: &mut BytesMut) {
    match len {
        n if n < 16 => buf.put_u8(tiny | n as u8),
        n if n <= u8::MAX as usize => {
            buf.put_u8(m8);
            buf.put_u8(n as u8);
        }
        n if n <= u16::MAX as usize => {
            buf.put_u8(m16);
            buf.put_u16(n as u16);
        }
        n => {
            buf.put_u8(m32);
            buf.put_u32(n as u32);
        }
    }
}

/// Decodes a single value from the front of `buf`, advancing it.
pub fn decode(buf: &mut Bytes) -> Result<Value, DecodeError> {
    decode_value(buf, 0)
}

fn decode_value(buf: &mut Bytes, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(DecodeError::DepthExceeded);
    }

    let marker = take_u8(buf)?;
    match marker {
        0x00..=0x7F => Ok(Value::Int(marker as i64)),
        0xF0..=0xFF => Ok(Value::Int(marker as i8 as i64)),
        NULL => Ok(Value::Null),
        TRUE => Ok(Value::Bool(true)),
        FALSE => Ok(Value::Bool(false)),
        FLOAT64 => {
            ensure(buf, 8)?;
            Ok(Value::Float(buf.get_f64()))
        }
        INT8 => {
            ensure(buf, 1)?;
            Ok(Value::Int(buf.get_i8() as i64))
        }
        INT16 => {
            ensure(buf, 2)?;
            Ok(Value::Int(buf.get_i16() as i64))
        }
        INT32 => {
            ensure(buf, 4)?;
            Ok(Value::Int(buf.get_i32() as i64))
        }
        INT64 => {
            ensure(buf, 8)?;
            Ok(Value::Int(buf.get_i64()))
        }
        BYTES8 | BYTES16 | BYTES32 => {
            let len = take_size(buf, marker - BYTES8)?;
            ensure(buf, len)?;
            Ok(Value::Bytes(buf.copy_to_bytes(len)))
        }
        m if m & 0xF0 == TINY_STRING => decode_string(buf, (m & 0x0F) as usize),
        STRING8 | STRING16 | STRING32 => {
            let len = take_size(buf, marker - STRING8)?;
            decode_string(buf, len)
        }
        m if m & 0xF0 == TINY_LIST => decode_list(buf, (m & 0x0F) as usize, depth),
        LIST8 | LIST16 | LIST32 => {
            let len = take_size(buf, marker - LIST8)?;
            decode_list(buf, len, depth)
        }
        m if m & 0xF0 == TINY_MAP => decode_map(buf, (m & 0x0F) as usize, depth),
        MAP8 | MAP16 | MAP32 => {
            let len = take_size(buf, marker - MAP8)?;
            decode_map(buf, len, depth)
        }
        m if m & 0xF0 == TINY_STRUCT => decode_struct(buf, (m & 0x0F) as usize, depth),
        STRUCT8 => {
            let len = take_u8(buf)? as usize;
            decode_struct(buf, len, depth)
        }
        STRUCT16 => {
            ensure(buf, 2)?;
            let len = buf.get_u16() as usize;
            decode_struct(buf, len, depth)
        }
        m => Err(DecodeError::UnknownMarker(m)),
    }
}

fn decode_string(buf: &mut Bytes, len: usize) -> Result<Value, DecodeError> {
    ensure(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    let s = std::str::from_utf8(&bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(Value::String(s.to_string()))
}

fn decode_list(buf: &mut Bytes, len: usize, depth: usize) -> Result<Value, DecodeError> {
    let mut items = Vec::with_capacity(len.min(buf.remaining()));
    for _ in 0..len {
        items.push(decode_value(buf, depth + 1)?);
    }
    Ok(Value::List(items))
}

fn decode_map(buf: &mut Bytes, len: usize, depth: usize) -> Result<Value, DecodeError> {
    let mut entries = HashMap::with_capacity(len.min(buf.remaining()));
    for _ in 0..len {
        let key = match decode_value(buf, depth + 1)? {
            Value::String(s) => s,
            _ => return Err(DecodeError::NonStringKey),
        };
        let val = decode_value(buf, depth + 1)?;
        entries.insert(key, val);
    }
    Ok(Value::Map(entries))
}

fn decode_struct(buf: &mut Bytes, n_fields: usize, depth: usize) -> Result<Value, DecodeError> {
    let signature = take_u8(buf)?;
    let mut fields = Vec::with_capacity(n_fields.min(buf.remaining()));
    for _ in 0..n_fields {
        fields.push(decode_value(buf, depth + 1)?);
    }

    match signature {
        SIG_NODE => decode_node(fields).map(Value::Node),
        SIG_RELATIONSHIP => {
            let [id, start, end, reltype, props] = take_fields(fields, "relationship")?;
            Ok(Value::Relationship(Relationship {
                identity: expect_int(id, "relationship")?,
                start: expect_int(start, "relationship")?,
                end: expect_int(end, "relationship")?,
                reltype: expect_string(reltype, "relationship")?,
                properties: expect_map(props, "relationship")?,
            }))
        }
        SIG_UNBOUND_RELATIONSHIP => {
            let [id, reltype, props] = take_fields(fields, "relationship")?;
            Ok(Value::UnboundRelationship(UnboundRelationship {
                identity: expect_int(id, "relationship")?,
                reltype: expect_string(reltype, "relationship")?,
                properties: expect_map(props, "relationship")?,
            }))
        }
        SIG_PATH => {
            let [nodes, rels, seq] = take_fields(fields, "path")?;
            let nodes = match nodes {
                Value::List(items) => items
                    .into_iter()
                    .map(|v| match v {
                        Value::Node(n) => Ok(n),
                        _ => Err(DecodeError::InvalidStructure("path")),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(DecodeError::InvalidStructure("path")),
            };
            let relationships = match rels {
                Value::List(items) => items
                    .into_iter()
                    .map(|v| match v {
                        Value::UnboundRelationship(r) => Ok(r),
                        _ => Err(DecodeError::InvalidStructure("path")),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(DecodeError::InvalidStructure("path")),
            };
            let sequence = match seq {
                Value::List(items) => items
                    .into_iter()
                    .map(|v| v.as_int().ok_or(DecodeError::InvalidStructure("path")))
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(DecodeError::InvalidStructure("path")),
            };
            Ok(Value::Path(Path {
                nodes,
                relationships,
                sequence,
            }))
        }
        sig => Err(DecodeError::UnknownSignature(sig)),
    }
}

fn decode_node(fields: Vec<Value>) -> Result<Node, DecodeError> {
    let [id, labels, props] = take_fields(fields, "node")?;
    let labels = match labels {
        Value::List(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(DecodeError::InvalidStructure("node")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(DecodeError::InvalidStructure("node")),
    };
    Ok(Node {
        identity: expect_int(id, "node")?,
        labels,
        properties: expect_map(props, "node")?,
    })
}

fn take_fields<const N: usize>(
    fields: Vec<Value>,
    what: &'static str,
) -> Result<[Value; N], DecodeError> {
    fields
        .try_into()
        .map_err(|_| DecodeError::InvalidStructure(what))
}

fn expect_int(value: Value, what: &'static str) -> Result<i64, DecodeError> {
    value.as_int().ok_or(DecodeError::InvalidStructure(what))
}

fn expect_string(value: Value, what: &'static str) -> Result<String, DecodeError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(DecodeError::InvalidStructure(what)),
    }
}

fn expect_map(value: Value, what: &'static str) -> Result<HashMap<String, Value>, DecodeError> {
    match value {
        Value::Map(m) => Ok(m),
        _ => Err(DecodeError::InvalidStructure(what)),
    }
}

fn take_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_size(buf: &mut Bytes, width: u8) -> Result<usize, DecodeError> {
    match width {
        0 => {
            ensure(buf, 1)?;
            Ok(buf.get_u8() as usize)
        }
        1 => {
            ensure(buf, 2)?;
            Ok(buf.get_u16() as usize)
        }
        _ => {
            ensure(buf, 4)?;
            Ok(buf.get_u32() as usize)
        }
    }
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::BytesMut;

    use super::*;

    fn roundtrip(value: Value) -> Value {
        let mut buf = BytesMut::new();
        encode(&value, &mut buf);
        let mut bytes = buf.freeze();
        let decoded = decode(&mut bytes).unwrap();
        assert_eq!(bytes.remaining(), 0, "trailing bytes after decode");
        decoded
    }

    #[test]
    fn test_encode_tiny_int() {
        let mut buf = BytesMut::new();
        encode(&Value::Int(42), &mut buf);
        assert_eq!(&buf[..], &[42]);

        let mut buf = BytesMut::new();
        encode(&Value::Int(-1), &mut buf);
        assert_eq!(&buf[..], &[0xFF]);
    }

    #[test]
    fn test_encode_int_widths() {
        let mut buf = BytesMut::new();
        encode(&Value::Int(-100), &mut buf);
        assert_eq!(&buf[..], &[0xC8, 0x9C]);

        let mut buf = BytesMut::new();
        encode(&Value::Int(1000), &mut buf);
        assert_eq!(&buf[..], &[0xC9, 0x03, 0xE8]);

        let mut buf = BytesMut::new();
        encode(&Value::Int(100_000), &mut buf);
        assert_eq!(&buf[..], &[0xCA, 0x00, 0x01, 0x86, 0xA0]);

        let mut buf = BytesMut::new();
        encode(&Value::Int(i64::MAX), &mut buf);
        assert_eq!(
            &buf[..],
            &[0xCB, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_encode_string() {
        let mut buf = BytesMut::new();
        encode(&Value::String("hello".into()), &mut buf);
        assert_eq!(&buf[..], b"\x85hello");
    }

    #[test]
    fn test_encode_null_and_bools() {
        let mut buf = BytesMut::new();
        encode(&Value::Null, &mut buf);
        encode(&Value::Bool(false), &mut buf);
        encode(&Value::Bool(true), &mut buf);
        assert_eq!(&buf[..], &[0xC0, 0xC2, 0xC3]);
    }

    #[test]
    fn test_roundtrip_scalars() {
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Int(-42)), Value::Int(-42));
        assert_eq!(roundtrip(Value::Float(1.5)), Value::Float(1.5));
        assert_eq!(
            roundtrip(Value::String("käse".into())),
            Value::String("käse".into())
        );
    }

    #[test]
    fn test_roundtrip_long_string() {
        let s = "x".repeat(300);
        assert_eq!(roundtrip(Value::String(s.clone())), Value::String(s));
    }

    #[test]
    fn test_roundtrip_collections() {
        let list = Value::List(vec![Value::Int(1), Value::String("a".into()), Value::Null]);
        assert_eq!(roundtrip(list.clone()), list);

        let mut map = HashMap::new();
        map.insert("one".to_string(), Value::Int(1));
        map.insert("nested".to_string(), list);
        let map = Value::Map(map);
        assert_eq!(roundtrip(map.clone()), map);
    }

    #[test]
    fn test_roundtrip_node() {
        let mut props = HashMap::new();
        props.insert("name".to_string(), Value::String("Alice".into()));
        let node = Value::Node(Node {
            identity: 7,
            labels: vec!["Person".to_string()],
            properties: props,
        });
        assert_eq!(roundtrip(node.clone()), node);
    }

    #[test]
    fn test_roundtrip_path() {
        let node = Node {
            identity: 1,
            labels: vec![],
            properties: HashMap::new(),
        };
        let rel = UnboundRelationship {
            identity: 9,
            reltype: "KNOWS".to_string(),
            properties: HashMap::new(),
        };
        let path = Value::Path(Path {
            nodes: vec![node.clone(), node],
            relationships: vec![rel],
            sequence: vec![1, 1],
        });
        assert_eq!(roundtrip(path.clone()), path);
    }

    #[test]
    fn test_decode_truncated_input() {
        let mut bytes = Bytes::from_static(&[0xC9, 0x03]);
        assert_eq!(decode(&mut bytes), Err(DecodeError::UnexpectedEof));

        let mut bytes = Bytes::from_static(b"\x85hel");
        assert_eq!(decode(&mut bytes), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_decode_unknown_marker() {
        let mut bytes = Bytes::from_static(&[0xC7]);
        assert_eq!(decode(&mut bytes), Err(DecodeError::UnknownMarker(0xC7)));
    }

    #[test]
    fn test_decode_unknown_signature() {
        let mut bytes = Bytes::from_static(&[0xB0, 0x42]);
        assert_eq!(decode(&mut bytes), Err(DecodeError::UnknownSignature(0x42)));
    }

    #[test]
    fn test_decode_depth_limit() {
        let mut buf = BytesMut::new();
        for _ in 0..=MAX_NESTING_DEPTH {
            buf.put_u8(TINY_LIST | 1);
        }
        buf.put_u8(NULL);
        let mut bytes = buf.freeze();
        assert_eq!(decode(&mut bytes), Err(DecodeError::DepthExceeded));
    }

    #[test]
    fn test_decode_non_string_key() {
        // map of one entry with an int key
        let mut bytes = Bytes::from_static(&[0xA1, 0x01, 0x01]);
        assert_eq!(decode(&mut bytes), Err(DecodeError::NonStringKey));
    }

    #[test]
    fn test_hostile_length_is_eof_not_alloc() {
        // claims a 4 GiB string with a 2-byte body
        let mut bytes = Bytes::from_static(&[0xD2, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(decode(&mut bytes), Err(DecodeError::UnexpectedEof));
    }
}
