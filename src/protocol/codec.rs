//! A concrete, self-contained wire codec.
//!
//! Message framing and value packing are treated as a pluggable
//! collaborator behind the [`Codec`] trait rather than baked into the
//! core — the core only needs *a* codec, not a particular byte format.
//! This module supplies one concrete implementation
//! (`PackStreamLiteCodec`) so the crate is runnable end to end: small
//! `read_*`/`write_*` functions operating on byte slices, threading the
//! remainder back to the caller.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::{Params, Value};

use super::message::{Message, ResponseMessage};

/// Structure tag bytes for the handful of top-level message shapes this
/// codec needs to tell apart. Distinct from [`crate::constant::MessageTag`]
/// in spirit only — this module owns its own encoding detail on purpose,
/// separate from `constant::CommandByte`.
mod tag {
    pub const NULL: u8 = 0x00;
    pub const BOOL_FALSE: u8 = 0x01;
    pub const BOOL_TRUE: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const STRING: u8 = 0x05;
    pub const BYTES: u8 = 0x06;
    pub const LIST: u8 = 0x07;
    pub const MAP: u8 = 0x08;
    pub const STRUCTURE: u8 = 0x09;
}

/// Encodes outbound [`Message`]s and decodes inbound [`ResponseMessage`]s.
///
/// A real deployment swaps this for a spec-compliant PackStream codec;
/// the rest of the core only ever talks to this trait.
pub trait Codec: Send + Sync {
    fn encode_message(&self, message: &Message, out: &mut Vec<u8>) -> Result<()>;
    fn decode_message(&self, bytes: &[u8]) -> Result<ResponseMessage>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PackStreamLiteCodec;

impl Codec for PackStreamLiteCodec {
    fn encode_message(&self, message: &Message, out: &mut Vec<u8>) -> Result<()> {
        match message {
            Message::Hello { user_agent, auth } => {
                write_u8(out, super::super::constant::MessageTag::Hello as u8);
                let mut map = BTreeMap::new();
                map.insert("user_agent".to_string(), Value::String(user_agent.clone()));
                for (k, v) in auth {
                    map.insert(k.clone(), v.clone());
                }
                write_value(out, &Value::Map(map));
            }
            Message::Run {
                statement,
                params,
                metadata,
            } => {
                write_u8(out, super::super::constant::MessageTag::Run as u8);
                write_value(out, &Value::String(statement.clone()));
                let param_map: BTreeMap<String, Value> =
                    params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
                write_value(out, &Value::Map(param_map));
                write_value(out, &Value::Map(metadata.clone()));
            }
            Message::PullAll => write_u8(out, super::super::constant::MessageTag::PullAll as u8),
            Message::Reset => write_u8(out, super::super::constant::MessageTag::Reset as u8),
            Message::Begin { metadata } => {
                write_u8(out, super::super::constant::MessageTag::Begin as u8);
                write_value(out, &Value::Map(metadata.clone()));
            }
            Message::Commit => write_u8(out, super::super::constant::MessageTag::Commit as u8),
            Message::Rollback => write_u8(out, super::super::constant::MessageTag::Rollback as u8),
        }
        Ok(())
    }

    fn decode_message(&self, bytes: &[u8]) -> Result<ResponseMessage> {
        let (tag_byte, rest) = read_u8(bytes)?;
        let tag = super::super::constant::MessageTag::from_byte(tag_byte)
            .ok_or_else(|| Error::LibraryBug(format!("unknown message tag 0x{tag_byte:02X}")))?;
        use super::super::constant::MessageTag as T;
        match tag {
            T::Success => {
                let (value, rest) = read_value(rest)?;
                ensure_exhausted(rest)?;
                let metadata = value
                    .as_map()
                    .cloned()
                    .ok_or_else(|| Error::LibraryBug("SUCCESS metadata was not a map".into()))?;
                Ok(ResponseMessage::Success { metadata })
            }
            T::Failure => {
                let (value, rest) = read_value(rest)?;
                ensure_exhausted(rest)?;
                let map = value
                    .as_map()
                    .ok_or_else(|| Error::LibraryBug("FAILURE payload was not a map".into()))?;
                let code = map
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("Neo.DatabaseError.General.UnknownError")
                    .to_string();
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown failure")
                    .to_string();
                Ok(ResponseMessage::Failure { code, message })
            }
            T::Record => {
                let (value, rest) = read_value(rest)?;
                ensure_exhausted(rest)?;
                let fields = value
                    .as_list()
                    .ok_or_else(|| Error::LibraryBug("RECORD payload was not a list".into()))?
                    .to_vec();
                Ok(ResponseMessage::Record { fields })
            }
            T::Ignored => Ok(ResponseMessage::Ignored),
            other => Err(Error::LibraryBug(format!(
                "{other:?} is not a valid response message tag"
            ))),
        }
    }
}

fn ensure_exhausted(rest: &[u8]) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(Error::LibraryBug(format!(
            "{} trailing bytes after decoding message body",
            rest.len()
        )))
    }
}

fn write_u8(out: &mut Vec<u8>, byte: u8) {
    out.push(byte);
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => write_u8(out, tag::NULL),
        Value::Bool(false) => write_u8(out, tag::BOOL_FALSE),
        Value::Bool(true) => write_u8(out, tag::BOOL_TRUE),
        Value::Integer(i) => {
            write_u8(out, tag::INT);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            write_u8(out, tag::FLOAT);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::String(s) => {
            write_u8(out, tag::STRING);
            write_bytes(out, s.as_bytes());
        }
        Value::Bytes(b) => {
            write_u8(out, tag::BYTES);
            write_bytes(out, b);
        }
        Value::List(items) => {
            write_u8(out, tag::LIST);
            write_u32(out, items.len() as u32);
            for item in items {
                write_value(out, item);
            }
        }
        Value::Map(map) => {
            write_u8(out, tag::MAP);
            write_u32(out, map.len() as u32);
            for (k, v) in map {
                write_bytes(out, k.as_bytes());
                write_value(out, v);
            }
        }
        Value::Structure { tag: struct_tag, fields } => {
            write_u8(out, tag::STRUCTURE);
            write_u8(out, *struct_tag);
            write_u32(out, fields.len() as u32);
            for field in fields {
                write_value(out, field);
            }
        }
    }
}

fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    data.split_first()
        .map(|(byte, rest)| (*byte, rest))
        .ok_or_else(|| Error::LibraryBug("unexpected end of message body".into()))
}

fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::LibraryBug("unexpected end of message body".into()));
    }
    let (head, rest) = data.split_at(4);
    Ok((u32::from_be_bytes([head[0], head[1], head[2], head[3]]), rest))
}

fn read_n(data: &[u8], n: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < n {
        return Err(Error::LibraryBug("unexpected end of message body".into()));
    }
    Ok(data.split_at(n))
}

fn read_value(data: &[u8]) -> Result<(Value, &[u8])> {
    let (tag_byte, rest) = read_u8(data)?;
    match tag_byte {
        tag::NULL => Ok((Value::Null, rest)),
        tag::BOOL_FALSE => Ok((Value::Bool(false), rest)),
        tag::BOOL_TRUE => Ok((Value::Bool(true), rest)),
        tag::INT => {
            let (bytes, rest) = read_n(rest, 8)?;
            let array: [u8; 8] = bytes.try_into().expect("read_n(8) returns 8 bytes");
            Ok((Value::Integer(i64::from_be_bytes(array)), rest))
        }
        tag::FLOAT => {
            let (bytes, rest) = read_n(rest, 8)?;
            let array: [u8; 8] = bytes.try_into().expect("read_n(8) returns 8 bytes");
            Ok((Value::Float(f64::from_be_bytes(array)), rest))
        }
        tag::STRING => {
            let (len, rest) = read_u32(rest)?;
            let (bytes, rest) = read_n(rest, len as usize)?;
            let s = String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::LibraryBug(format!("invalid utf8 in STRING value: {e}")))?;
            Ok((Value::String(s), rest))
        }
        tag::BYTES => {
            let (len, rest) = read_u32(rest)?;
            let (bytes, rest) = read_n(rest, len as usize)?;
            Ok((Value::Bytes(bytes.to_vec()), rest))
        }
        tag::LIST => {
            let (len, mut rest) = read_u32(rest)?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let (item, next) = read_value(rest)?;
                items.push(item);
                rest = next;
            }
            Ok((Value::List(items), rest))
        }
        tag::MAP => {
            let (len, mut rest) = read_u32(rest)?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let (klen, next) = read_u32(rest)?;
                let (kbytes, next) = read_n(next, klen as usize)?;
                let key = String::from_utf8(kbytes.to_vec())
                    .map_err(|e| Error::LibraryBug(format!("invalid utf8 in map key: {e}")))?;
                let (value, next) = read_value(next)?;
                map.insert(key, value);
                rest = next;
            }
            Ok((Value::Map(map), rest))
        }
        tag::STRUCTURE => {
            let (struct_tag, rest) = read_u8(rest)?;
            let (len, mut rest) = read_u32(rest)?;
            let mut fields = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let (field, next) = read_value(rest)?;
                fields.push(field);
                rest = next;
            }
            Ok((
                Value::Structure {
                    tag: struct_tag,
                    fields,
                },
                rest,
            ))
        }
        other => Err(Error::LibraryBug(format!("unknown value tag 0x{other:02X}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_success_metadata() {
        let codec = PackStreamLiteCodec;
        let mut metadata = BTreeMap::new();
        metadata.insert("fields".to_string(), Value::List(vec![Value::from("n")]));
        let mut out = Vec::new();
        write_u8(&mut out, super::super::super::constant::MessageTag::Success as u8);
        write_value(&mut out, &Value::Map(metadata.clone()));
        let decoded = codec.decode_message(&out).unwrap();
        assert_eq!(decoded, ResponseMessage::Success { metadata });
    }

    #[test]
    fn round_trips_failure() {
        let codec = PackStreamLiteCodec;
        let mut map = BTreeMap::new();
        map.insert("code".to_string(), Value::from("Neo.ClientError.Statement.SyntaxError"));
        map.insert("message".to_string(), Value::from("bad syntax"));
        let mut out = Vec::new();
        write_u8(&mut out, super::super::super::constant::MessageTag::Failure as u8);
        write_value(&mut out, &Value::Map(map));
        let decoded = codec.decode_message(&out).unwrap();
        assert_eq!(
            decoded,
            ResponseMessage::Failure {
                code: "Neo.ClientError.Statement.SyntaxError".into(),
                message: "bad syntax".into(),
            }
        );
    }

    #[test]
    fn round_trips_record() {
        let codec = PackStreamLiteCodec;
        let mut out = Vec::new();
        write_u8(&mut out, super::super::super::constant::MessageTag::Record as u8);
        write_value(&mut out, &Value::List(vec![Value::Integer(42), Value::from("hi")]));
        let decoded = codec.decode_message(&out).unwrap();
        assert_eq!(
            decoded,
            ResponseMessage::Record {
                fields: vec![Value::Integer(42), Value::from("hi")]
            }
        );
    }

    #[test]
    fn encodes_run_then_decodes_as_opaque_bytes_roundtrip() {
        let codec = PackStreamLiteCodec;
        let mut params = Params::new();
        params.insert("name", "alice");
        let message = Message::Run {
            statement: "MATCH (n) WHERE n.name = $name RETURN n".to_string(),
            params,
            metadata: BTreeMap::new(),
        };
        let mut out = Vec::new();
        codec.encode_message(&message, &mut out).unwrap();
        assert_eq!(out[0], super::super::super::constant::MessageTag::Run as u8);
    }
}
