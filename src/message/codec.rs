//! Binary envelope codec
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! magic "MQMS" | version u8
//! message id [24] | correlation id [24]
//! format str | persistence u8 | message type u8 | priority u8
//! report u32 | expiry: flag u8 [+ secs u64 + nanos u32] | backout count u32
//! put timestamp: flag u8 [+ millis i64] | reply-to: flag u8 [+ str]
//! property count u32 | { name u16-str | tag u8 | value }*
//! payload u32 length | payload bytes
//! ```
//!
//! `str` is a u32 length followed by UTF-8 bytes. Decoding consumes the whole
//! input; anything left over is an error.

use super::envelope::{
    CorrelationId, Headers, Message, MessageId, MessageType, Persistence, ReportOptions,
    ID_LENGTH, MAX_PRIORITY,
};
use super::properties::{Properties, PropertyValue};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"MQMS";
const VERSION: u8 = 1;

/// Errors decoding an encoded envelope
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("unknown {field} tag {tag}")]
    UnknownTag { field: &'static str, tag: u8 },
    #[error("duplicate property '{0}'")]
    DuplicateProperty(String),
    #[error("invalid property name '{0}'")]
    InvalidPropertyName(String),
    #[error("expiry nanoseconds {0} out of range")]
    InvalidExpiry(u32),
    #[error("priority {0} out of range")]
    InvalidPriority(u8),
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("malformed admin payload: {0}")]
    AdminPayload(String),
}

impl Message {
    /// Encode the message into its binary envelope
    pub fn encode(&self) -> Bytes {
        let h = &self.headers;
        let mut out = BytesMut::with_capacity(128 + self.payload.len());

        out.put_slice(MAGIC);
        out.put_u8(VERSION);
        out.put_slice(h.message_id.as_bytes());
        out.put_slice(h.correlation_id.as_bytes());
        put_str(&mut out, &h.format);
        out.put_u8(match h.persistence {
            Persistence::NotPersistent => 0,
            Persistence::Persistent => 1,
        });
        out.put_u8(h.message_type.code());
        out.put_u8(h.priority);
        out.put_u32(h.report.bits());
        match h.expiry {
            Some(expiry) => {
                out.put_u8(1);
                out.put_u64(expiry.as_secs());
                out.put_u32(expiry.subsec_nanos());
            }
            None => out.put_u8(0),
        }
        out.put_u32(h.backout_count);

        match h.put_timestamp {
            Some(ts) => {
                out.put_u8(1);
                out.put_i64(ts.timestamp_millis());
            }
            None => out.put_u8(0),
        }
        match &h.reply_to {
            Some(queue) => {
                out.put_u8(1);
                put_str(&mut out, queue);
            }
            None => out.put_u8(0),
        }

        out.put_u32(self.properties.len() as u32);
        for (name, value) in self.properties.iter() {
            out.put_u16(name.len() as u16);
            out.put_slice(name.as_bytes());
            out.put_u8(value.tag());
            match value {
                PropertyValue::Bool(v) => out.put_u8(u8::from(*v)),
                PropertyValue::Int8(v) => out.put_i8(*v),
                PropertyValue::Int16(v) => out.put_i16(*v),
                PropertyValue::Int32(v) => out.put_i32(*v),
                PropertyValue::Int64(v) => out.put_i64(*v),
                PropertyValue::Float32(v) => out.put_f32(*v),
                PropertyValue::Float64(v) => out.put_f64(*v),
                PropertyValue::String(v) => put_str(&mut out, v),
                PropertyValue::Bytes(v) => {
                    out.put_u32(v.len() as u32);
                    out.put_slice(v);
                }
                PropertyValue::Null => {}
            }
        }

        out.put_u32(self.payload.len() as u32);
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Decode a binary envelope produced by [`Message::encode`]
    pub fn decode(input: &[u8]) -> Result<Message, FormatError> {
        let mut r = Reader::new(input);

        if r.take(MAGIC.len())? != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = r.u8()?;
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let message_id = MessageId::from_bytes(r.id()?);
        let correlation_id = CorrelationId::from_bytes(r.id()?);
        let format = r.string("format")?;
        let persistence = match r.u8()? {
            0 => Persistence::NotPersistent,
            1 => Persistence::Persistent,
            tag => {
                return Err(FormatError::UnknownTag {
                    field: "persistence",
                    tag,
                })
            }
        };
        let type_code = r.u8()?;
        let message_type = MessageType::from_code(type_code).ok_or(FormatError::UnknownTag {
            field: "message type",
            tag: type_code,
        })?;
        let priority = r.u8()?;
        if priority > MAX_PRIORITY {
            return Err(FormatError::InvalidPriority(priority));
        }
        let report = ReportOptions::from_bits(r.u32()?);
        let expiry = match r.flag("expiry")? {
            true => {
                let secs = r.u64()?;
                let nanos = r.u32()?;
                if nanos >= 1_000_000_000 {
                    return Err(FormatError::InvalidExpiry(nanos));
                }
                Some(Duration::new(secs, nanos))
            }
            false => None,
        };
        let backout_count = r.u32()?;

        let put_timestamp = match r.flag("put timestamp")? {
            true => DateTime::<Utc>::from_timestamp_millis(r.i64()?),
            false => None,
        };
        let reply_to = match r.flag("reply-to")? {
            true => Some(r.string("reply-to")?),
            false => None,
        };

        let mut properties = Properties::new();
        let count = r.u32()?;
        for _ in 0..count {
            let name_len = r.u16()? as usize;
            let name = std::str::from_utf8(r.take(name_len)?)
                .map_err(|_| FormatError::InvalidUtf8("property name"))?
                .to_string();
            let value = r.property_value()?;
            properties.insert_unique(name, value)?;
        }

        let payload_len = r.u32()? as usize;
        let payload = Bytes::copy_from_slice(r.take(payload_len)?);

        if r.remaining() > 0 {
            return Err(FormatError::TrailingBytes(r.remaining()));
        }

        Ok(Message {
            headers: Headers {
                message_id,
                correlation_id,
                format,
                persistence,
                report,
                message_type,
                priority,
                expiry,
                reply_to,
                put_timestamp,
                backout_count,
            },
            properties,
            payload,
        })
    }
}

fn put_str(out: &mut BytesMut, s: &str) {
    out.put_u32(s.len() as u32);
    out.put_slice(s.as_bytes());
}

struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    fn remaining(&self) -> usize {
        self.input.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.input.len() < n {
            return Err(FormatError::UnexpectedEof {
                needed: n,
                remaining: self.input.len(),
            });
        }
        let (head, tail) = self.input.split_at(n);
        self.input = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn id(&mut self) -> Result<[u8; ID_LENGTH], FormatError> {
        self.array::<ID_LENGTH>()
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, FormatError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, FormatError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, FormatError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, FormatError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(FormatError::UnknownTag { field, tag }),
        }
    }

    fn string(&mut self, field: &'static str) -> Result<String, FormatError> {
        let len = self.u32()? as usize;
        std::str::from_utf8(self.take(len)?)
            .map(str::to_string)
            .map_err(|_| FormatError::InvalidUtf8(field))
    }

    fn property_value(&mut self) -> Result<PropertyValue, FormatError> {
        let tag = self.u8()?;
        Ok(match tag {
            1 => PropertyValue::Bool(self.flag("bool property")?),
            2 => PropertyValue::Int8(i8::from_be_bytes(self.array()?)),
            3 => PropertyValue::Int16(i16::from_be_bytes(self.array()?)),
            4 => PropertyValue::Int32(i32::from_be_bytes(self.array()?)),
            5 => PropertyValue::Int64(self.i64()?),
            6 => PropertyValue::Float32(f32::from_be_bytes(self.array()?)),
            7 => PropertyValue::Float64(f64::from_be_bytes(self.array()?)),
            8 => PropertyValue::String(self.string("string property")?),
            9 => {
                let len = self.u32()? as usize;
                PropertyValue::Bytes(Bytes::copy_from_slice(self.take(len)?))
            }
            10 => PropertyValue::Null,
            tag => {
                return Err(FormatError::UnknownTag {
                    field: "property",
                    tag,
                })
            }
        })
    }
}
