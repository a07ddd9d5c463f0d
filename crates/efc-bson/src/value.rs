//! Node values, their type tags and payload encoding

use std::fmt;

use efc_core::{Error, Result};

use crate::varint;

/// Wire type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    String = 1,
    Binary = 2,
    I8 = 3,
    I16 = 4,
    I32 = 5,
    I64 = 6,
    Float = 7,
    Double = 8,
    VarInt = 9,
    Container = 10,
}

impl Tag {
    pub fn from_u8(b: u8) -> Result<Tag> {
        Ok(match b {
            1 => Tag::String,
            2 => Tag::Binary,
            3 => Tag::I8,
            4 => Tag::I16,
            5 => Tag::I32,
            6 => Tag::I64,
            7 => Tag::Float,
            8 => Tag::Double,
            9 => Tag::VarInt,
            10 => Tag::Container,
            other => return Err(Error::data_format(format!("unknown type tag {}", other))),
        })
    }

    /// Payload size for fixed-width tags.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Tag::I8 => Some(1),
            Tag::I16 => Some(2),
            Tag::I32 | Tag::Float => Some(4),
            Tag::I64 | Tag::Double => Some(8),
            Tag::Container => Some(0),
            Tag::String | Tag::Binary | Tag::VarInt => None,
        }
    }

    /// Check a declared payload length against the tag.
    pub(crate) fn check_len(self, len: u64) -> Result<()> {
        let ok = match self.fixed_len() {
            Some(n) => len == n as u64,
            None if self == Tag::VarInt => (1..=varint::MAX_LEN as u64).contains(&len),
            None => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::data_format(format!("{:?} payload of {} bytes", self, len)))
        }
    }
}

/// The typed value of a node or attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Binary(Vec<u8>),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Float(f32),
    Double(f64),
    VarInt(u64),
    /// Holds children only
    Container,
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::String(_) => Tag::String,
            Value::Binary(_) => Tag::Binary,
            Value::I8(_) => Tag::I8,
            Value::I16(_) => Tag::I16,
            Value::I32(_) => Tag::I32,
            Value::I64(_) => Tag::I64,
            Value::Float(_) => Tag::Float,
            Value::Double(_) => Tag::Double,
            Value::VarInt(_) => Tag::VarInt,
            Value::Container => Tag::Container,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Container)
    }

    /// Append the payload bytes (without tag or length).
    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Binary(b) => out.extend_from_slice(b),
            Value::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::VarInt(v) => varint::encode(*v, out),
            Value::Container => {}
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            Value::Binary(b) => b.len(),
            Value::VarInt(v) => varint::encoded_len(*v),
            other => other.tag().fixed_len().unwrap_or(0),
        }
    }

    /// Rebuild a value from its tag and complete payload.
    pub fn decode(tag: Tag, payload: &[u8]) -> Result<Value> {
        tag.check_len(payload.len() as u64)?;
        Ok(match tag {
            Tag::String => Value::String(
                String::from_utf8(payload.to_vec())
                    .map_err(|e| Error::data_format(format!("string payload: {}", e)))?,
            ),
            Tag::Binary => Value::Binary(payload.to_vec()),
            Tag::I8 => Value::I8(i8::from_le_bytes(fixed(payload)?)),
            Tag::I16 => Value::I16(i16::from_le_bytes(fixed(payload)?)),
            Tag::I32 => Value::I32(i32::from_le_bytes(fixed(payload)?)),
            Tag::I64 => Value::I64(i64::from_le_bytes(fixed(payload)?)),
            Tag::Float => Value::Float(f32::from_bits(u32::from_le_bytes(fixed(payload)?))),
            Tag::Double => Value::Double(f64::from_bits(u64::from_le_bytes(fixed(payload)?))),
            Tag::VarInt => match varint::decode(payload) {
                Some((v, used)) if used == payload.len() => Value::VarInt(v),
                _ => return Err(Error::data_format("malformed varint payload")),
            },
            Tag::Container => Value::Container,
        })
    }

    // ── Lossy conversions ──

    /// Integer view: narrower integers widen, floats truncate toward
    /// zero, strings parse as base-10.
    pub fn to_i64(&self) -> Result<i64> {
        match self {
            Value::I8(v) => Ok(i64::from(*v)),
            Value::I16(v) => Ok(i64::from(*v)),
            Value::I32(v) => Ok(i64::from(*v)),
            Value::I64(v) => Ok(*v),
            Value::VarInt(v) => Ok(*v as i64),
            Value::Float(v) => Ok(*v as i64),
            Value::Double(v) => Ok(*v as i64),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| Error::number_format(format!("{:?}: {}", s, e))),
            Value::Binary(_) | Value::Container => Err(not_numeric(self)),
        }
    }

    pub fn to_i8(&self) -> Result<i8> {
        self.to_i64().map(|v| v as i8)
    }

    pub fn to_i16(&self) -> Result<i16> {
        self.to_i64().map(|v| v as i16)
    }

    pub fn to_i32(&self) -> Result<i32> {
        self.to_i64().map(|v| v as i32)
    }

    pub fn to_f64(&self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(f64::from(*v)),
            Value::Double(v) => Ok(*v),
            Value::VarInt(v) => Ok(*v as f64),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| Error::number_format(format!("{:?}: {}", s, e))),
            Value::Binary(_) | Value::Container => Err(not_numeric(self)),
            int => int.to_i64().map(|v| v as f64),
        }
    }

    pub fn to_f32(&self) -> Result<f32> {
        match self {
            Value::Float(v) => Ok(*v),
            other => other.to_f64().map(|v| v as f32),
        }
    }

    /// Text view: numbers format in base 10, binary decodes lossily.
    pub fn to_string_value(&self) -> Result<String> {
        Ok(match self {
            Value::String(s) => s.clone(),
            Value::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Value::I8(v) => v.to_string(),
            Value::I16(v) => v.to_string(),
            Value::I32(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::VarInt(v) => v.to_string(),
            Value::Container => return Err(Error::illegal_state("container has no value")),
        })
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
    payload
        .try_into()
        .map_err(|_| Error::data_format(format!("expected {} payload bytes, got {}", N, payload.len())))
}

fn not_numeric(v: &Value) -> Error {
    Error::number_format(format!("{:?} value is not numeric", v.tag()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Container => f.write_str("{}"),
            other => match other.to_string_value() {
                Ok(s) => f.write_str(&s),
                Err(_) => Ok(()),
            },
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    String => String,
    Vec<u8> => Binary,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => Float,
    f64 => Double,
    u64 => VarInt,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}
