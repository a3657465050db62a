//! Primitive types shared by every history-tree component.

use crate::error::{Result, StateHistoryError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Time in trace units (usually nanoseconds).
pub type Timestamp = i64;

/// Integer handle of a hierarchical attribute.
pub type Quark = u32;

/// Binary tag identifying each state value variant on disk.
///
/// Tags are part of the file format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueTag {
    Null = 0,
    Int = 1,
    Long = 2,
    Double = 3,
    String = 4,
    Custom = 5,
}

impl ValueTag {
    /// Decodes a tag byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ValueTag::Null),
            1 => Some(ValueTag::Int),
            2 => Some(ValueTag::Long),
            3 => Some(ValueTag::Double),
            4 => Some(ValueTag::String),
            5 => Some(ValueTag::Custom),
            _ => None,
        }
    }

    /// Returns the fixed payload size for this tag, or None for length-prefixed payloads.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ValueTag::Null => Some(0),
            ValueTag::Int => Some(4),
            ValueTag::Long | ValueTag::Double => Some(8),
            ValueTag::String | ValueTag::Custom => None,
        }
    }
}

/// Value held by an attribute during an interval.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum StateValue {
    /// No value; also the answer for attributes without state at a time.
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    /// Opaque payload encoded by the caller.
    Custom(Bytes),
}

impl StateValue {
    /// Size of the length prefix of string and custom payloads.
    const LEN_PREFIX: usize = 4;

    /// Returns the binary tag of this value.
    pub fn tag(&self) -> ValueTag {
        match self {
            StateValue::Null => ValueTag::Null,
            StateValue::Int(_) => ValueTag::Int,
            StateValue::Long(_) => ValueTag::Long,
            StateValue::Double(_) => ValueTag::Double,
            StateValue::String(_) => ValueTag::String,
            StateValue::Custom(_) => ValueTag::Custom,
        }
    }

    /// Returns a short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Int(_) => "int",
            StateValue::Long(_) => "long",
            StateValue::Double(_) => "double",
            StateValue::String(_) => "string",
            StateValue::Custom(_) => "custom",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Size of the encoded value including its tag byte.
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            StateValue::Null => 0,
            StateValue::Int(_) => 4,
            StateValue::Long(_) | StateValue::Double(_) => 8,
            StateValue::String(s) => Self::LEN_PREFIX + s.len(),
            StateValue::Custom(b) => Self::LEN_PREFIX + b.len(),
        }
    }

    /// Encodes the value into `buf`, which must hold at least `encoded_size()` bytes.
    ///
    /// Returns the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.tag() as u8;
        let payload = &mut buf[1..];
        let written = match self {
            StateValue::Null => 0,
            StateValue::Int(v) => {
                payload[0..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            StateValue::Long(v) => {
                payload[0..8].copy_from_slice(&v.to_le_bytes());
                8
            }
            StateValue::Double(v) => {
                payload[0..8].copy_from_slice(&v.to_bits().to_le_bytes());
                8
            }
            StateValue::String(s) => Self::encode_bytes(payload, s.as_bytes()),
            StateValue::Custom(b) => Self::encode_bytes(payload, b),
        };
        1 + written
    }

    fn encode_bytes(payload: &mut [u8], data: &[u8]) -> usize {
        payload[0..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
        payload[4..4 + data.len()].copy_from_slice(data);
        Self::LEN_PREFIX + data.len()
    }

    /// Decodes a value from the start of `buf`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(StateValue, usize)> {
        let tag_byte = *buf
            .first()
            .ok_or_else(|| StateHistoryError::Format("truncated state value".to_string()))?;
        let tag = ValueTag::from_u8(tag_byte).ok_or_else(|| {
            StateHistoryError::Format(format!("unknown state value tag: {}", tag_byte))
        })?;
        let payload = &buf[1..];

        if let Some(size) = tag.fixed_size() {
            if payload.len() < size {
                return Err(StateHistoryError::Format(format!(
                    "truncated {:?} state value",
                    tag
                )));
            }
        }

        let (value, consumed) = match tag {
            ValueTag::Null => (StateValue::Null, 0),
            ValueTag::Int => (
                StateValue::Int(i32::from_le_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ])),
                4,
            ),
            ValueTag::Long => (StateValue::Long(read_i64(payload)), 8),
            ValueTag::Double => (
                StateValue::Double(f64::from_bits(read_i64(payload) as u64)),
                8,
            ),
            ValueTag::String => {
                let data = Self::decode_bytes(payload)?;
                let s = std::str::from_utf8(data).map_err(|e| {
                    StateHistoryError::Format(format!("invalid UTF-8 in string value: {}", e))
                })?;
                (StateValue::String(s.to_string()), Self::LEN_PREFIX + data.len())
            }
            ValueTag::Custom => {
                let data = Self::decode_bytes(payload)?;
                (
                    StateValue::Custom(Bytes::copy_from_slice(data)),
                    Self::LEN_PREFIX + data.len(),
                )
            }
        };
        Ok((value, 1 + consumed))
    }

    fn decode_bytes(payload: &[u8]) -> Result<&[u8]> {
        if payload.len() < Self::LEN_PREFIX {
            return Err(StateHistoryError::Format(
                "truncated length prefix".to_string(),
            ));
        }
        let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        payload
            .get(Self::LEN_PREFIX..Self::LEN_PREFIX + len)
            .ok_or_else(|| StateHistoryError::Format(format!("truncated payload of {} bytes", len)))
    }

    fn type_error(&self, expected: &'static str) -> StateHistoryError {
        StateHistoryError::StateValueType {
            expected,
            actual: self.type_name(),
        }
    }

    pub fn as_int(&self) -> Result<i32> {
        match self {
            StateValue::Int(v) => Ok(*v),
            other => Err(other.type_error("int")),
        }
    }

    /// Returns the value as i64, widening ints.
    pub fn as_long(&self) -> Result<i64> {
        match self {
            StateValue::Int(v) => Ok(*v as i64),
            StateValue::Long(v) => Ok(*v),
            other => Err(other.type_error("long")),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            StateValue::Double(v) => Ok(*v),
            other => Err(other.type_error("double")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            StateValue::String(s) => Ok(s),
            other => Err(other.type_error("string")),
        }
    }

    /// Adds `delta` to a counter value. A null counter starts at zero.
    pub fn increment(&self, delta: i64) -> Result<StateValue> {
        match self {
            StateValue::Null => Ok(match i32::try_from(delta) {
                Ok(v) => StateValue::Int(v),
                Err(_) => StateValue::Long(delta),
            }),
            StateValue::Int(v) => Ok(match i32::try_from(*v as i64 + delta) {
                Ok(sum) => StateValue::Int(sum),
                Err(_) => StateValue::Long(*v as i64 + delta),
            }),
            StateValue::Long(v) => Ok(StateValue::Long(v.wrapping_add(delta))),
            other => Err(other.type_error("int or long")),
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::Null => write!(f, "null"),
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Long(v) => write!(f, "{}", v),
            StateValue::Double(v) => write!(f, "{}", v),
            StateValue::String(s) => write!(f, "{}", s),
            StateValue::Custom(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::String(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::String(v)
    }
}

#[inline]
pub(crate) fn read_i64(buf: &[u8]) -> i64 {
    i64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}
