//! Typed values and block type codes
//!
//! Every value stored by the engine is a timestamped variant of one of five
//! primitive types. On disk and in the WAL each variant is identified by a
//! one-byte *block type code*; codes 5..7 are reserved and decode as
//! [`ValueType::Unknown`].

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{EngineError, Result};

/// Block type code for 64-bit float blocks
pub const BLOCK_FLOAT64: u8 = 0;
/// Block type code for 64-bit signed integer blocks
pub const BLOCK_INTEGER: u8 = 1;
/// Block type code for boolean blocks
pub const BLOCK_BOOLEAN: u8 = 2;
/// Block type code for string blocks
pub const BLOCK_STRING: u8 = 3;
/// Block type code for 64-bit unsigned integer blocks
pub const BLOCK_UNSIGNED: u8 = 4;

/// The maximum number of points in an encoded block in a TSM file
pub const MAX_POINTS_PER_BLOCK: usize = 1000;

/// Logical type of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// 64-bit float
    Float,
    /// 64-bit signed integer
    Integer,
    /// Boolean
    Boolean,
    /// Byte string
    String,
    /// 64-bit unsigned integer
    Unsigned,
    /// Reserved/unrecognized block type
    Unknown,
}

/// Maps a block type code to its logical value type.
///
/// Only the low three bits are significant; codes 5..7 map to
/// [`ValueType::Unknown`].
pub fn block_type_to_value_type(typ: u8) -> ValueType {
    match typ & 7 {
        BLOCK_FLOAT64 => ValueType::Float,
        BLOCK_INTEGER => ValueType::Integer,
        BLOCK_BOOLEAN => ValueType::Boolean,
        BLOCK_STRING => ValueType::String,
        BLOCK_UNSIGNED => ValueType::Unsigned,
        _ => ValueType::Unknown,
    }
}

/// A single field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit unsigned integer
    Unsigned(u64),
    /// Boolean
    Boolean(bool),
    /// Byte string
    String(Vec<u8>),
}

impl FieldValue {
    /// Block type code for this value
    pub fn block_type(&self) -> u8 {
        match self {
            FieldValue::Float(_) => BLOCK_FLOAT64,
            FieldValue::Integer(_) => BLOCK_INTEGER,
            FieldValue::Unsigned(_) => BLOCK_UNSIGNED,
            FieldValue::Boolean(_) => BLOCK_BOOLEAN,
            FieldValue::String(_) => BLOCK_STRING,
        }
    }
}

/// A timestamped value as stored in the cache, WAL and TSM files
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// Timestamp in nanoseconds since the unix epoch
    pub unix_nano: i64,
    /// The typed value
    pub value: FieldValue,
}

impl Value {
    /// Create a new value
    pub fn new(unix_nano: i64, value: FieldValue) -> Self {
        Self { unix_nano, value }
    }

    /// Create a new float value
    pub fn float(unix_nano: i64, v: f64) -> Self {
        Self::new(unix_nano, FieldValue::Float(v))
    }

    /// Create a new integer value
    pub fn integer(unix_nano: i64, v: i64) -> Self {
        Self::new(unix_nano, FieldValue::Integer(v))
    }

    /// Create a new unsigned value
    pub fn unsigned(unix_nano: i64, v: u64) -> Self {
        Self::new(unix_nano, FieldValue::Unsigned(v))
    }

    /// Create a new boolean value
    pub fn boolean(unix_nano: i64, v: bool) -> Self {
        Self::new(unix_nano, FieldValue::Boolean(v))
    }

    /// Create a new string value
    pub fn string(unix_nano: i64, v: impl Into<Vec<u8>>) -> Self {
        Self::new(unix_nano, FieldValue::String(v.into()))
    }

    /// Block type code for this value
    pub fn block_type(&self) -> u8 {
        self.value.block_type()
    }

    /// Approximate in-memory size in bytes, used for cache accounting
    pub fn size(&self) -> usize {
        match &self.value {
            FieldValue::Float(_) | FieldValue::Integer(_) | FieldValue::Unsigned(_) => 16,
            FieldValue::Boolean(_) => 9,
            FieldValue::String(s) => 12 + s.len(),
        }
    }

    /// Append the little-endian wire encoding of this value to `buf`.
    ///
    /// Layout: block type code, i64 timestamp, then the variant payload.
    /// Strings are length-prefixed with a u32.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.block_type());
        // Vec<u8> writes cannot fail.
        let _ = buf.write_i64::<LittleEndian>(self.unix_nano);
        match &self.value {
            FieldValue::Float(v) => {
                let _ = buf.write_f64::<LittleEndian>(*v);
            }
            FieldValue::Integer(v) => {
                let _ = buf.write_i64::<LittleEndian>(*v);
            }
            FieldValue::Unsigned(v) => {
                let _ = buf.write_u64::<LittleEndian>(*v);
            }
            FieldValue::Boolean(v) => buf.push(u8::from(*v)),
            FieldValue::String(s) => {
                let _ = buf.write_u32::<LittleEndian>(s.len() as u32);
                buf.extend_from_slice(s);
            }
        }
    }

    /// Decode a value from its wire encoding.
    pub fn decode_from<R: Read>(r: &mut R) -> Result<Self> {
        let typ = r.read_u8()?;
        let unix_nano = r.read_i64::<LittleEndian>()?;
        let value = match typ {
            BLOCK_FLOAT64 => FieldValue::Float(r.read_f64::<LittleEndian>()?),
            BLOCK_INTEGER => FieldValue::Integer(r.read_i64::<LittleEndian>()?),
            BLOCK_UNSIGNED => FieldValue::Unsigned(r.read_u64::<LittleEndian>()?),
            BLOCK_BOOLEAN => FieldValue::Boolean(r.read_u8()? != 0),
            BLOCK_STRING => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut s = vec![0u8; len];
                r.read_exact(&mut s)?;
                FieldValue::String(s)
            }
            other => return Err(EngineError::UnknownFieldType(other)),
        };
        Ok(Self { unix_nano, value })
    }
}

/// Sorts values by timestamp and deduplicates equal timestamps, keeping the
/// most recently written value for each.
pub fn sort_dedup(values: &mut Vec<Value>) {
    if values.len() < 2 {
        return;
    }
    // Stable sort keeps insertion order within equal timestamps, so the last
    // write for a timestamp ends up last in its run.
    values.sort_by_key(|v| v.unix_nano);
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values.drain(..) {
        if let Some(last) = out.last_mut() {
            if last.unix_nano == v.unix_nano {
                *last = v;
                continue;
            }
        }
        out.push(v);
    }
    *values = out;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_type_mapping() {
        assert_eq!(block_type_to_value_type(0), ValueType::Float);
        assert_eq!(block_type_to_value_type(1), ValueType::Integer);
        assert_eq!(block_type_to_value_type(2), ValueType::Boolean);
        assert_eq!(block_type_to_value_type(3), ValueType::String);
        assert_eq!(block_type_to_value_type(4), ValueType::Unsigned);
        for t in 5u8..=7 {
            assert_eq!(block_type_to_value_type(t), ValueType::Unknown);
        }
    }

    #[test]
    fn test_encode_decode_all_variants() {
        let values = vec![
            Value::float(1, 0.5),
            Value::integer(2, -7),
            Value::unsigned(3, 42),
            Value::boolean(4, true),
            Value::string(5, b"hello".to_vec()),
        ];

        for v in values {
            let mut buf = Vec::new();
            v.encode_into(&mut buf);
            let decoded = Value::decode_from(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn test_decode_unknown_block_type() {
        let mut buf = vec![6u8];
        buf.extend_from_slice(&1i64.to_le_bytes());
        let err = Value::decode_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, EngineError::UnknownFieldType(6)));
    }

    #[test]
    fn test_sort_dedup_last_write_wins() {
        let mut values = vec![
            Value::float(3, 3.0),
            Value::float(1, 1.0),
            Value::float(3, 3.5),
            Value::float(2, 2.0),
        ];
        sort_dedup(&mut values);
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], Value::float(1, 1.0));
        assert_eq!(values[1], Value::float(2, 2.0));
        assert_eq!(values[2], Value::float(3, 3.5));
    }
}
