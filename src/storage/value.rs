use std::{cmp::Ordering, fmt, io::Read};

use crate::{
    error::{DbError, DbResult},
    io::{read_exact, Decodeable, Encodeable},
};

const TAG_INT: u8 = 0;
const TAG_FLOAT: u8 = 1;
const TAG_TEXT: u8 = 2;
const TAG_COLUMN: u8 = 3;

/// A SQL scalar as it appears in rows and predicates.
///
/// `Column` never reaches disk inside a row; it only occurs in
/// predicates, where it names the column whose value the comparison
/// reads.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Column(String),
}

impl Value {
    pub fn tag(&self) -> u8 {
        match self {
            Value::Int(_) => TAG_INT,
            Value::Float(_) => TAG_FLOAT,
            Value::Text(_) => TAG_TEXT,
            Value::Column(_) => TAG_COLUMN,
        }
    }

    /// Encoded size in bytes, including the tag.
    pub fn encoded_size(&self) -> usize {
        match self {
            Value::Int(_) | Value::Float(_) => 1 + 8,
            Value::Text(s) | Value::Column(s) => 1 + 2 + s.len(),
        }
    }

    /// Fixed-width big-endian image used as a B+Tree key. Only the
    /// 8-byte scalars can be indexed.
    pub fn index_key_bytes(&self) -> Option<[u8; 8]> {
        match self {
            Value::Int(v) => Some(v.to_be_bytes()),
            Value::Float(v) => Some(v.to_bits().to_be_bytes()),
            Value::Text(_) | Value::Column(_) => None,
        }
    }

    /// Ordering across the comparable combinations; `None` when the
    /// operand types cannot be compared.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Column(c) => write!(f, "{}", c),
        }
    }
}

/// # Format
///
/// - 1 byte: tag
/// - int/float: 8-byte body
/// - text/column: 2-byte length, then the bytes
impl Encodeable for Value {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.push(self.tag());
        match self {
            Value::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Float(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            Value::Text(s) | Value::Column(s) => {
                buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
        buf
    }
}

impl Decodeable for Value {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let tag = u8::decode_from(reader)?;
        match tag {
            TAG_INT => Ok(Value::Int(i64::decode_from(reader)?)),
            TAG_FLOAT => Ok(Value::Float(f64::decode_from(reader)?)),
            TAG_TEXT | TAG_COLUMN => {
                let len = u16::decode_from(reader)? as usize;
                let bytes = read_exact(reader, len)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| DbError::corrupt("invalid utf-8 in value"))?;
                if tag == TAG_TEXT {
                    Ok(Value::Text(s))
                } else {
                    Ok(Value::Column(s))
                }
            }
            _ => Err(DbError::corrupt(&format!("unknown value tag {}", tag))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn round_trip(v: &Value) -> Value {
        let mut reader = Cursor::new(v.encode());
        Value::decode_from(&mut reader).unwrap()
    }

    #[test]
    fn test_round_trip() {
        for v in [
            Value::Int(-7),
            Value::Float(2.5),
            Value::Text("tom".to_string()),
            Value::Column("id".to_string()),
        ] {
            assert_eq!(round_trip(&v), v);
        }
    }

    #[test]
    fn test_encoded_size_matches() {
        for v in [
            Value::Int(1),
            Value::Float(0.0),
            Value::Text("name-500".to_string()),
        ] {
            assert_eq!(v.encode().len(), v.encoded_size());
        }
    }

    #[test]
    fn test_compare_mixed_numerics() {
        assert_eq!(
            Value::Int(1).compare(&Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Float(2.0).compare(&Value::Int(2)),
            Some(Ordering::Equal)
        );
        assert!(Value::Int(1).compare(&Value::Text("x".to_string())).is_none());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut reader = Cursor::new(vec![9u8, 0, 0]);
        assert!(Value::decode_from(&mut reader).is_err());
    }
}
