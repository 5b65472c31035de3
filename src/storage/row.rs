use std::io::Read;

use crate::{
    error::{DbError, DbResult},
    io::{ByteWriter, Decodeable, Encodeable},
    storage::value::Value,
    types::{Xid, NIL_XID},
};

/// Number of bytes in front of the column values: size + offset +
/// column count.
pub const ROW_HEADER_SIZE: usize = 2 + 8 + 1;

/// A row as stored on a record page.
///
/// The last two columns of every row are reserved: xmin (the xid that
/// created the row) and xmax (the xid that deleted it, NIL_XID while
/// live). Both are `Value::Int` and therefore fixed width, which is
/// what makes the in-place xmax rewrite safe.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    size: u16,
    offset: u64,
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        let mut row = Self {
            size: 0,
            offset: 0,
            values,
        };
        row.size = row.encoded_size() as u16;
        row
    }

    /// Total encoded bytes, header included.
    pub fn encoded_size(&self) -> usize {
        ROW_HEADER_SIZE + self.values.iter().map(|v| v.encoded_size()).sum::<usize>()
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Absolute byte position of this row in the data file. Set once
    /// at insert time and stable for the row's lifetime.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The user-visible columns, with the trailing MVCC pair stripped.
    pub fn user_values(&self) -> &[Value] {
        &self.values[..self.values.len().saturating_sub(2)]
    }

    fn xid_column(&self, back_index: usize, name: &str) -> DbResult<Xid> {
        let index = self
            .values
            .len()
            .checked_sub(back_index)
            .ok_or_else(|| DbError::corrupt(&format!("row too short for {}", name)))?;
        match self.values.get(index) {
            Some(Value::Int(v)) => Ok(*v as Xid),
            _ => Err(DbError::corrupt(&format!("{} is not an int", name))),
        }
    }

    pub fn xmin(&self) -> DbResult<Xid> {
        self.xid_column(2, "xmin")
    }

    pub fn xmax(&self) -> DbResult<Xid> {
        self.xid_column(1, "xmax")
    }

    pub fn set_xmax(&mut self, xid: Xid) {
        let last = self.values.len() - 1;
        self.values[last] = Value::Int(xid as i64);
    }

    pub fn is_live(&self) -> DbResult<bool> {
        Ok(self.xmax()? == NIL_XID)
    }
}

/// # Format
///
/// - 2 bytes: total encoded size, header included
/// - 8 bytes: absolute file offset of the row
/// - 1 byte: column count
/// - columns in order
impl Encodeable for Row {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.size);
        writer.write(&self.offset);
        writer.write(&(self.values.len() as u8));
        for value in &self.values {
            writer.write_raw(&value.encode());
        }
        writer.to_bytes()
    }
}

impl Decodeable for Row {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let size = u16::decode_from(reader)?;
        let offset = u64::decode_from(reader)?;
        let count = u8::decode_from(reader)?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(Value::decode_from(reader)?);
        }
        Ok(Self {
            size,
            offset,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_row() -> Row {
        Row::new(vec![
            Value::Int(1),
            Value::Text("tom".to_string()),
            Value::Int(3),
            Value::Int(NIL_XID as i64),
        ])
    }

    #[test]
    fn test_round_trip_identity() {
        let mut row = sample_row();
        row.set_offset(8213);

        let bytes = row.encode();
        assert_eq!(bytes.len(), row.size() as usize);

        let mut reader = Cursor::new(bytes);
        let decoded = Row::decode_from(&mut reader).unwrap();
        assert_eq!(decoded, row);
        assert_eq!(decoded.offset(), 8213);
    }

    #[test]
    fn test_mvcc_columns() {
        let mut row = sample_row();
        assert_eq!(row.xmin().unwrap(), 3);
        assert_eq!(row.xmax().unwrap(), NIL_XID);
        assert!(row.is_live().unwrap());

        row.set_xmax(5);
        assert_eq!(row.xmax().unwrap(), 5);
        assert!(!row.is_live().unwrap());
        // xmax is fixed width, so the rewrite never changes the size
        assert_eq!(row.encode().len(), row.size() as usize);
    }

    #[test]
    fn test_user_values_strip_mvcc_pair() {
        let row = sample_row();
        assert_eq!(
            row.user_values(),
            &[Value::Int(1), Value::Text("tom".to_string())]
        );
    }
}
