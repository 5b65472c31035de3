use std::io::{Cursor, Read};

use crate::{
    btree::node::BTreeNode,
    error::{DbError, DbResult},
    io::{ByteWriter, Decodeable, Encodeable},
    storage::{meta::MetaData, row::Row},
    types::{PageNum, NIL_PAGE_NUM},
};

/// Fixed unit of file I/O and cache residency.
pub const PAGE_SIZE: usize = 8192;

/// page_num (4) + lsn (8) + prev (4) + next (4)
pub const PAGE_HEADER_SIZE: usize = 20;

/// The trailing word of every page image is reserved for the XOR
/// checksum the double-write buffer stamps on its copy. Home pages
/// leave it zero.
pub const PAGE_CHECKSUM_SIZE: usize = 4;

/// Payload bytes available to the page's owner.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - PAGE_CHECKSUM_SIZE;

/// What the caller expects a page's payload to be. The on-disk
/// representation is homogeneous, so the reader has to say what it is
/// looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Meta,
    Record,
    Node,
}

pub enum PageData {
    Meta(MetaData),
    Record(RecordData),
    Node(BTreeNode),
}

impl PageData {
    pub fn kind(&self) -> PayloadKind {
        match self {
            PageData::Meta(_) => PayloadKind::Meta,
            PageData::Record(_) => PayloadKind::Record,
            PageData::Node(_) => PayloadKind::Node,
        }
    }

    pub fn as_meta(&self) -> DbResult<&MetaData> {
        match self {
            PageData::Meta(meta) => Ok(meta),
            _ => Err(DbError::corrupt("page payload is not meta data")),
        }
    }

    pub fn as_meta_mut(&mut self) -> DbResult<&mut MetaData> {
        match self {
            PageData::Meta(meta) => Ok(meta),
            _ => Err(DbError::corrupt("page payload is not meta data")),
        }
    }

    pub fn as_record(&self) -> DbResult<&RecordData> {
        match self {
            PageData::Record(record) => Ok(record),
            _ => Err(DbError::corrupt("page payload is not record data")),
        }
    }

    pub fn as_record_mut(&mut self) -> DbResult<&mut RecordData> {
        match self {
            PageData::Record(record) => Ok(record),
            _ => Err(DbError::corrupt("page payload is not record data")),
        }
    }

    pub fn as_node(&self) -> DbResult<&BTreeNode> {
        match self {
            PageData::Node(node) => Ok(node),
            _ => Err(DbError::corrupt("page payload is not a b+tree node")),
        }
    }

    pub fn as_node_mut(&mut self) -> DbResult<&mut BTreeNode> {
        match self {
            PageData::Node(node) => Ok(node),
            _ => Err(DbError::corrupt("page payload is not a b+tree node")),
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            PageData::Meta(meta) => meta.encode(),
            PageData::Record(record) => record.encode(),
            PageData::Node(node) => node.encode(),
        }
    }

    fn decode_from<R: Read>(reader: &mut R, kind: PayloadKind) -> DbResult<Self> {
        match kind {
            PayloadKind::Meta => Ok(PageData::Meta(MetaData::decode_from(reader)?)),
            PayloadKind::Record => Ok(PageData::Record(RecordData::decode_from(reader)?)),
            PayloadKind::Node => Ok(PageData::Node(BTreeNode::decode_from(reader)?)),
        }
    }
}

/// A record page's payload: a count-prefixed list of encoded rows.
/// Rows never move within a page; updates create a new version
/// elsewhere.
pub struct RecordData {
    /// Payload bytes used so far, this 3-byte header included.
    size: u16,
    rows: Vec<Row>,
}

impl RecordData {
    /// size (2) + row count (1)
    pub const HEADER_SIZE: usize = 3;

    /// The largest row a record page can take.
    pub const MAX_ROW_SIZE: usize = PAGE_PAYLOAD_SIZE - Self::HEADER_SIZE;

    pub fn new() -> Self {
        Self {
            size: Self::HEADER_SIZE as u16,
            rows: Vec::new(),
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn free_space(&self) -> usize {
        PAGE_PAYLOAD_SIZE - self.size as usize
    }

    /// Room for one more row of `bytes`: enough free payload, and a
    /// row count that still fits its one-byte field.
    pub fn has_room(&self, bytes: usize) -> bool {
        self.free_space() >= bytes && self.rows.len() < u8::MAX as usize
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Row] {
        &mut self.rows
    }

    /// Byte position the next appended row will occupy, relative to
    /// the start of the page.
    pub fn next_row_offset(&self) -> usize {
        PAGE_HEADER_SIZE + self.size as usize
    }

    pub fn append(&mut self, row: Row) {
        self.size += row.size();
        self.rows.push(row);
    }
}

/// # Format
///
/// - 2 bytes: used payload size (3 for an empty page)
/// - 1 byte: row count
/// - rows, each self-describing
impl Encodeable for RecordData {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.size);
        writer.write(&(self.rows.len() as u8));
        for row in &self.rows {
            writer.write_raw(&row.encode());
        }
        writer.to_bytes()
    }
}

impl Decodeable for RecordData {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let size = u16::decode_from(reader)?;
        let count = u8::decode_from(reader)?;
        let mut rows = Vec::with_capacity(count as usize);
        for _ in 0..count {
            rows.push(Row::decode_from(reader)?);
        }
        Ok(Self { size, rows })
    }
}

/// An in-memory page. The pager owns every instance; other components
/// borrow them for the duration of a latched operation.
pub struct Page {
    page_num: PageNum,
    lsn: u64,
    prev: PageNum,
    next: PageNum,
    dirty: bool,
    data: PageData,
}

impl Page {
    pub fn new(page_num: PageNum, data: PageData) -> Self {
        Self {
            page_num,
            lsn: 0,
            prev: NIL_PAGE_NUM,
            next: NIL_PAGE_NUM,
            dirty: true,
            data,
        }
    }

    pub fn page_num(&self) -> PageNum {
        self.page_num
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = lsn;
    }

    pub fn prev(&self) -> PageNum {
        self.prev
    }

    pub fn next(&self) -> PageNum {
        self.next
    }

    pub fn set_prev(&mut self, prev: PageNum) {
        self.prev = prev;
    }

    pub fn set_next(&mut self, next: PageNum) {
        self.next = next;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn data(&self) -> &PageData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut PageData {
        &mut self.data
    }

    /// Home byte offset in the data file.
    pub fn file_offset(&self) -> u64 {
        self.page_num as u64 * PAGE_SIZE as u64
    }

    /// Canonical PAGE_SIZE image: header, payload, zero padding. The
    /// checksum word stays zero; only the double-write buffer fills it.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let payload = self.data.encode();
        if payload.len() > PAGE_PAYLOAD_SIZE {
            return Err(DbError::PagerExhausted(format!(
                "page {} payload of {} bytes exceeds {} bytes",
                self.page_num,
                payload.len(),
                PAGE_PAYLOAD_SIZE
            )));
        }
        let mut writer = ByteWriter::new();
        writer.write(&self.page_num);
        writer.write(&self.lsn);
        writer.write(&self.prev);
        writer.write(&self.next);
        writer.write_raw(&payload);
        writer.to_padded_bytes(PAGE_SIZE)
    }

    pub fn decode(bytes: &[u8], kind: PayloadKind) -> DbResult<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(DbError::corrupt("page image has wrong length"));
        }
        let mut reader = Cursor::new(bytes);
        let page_num = u32::decode_from(&mut reader)?;
        let lsn = u64::decode_from(&mut reader)?;
        let prev = u32::decode_from(&mut reader)?;
        let next = u32::decode_from(&mut reader)?;
        let data = PageData::decode_from(&mut reader, kind)?;
        Ok(Self {
            page_num,
            lsn,
            prev,
            next,
            dirty: false,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::Value;
    use crate::types::NIL_XID;

    #[test]
    fn test_empty_record_page_size_is_three() {
        let record = RecordData::new();
        assert_eq!(record.size(), 3);
        assert_eq!(record.encode().len(), 3);
    }

    #[test]
    fn test_page_round_trip() {
        let mut record = RecordData::new();
        let mut row = Row::new(vec![
            Value::Int(42),
            Value::Text("bob".to_string()),
            Value::Int(1),
            Value::Int(NIL_XID as i64),
        ]);
        row.set_offset(PAGE_HEADER_SIZE as u64 + 3);
        record.append(row);

        let mut page = Page::new(7, PageData::Record(record));
        page.set_lsn(99);
        page.set_next(8);

        let image = page.encode().unwrap();
        assert_eq!(image.len(), PAGE_SIZE);

        let decoded = Page::decode(&image, PayloadKind::Record).unwrap();
        assert_eq!(decoded.page_num(), 7);
        assert_eq!(decoded.lsn(), 99);
        assert_eq!(decoded.next(), 8);
        assert_eq!(decoded.prev(), NIL_PAGE_NUM);
        assert!(!decoded.is_dirty());

        let record = decoded.data().as_record().unwrap();
        assert_eq!(record.row_count(), 1);
        assert_eq!(record.rows()[0].values()[0], Value::Int(42));
    }

    #[test]
    fn test_record_size_tracks_appends() {
        let mut record = RecordData::new();
        let row = Row::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let row_size = row.size();
        record.append(row);
        assert_eq!(record.size(), 3 + row_size);
        assert_eq!(
            record.free_space(),
            PAGE_PAYLOAD_SIZE - 3 - row_size as usize
        );
    }
}
