use std::{
    io::{Cursor, Read},
    path::Path,
    sync::Mutex,
};

use log::{debug, warn};

use crate::{
    error::{DbError, DbResult},
    io::{ByteWriter, DbFile, Decodeable},
    types::PageNum,
};

pub const REDO_FILE_NAME: &str = "redo.log";

const TAG_B_NODE_INSERT_KV: u8 = 0;
const TAG_B_NODE_SPLIT: u8 = 1;
const TAG_RECORD_PAGE_APPEND: u8 = 2;

/// A logical page mutation. Replaying a record against a page whose
/// stored LSN is already at or past the record's LSN is a no-op.
#[derive(Debug, Clone, PartialEq)]
pub enum RedoRecord {
    BNodeInsertKv {
        table_id: u16,
        column_id: u16,
        page_num: PageNum,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    BNodeSplit {
        table_id: u16,
        column_id: u16,
        page_num: PageNum,
        new_page_num: PageNum,
    },
    RecordPageAppend {
        page_num: PageNum,
        row: Vec<u8>,
    },
}

impl RedoRecord {
    pub fn tag(&self) -> u8 {
        match self {
            RedoRecord::BNodeInsertKv { .. } => TAG_B_NODE_INSERT_KV,
            RedoRecord::BNodeSplit { .. } => TAG_B_NODE_SPLIT,
            RedoRecord::RecordPageAppend { .. } => TAG_RECORD_PAGE_APPEND,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        match self {
            RedoRecord::BNodeInsertKv {
                table_id,
                column_id,
                page_num,
                key,
                value,
            } => {
                writer.write(table_id);
                writer.write(column_id);
                writer.write(page_num);
                writer.write(key);
                writer.write(value);
            }
            RedoRecord::BNodeSplit {
                table_id,
                column_id,
                page_num,
                new_page_num,
            } => {
                writer.write(table_id);
                writer.write(column_id);
                writer.write(page_num);
                writer.write(new_page_num);
            }
            RedoRecord::RecordPageAppend { page_num, row } => {
                writer.write(page_num);
                writer.write(row);
            }
        }
        writer.to_bytes()
    }

    fn decode_body<R: Read>(tag: u8, reader: &mut R) -> DbResult<Self> {
        match tag {
            TAG_B_NODE_INSERT_KV => Ok(RedoRecord::BNodeInsertKv {
                table_id: u16::decode_from(reader)?,
                column_id: u16::decode_from(reader)?,
                page_num: u32::decode_from(reader)?,
                key: Vec::<u8>::decode_from(reader)?,
                value: Vec::<u8>::decode_from(reader)?,
            }),
            TAG_B_NODE_SPLIT => Ok(RedoRecord::BNodeSplit {
                table_id: u16::decode_from(reader)?,
                column_id: u16::decode_from(reader)?,
                page_num: u32::decode_from(reader)?,
                new_page_num: u32::decode_from(reader)?,
            }),
            TAG_RECORD_PAGE_APPEND => Ok(RedoRecord::RecordPageAppend {
                page_num: u32::decode_from(reader)?,
                row: Vec::<u8>::decode_from(reader)?,
            }),
            _ => Err(DbError::CorruptRedoRecord(tag)),
        }
    }
}

/// Append-only log of redo records. The LSN of a record is the byte
/// offset where it begins; LSNs are assigned under the log's mutex,
/// so once a record is appended, its LSN is <= every later one.
pub struct RedoLog {
    file: DbFile,
    /// Current end of the file, which is also the next LSN.
    tail: Mutex<u64>,
}

impl RedoLog {
    pub fn create(dir: &Path) -> DbResult<Self> {
        let file = DbFile::create(dir.join(REDO_FILE_NAME))?;
        Ok(Self {
            file,
            tail: Mutex::new(0),
        })
    }

    pub fn open(dir: &Path) -> DbResult<Self> {
        let file = DbFile::open(dir.join(REDO_FILE_NAME))?;
        let tail = file.size()?;
        Ok(Self {
            file,
            tail: Mutex::new(tail),
        })
    }

    pub fn tail(&self) -> u64 {
        *self.tail.lock().unwrap()
    }

    /// Append a batch in one buffered write followed by fsync;
    /// returns the LSN of the last record.
    pub fn append(&self, records: &[RedoRecord]) -> DbResult<u64> {
        debug_assert!(!records.is_empty());
        let mut tail = self.tail.lock().unwrap();

        let mut buf = Vec::new();
        let mut last_lsn = *tail;
        for record in records {
            let lsn = *tail + buf.len() as u64;
            last_lsn = lsn;
            buf.push(record.tag());
            buf.extend_from_slice(&lsn.to_be_bytes());
            buf.extend_from_slice(&record.encode_body());
        }

        self.file.write_at(*tail, &buf)?;
        self.file.sync()?;
        *tail += buf.len() as u64;

        debug!("redo append, records: {}, last lsn: {}", records.len(), last_lsn);
        Ok(last_lsn)
    }

    /// Read every record from `from_lsn` to the end of the log. A
    /// truncated record at the tail (a crash mid-append) ends the
    /// scan; an unknown tag is corruption and fails it.
    pub fn read_from(&self, from_lsn: u64) -> DbResult<Vec<(u64, RedoRecord)>> {
        let end = self.tail();
        if from_lsn >= end {
            return Ok(Vec::new());
        }
        let bytes = self.file.read_at(from_lsn, (end - from_lsn) as usize)?;
        let mut reader = Cursor::new(bytes.as_slice());
        let mut records = Vec::new();

        loop {
            let tag = match u8::decode_from(&mut reader) {
                Ok(tag) => tag,
                Err(_) => break,
            };
            let parsed = u64::decode_from(&mut reader)
                .and_then(|lsn| Ok((lsn, RedoRecord::decode_body(tag, &mut reader)?)));
            match parsed {
                Ok((lsn, record)) => records.push((lsn, record)),
                Err(DbError::CorruptRedoRecord(tag)) => {
                    return Err(DbError::CorruptRedoRecord(tag));
                }
                Err(_) => {
                    warn!("truncated redo record at log tail, stopping replay scan");
                    break;
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> Vec<RedoRecord> {
        vec![
            RedoRecord::BNodeInsertKv {
                table_id: 0,
                column_id: 0,
                page_num: 1,
                key: 7i64.to_be_bytes().to_vec(),
                value: vec![0, 0, 0, 2],
            },
            RedoRecord::BNodeSplit {
                table_id: 0,
                column_id: 0,
                page_num: 1,
                new_page_num: 3,
            },
            RedoRecord::RecordPageAppend {
                page_num: 2,
                row: vec![1, 2, 3, 4],
            },
        ]
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = RedoLog::create(dir.path()).unwrap();

        let records = sample_records();
        let last_lsn = log.append(&records).unwrap();
        assert!(last_lsn < log.tail());

        let read = log.read_from(0).unwrap();
        assert_eq!(read.len(), 3);
        for ((lsn, record), original) in read.iter().zip(records.iter()) {
            assert_eq!(record, original);
            assert!(*lsn <= last_lsn);
        }
        // LSNs are the byte offsets of the records
        assert_eq!(read[0].0, 0);
        assert_eq!(read[2].0, last_lsn);
    }

    #[test]
    fn test_read_from_checkpoint_skips_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = RedoLog::create(dir.path()).unwrap();

        let records = sample_records();
        log.append(&records[..2]).unwrap();
        let checkpoint = log.tail();
        log.append(&records[2..]).unwrap();

        let read = log.read_from(checkpoint).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].1, records[2]);
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let log = RedoLog::create(dir.path()).unwrap();
        log.append(&sample_records()).unwrap();

        // stomp the first tag byte
        log.file.write_at(0, &[0xff]).unwrap();
        match log.read_from(0) {
            Err(DbError::CorruptRedoRecord(0xff)) => {}
            other => panic!("expected corrupt redo record, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_reopen_restores_tail() {
        let dir = tempfile::tempdir().unwrap();
        let tail = {
            let log = RedoLog::create(dir.path()).unwrap();
            log.append(&sample_records()).unwrap();
            log.tail()
        };
        let log = RedoLog::open(dir.path()).unwrap();
        assert_eq!(log.tail(), tail);
        assert_eq!(log.read_from(0).unwrap().len(), 3);
    }
}
