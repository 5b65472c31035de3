use std::io;

use crate::types::{PageNum, Xid};

/// Every failure the engine surfaces through its public operations.
///
/// Parser and validation errors never show up here: the executor
/// pre-checks statements before handing them to the core.
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("data file version is {found:?}, expected {expected:?}")]
    VersionMismatch { expected: String, found: String },

    #[error("table {0:?} not found")]
    TableNotFound(String),

    #[error("table {0:?} already exists")]
    TableAlreadyExists(String),

    #[error("column {0:?} not found")]
    ColumnNotFound(String),

    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("transaction {0} is not active")]
    XidNotActive(Xid),

    #[error("pager exhausted: {0}")]
    PagerExhausted(String),

    #[error("corrupt redo record: unknown tag {0}")]
    CorruptRedoRecord(u8),

    #[error("torn write on page {0} is not recoverable")]
    TornWriteUnrecoverable(PageNum),
}

impl DbError {
    /// Decode failures are surfaced as I/O errors: the bytes came off
    /// the disk, and the caller treats them the same way.
    pub fn corrupt(msg: &str) -> Self {
        DbError::Io(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
    }
}

pub type DbResult<T> = Result<T, DbError>;
