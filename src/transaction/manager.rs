use std::{path::Path, sync::Mutex};

use log::debug;

use crate::{
    error::DbResult,
    io::DbFile,
    types::{Xid, NIL_XID},
};

pub const XID_FILE_NAME: &str = "minidb.xid";

/// The first 4 bytes of the file hold the last assigned xid.
const XID_FILE_HEADER_SIZE: u64 = 4;

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

/// Persistent transaction state: a big-endian xid counter followed by
/// one status byte per xid. Every state change is a single positioned
/// write plus fsync, so the answer to "did xid N commit" survives any
/// crash.
pub struct TransactionManager {
    file: DbFile,
    xid_counter: Mutex<Xid>,
}

/// Status byte of `xid` lives at offset xid + 3.
fn status_offset(xid: Xid) -> u64 {
    XID_FILE_HEADER_SIZE + xid as u64 - 1
}

impl TransactionManager {
    pub fn create(dir: &Path) -> DbResult<Self> {
        let file = DbFile::create(dir.join(XID_FILE_NAME))?;
        file.write_at(0, &0u32.to_be_bytes())?;
        file.sync()?;
        Ok(Self {
            file,
            xid_counter: Mutex::new(0),
        })
    }

    pub fn open(dir: &Path) -> DbResult<Self> {
        let file = DbFile::open(dir.join(XID_FILE_NAME))?;
        let bytes = file.read_at(0, 4)?;
        let counter = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Self {
            file,
            xid_counter: Mutex::new(counter),
        })
    }

    fn write_status(&self, xid: Xid, status: u8) -> DbResult<()> {
        self.file.write_at(status_offset(xid), &[status])?;
        self.file.sync()?;
        Ok(())
    }

    fn read_status(&self, xid: Xid) -> DbResult<u8> {
        let bytes = self.file.read_at(status_offset(xid), 1)?;
        Ok(bytes[0])
    }

    /// Assign the next xid, persist it as active, and bump the
    /// counter.
    pub fn begin(&self) -> DbResult<Xid> {
        let mut counter = self.xid_counter.lock().unwrap();
        let xid = *counter + 1;
        self.write_status(xid, STATUS_ACTIVE)?;
        self.file.write_at(0, &xid.to_be_bytes())?;
        self.file.sync()?;
        *counter = xid;
        debug!("transaction {} began", xid);
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> DbResult<()> {
        debug!("transaction {} committed", xid);
        self.write_status(xid, STATUS_COMMITTED)
    }

    pub fn abort(&self, xid: Xid) -> DbResult<()> {
        debug!("transaction {} aborted", xid);
        self.write_status(xid, STATUS_ABORTED)
    }

    pub fn is_active(&self, xid: Xid) -> DbResult<bool> {
        if xid == 0 || xid == NIL_XID {
            return Ok(false);
        }
        Ok(self.read_status(xid)? == STATUS_ACTIVE)
    }

    pub fn is_committed(&self, xid: Xid) -> DbResult<bool> {
        if xid == 0 || xid == NIL_XID {
            return Ok(false);
        }
        Ok(self.read_status(xid)? == STATUS_COMMITTED)
    }

    pub fn is_aborted(&self, xid: Xid) -> DbResult<bool> {
        if xid == 0 || xid == NIL_XID {
            return Ok(false);
        }
        Ok(self.read_status(xid)? == STATUS_ABORTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xids_are_sequential_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TransactionManager::create(dir.path()).unwrap();
        assert_eq!(tm.begin().unwrap(), 1);
        assert_eq!(tm.begin().unwrap(), 2);
        assert_eq!(tm.begin().unwrap(), 3);
    }

    #[test]
    fn test_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TransactionManager::create(dir.path()).unwrap();

        let a = tm.begin().unwrap();
        let b = tm.begin().unwrap();
        assert!(tm.is_active(a).unwrap());

        tm.commit(a).unwrap();
        tm.abort(b).unwrap();
        assert!(tm.is_committed(a).unwrap());
        assert!(!tm.is_active(a).unwrap());
        assert!(tm.is_aborted(b).unwrap());
        assert!(!tm.is_committed(b).unwrap());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let tm = TransactionManager::create(dir.path()).unwrap();
            let a = tm.begin().unwrap();
            let b = tm.begin().unwrap();
            tm.commit(a).unwrap();
            (a, b)
        };

        let tm = TransactionManager::open(dir.path()).unwrap();
        assert!(tm.is_committed(a).unwrap());
        assert!(tm.is_active(b).unwrap());
        // the counter picked up where it left off
        assert_eq!(tm.begin().unwrap(), 3);
    }

    #[test]
    fn test_reserved_xids_have_no_status() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TransactionManager::create(dir.path()).unwrap();
        assert!(!tm.is_committed(0).unwrap());
        assert!(!tm.is_committed(NIL_XID).unwrap());
        assert!(!tm.is_active(NIL_XID).unwrap());
    }
}
