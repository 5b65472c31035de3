use std::{path::Path, sync::Mutex};

use crate::{
    error::{DbError, DbResult},
    io::DbFile,
};

pub const REC_INFO_FILE_NAME: &str = "recovery_info";

/// The recovery bookkeeping file: the checkpoint LSN redo replay
/// starts from, and whether the last shutdown was clean. Plain text,
/// rewritten wholesale on every change.
pub struct RecoveryInfo {
    file: DbFile,
    state: Mutex<State>,
}

#[derive(Clone, Copy)]
struct State {
    checkpoint: u64,
    clean: bool,
}

impl RecoveryInfo {
    pub fn create(dir: &Path) -> DbResult<Self> {
        let file = DbFile::create(dir.join(REC_INFO_FILE_NAME))?;
        let info = Self {
            file,
            state: Mutex::new(State {
                checkpoint: 0,
                clean: true,
            }),
        };
        info.persist()?;
        Ok(info)
    }

    pub fn open(dir: &Path) -> DbResult<Self> {
        let file = DbFile::open(dir.join(REC_INFO_FILE_NAME))?;
        let text = String::from_utf8(file.read_all()?)
            .map_err(|_| DbError::corrupt("recovery info is not text"))?;
        let mut fields = text.split_whitespace();
        let checkpoint = fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| DbError::corrupt("recovery info missing checkpoint"))?;
        let clean = fields
            .next()
            .and_then(|f| f.parse::<bool>().ok())
            .ok_or_else(|| DbError::corrupt("recovery info missing clean flag"))?;
        Ok(Self {
            file,
            state: Mutex::new(State { checkpoint, clean }),
        })
    }

    fn persist(&self) -> DbResult<()> {
        let state = *self.state.lock().unwrap();
        let text = format!("{} {}\n", state.checkpoint, state.clean);
        self.file.write_at(0, text.as_bytes())?;
        self.file.set_len(text.len() as u64)?;
        self.file.sync()?;
        Ok(())
    }

    pub fn checkpoint(&self) -> u64 {
        self.state.lock().unwrap().checkpoint
    }

    pub fn set_checkpoint(&self, lsn: u64) -> DbResult<()> {
        self.state.lock().unwrap().checkpoint = lsn;
        self.persist()
    }

    pub fn is_clean(&self) -> bool {
        self.state.lock().unwrap().clean
    }

    pub fn set_clean(&self, clean: bool) -> DbResult<()> {
        self.state.lock().unwrap().clean = clean;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let info = RecoveryInfo::create(dir.path()).unwrap();
            assert!(info.is_clean());
            assert_eq!(info.checkpoint(), 0);
            info.set_checkpoint(4096).unwrap();
            info.set_clean(false).unwrap();
        }
        let info = RecoveryInfo::open(dir.path()).unwrap();
        assert_eq!(info.checkpoint(), 4096);
        assert!(!info.is_clean());
    }

    #[test]
    fn test_shrinking_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let info = RecoveryInfo::create(dir.path()).unwrap();
        info.set_checkpoint(1234567890).unwrap();
        info.set_checkpoint(1).unwrap();

        drop(info);
        let info = RecoveryInfo::open(dir.path()).unwrap();
        assert_eq!(info.checkpoint(), 1);
    }
}
