//! Crash recovery: the double-write scratch heals torn pages, then
//! redo replay rolls the data file forward from the last checkpoint.

pub mod double_write;
pub mod rec_info;
pub mod redo;

use std::{io::Cursor, sync::Arc, thread};

use log::{error, info, warn};

use double_write::DoubleWrite;
use rec_info::RecoveryInfo;
use redo::{RedoLog, RedoRecord};

use crate::{
    btree::node::value_to_page_num,
    config::Options,
    error::{DbError, DbResult},
    io::{DbFile, Decodeable},
    storage::{
        page::{Page, PageData, PayloadKind, PAGE_SIZE},
        row::Row,
    },
    types::{PageNum, NIL_PAGE_NUM},
};

const DATA_FILE_NAME: &str = "data.db";

/// Owns the redo log, the double-write buffer and the recovery info
/// file, plus a private handle to the data file for healing and
/// replay. The pager borrows this as its eviction sink.
pub struct Recovery {
    redo: RedoLog,
    dwrite: DoubleWrite,
    info: RecoveryInfo,
    data_file: DbFile,
}

impl Recovery {
    /// Set up the recovery files next to a freshly created data file.
    pub fn create(opts: &Options) -> DbResult<Arc<Self>> {
        let dir = &opts.path;
        let recovery = Self {
            redo: RedoLog::create(dir)?,
            dwrite: DoubleWrite::create(dir, opts.double_write_pool_pages)?,
            info: RecoveryInfo::create(dir)?,
            data_file: DbFile::open(dir.join(DATA_FILE_NAME))?,
        };
        // dirty until a clean close
        recovery.info.set_clean(false)?;
        Ok(Arc::new(recovery))
    }

    /// Open the recovery files and, when the last shutdown was not
    /// clean, run the two-phase recovery before anyone reads a page.
    pub fn open(opts: &Options) -> DbResult<Arc<Self>> {
        let dir = &opts.path;
        let recovery = Self {
            redo: RedoLog::open(dir)?,
            dwrite: DoubleWrite::open(dir, opts.double_write_pool_pages)?,
            info: RecoveryInfo::open(dir)?,
            data_file: DbFile::open(dir.join(DATA_FILE_NAME))?,
        };
        if recovery.info.is_clean() {
            info!("clean shutdown on record, skipping recovery");
        } else {
            warn!("database exited abnormally, recovering");
            recovery.recover()?;
        }
        recovery.info.set_clean(false)?;
        Ok(Arc::new(recovery))
    }

    /// Eviction entry point: absorb a dirty page image and, once the
    /// scratch pool fills up, flush it on a background thread.
    pub fn write(self: Arc<Self>, image: Vec<u8>) {
        if self.dwrite.write(image) {
            thread::spawn(move || {
                if let Err(e) = self.flush() {
                    error!("background double-write flush failed: {}", e);
                }
            });
        }
    }

    /// Freshest image of a page still sitting in the double-write
    /// pool, for cache misses that race an eviction. Taking it makes
    /// the caller responsible for flushing the page again.
    pub fn take_buffered_page(&self, page_num: PageNum) -> Option<Vec<u8>> {
        self.dwrite.take_buffered(page_num)
    }

    pub fn append_redo(&self, record: RedoRecord) -> DbResult<u64> {
        self.redo.append(&[record])
    }

    pub fn append_redo_batch(&self, records: &[RedoRecord]) -> DbResult<u64> {
        self.redo.append(records)
    }

    pub fn redo_tail(&self) -> u64 {
        self.redo.tail()
    }

    pub fn checkpoint(&self) -> u64 {
        self.info.checkpoint()
    }

    /// Drain the double-write pool and advance the checkpoint to the
    /// highest LSN that made it home.
    pub fn flush(&self) -> DbResult<()> {
        let max_lsn = self.dwrite.flush_to_disk(&self.data_file)?;
        if max_lsn > self.info.checkpoint() {
            self.info.set_checkpoint(max_lsn)?;
        }
        Ok(())
    }

    /// Clean shutdown: everything the pager flushed is already home,
    /// so the whole log is covered and the clean flag can be set.
    pub fn close(&self) -> DbResult<()> {
        self.flush()?;
        self.info.set_checkpoint(self.redo.tail())?;
        self.info.set_clean(true)?;
        Ok(())
    }

    fn recover(&self) -> DbResult<()> {
        info!("recover begin");

        // phase 1: heal torn home pages from the scratch
        self.dwrite.recover(&self.data_file)?;

        // phase 2: replay the log from the checkpoint
        let checkpoint = self.info.checkpoint();
        let records = self.redo.read_from(checkpoint)?;
        info!(
            "replaying {} redo records from lsn {}",
            records.len(),
            checkpoint
        );
        for (lsn, record) in &records {
            self.apply(*lsn, record)?;
        }
        self.data_file.sync()?;

        self.info.set_checkpoint(self.redo.tail())?;
        info!("recover end");
        Ok(())
    }

    fn read_page(&self, page_num: PageNum, kind: PayloadKind) -> DbResult<Page> {
        let bytes = self
            .data_file
            .read_at(page_num as u64 * PAGE_SIZE as u64, PAGE_SIZE)?;
        Page::decode(&bytes, kind)
    }

    /// During replay an unreadable target page means both its home
    /// copy and any scratch copy are gone: fatal.
    fn replay_page(&self, page_num: PageNum, kind: PayloadKind) -> DbResult<Page> {
        self.read_page(page_num, kind)
            .map_err(|_| DbError::TornWriteUnrecoverable(page_num))
    }

    fn write_page(&self, page: &Page) -> DbResult<()> {
        self.data_file.write_at(page.file_offset(), &page.encode()?)
    }

    /// Re-execute one record. Idempotency comes from the LSN stored
    /// in the target page: anything at or past the record's LSN has
    /// the mutation already.
    fn apply(&self, lsn: u64, record: &RedoRecord) -> DbResult<()> {
        match record {
            RedoRecord::BNodeInsertKv {
                page_num,
                key,
                value,
                ..
            } => {
                let mut page = self.replay_page(*page_num, PayloadKind::Node)?;
                if page.lsn() >= lsn {
                    return Ok(());
                }
                let is_inner = {
                    let node = page.data_mut().as_node_mut()?;
                    node.insert_entry(key, value);
                    !node.is_leaf
                };
                if is_inner {
                    // keep the inserted child's parent backref sane
                    let child_num = value_to_page_num(value);
                    if let Ok(mut child) = self.read_page(child_num, PayloadKind::Node) {
                        child.data_mut().as_node_mut()?.parent = *page_num;
                        self.write_page(&child)?;
                    }
                }
                page.set_lsn(lsn);
                self.write_page(&page)
            }

            RedoRecord::BNodeSplit {
                page_num,
                new_page_num,
                ..
            } => self.apply_split(lsn, *page_num, *new_page_num),

            RedoRecord::RecordPageAppend { page_num, row } => {
                let mut page = self.replay_page(*page_num, PayloadKind::Record)?;
                if page.lsn() >= lsn {
                    return Ok(());
                }
                let decoded = Row::decode_from(&mut Cursor::new(row.as_slice()))?;
                page.data_mut().as_record_mut()?.append(decoded);
                page.set_lsn(lsn);
                self.write_page(&page)
            }
        }
    }

    fn apply_split(&self, lsn: u64, page_num: PageNum, new_page_num: PageNum) -> DbResult<()> {
        let mut source = self.replay_page(page_num, PayloadKind::Node)?;
        if source.lsn() >= lsn {
            return Ok(());
        }

        let (sibling, old_next, moved_children) = {
            let node = source.data_mut().as_node_mut()?;
            if node.is_leaf {
                let mut sibling = node.split_leaf();
                let old_next = node.next_leaf;
                sibling.prev_leaf = page_num;
                sibling.next_leaf = old_next;
                node.next_leaf = new_page_num;
                (sibling, old_next, Vec::new())
            } else {
                let (_promoted, sibling) = node.split_inner();
                let moved = sibling.children();
                (sibling, NIL_PAGE_NUM, moved)
            }
        };

        source.set_lsn(lsn);
        self.write_page(&source)?;

        let mut sibling_page = Page::new(new_page_num, PageData::Node(sibling));
        sibling_page.set_lsn(lsn);
        self.write_page(&sibling_page)?;

        if old_next != NIL_PAGE_NUM {
            let mut next = self.replay_page(old_next, PayloadKind::Node)?;
            next.data_mut().as_node_mut()?.prev_leaf = new_page_num;
            self.write_page(&next)?;
        }
        for child_num in moved_children {
            let mut child = self.replay_page(child_num, PayloadKind::Node)?;
            child.data_mut().as_node_mut()?.parent = new_page_num;
            self.write_page(&child)?;
        }
        Ok(())
    }
}
