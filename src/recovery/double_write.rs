use std::{collections::HashMap, path::Path, sync::Mutex};

use log::{debug, info};

use crate::{
    error::DbResult,
    io::DbFile,
    storage::page::{PAGE_CHECKSUM_SIZE, PAGE_SIZE},
    types::PageNum,
};

pub const DOUBLE_WRITE_FILE_NAME: &str = "double_write.buf";

/// Fraction of the pool that triggers a flush, as a percentage.
const FLUSH_THRESHOLD_PERCENT: usize = 75;

/// XOR checksum over the page image, one lane per quarter.
pub fn checksum(bytes: &[u8]) -> [u8; 4] {
    let k = bytes.len() / 4;
    let mut sum = [0u8; 4];
    for lane in 0..4 {
        let start = lane * k;
        let end = if lane == 3 { bytes.len() } else { start + k };
        for b in &bytes[start..end] {
            sum[lane] ^= b;
        }
    }
    sum
}

/// A slot is intact when the checksum stamped into its trailing word
/// matches the image in front of it.
pub fn slot_intact(slot: &[u8]) -> bool {
    let body = &slot[..PAGE_SIZE - PAGE_CHECKSUM_SIZE];
    checksum(body) == slot[PAGE_SIZE - PAGE_CHECKSUM_SIZE..]
}

fn slot_lsn(slot: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&slot[4..12]);
    u64::from_be_bytes(bytes)
}

fn slot_page_num(slot: &[u8]) -> PageNum {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&slot[..4]);
    PageNum::from_be_bytes(bytes)
}

/// Fixed-size scratch region that absorbs dirty pages before they
/// reach their home offsets. Pages are written to the scratch and
/// fsynced first, then to their homes; a restart can therefore always
/// find one intact copy of every page that was in flight.
pub struct DoubleWrite {
    pool_pages: usize,
    file: DbFile,
    /// Checksummed images of evicted dirty pages, not yet home.
    pages: Mutex<HashMap<PageNum, Vec<u8>>>,
    /// Serializes the scratch-then-home write sequence.
    disk_lock: Mutex<()>,
}

impl DoubleWrite {
    pub fn create(dir: &Path, pool_pages: usize) -> DbResult<Self> {
        let file = DbFile::create(dir.join(DOUBLE_WRITE_FILE_NAME))?;
        file.write_at(0, &vec![0u8; pool_pages * PAGE_SIZE])?;
        file.sync()?;
        Ok(Self {
            pool_pages,
            file,
            pages: Mutex::new(HashMap::new()),
            disk_lock: Mutex::new(()),
        })
    }

    pub fn open(dir: &Path, pool_pages: usize) -> DbResult<Self> {
        let file = DbFile::open(dir.join(DOUBLE_WRITE_FILE_NAME))?;
        Ok(Self {
            pool_pages,
            file,
            pages: Mutex::new(HashMap::new()),
            disk_lock: Mutex::new(()),
        })
    }

    /// Accept a page image. Returns true once the pool is full enough
    /// that the caller should schedule a flush.
    pub fn write(&self, mut image: Vec<u8>) -> bool {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        let sum = checksum(&image[..PAGE_SIZE - PAGE_CHECKSUM_SIZE]);
        image[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].copy_from_slice(&sum);

        let mut pages = self.pages.lock().unwrap();
        pages.insert(slot_page_num(&image), image);
        pages.len() * 100 >= self.pool_pages * FLUSH_THRESHOLD_PERCENT
    }

    /// Freshest image of a page that is still waiting to go home, for
    /// cache misses that race an in-flight eviction. The entry is
    /// removed: the caller's cached copy becomes the authoritative
    /// one, and a later pool flush must not overwrite it with this
    /// older image.
    pub fn take_buffered(&self, page_num: PageNum) -> Option<Vec<u8>> {
        if let Some(image) = self.pages.lock().unwrap().remove(&page_num) {
            return Some(image);
        }
        // not buffered; make sure no flush is mid-way through its
        // home writes before the caller reads the home offset
        drop(self.disk_lock.lock().unwrap());
        None
    }

    /// Seal the scratch, write every image home, zero the scratch.
    /// Returns the highest LSN among the flushed pages, 0 when there
    /// was nothing to flush.
    pub fn flush_to_disk(&self, data_file: &DbFile) -> DbResult<u64> {
        let pages = {
            let mut pages = self.pages.lock().unwrap();
            std::mem::take(&mut *pages)
        };
        if pages.is_empty() {
            return Ok(0);
        }

        let _disk = self.disk_lock.lock().unwrap();

        // step 1: scratch first, fsynced, so a torn home write below
        // stays repairable
        let mut offset = 0u64;
        for image in pages.values() {
            self.file.write_at(offset, image)?;
            offset += PAGE_SIZE as u64;
        }
        self.file.sync()?;

        // step 2: home writes
        let mut max_lsn = 0u64;
        for (page_num, image) in &pages {
            let mut home = image.clone();
            home[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].fill(0);
            data_file.write_at(*page_num as u64 * PAGE_SIZE as u64, &home)?;
            max_lsn = max_lsn.max(slot_lsn(image));
        }
        data_file.sync()?;

        // step 3: retire the scratch
        self.file.write_at(0, &vec![0u8; self.pool_pages * PAGE_SIZE])?;
        self.file.sync()?;

        debug!("double write flushed {} pages, max lsn {}", pages.len(), max_lsn);
        Ok(max_lsn)
    }

    /// Roll intact scratch slots forward to their home offsets. Run
    /// before redo replay: it heals any page whose home write was cut
    /// short. A slot with a zeroed header means the rest of the
    /// scratch was never written; a checksum mismatch means the crash
    /// hit the scratch write itself, in which case the home copy is
    /// still the good one.
    pub fn recover(&self, data_file: &DbFile) -> DbResult<usize> {
        let mut healed = 0;
        for slot_index in 0..self.pool_pages {
            let slot = self
                .file
                .read_at(slot_index as u64 * PAGE_SIZE as u64, PAGE_SIZE)?;
            if slot[..12].iter().all(|&b| b == 0) {
                break;
            }
            if !slot_intact(&slot) {
                break;
            }
            let page_num = slot_page_num(&slot);
            let mut home = slot.clone();
            home[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].fill(0);
            data_file.write_at(page_num as u64 * PAGE_SIZE as u64, &home)?;
            healed += 1;
        }
        if healed > 0 {
            data_file.sync()?;
            info!("double write healed {} pages", healed);
        }
        Ok(healed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(page_num: PageNum, lsn: u64, fill: u8) -> Vec<u8> {
        let mut image = vec![fill; PAGE_SIZE];
        image[..4].copy_from_slice(&page_num.to_be_bytes());
        image[4..12].copy_from_slice(&lsn.to_be_bytes());
        image[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].fill(0);
        image
    }

    #[test]
    fn test_checksum_lanes() {
        let mut bytes = vec![0u8; 16];
        bytes[0] = 0x0f; // lane 0
        bytes[5] = 0xf0; // lane 1
        bytes[15] = 0x55; // lane 3
        assert_eq!(checksum(&bytes), [0x0f, 0xf0, 0, 0x55]);
    }

    #[test]
    fn test_torn_slot_detected() {
        let mut slot = image(1, 10, 0xab);
        let sum = checksum(&slot[..PAGE_SIZE - PAGE_CHECKSUM_SIZE]);
        slot[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].copy_from_slice(&sum);
        assert!(slot_intact(&slot));

        slot[100] ^= 0xff;
        assert!(!slot_intact(&slot));
    }

    #[test]
    fn test_flush_writes_home_and_advances_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = DbFile::create(dir.path().join("data.db")).unwrap();
        data_file.write_at(0, &vec![0u8; PAGE_SIZE * 3]).unwrap();

        let dw = DoubleWrite::create(dir.path(), 8).unwrap();
        dw.write(image(1, 11, 0x11));
        dw.write(image(2, 22, 0x22));

        let max_lsn = dw.flush_to_disk(&data_file).unwrap();
        assert_eq!(max_lsn, 22);

        let home = data_file.read_at(PAGE_SIZE as u64, PAGE_SIZE).unwrap();
        assert_eq!(home[20], 0x11);
        // home copies do not carry the checksum
        assert!(home[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].iter().all(|&b| b == 0));

        // scratch zeroed afterwards, so a second flush is a no-op
        assert_eq!(dw.flush_to_disk(&data_file).unwrap(), 0);
        assert_eq!(dw.recover(&data_file).unwrap(), 0);
    }

    #[test]
    fn test_recover_heals_torn_home_page() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = DbFile::create(dir.path().join("data.db")).unwrap();
        data_file.write_at(0, &vec![0u8; PAGE_SIZE * 2]).unwrap();

        let dw = DoubleWrite::create(dir.path(), 8).unwrap();

        // a sealed scratch slot whose home write never happened
        let mut slot = image(1, 5, 0x77);
        let sum = checksum(&slot[..PAGE_SIZE - PAGE_CHECKSUM_SIZE]);
        slot[PAGE_SIZE - PAGE_CHECKSUM_SIZE..].copy_from_slice(&sum);
        dw.file.write_at(0, &slot).unwrap();

        assert_eq!(dw.recover(&data_file).unwrap(), 1);
        let home = data_file.read_at(PAGE_SIZE as u64, PAGE_SIZE).unwrap();
        assert_eq!(home[50], 0x77);
    }

    #[test]
    fn test_recover_discards_torn_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = DbFile::create(dir.path().join("data.db")).unwrap();
        data_file.write_at(0, &vec![0xaau8; PAGE_SIZE * 2]).unwrap();

        let dw = DoubleWrite::create(dir.path(), 8).unwrap();

        // nonzero header but bogus checksum: the scratch write itself
        // was torn, home must stay untouched
        let slot = image(1, 5, 0x77);
        dw.file.write_at(0, &slot).unwrap();

        assert_eq!(dw.recover(&data_file).unwrap(), 0);
        let home = data_file.read_at(PAGE_SIZE as u64, PAGE_SIZE).unwrap();
        assert!(home.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_flush_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let dw = DoubleWrite::create(dir.path(), 4).unwrap();
        assert!(!dw.write(image(1, 1, 0)));
        assert!(!dw.write(image(2, 1, 0)));
        // 3 of 4 slots used crosses 75%
        assert!(dw.write(image(3, 1, 0)));
    }
}
