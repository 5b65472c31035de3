use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error};
use once_cell::sync::OnceCell;

use crate::{
    cache::{Cache, LruCache, WTinyLfu},
    config::{CacheKind, Options},
    error::{DbError, DbResult},
    io::DbFile,
    recovery::Recovery,
    storage::{
        meta::{MetaData, META_PAGE_NUM, VERSION},
        page::{Page, PageData, PayloadKind, RecordData, PAGE_SIZE},
    },
    types::{PageNum, Pod},
    utils::HandyRwLock,
};

pub const DATA_FILE_NAME: &str = "data.db";

type PageCache = Box<dyn Cache<Pod<Page>>>;

/// Owns the data file and every in-memory page. Pages are allocated
/// by appending to the file, so page number times PAGE_SIZE is always
/// the home offset, and the file size always equals
/// (max page num + 1) * PAGE_SIZE.
pub struct Pager {
    file: DbFile,
    cache: Mutex<PageCache>,
    /// Evicted pages waiting to be routed through the double-write
    /// buffer. Filled by the cache callback, drained outside the
    /// cache mutex.
    pending_evictions: Arc<Mutex<Vec<(PageNum, Pod<Page>)>>>,
    /// Page 0 is pinned for the engine's lifetime; every catalog
    /// access goes through it.
    meta_page: OnceCell<Pod<Page>>,
    next_page_num: Mutex<PageNum>,
    /// Serializes record-page tail selection and chain splicing.
    chain_lock: Mutex<()>,
    recovery: OnceCell<Arc<Recovery>>,
}

fn new_cache(opts: &Options) -> PageCache {
    match opts.cache_kind {
        CacheKind::Lru => Box::new(LruCache::new(opts.page_cache_capacity)),
        CacheKind::TinyLfu => Box::new(WTinyLfu::new(opts.page_cache_capacity)),
    }
}

impl Pager {
    fn with_file(file: DbFile, opts: &Options, next_page_num: PageNum) -> Self {
        let pending: Arc<Mutex<Vec<(PageNum, Pod<Page>)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut cache = new_cache(opts);
        let sink = Arc::clone(&pending);
        cache.set_eviction(Box::new(move |page_num, pod| {
            sink.lock().unwrap().push((page_num, pod));
        }));

        Self {
            file,
            cache: Mutex::new(cache),
            pending_evictions: pending,
            meta_page: OnceCell::new(),
            next_page_num: Mutex::new(next_page_num),
            chain_lock: Mutex::new(()),
            recovery: OnceCell::new(),
        }
    }

    /// Initialize a fresh data file; page 0 becomes the meta page.
    pub fn create(opts: &Options) -> DbResult<Self> {
        std::fs::create_dir_all(&opts.path)?;
        let file = DbFile::create(opts.path.join(DATA_FILE_NAME))?;
        let pager = Self::with_file(file, opts, 0);
        pager.new_page(PageData::Meta(MetaData::new()))?;
        Ok(pager)
    }

    /// Open an existing data file and verify the meta page's version
    /// string. Recovery must have already run against the file.
    pub fn open(opts: &Options) -> DbResult<Self> {
        let file = DbFile::open(opts.path.join(DATA_FILE_NAME))?;
        let size = file.size()?;
        let page_count = (size / PAGE_SIZE as u64) as PageNum;
        let pager = Self::with_file(file, opts, page_count);

        let bytes = pager.file.read_at(0, PAGE_SIZE)?;
        let page = Page::decode(&bytes, PayloadKind::Meta)?;
        let found = page.data().as_meta()?.version().to_string();
        if found != VERSION {
            return Err(DbError::VersionMismatch {
                expected: VERSION.to_string(),
                found,
            });
        }
        pager
            .meta_page
            .set(Arc::new(RwLock::new(page)))
            .ok()
            .expect("meta page set twice");
        Ok(pager)
    }

    /// Wire the eviction sink. Called once, right after the recovery
    /// coordinator comes up.
    pub fn set_recovery(&self, recovery: Arc<Recovery>) {
        self.recovery.set(recovery).ok().expect("recovery set twice");
    }

    /// The pinned meta page.
    pub fn meta(&self) -> Pod<Page> {
        Arc::clone(self.meta_page.get().expect("meta page not loaded"))
    }

    /// Append a new page to the data file and cache it. The initial
    /// image is flushed immediately, which is what lets redo replay
    /// decode any page a record ever referenced.
    pub fn new_page(&self, data: PageData) -> DbResult<Pod<Page>> {
        let (page_num, pod) = {
            let mut next = self.next_page_num.lock().unwrap();
            let page_num = *next;
            let page = Page::new(page_num, data);
            let image = page.encode()?;
            self.file.write_at(page_num as u64 * PAGE_SIZE as u64, &image)?;
            *next += 1;
            (page_num, Arc::new(RwLock::new(page)))
        };
        debug!("allocated page {}", page_num);

        if page_num == META_PAGE_NUM {
            self.meta_page
                .set(Arc::clone(&pod))
                .ok()
                .expect("meta page set twice");
            return Ok(pod);
        }

        let pod = self.cache_insert(page_num, pod);
        self.process_pending_evictions();
        Ok(pod)
    }

    /// Cache lookup; on a miss, read exactly PAGE_SIZE bytes at the
    /// home offset and decode them as whatever the caller expects.
    pub fn get_page(&self, page_num: PageNum, kind: PayloadKind) -> DbResult<Pod<Page>> {
        if page_num == META_PAGE_NUM {
            return Ok(self.meta());
        }

        if let Some(pod) = self.cache.lock().unwrap().get(page_num) {
            return Ok(pod);
        }

        // an evicted page that has not yet reached the double-write
        // pool may still be parked on the pending queue; adopt it
        // back so every caller shares the one live object
        if let Some(pod) = self.take_pending(page_num) {
            let pod = self.cache_insert(page_num, pod);
            self.process_pending_evictions();
            return Ok(pod);
        }

        // the freshest image of a recently evicted page may still be
        // in the double-write pool rather than at its home offset;
        // taking it over makes this cache entry the one that has to
        // reach the disk
        let (bytes, from_pool) = match self
            .recovery
            .get()
            .and_then(|r| r.take_buffered_page(page_num))
        {
            Some(bytes) => (bytes, true),
            None => (
                self.file
                    .read_at(page_num as u64 * PAGE_SIZE as u64, PAGE_SIZE)?,
                false,
            ),
        };
        let mut page = Page::decode(&bytes, kind)?;
        if from_pool {
            page.mark_dirty();
        }
        let pod = self.cache_insert(page_num, Arc::new(RwLock::new(page)));
        self.process_pending_evictions();
        Ok(pod)
    }

    /// Insert unless a racing reader beat us to it; either way every
    /// caller ends up sharing one object per page.
    fn cache_insert(&self, page_num: PageNum, pod: Pod<Page>) -> Pod<Page> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(existing) = cache.get(page_num) {
            return existing;
        }
        cache.put(page_num, pod.clone());
        pod
    }

    /// Pull a specific page off the pending-eviction queue.
    fn take_pending(&self, page_num: PageNum) -> Option<Pod<Page>> {
        let mut queue = self.pending_evictions.lock().unwrap();
        let pos = queue.iter().position(|(num, _)| *num == page_num)?;
        Some(queue.remove(pos).1)
    }

    /// Route evicted dirty pages through the double-write buffer. A
    /// page that is latched right now is requeued rather than waited
    /// on: the latch holder may itself be blocked inside a pager
    /// call, so blocking here could cycle.
    fn process_pending_evictions(&self) {
        let pending = {
            let mut queue = self.pending_evictions.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }

        let mut requeue = Vec::new();
        for (page_num, pod) in pending {
            let requeue_pod = pod.clone();
            match pod.try_read() {
                Ok(page) => {
                    if !page.is_dirty() {
                        continue;
                    }
                    match page.encode() {
                        Ok(image) => match self.recovery.get() {
                            Some(recovery) => Arc::clone(recovery).write(image),
                            // no recovery wired (bootstrap): write home
                            None => {
                                if let Err(e) = self.file.write_at(page.file_offset(), &image) {
                                    error!("eviction write of page {} failed: {}", page_num, e);
                                }
                            }
                        },
                        Err(e) => error!("evicted page {} failed to encode: {}", page_num, e),
                    }
                }
                Err(_) => requeue.push((page_num, requeue_pod)),
            }
        }
        if !requeue.is_empty() {
            self.pending_evictions.lock().unwrap().extend(requeue);
        }
    }

    /// The table's tail record page when it still has room, otherwise
    /// a fresh page spliced onto the end of the table's chain.
    pub fn select_page(&self, required_bytes: usize, table_name: &str) -> DbResult<Pod<Page>> {
        if required_bytes > RecordData::MAX_ROW_SIZE {
            return Err(DbError::PagerExhausted(format!(
                "row of {} bytes cannot fit a page",
                required_bytes
            )));
        }

        let _chain = self.chain_lock.lock().unwrap();

        let meta_pod = self.meta();
        let tail_num = {
            let meta = meta_pod.rl();
            meta.data()
                .as_meta()?
                .table(table_name)
                .ok_or_else(|| DbError::TableNotFound(table_name.to_string()))?
                .last_page_num
        };

        let tail_pod = self.get_page(tail_num, PayloadKind::Record)?;
        {
            let tail = tail_pod.rl();
            if tail.data().as_record()?.has_room(required_bytes) {
                drop(tail);
                return Ok(tail_pod);
            }
        }

        // tail is full: append a fresh record page and splice it in
        let new_pod = self.new_page(PageData::Record(RecordData::new()))?;
        let new_num = new_pod.rl().page_num();
        debug!(
            "table {} tail page {} is full, spliced page {}",
            table_name, tail_num, new_num
        );

        {
            let mut tail = tail_pod.wl();
            tail.set_next(new_num);
            tail.mark_dirty();
        }
        {
            let mut new_page = new_pod.wl();
            new_page.set_prev(tail_num);
            new_page.mark_dirty();
        }
        {
            let mut meta = meta_pod.wl();
            meta.data_mut()
                .as_meta_mut()?
                .table_mut(table_name)
                .ok_or_else(|| DbError::TableNotFound(table_name.to_string()))?
                .last_page_num = new_num;
            meta.mark_dirty();
        }

        // the splice has no redo coverage; flush the chain eagerly so
        // replayed row appends land on a reachable page
        self.flush_pod(&tail_pod)?;
        self.flush_pod(&new_pod)?;
        self.flush_pod(&meta_pod)?;

        Ok(new_pod)
    }

    /// Follow a table's page chain.
    pub fn next_page_num(&self, page_num: PageNum) -> DbResult<PageNum> {
        let pod = self.get_page(page_num, PayloadKind::Record)?;
        let next = pod.rl().next();
        Ok(next)
    }

    /// Write a page's canonical image at its home offset.
    pub fn flush_pod(&self, pod: &Pod<Page>) -> DbResult<()> {
        let mut page = pod.wl();
        let image = page.encode()?;
        self.file.write_at(page.file_offset(), &image)?;
        page.clear_dirty();
        Ok(())
    }

    /// Flush every resident page: cache, pinned meta, and anything
    /// still parked on the eviction queue.
    pub fn flush_all(&self) -> DbResult<()> {
        let mut pods: Vec<Pod<Page>> = {
            let cache = self.cache.lock().unwrap();
            cache.entries().into_iter().map(|(_, pod)| pod).collect()
        };
        pods.push(self.meta());
        pods.extend(
            std::mem::take(&mut *self.pending_evictions.lock().unwrap())
                .into_iter()
                .map(|(_, pod)| pod),
        );

        for pod in pods {
            let dirty = pod.rl().is_dirty();
            if dirty {
                self.flush_pod(&pod)?;
            }
        }
        self.file.sync()?;
        Ok(())
    }

    /// Raw positioned write into the data file; the in-place xmax
    /// stamp of a deleted row goes through here.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> DbResult<()> {
        self.file.write_at(offset, bytes)
    }

    pub fn page_count(&self) -> PageNum {
        *self.next_page_num.lock().unwrap()
    }

    pub fn sync(&self) -> DbResult<()> {
        self.file.sync()
    }
}
