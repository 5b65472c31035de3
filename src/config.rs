use std::path::PathBuf;

/// How the engine treats the target directory at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Initialize a fresh database; refuse a directory that already
    /// holds one.
    Create,
    /// Open an existing database; refuse a directory without one.
    Open,
}

/// Page cache replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Lru,
    TinyLfu,
}

/// Engine options. `path` and `mode` are required; everything else
/// defaults to the values the engine is tuned for.
#[derive(Debug, Clone)]
pub struct Options {
    pub path: PathBuf,
    pub mode: OpenMode,
    pub page_cache_capacity: usize,
    pub double_write_pool_pages: usize,
    pub max_search_threshold: usize,
    pub cache_kind: CacheKind,
}

impl Options {
    pub fn new<P: Into<PathBuf>>(path: P, mode: OpenMode) -> Self {
        Self {
            path: path.into(),
            mode,
            page_cache_capacity: 16,
            double_write_pool_pages: 128,
            max_search_threshold: 4,
            cache_kind: CacheKind::Lru,
        }
    }

    pub fn page_cache_capacity(mut self, capacity: usize) -> Self {
        self.page_cache_capacity = capacity;
        self
    }

    pub fn double_write_pool_pages(mut self, pages: usize) -> Self {
        self.double_write_pool_pages = pages;
        self
    }

    pub fn max_search_threshold(mut self, workers: usize) -> Self {
        self.max_search_threshold = workers;
        self
    }

    pub fn cache_kind(mut self, kind: CacheKind) -> Self {
        self.cache_kind = kind;
        self
    }
}
