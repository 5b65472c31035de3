use std::sync::{Arc, RwLock};

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

/// Page identifier: the page's offset in the data file divided by
/// PAGE_SIZE.
pub type PageNum = u32;

/// Sentinel for "no page" in page chains and leaf links.
pub const NIL_PAGE_NUM: PageNum = u32::MAX;

/// Transaction identifier. XID 0 is reserved for "no transaction"
/// (autocommit), so the first transaction of a fresh database is 1.
pub type Xid = u32;

/// Stored in a row's xmax column while the row is live.
pub const NIL_XID: Xid = u32::MAX;
