use std::{
    sync::{Arc, RwLock, RwLockWriteGuard},
    thread,
};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, error};

use crate::{
    btree::node::{order_of, page_num_to_value, BTreeNode},
    error::{DbError, DbResult},
    recovery::{redo::RedoRecord, Recovery},
    storage::{
        meta::IndexMeta,
        page::{Page, PageData, PayloadKind},
        pager::Pager,
    },
    types::{PageNum, Pod, NIL_PAGE_NUM},
    utils::HandyRwLock,
};

/// Capacity of the channel a lookup streams its values through.
const SEARCH_CHANNEL_CAP: usize = 16;

/// Mutable tree shape: where the root and the ends of the leaf chain
/// currently are. Guarded by a tree-level lock and mirrored into the
/// owning column's [`IndexMeta`] after structural changes.
struct TreeShape {
    root: PageNum,
    first_leaf: PageNum,
    last_leaf: PageNum,
}

/// A split that still has to be folded into the parent level.
struct SplitUp {
    key: Vec<u8>,
    right: PageNum,
    parent: PageNum,
}

/// Concurrent ordered map from fixed-width binary keys to fixed-width
/// binary values, with duplicates. Nodes live in pager pages; descent
/// resolves each child under its parent's latch before moving down.
pub struct BPlusTree {
    table_id: u16,
    column_id: u16,
    key_size: u16,
    value_size: u16,
    order: usize,
    shape: RwLock<TreeShape>,
    pager: Arc<Pager>,
    recovery: Arc<Recovery>,
}

/// Lazy, finite stream of values for one key. Dropping it mid-stream
/// disconnects the producer, which releases whatever leaf latch it
/// holds on its next send.
pub struct ValueStream {
    rx: Receiver<Vec<u8>>,
}

impl Iterator for ValueStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().ok()
    }
}

/// Read-latched descent to the leaf holding the key's lower bound.
/// The child page is resolved while the parent latch pins the
/// pointer; the child's own latch is taken right after the parent's
/// is released.
fn descend_read(pager: &Pager, pod: Pod<Page>, key: &[u8], tx: &Sender<Vec<u8>>) -> DbResult<()> {
    let child_pod = {
        let guard = pod.rl();
        let node = guard.data().as_node()?;
        if node.is_leaf {
            drop(guard);
            return emit_from_leaf(pager, pod, key, tx);
        }
        let child_num = node.child_at(node.child_index(key));
        pager.get_page(child_num, PayloadKind::Node)?
    };
    descend_read(pager, child_pod, key, tx)
}

/// Walk forward from the key's lower bound, hopping leaf links while
/// the run of equal keys continues.
fn emit_from_leaf(
    pager: &Pager,
    mut pod: Pod<Page>,
    key: &[u8],
    tx: &Sender<Vec<u8>>,
) -> DbResult<()> {
    loop {
        let next_num = {
            let guard = pod.rl();
            let node = guard.data().as_node()?;
            let mut slot = node.lower_bound(key);
            while slot < node.len() {
                if node.key_at(slot) != key {
                    return Ok(());
                }
                if tx.send(node.value_at(slot).to_vec()).is_err() {
                    // consumer hung up; drop the latch and stop
                    return Ok(());
                }
                slot += 1;
            }
            // the lower bound sits past this leaf's last key, so the
            // run (if any) continues at the next leaf's front
            node.next_leaf
        };
        if next_num == NIL_PAGE_NUM {
            return Ok(());
        }
        pod = pager.get_page(next_num, PayloadKind::Node)?;
    }
}

impl BPlusTree {
    /// Build a fresh tree: the root starts as an empty leaf.
    pub fn create(
        pager: Arc<Pager>,
        recovery: Arc<Recovery>,
        table_id: u16,
        column_id: u16,
        key_size: u16,
        value_size: u16,
    ) -> DbResult<Self> {
        let root_pod = pager.new_page(PageData::Node(BTreeNode::new_leaf(key_size, value_size)))?;
        let root = root_pod.rl().page_num();
        debug!(
            "created index for table {} column {}, root page {}",
            table_id, column_id, root
        );
        Ok(Self {
            table_id,
            column_id,
            key_size,
            value_size,
            order: order_of(key_size, value_size),
            shape: RwLock::new(TreeShape {
                root,
                first_leaf: root,
                last_leaf: root,
            }),
            pager,
            recovery,
        })
    }

    /// Rebuild the live handle from a column's persisted index meta.
    pub fn from_meta(
        meta: &IndexMeta,
        table_id: u16,
        column_id: u16,
        pager: Arc<Pager>,
        recovery: Arc<Recovery>,
    ) -> Self {
        Self {
            table_id,
            column_id,
            key_size: meta.key_size,
            value_size: meta.value_size,
            order: order_of(meta.key_size, meta.value_size),
            shape: RwLock::new(TreeShape {
                root: meta.root,
                first_leaf: meta.first_leaf,
                last_leaf: meta.last_leaf,
            }),
            pager,
            recovery,
        }
    }

    pub fn index_meta(&self) -> IndexMeta {
        let shape = self.shape.rl();
        IndexMeta {
            root: shape.root,
            first_leaf: shape.first_leaf,
            last_leaf: shape.last_leaf,
            key_size: self.key_size,
            value_size: self.value_size,
        }
    }

    pub fn value_size(&self) -> u16 {
        self.value_size
    }

    /// Stream every value stored under `key`. The producer runs on
    /// its own thread, descending under read latches; the stream ends
    /// when the run of equal keys does, or when the consumer drops
    /// the handle.
    pub fn search(&self, key: &[u8]) -> ValueStream {
        let (tx, rx) = bounded(SEARCH_CHANNEL_CAP);
        let pager = Arc::clone(&self.pager);
        let root = self.shape.rl().root;
        let key = key.to_vec();
        let (table_id, column_id) = (self.table_id, self.column_id);

        thread::spawn(move || {
            let run = || -> DbResult<()> {
                let root_pod = pager.get_page(root, PayloadKind::Node)?;
                descend_read(&pager, root_pod, &key, &tx)
            };
            if let Err(e) = run() {
                error!(
                    "index search failed, table {} column {} key {}: {}",
                    table_id,
                    column_id,
                    hex::encode(&key),
                    e
                );
            }
        });
        ValueStream { rx }
    }

    /// Insert a (key, value) pair. Re-inserting an existing pair is a
    /// no-op; duplicates on the key alone are expected and kept.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        debug_assert_eq!(key.len(), self.key_size as usize);
        debug_assert_eq!(value.len(), self.value_size as usize);

        {
            let mut probe = self.search(key);
            if probe.any(|v| v == value) {
                return Ok(());
            }
        }

        let root = self.shape.rl().root;
        let root_pod = self.pager.get_page(root, PayloadKind::Node)?;
        let mut split = self.descend_insert(root_pod, None, key, value)?;

        let structural = split.is_some();
        while let Some(up) = split {
            split = self.insert_into_parent(up)?;
        }
        if structural {
            self.persist_index_meta()?;
        }
        Ok(())
    }

    /// Write-latched descent. The parent's latch is held while the
    /// child pointer is resolved and released before the child's own
    /// latch is taken, so latches are only ever acquired top-down.
    fn descend_insert(
        &self,
        pod: Pod<Page>,
        parent_num: Option<PageNum>,
        key: &[u8],
        value: &[u8],
    ) -> DbResult<Option<SplitUp>> {
        let mut guard = pod.wl();
        let this_num = guard.page_num();

        // splits only consult parent pointers, so a pointer that went
        // stale across a crash heals here, under the write latch
        if let Some(parent_num) = parent_num {
            let stale = {
                let node = guard.data_mut().as_node_mut()?;
                if node.parent != parent_num {
                    node.parent = parent_num;
                    true
                } else {
                    false
                }
            };
            if stale {
                guard.mark_dirty();
            }
        }

        let is_leaf = guard.data().as_node()?.is_leaf;
        if !is_leaf {
            let child_pod = {
                let node = guard.data().as_node()?;
                let child_num = node.child_at(node.child_index(key));
                self.pager.get_page(child_num, PayloadKind::Node)?
            };
            drop(guard);
            return self.descend_insert(child_pod, Some(this_num), key, value);
        }

        {
            let node = guard.data_mut().as_node_mut()?;
            node.insert_entry(key, value);
        }
        guard.mark_dirty();

        let lsn = self.recovery.append_redo(RedoRecord::BNodeInsertKv {
            table_id: self.table_id,
            column_id: self.column_id,
            page_num: this_num,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        guard.set_lsn(lsn);

        if !guard.data().as_node()?.is_overflow() {
            return Ok(None);
        }
        debug!(
            "leaf page {} reached {} keys, splitting",
            this_num, self.order
        );
        self.split_node(guard, this_num).map(Some)
    }

    fn insert_into_parent(&self, up: SplitUp) -> DbResult<Option<SplitUp>> {
        let pod = self.pager.get_page(up.parent, PayloadKind::Node)?;
        let mut guard = pod.wl();
        let this_num = guard.page_num();
        let value = page_num_to_value(up.right, self.value_size);

        {
            let node = guard.data_mut().as_node_mut()?;
            node.insert_entry(&up.key, &value);
        }
        guard.mark_dirty();

        let lsn = self.recovery.append_redo(RedoRecord::BNodeInsertKv {
            table_id: self.table_id,
            column_id: self.column_id,
            page_num: this_num,
            key: up.key,
            value,
        })?;
        guard.set_lsn(lsn);

        if !guard.data().as_node()?.is_overflow() {
            return Ok(None);
        }
        self.split_node(guard, this_num).map(Some)
    }

    /// Split an over-full node, leaf or inner, and hand the separator
    /// up. Nothing is mutated before the sibling (and, for a root,
    /// the new root) has been allocated, so a failed allocation
    /// leaves the tree invariant-intact.
    fn split_node(
        &self,
        mut guard: RwLockWriteGuard<'_, Page>,
        page_num: PageNum,
    ) -> DbResult<SplitUp> {
        let is_root = self.shape.rl().root == page_num;
        let mut parent_num = guard.data().as_node()?.parent;

        if is_root {
            // root promotion: the only place new roots come from
            let new_root = BTreeNode::new_inner(self.key_size, self.value_size, page_num);
            let root_pod = self.pager.new_page(PageData::Node(new_root))?;
            let new_root_num = root_pod.rl().page_num();

            self.shape.wl().root = new_root_num;
            {
                let node = guard.data_mut().as_node_mut()?;
                node.parent = new_root_num;
            }
            guard.mark_dirty();
            parent_num = new_root_num;
            debug!(
                "root split: page {} now under new root {}",
                page_num, new_root_num
            );
        }

        let is_leaf = guard.data().as_node()?.is_leaf;
        if is_leaf {
            self.split_leaf_node(guard, page_num, parent_num)
        } else {
            self.split_inner_node(guard, page_num, parent_num)
        }
    }

    fn split_leaf_node(
        &self,
        mut guard: RwLockWriteGuard<'_, Page>,
        page_num: PageNum,
        parent_num: PageNum,
    ) -> DbResult<SplitUp> {
        let (sibling, old_next, sep_key) = {
            let node = guard.data_mut().as_node_mut()?;
            let mut sibling = node.split_leaf();
            let old_next = node.next_leaf;
            sibling.prev_leaf = page_num;
            sibling.next_leaf = old_next;
            sibling.parent = parent_num;
            let sep_key = sibling.first_key().to_vec();
            (sibling, old_next, sep_key)
        };

        let sibling_pod = self.pager.new_page(PageData::Node(sibling))?;
        let sibling_num = sibling_pod.rl().page_num();

        {
            let node = guard.data_mut().as_node_mut()?;
            node.next_leaf = sibling_num;
        }
        guard.mark_dirty();

        let lsn = self.recovery.append_redo(RedoRecord::BNodeSplit {
            table_id: self.table_id,
            column_id: self.column_id,
            page_num,
            new_page_num: sibling_num,
        })?;
        guard.set_lsn(lsn);
        sibling_pod.wl().set_lsn(lsn);
        drop(guard);

        // patch the doubly linked leaf list around the new sibling
        if old_next != NIL_PAGE_NUM {
            let next_pod = self.pager.get_page(old_next, PayloadKind::Node)?;
            let mut next = next_pod.wl();
            next.data_mut().as_node_mut()?.prev_leaf = sibling_num;
            next.mark_dirty();
        }

        {
            let mut shape = self.shape.wl();
            if shape.last_leaf == page_num {
                shape.last_leaf = sibling_num;
            }
        }

        Ok(SplitUp {
            key: sep_key,
            right: sibling_num,
            parent: parent_num,
        })
    }

    fn split_inner_node(
        &self,
        mut guard: RwLockWriteGuard<'_, Page>,
        page_num: PageNum,
        parent_num: PageNum,
    ) -> DbResult<SplitUp> {
        let (promoted, sibling) = {
            let node = guard.data_mut().as_node_mut()?;
            let (promoted, mut sibling) = node.split_inner();
            sibling.parent = parent_num;
            (promoted, sibling)
        };
        let moved_children = sibling.children();

        let sibling_pod = self.pager.new_page(PageData::Node(sibling))?;
        let sibling_num = sibling_pod.rl().page_num();
        guard.mark_dirty();

        let lsn = self.recovery.append_redo(RedoRecord::BNodeSplit {
            table_id: self.table_id,
            column_id: self.column_id,
            page_num,
            new_page_num: sibling_num,
        })?;
        guard.set_lsn(lsn);
        sibling_pod.wl().set_lsn(lsn);
        drop(guard);

        // every child whose pointer moved now answers to the sibling
        for child_num in moved_children {
            let child_pod = self.pager.get_page(child_num, PayloadKind::Node)?;
            let mut child = child_pod.wl();
            child.data_mut().as_node_mut()?.parent = sibling_num;
            child.mark_dirty();
        }

        Ok(SplitUp {
            key: promoted,
            right: sibling_num,
            parent: parent_num,
        })
    }

    /// Mirror the shape back into the owning column's index handle
    /// and flush the meta page: structural changes have no redo
    /// coverage of their own.
    fn persist_index_meta(&self) -> DbResult<()> {
        let meta_pod = self.pager.meta();
        {
            let mut page = meta_pod.wl();
            let meta = page.data_mut().as_meta_mut()?;
            let table = meta
                .table_by_id_mut(self.table_id)
                .ok_or_else(|| DbError::corrupt("index owner table missing from catalog"))?;
            let column = table
                .columns
                .get_mut(self.column_id as usize)
                .ok_or_else(|| DbError::corrupt("index owner column missing from catalog"))?;
            column.index = Some(self.index_meta());
            page.mark_dirty();
        }
        self.pager.flush_pod(&meta_pod)
    }
}
