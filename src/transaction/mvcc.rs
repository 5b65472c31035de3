//! Snapshot-based concurrency. Every transaction captures the set of
//! transactions active at its begin; the visibility predicate over a
//! row's (xmin, xmax) then gives repeatable reads for the rest of its
//! life.
//!
//! Writers conflict only through the in-place xmax stamp, which is
//! monotonic per row: when two transactions race to delete the same
//! live row, the first stamp wins and the loser's delete skips the
//! row. Row-level locking is a future extension, not something this
//! layer pretends to have.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use log::debug;

use crate::{
    error::{DbError, DbResult},
    stmt::{DeleteStmt, InsertStmt, SelectStmt, UpdateStmt},
    storage::{data_manager::DataManager, row::Row, value::Value},
    transaction::manager::TransactionManager,
    types::{Xid, NIL_XID},
    utils::HandyRwLock,
};

pub struct MvccCoordinator {
    tx_manager: Arc<TransactionManager>,
    data_manager: Arc<DataManager>,
    /// Active transactions and the snapshot each captured at begin.
    active: RwLock<HashMap<Xid, HashSet<Xid>>>,
}

impl MvccCoordinator {
    pub fn new(tx_manager: Arc<TransactionManager>, data_manager: Arc<DataManager>) -> Self {
        Self {
            tx_manager,
            data_manager,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Start a transaction. The snapshot is the set of transactions
    /// active right now, self excluded.
    pub fn begin(&self) -> DbResult<Xid> {
        let mut active = self.active.wl();
        let xid = self.tx_manager.begin()?;
        let snapshot: HashSet<Xid> = active.keys().copied().collect();
        debug!("xid {} begins with snapshot of {} xids", xid, snapshot.len());
        active.insert(xid, snapshot);
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> DbResult<()> {
        {
            let mut active = self.active.wl();
            if active.remove(&xid).is_none() {
                return Err(DbError::XidNotActive(xid));
            }
        }
        self.tx_manager.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> DbResult<()> {
        {
            let mut active = self.active.wl();
            if active.remove(&xid).is_none() {
                return Err(DbError::XidNotActive(xid));
            }
        }
        self.tx_manager.abort(xid)
    }

    fn snapshot_of(&self, xid: Xid) -> DbResult<HashSet<Xid>> {
        self.active
            .rl()
            .get(&xid)
            .cloned()
            .ok_or(DbError::XidNotActive(xid))
    }

    /// The visibility predicate: does transaction `xid`, holding
    /// `snapshot`, see this row version?
    pub fn is_visible(&self, xid: Xid, snapshot: &HashSet<Xid>, row: &Row) -> DbResult<bool> {
        let xmin = row.xmin()?;
        let xmax = row.xmax()?;

        // the transaction's own live insertion
        if xmin == xid && xmax == NIL_XID {
            return Ok(true);
        }
        // created after this transaction began
        if xmin > xid {
            return Ok(false);
        }
        // creator never committed (still active, or aborted)
        if !self.tx_manager.is_committed(xmin)? {
            return Ok(false);
        }
        // creator was concurrent at begin
        if snapshot.contains(&xmin) {
            return Ok(false);
        }

        // the creation is visible; now the deletion, if any
        if xmax == NIL_XID {
            return Ok(true);
        }
        // this transaction deleted it itself
        if xmax == xid {
            return Ok(false);
        }
        // the deletion is not effective from this transaction's view
        if !self.tx_manager.is_committed(xmax)? {
            return Ok(true);
        }
        // deleted after this transaction began
        if xmax > xid {
            return Ok(true);
        }
        // deleter was concurrent at begin
        if snapshot.contains(&xmax) {
            return Ok(true);
        }
        Ok(false)
    }

    /// Stream candidate rows and keep the visible ones.
    pub fn read(&self, xid: Xid, stmt: &SelectStmt) -> DbResult<Vec<Row>> {
        let snapshot = self.snapshot_of(xid)?;
        let stream = self.data_manager.select(stmt)?;

        let mut rows = Vec::new();
        for row in stream.iter() {
            if self.is_visible(xid, &snapshot, &row)? {
                rows.push(row);
            }
        }
        stream.check()?;
        Ok(rows)
    }

    /// Wrap the user values with (xmin = xid, xmax = NIL) and append.
    pub fn insert(&self, xid: Xid, stmt: &InsertStmt) -> DbResult<Row> {
        self.snapshot_of(xid)?;
        let mut values = stmt.values.clone();
        values.push(Value::Int(xid as i64));
        values.push(Value::Int(NIL_XID as i64));
        self.data_manager.insert(&stmt.table_name, Row::new(values))
    }

    /// Stamp every visible match with xmax = xid, in place. A row
    /// whose xmax is already set is someone else's delete in flight:
    /// skipped, not overwritten.
    pub fn delete(&self, xid: Xid, stmt: &DeleteStmt) -> DbResult<Vec<Row>> {
        let select = SelectStmt {
            table_name: stmt.table_name.clone(),
            filter: stmt.filter.clone(),
        };
        let candidates = self.read(xid, &select)?;

        let mut deleted = Vec::new();
        for mut row in candidates {
            if row.xmax()? != NIL_XID {
                continue;
            }
            row.set_xmax(xid);
            self.data_manager.rewrite(&row)?;
            deleted.push(row);
        }
        debug!("xid {} deleted {} rows from {:?}", xid, deleted.len(), stmt.table_name);
        Ok(deleted)
    }

    /// Delete the matches, then re-insert modified copies under the
    /// same xid. Returns the new versions.
    pub fn update(&self, xid: Xid, stmt: &UpdateStmt) -> DbResult<Vec<Row>> {
        let table = self.data_manager.table_info(&stmt.table_name)?;

        // resolve assignment targets before touching any row
        let mut assignments = Vec::with_capacity(stmt.assignments.len());
        for assignment in &stmt.assignments {
            let column = table
                .column(&assignment.column)
                .ok_or_else(|| DbError::ColumnNotFound(assignment.column.clone()))?;
            assignments.push((column.column_id as usize, assignment.value.clone()));
        }

        let old_rows = self.delete(
            xid,
            &DeleteStmt {
                table_name: stmt.table_name.clone(),
                filter: stmt.filter.clone(),
            },
        )?;
        if old_rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut new_rows = Vec::with_capacity(old_rows.len());
        for row in old_rows {
            let mut values = row.user_values().to_vec();
            for (column_id, value) in &assignments {
                values[*column_id] = value.clone();
            }
            let insert = InsertStmt {
                table_name: stmt.table_name.clone(),
                values,
            };
            new_rows.push(self.insert(xid, &insert)?);
        }
        Ok(new_rows)
    }
}
