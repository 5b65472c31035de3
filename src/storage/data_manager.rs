use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    thread,
};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, error};

use crate::{
    btree::{
        node::{page_num_to_value, value_to_page_num},
        BPlusTree,
    },
    error::{DbError, DbResult},
    io::Encodeable,
    recovery::{redo::RedoRecord, Recovery},
    stmt::{CompareOp, CreateTableStmt, SelectStmt, WhereClause},
    storage::{
        meta::{ColumnDefine, ColumnType, TableInfo},
        page::{PageData, PayloadKind, RecordData, PAGE_SIZE},
        pager::Pager,
        row::Row,
        value::Value,
    },
    types::{PageNum, NIL_PAGE_NUM},
    utils::HandyRwLock,
};

/// Rows flow out of a query on a channel of this capacity, closed
/// exactly once after every producer is done.
const ROW_CHANNEL_CAP: usize = 64;

/// Width of a primary index key/value and of a secondary index key.
const INDEX_KEY_SIZE: u16 = 8;
/// A primary index value is a page number.
const PRIMARY_VALUE_SIZE: u16 = 4;
/// A secondary index value is a primary key image.
const SECONDARY_VALUE_SIZE: u16 = 8;

/// Closure form of a WHERE clause, applied per row during scans. A
/// failing comparison (incomparable operand types) closes the stream
/// with an error instead of guessing.
pub type RowPredicate = Arc<dyn Fn(&Row) -> DbResult<bool> + Send + Sync>;

/// Candidate rows streaming out of a query, with the first per-row
/// error parked on the handle for the consumer to inspect after the
/// stream closes.
pub struct RowStream {
    rx: Receiver<Row>,
    error: Arc<Mutex<Option<DbError>>>,
}

impl RowStream {
    fn channel() -> (Sender<Row>, RowStream) {
        let (tx, rx) = bounded(ROW_CHANNEL_CAP);
        (
            tx,
            RowStream {
                rx,
                error: Arc::new(Mutex::new(None)),
            },
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = Row> + '_ {
        self.rx.iter()
    }

    /// After the stream is drained: did a producer die early?
    pub fn check(&self) -> DbResult<()> {
        match self.error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Follow the table's page chain from first to last, streaming rows
/// through the optional predicate. Returns early when the consumer
/// hangs up.
fn scan_task(
    pager: &Pager,
    table: &TableInfo,
    predicate: Option<&RowPredicate>,
    tx: &Sender<Row>,
) -> DbResult<()> {
    let mut page_num = table.first_page_num;
    while page_num != NIL_PAGE_NUM {
        let pod = pager.get_page(page_num, PayloadKind::Record)?;
        let next = {
            let page = pod.rl();
            for row in page.data().as_record()?.rows() {
                let keep = match predicate {
                    Some(pred) => pred(row)?,
                    None => true,
                };
                if keep && tx.send(row.clone()).is_err() {
                    return Ok(());
                }
            }
            page.next()
        };
        page_num = next;
    }
    Ok(())
}

/// Stream the rows of one record page whose `column_id` column equals
/// the literal. Returns false when the consumer hung up.
fn emit_matches(
    pager: &Pager,
    page_num: PageNum,
    column_id: usize,
    literal: &Value,
    tx: &Sender<Row>,
) -> DbResult<bool> {
    let pod = pager.get_page(page_num, PayloadKind::Record)?;
    let page = pod.rl();
    for row in page.data().as_record()?.rows() {
        if row.values().get(column_id) == Some(literal) && tx.send(row.clone()).is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Routes reads through an index when the WHERE shape allows it,
/// falls back to chain scans otherwise, and maintains every index on
/// insert. Knows nothing about visibility: every version of every row
/// streams out, and the MVCC layer above filters.
pub struct DataManager {
    pager: Arc<Pager>,
    recovery: Arc<Recovery>,
    max_search_threshold: usize,
    /// Live tree handles, built on demand from the catalog's index
    /// metas and keyed by (table id, column id).
    indexes: RwLock<HashMap<(u16, u16), Arc<BPlusTree>>>,
}

impl DataManager {
    pub fn new(pager: Arc<Pager>, recovery: Arc<Recovery>, max_search_threshold: usize) -> Self {
        Self {
            pager,
            recovery,
            max_search_threshold: max_search_threshold.max(1),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn table_info(&self, table_name: &str) -> DbResult<TableInfo> {
        let meta_pod = self.pager.meta();
        let meta = meta_pod.rl();
        meta.data()
            .as_meta()?
            .table(table_name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(table_name.to_string()))
    }

    /// Register a table: columns, the primary index over column 0,
    /// secondary indexes where requested, and one empty record page.
    pub fn create_table(&self, stmt: &CreateTableStmt) -> DbResult<()> {
        let meta_pod = self.pager.meta();

        // reserve the id up front; page allocations below must not
        // run under the meta latch
        let table_id = {
            let meta = meta_pod.rl();
            let meta = meta.data().as_meta()?;
            if meta.table(&stmt.table_name).is_some() {
                return Err(DbError::TableAlreadyExists(stmt.table_name.clone()));
            }
            meta.next_table_id()
        };

        let mut columns = Vec::with_capacity(stmt.columns.len());
        for (column_id, spec) in stmt.columns.iter().enumerate() {
            let column_id = column_id as u16;
            let indexed = column_id == 0 || spec.indexed;
            if indexed && spec.column_type == ColumnType::Text {
                return Err(DbError::UnsupportedOperator(format!(
                    "column {:?} cannot be indexed: text keys are not fixed width",
                    spec.name
                )));
            }

            let index = if indexed {
                let value_size = if column_id == 0 {
                    PRIMARY_VALUE_SIZE
                } else {
                    SECONDARY_VALUE_SIZE
                };
                let tree = BPlusTree::create(
                    Arc::clone(&self.pager),
                    Arc::clone(&self.recovery),
                    table_id,
                    column_id,
                    INDEX_KEY_SIZE,
                    value_size,
                )?;
                let meta = tree.index_meta();
                self.indexes
                    .wl()
                    .insert((table_id, column_id), Arc::new(tree));
                Some(meta)
            } else {
                None
            };

            columns.push(ColumnDefine {
                name: spec.name.clone(),
                column_type: spec.column_type,
                column_id,
                index,
            });
        }

        let first_pod = self.pager.new_page(PageData::Record(RecordData::new()))?;
        let first_page_num = first_pod.rl().page_num();

        {
            let mut page = meta_pod.wl();
            let meta = page.data_mut().as_meta_mut()?;
            if meta.table(&stmt.table_name).is_some() {
                return Err(DbError::TableAlreadyExists(stmt.table_name.clone()));
            }
            meta.add_table(TableInfo {
                table_name: stmt.table_name.clone(),
                table_id,
                columns,
                first_page_num,
                last_page_num: first_page_num,
            });
            page.mark_dirty();
        }
        self.pager.flush_pod(&meta_pod)?;
        debug!("created table {:?} with id {}", stmt.table_name, table_id);
        Ok(())
    }

    /// The live tree for a column, rebuilt from its persisted handle
    /// on first use.
    fn index_for(&self, table: &TableInfo, column: &ColumnDefine) -> Option<Arc<BPlusTree>> {
        let index_meta = column.index.as_ref()?;
        let key = (table.table_id, column.column_id);
        if let Some(tree) = self.indexes.rl().get(&key) {
            return Some(Arc::clone(tree));
        }
        let mut indexes = self.indexes.wl();
        let tree = indexes.entry(key).or_insert_with(|| {
            Arc::new(BPlusTree::from_meta(
                index_meta,
                table.table_id,
                column.column_id,
                Arc::clone(&self.pager),
                Arc::clone(&self.recovery),
            ))
        });
        Some(Arc::clone(tree))
    }

    /// The column's index handle, if it carries one.
    pub fn index(&self, table_name: &str, column_name: &str) -> DbResult<Option<Arc<BPlusTree>>> {
        let table = self.table_info(table_name)?;
        let column = table
            .column(column_name)
            .ok_or_else(|| DbError::ColumnNotFound(column_name.to_string()))?;
        Ok(self.index_for(&table, column))
    }

    /// Append a row to the table and maintain its indexes. The caller
    /// has already wrapped the user values with (xmin, xmax).
    pub fn insert(&self, table_name: &str, mut row: Row) -> DbResult<Row> {
        let table = self.table_info(table_name)?;
        let expected = table.columns.len() + 2;
        if row.values().len() != expected {
            return Err(DbError::ColumnNotFound(format!(
                "row carries {} values, table {:?} stores {}",
                row.values().len(),
                table_name,
                expected
            )));
        }

        let size = row.encoded_size();

        // a concurrent insert can fill the returned page before we
        // latch it; re-select until the space check holds under the
        // write latch
        loop {
            let pod = self.pager.select_page(size, table_name)?;
            let mut page = pod.wl();
            let page_num = page.page_num();
            {
                let record = page.data_mut().as_record_mut()?;
                if !record.has_room(size) {
                    continue;
                }
                row.set_offset(
                    page_num as u64 * PAGE_SIZE as u64 + record.next_row_offset() as u64,
                );
                record.append(row.clone());
            }
            page.mark_dirty();

            let lsn = self.recovery.append_redo(RedoRecord::RecordPageAppend {
                page_num,
                row: row.encode(),
            })?;
            page.set_lsn(lsn);
            drop(page);

            self.maintain_indexes(&table, &row, page_num)?;
            return Ok(row);
        }
    }

    /// Primary index: key bytes -> destination page number. Secondary
    /// indexes: column bytes -> primary key bytes.
    fn maintain_indexes(&self, table: &TableInfo, row: &Row, page_num: PageNum) -> DbResult<()> {
        let primary_key = match row.values()[0].index_key_bytes() {
            Some(bytes) => bytes,
            None => {
                return Err(DbError::UnsupportedOperator(
                    "primary key is not an indexable scalar".to_string(),
                ))
            }
        };

        for column in &table.columns {
            if column.index.is_none() {
                continue;
            }
            let tree = match self.index_for(table, column) {
                Some(tree) => tree,
                None => continue,
            };
            if column.column_id == 0 {
                tree.insert(
                    &primary_key,
                    &page_num_to_value(page_num, PRIMARY_VALUE_SIZE),
                )?;
            } else {
                let column_key = row.values()[column.column_id as usize]
                    .index_key_bytes()
                    .ok_or_else(|| {
                        DbError::UnsupportedOperator(format!(
                            "column {:?} is indexed but not an indexable scalar",
                            column.name
                        ))
                    })?;
                tree.insert(&column_key, &primary_key)?;
            }
        }
        Ok(())
    }

    /// Stamp a row version in place. The cached page is updated and
    /// the encoded row is written straight at its home offset; the
    /// MVCC columns are fixed width, so the rewrite never moves data.
    pub fn rewrite(&self, row: &Row) -> DbResult<()> {
        let page_num = (row.offset() / PAGE_SIZE as u64) as PageNum;
        let page_pod = self.pager.get_page(page_num, PayloadKind::Record)?;
        {
            let mut page = page_pod.wl();
            let record = page.data_mut().as_record_mut()?;
            let slot = record
                .rows_mut()
                .iter_mut()
                .find(|r| r.offset() == row.offset())
                .ok_or_else(|| DbError::corrupt("row vanished from its page"))?;
            *slot = row.clone();
            page.mark_dirty();
        }
        self.pager.write_at(row.offset(), &row.encode())
    }

    /// Dispatch on the WHERE shape: no filter or an unindexable one
    /// scans the table chain; an equality on an indexed column probes
    /// the tree(s).
    pub fn select(&self, stmt: &SelectStmt) -> DbResult<RowStream> {
        let table = self.table_info(&stmt.table_name)?;

        let clause = match &stmt.filter {
            None => return Ok(self.scan_stream(table, None)),
            Some(clause) => clause,
        };

        if let Some((column_name, literal)) = clause.as_column_eq() {
            let column = table
                .column(column_name)
                .ok_or_else(|| DbError::ColumnNotFound(column_name.to_string()))?
                .clone();
            let key = literal.index_key_bytes();
            if let (Some(tree), Some(key)) = (self.index_for(&table, &column), key) {
                if column.column_id == 0 {
                    return Ok(self.primary_probe(tree, key, literal.clone()));
                }
                let primary = self
                    .index_for(&table, table.primary_key())
                    .ok_or_else(|| DbError::corrupt("table has no primary index"))?;
                return Ok(self.secondary_probe(tree, primary, key, column, literal.clone()));
            }
        }

        let predicate = compile_predicate(&table, clause)?;
        Ok(self.scan_stream(table, Some(predicate)))
    }

    fn scan_stream(&self, table: TableInfo, predicate: Option<RowPredicate>) -> RowStream {
        let (tx, stream) = RowStream::channel();
        let error = Arc::clone(&stream.error);
        let pager = Arc::clone(&self.pager);

        thread::spawn(move || {
            if let Err(e) = scan_task(&pager, &table, predicate.as_ref(), &tx) {
                error!("table scan of {:?} failed: {}", table.table_name, e);
                *error.lock().unwrap() = Some(e);
            }
        });
        stream
    }

    /// Probe the primary tree, then scan each hit page for rows whose
    /// first column equals the literal.
    fn primary_probe(&self, tree: Arc<BPlusTree>, key: [u8; 8], literal: Value) -> RowStream {
        let (tx, stream) = RowStream::channel();
        let error = Arc::clone(&stream.error);
        let pager = Arc::clone(&self.pager);

        thread::spawn(move || {
            let mut seen = HashSet::new();
            let mut run = || -> DbResult<()> {
                for value in tree.search(&key) {
                    let page_num = value_to_page_num(&value);
                    if !seen.insert(page_num) {
                        continue;
                    }
                    if !emit_matches(&pager, page_num, 0, &literal, &tx)? {
                        return Ok(());
                    }
                }
                Ok(())
            };
            if let Err(e) = run() {
                error!("primary probe failed: {}", e);
                *error.lock().unwrap() = Some(e);
            }
        });
        stream
    }

    /// Probe the secondary tree for primary keys, then fan the
    /// primary probes out across a fixed-size worker pool. The row
    /// channel closes once, when the last worker drops its sender.
    fn secondary_probe(
        &self,
        tree: Arc<BPlusTree>,
        primary: Arc<BPlusTree>,
        key: [u8; 8],
        column: ColumnDefine,
        literal: Value,
    ) -> RowStream {
        let (tx, stream) = RowStream::channel();
        let error = Arc::clone(&stream.error);
        let workers = self.max_search_threshold;
        let pager = Arc::clone(&self.pager);

        thread::spawn(move || {
            let (task_tx, task_rx) = bounded::<Vec<u8>>(ROW_CHANNEL_CAP);
            let seen: Arc<Mutex<HashSet<PageNum>>> = Arc::new(Mutex::new(HashSet::new()));
            let column_id = column.column_id as usize;

            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let row_tx = tx.clone();
                let primary = Arc::clone(&primary);
                let seen = Arc::clone(&seen);
                let literal = literal.clone();
                let error = Arc::clone(&error);
                let pager = Arc::clone(&pager);

                handles.push(thread::spawn(move || {
                    for primary_key in task_rx.iter() {
                        let run = || -> DbResult<()> {
                            for value in primary.search(&primary_key) {
                                let page_num = value_to_page_num(&value);
                                if !seen.lock().unwrap().insert(page_num) {
                                    continue;
                                }
                                if !emit_matches(&pager, page_num, column_id, &literal, &row_tx)? {
                                    return Ok(());
                                }
                            }
                            Ok(())
                        };
                        if let Err(e) = run() {
                            error!("secondary fan-out failed: {}", e);
                            *error.lock().unwrap() = Some(e);
                            return;
                        }
                    }
                }));
            }
            drop(task_rx);
            drop(tx);

            for primary_key in tree.search(&key) {
                if task_tx.send(primary_key).is_err() {
                    break;
                }
            }
            drop(task_tx);

            for handle in handles {
                let _ = handle.join();
            }
        });
        stream
    }
}

/// Compile a WHERE clause into a per-row closure. Column references
/// resolve to column ids now; type errors surface per row, at
/// evaluation time.
pub fn compile_predicate(table: &TableInfo, clause: &WhereClause) -> DbResult<RowPredicate> {
    enum Operand {
        Literal(Value),
        Column(usize),
    }

    let resolve = |value: &Value| -> DbResult<Operand> {
        match value {
            Value::Column(name) => {
                let column = table
                    .column(name)
                    .ok_or_else(|| DbError::ColumnNotFound(name.clone()))?;
                Ok(Operand::Column(column.column_id as usize))
            }
            other => Ok(Operand::Literal(other.clone())),
        }
    };

    let left = resolve(&clause.left)?;
    let right = resolve(&clause.right)?;
    let op = clause.op;

    Ok(Arc::new(move |row: &Row| {
        let fetch = |operand: &Operand| -> Value {
            match operand {
                Operand::Literal(value) => value.clone(),
                Operand::Column(id) => row.values()[*id].clone(),
            }
        };
        let lhs = fetch(&left);
        let rhs = fetch(&right);
        let ordering = lhs.compare(&rhs).ok_or_else(|| {
            DbError::UnsupportedOperator(format!("cannot compare {} with {}", lhs, rhs))
        })?;
        Ok(match op {
            CompareOp::Eq => ordering == std::cmp::Ordering::Equal,
            CompareOp::Ne => ordering != std::cmp::Ordering::Equal,
            CompareOp::Lt => ordering == std::cmp::Ordering::Less,
            CompareOp::Le => ordering != std::cmp::Ordering::Greater,
            CompareOp::Gt => ordering == std::cmp::Ordering::Greater,
            CompareOp::Ge => ordering != std::cmp::Ordering::Less,
        })
    }))
}
