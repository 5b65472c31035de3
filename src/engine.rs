use std::sync::Arc;

use log::info;

use crate::{
    config::{OpenMode, Options},
    error::DbResult,
    recovery::Recovery,
    stmt::{CreateTableStmt, DeleteStmt, InsertStmt, SelectStmt, UpdateStmt},
    storage::{data_manager::DataManager, pager::Pager, row::Row, value::Value},
    transaction::{manager::TransactionManager, mvcc::MvccCoordinator},
    types::Xid,
};

/// What a command hands back: the table's column names and the
/// user-visible values of each affected row.
#[derive(Debug)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// The engine aggregate. One owned instance per database directory;
/// request handlers borrow it. There is deliberately no process-wide
/// state behind this struct.
pub struct Engine {
    pager: Arc<Pager>,
    recovery: Arc<Recovery>,
    tx_manager: Arc<TransactionManager>,
    data_manager: Arc<DataManager>,
    mvcc: MvccCoordinator,
}

impl Engine {
    /// Dispatch on the configured mode.
    pub fn start(opts: Options) -> DbResult<Self> {
        match opts.mode {
            OpenMode::Create => Self::create(opts),
            OpenMode::Open => Self::open(opts),
        }
    }

    /// Initialize a fresh database directory.
    pub fn create(opts: Options) -> DbResult<Self> {
        let pager = Arc::new(Pager::create(&opts)?);
        let recovery = Recovery::create(&opts)?;
        pager.set_recovery(Arc::clone(&recovery));
        let tx_manager = Arc::new(TransactionManager::create(&opts.path)?);
        info!("created database at {:?}", opts.path);
        Self::assemble(opts, pager, recovery, tx_manager)
    }

    /// Open an existing database directory. Recovery runs first, so
    /// the pager only ever reads healed pages.
    pub fn open(opts: Options) -> DbResult<Self> {
        let recovery = Recovery::open(&opts)?;
        let pager = Arc::new(Pager::open(&opts)?);
        pager.set_recovery(Arc::clone(&recovery));
        let tx_manager = Arc::new(TransactionManager::open(&opts.path)?);
        info!("opened database at {:?}", opts.path);
        Self::assemble(opts, pager, recovery, tx_manager)
    }

    fn assemble(
        opts: Options,
        pager: Arc<Pager>,
        recovery: Arc<Recovery>,
        tx_manager: Arc<TransactionManager>,
    ) -> DbResult<Self> {
        let data_manager = Arc::new(DataManager::new(
            Arc::clone(&pager),
            Arc::clone(&recovery),
            opts.max_search_threshold,
        ));
        let mvcc = MvccCoordinator::new(Arc::clone(&tx_manager), Arc::clone(&data_manager));
        Ok(Self {
            pager,
            recovery,
            tx_manager,
            data_manager,
            mvcc,
        })
    }

    /// Flush everything and record a clean shutdown. An engine that
    /// is dropped without this goes through recovery on next open.
    pub fn close(&self) -> DbResult<()> {
        info!("engine closing");
        self.pager.flush_all()?;
        self.recovery.close()?;
        Ok(())
    }

    pub fn begin(&self) -> DbResult<Xid> {
        self.mvcc.begin()
    }

    pub fn commit(&self, xid: Xid) -> DbResult<()> {
        self.mvcc.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> DbResult<()> {
        self.mvcc.abort(xid)
    }

    /// xid 0 means autocommit: the statement runs in its own
    /// transaction, committed on success and aborted on error.
    fn with_xid<T>(&self, xid: Xid, f: impl FnOnce(Xid) -> DbResult<T>) -> DbResult<T> {
        if xid != 0 {
            return f(xid);
        }
        let xid = self.begin()?;
        match f(xid) {
            Ok(value) => {
                self.commit(xid)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.abort(xid);
                Err(e)
            }
        }
    }

    fn result_set(&self, table_name: &str, rows: Vec<Row>) -> DbResult<ResultSet> {
        let table = self.data_manager.table_info(table_name)?;
        Ok(ResultSet {
            columns: table.column_names(),
            rows: rows
                .into_iter()
                .map(|row| row.user_values().to_vec())
                .collect(),
        })
    }

    pub fn create_table(&self, xid: Xid, stmt: &CreateTableStmt) -> DbResult<()> {
        self.with_xid(xid, |_| self.data_manager.create_table(stmt))
    }

    pub fn insert(&self, xid: Xid, stmt: &InsertStmt) -> DbResult<ResultSet> {
        let rows = self.with_xid(xid, |xid| self.mvcc.insert(xid, stmt).map(|row| vec![row]))?;
        self.result_set(&stmt.table_name, rows)
    }

    pub fn select(&self, xid: Xid, stmt: &SelectStmt) -> DbResult<ResultSet> {
        let rows = self.with_xid(xid, |xid| self.mvcc.read(xid, stmt))?;
        self.result_set(&stmt.table_name, rows)
    }

    pub fn update(&self, xid: Xid, stmt: &UpdateStmt) -> DbResult<ResultSet> {
        let rows = self.with_xid(xid, |xid| self.mvcc.update(xid, stmt))?;
        self.result_set(&stmt.table_name, rows)
    }

    pub fn delete(&self, xid: Xid, stmt: &DeleteStmt) -> DbResult<ResultSet> {
        let rows = self.with_xid(xid, |xid| self.mvcc.delete(xid, stmt))?;
        self.result_set(&stmt.table_name, rows)
    }

    /// Component handles, mostly for tests and the outer executor's
    /// bookkeeping.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn data_manager(&self) -> &Arc<DataManager> {
        &self.data_manager
    }

    pub fn tx_manager(&self) -> &Arc<TransactionManager> {
        &self.tx_manager
    }

    pub fn recovery(&self) -> &Arc<Recovery> {
        &self.recovery
    }
}
