use mini_db::{
    stmt::{ColumnSpec, CompareOp, CreateTableStmt, InsertStmt, SelectStmt, WhereClause},
    storage::meta::ColumnType,
    utils, Engine, OpenMode, Options, Value, Xid,
};
use tempfile::TempDir;

pub fn setup() {
    utils::init_log();
}

/// A fresh engine in its own temporary directory.
pub fn new_engine() -> (Engine, TempDir) {
    setup();
    let dir = TempDir::new().unwrap();
    let engine = Engine::create(Options::new(dir.path(), OpenMode::Create)).unwrap();
    (engine, dir)
}

pub fn reopen(dir: &TempDir) -> Engine {
    Engine::open(Options::new(dir.path(), OpenMode::Open)).unwrap()
}

/// `create table student (id int, name text)` with the implicit
/// primary index on id.
pub fn create_student_table(engine: &Engine) {
    engine
        .create_table(
            0,
            &CreateTableStmt {
                table_name: "student".to_string(),
                columns: vec![
                    ColumnSpec::new("id", ColumnType::Int),
                    ColumnSpec::new("name", ColumnType::Text),
                ],
            },
        )
        .unwrap();
}

pub fn insert_student(engine: &Engine, xid: Xid, id: i64, name: &str) {
    engine
        .insert(
            xid,
            &InsertStmt {
                table_name: "student".to_string(),
                values: vec![Value::Int(id), Value::Text(name.to_string())],
            },
        )
        .unwrap();
}

pub fn select_students(engine: &Engine, xid: Xid, filter: Option<WhereClause>) -> Vec<Vec<Value>> {
    engine
        .select(
            xid,
            &SelectStmt {
                table_name: "student".to_string(),
                filter,
            },
        )
        .unwrap()
        .rows
}

pub fn id_eq(id: i64) -> Option<WhereClause> {
    Some(WhereClause::new(
        Value::Column("id".to_string()),
        CompareOp::Eq,
        Value::Int(id),
    ))
}

pub fn student_row(id: i64, name: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::Text(name.to_string())]
}
