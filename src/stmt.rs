//! Statement structs: the contract between the external executor and
//! the core. The SQL text parser lives outside the engine; by the
//! time anything reaches these types it has already been validated.

use crate::storage::{meta::ColumnType, value::Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A single comparison between two operands, each either a literal or
/// a column reference (`Value::Column`).
#[derive(Debug, Clone)]
pub struct WhereClause {
    pub left: Value,
    pub op: CompareOp,
    pub right: Value,
}

impl WhereClause {
    pub fn new(left: Value, op: CompareOp, right: Value) -> Self {
        Self { left, op, right }
    }

    /// The `column = literal` shape, the one indexes can serve.
    pub fn as_column_eq(&self) -> Option<(&str, &Value)> {
        if self.op != CompareOp::Eq {
            return None;
        }
        match (&self.left, &self.right) {
            (Value::Column(name), literal) if !matches!(literal, Value::Column(_)) => {
                Some((name, literal))
            }
            (literal, Value::Column(name)) if !matches!(literal, Value::Column(_)) => {
                Some((name, literal))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    /// Request a secondary index over this column. The first column
    /// is the primary key and always indexed.
    pub indexed: bool,
}

impl ColumnSpec {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            indexed: false,
        }
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CreateTableStmt {
    pub table_name: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone)]
pub struct InsertStmt {
    pub table_name: String,
    /// User values only, in column order; the engine wraps them with
    /// the MVCC pair.
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct SelectStmt {
    pub table_name: String,
    pub filter: Option<WhereClause>,
}

#[derive(Debug, Clone)]
pub struct DeleteStmt {
    pub table_name: String,
    pub filter: Option<WhereClause>,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct UpdateStmt {
    pub table_name: String,
    pub assignments: Vec<Assignment>,
    pub filter: Option<WhereClause>,
}
