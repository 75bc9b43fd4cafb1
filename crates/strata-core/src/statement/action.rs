use std::fmt;
use std::sync::Arc;

use super::sql;
use super::value::Value;
use crate::error::Result;
use crate::traits::Executor;

/// How a column's value is combined with what is already stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnOp {
    /// Overwrite the column
    #[default]
    Set,
    /// Push the value onto the JSON array held by the column
    ArrayAppend,
    /// Drop every occurrence of the value from the JSON array held by the column
    ArrayRemove,
}

/// Named column value
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: Value,
    pub op: ColumnOp,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            op: ColumnOp::Set,
        }
    }

    pub fn array_append(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: ColumnOp::ArrayAppend,
            ..Self::new(name, value)
        }
    }

    pub fn array_remove(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            op: ColumnOp::ArrayRemove,
            ..Self::new(name, value)
        }
    }
}

/// Source of one column of a copied row
#[derive(Debug, Clone, PartialEq)]
pub enum CopySource {
    /// Take the value of this column from the source row
    Column(String),
    /// Use a fixed value instead of the source row's
    Value(Value),
}

impl CopySource {
    pub fn column(name: impl Into<String>) -> Self {
        CopySource::Column(name.into())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        CopySource::Value(value.into())
    }
}

/// Row filter used by update and delete actions
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    NotEq(String, Value),
    IsNull(String),
    LessThan(String, Value),
    /// The column holds a JSON array of strings that contains the value
    TextArrayContains(String, String),
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    pub fn not_eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::NotEq(column.into(), value.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::IsNull(column.into())
    }

    pub fn less_than(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::LessThan(column.into(), value.into())
    }

    pub fn text_array_contains(column: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::TextArrayContains(column.into(), value.into())
    }
}

/// Custom mutation run against the projection transaction
pub type ExecFn = Arc<dyn Fn(&mut dyn Executor) -> Result<()> + Send + Sync>;

/// Row-level mutation carried by a statement
#[derive(Clone)]
pub enum Action {
    NoOp,
    Create {
        table: String,
        columns: Vec<Column>,
    },
    Upsert {
        table: String,
        conflict_columns: Vec<String>,
        columns: Vec<Column>,
    },
    Update {
        table: String,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    },
    Delete {
        table: String,
        conditions: Vec<Condition>,
    },
    /// Insert new rows into `table` built from its rows matching `conditions`.
    /// `to[i]` receives `from[i]`. Rows colliding on `conflict_columns` are
    /// overwritten.
    Copy {
        table: String,
        conflict_columns: Vec<String>,
        from: Vec<CopySource>,
        to: Vec<String>,
        conditions: Vec<Condition>,
    },
    /// Several actions executed in order as one unit
    Multi(Vec<Action>),
    Exec(ExecFn),
}

/// Kind of mutation, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    NoOp,
    Create,
    Upsert,
    Update,
    Delete,
    Copy,
    Multi,
    Exec,
}

impl Action {
    pub fn create(table: impl Into<String>, columns: Vec<Column>) -> Self {
        Action::Create {
            table: table.into(),
            columns,
        }
    }

    pub fn upsert(
        table: impl Into<String>,
        conflict_columns: Vec<String>,
        columns: Vec<Column>,
    ) -> Self {
        Action::Upsert {
            table: table.into(),
            conflict_columns,
            columns,
        }
    }

    pub fn update(
        table: impl Into<String>,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> Self {
        Action::Update {
            table: table.into(),
            values,
            conditions,
        }
    }

    pub fn delete(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Action::Delete {
            table: table.into(),
            conditions,
        }
    }

    pub fn copy(
        table: impl Into<String>,
        conflict_columns: Vec<String>,
        from: Vec<CopySource>,
        to: Vec<String>,
        conditions: Vec<Condition>,
    ) -> Self {
        Action::Copy {
            table: table.into(),
            conflict_columns,
            from,
            to,
            conditions,
        }
    }

    pub fn exec<F>(f: F) -> Self
    where
        F: Fn(&mut dyn Executor) -> Result<()> + Send + Sync + 'static,
    {
        Action::Exec(Arc::new(f))
    }

    pub fn operation(&self) -> Operation {
        match self {
            Action::NoOp => Operation::NoOp,
            Action::Create { .. } => Operation::Create,
            Action::Upsert { .. } => Operation::Upsert,
            Action::Update { .. } => Operation::Update,
            Action::Delete { .. } => Operation::Delete,
            Action::Copy { .. } => Operation::Copy,
            Action::Multi(_) => Operation::Multi,
            Action::Exec(_) => Operation::Exec,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            Action::Create { table, .. }
            | Action::Upsert { table, .. }
            | Action::Update { table, .. }
            | Action::Delete { table, .. }
            | Action::Copy { table, .. } => Some(table),
            Action::NoOp | Action::Multi(_) | Action::Exec(_) => None,
        }
    }

    /// Run the mutation. Validation errors (`NoTable`, `NoValues`,
    /// `NoCondition`) surface here, at execution time.
    pub fn execute(&self, executor: &mut dyn Executor) -> Result<()> {
        match self {
            Action::NoOp => Ok(()),
            Action::Multi(actions) => {
                for action in actions {
                    action.execute(executor)?;
                }
                Ok(())
            }
            Action::Exec(f) => f(executor),
            other => {
                let rendered = sql::render(other)?;
                executor.execute(&rendered.sql, &rendered.params)?;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::NoOp => f.write_str("NoOp"),
            Action::Create { table, columns } => f
                .debug_struct("Create")
                .field("table", table)
                .field("columns", columns)
                .finish(),
            Action::Upsert {
                table,
                conflict_columns,
                columns,
            } => f
                .debug_struct("Upsert")
                .field("table", table)
                .field("conflict_columns", conflict_columns)
                .field("columns", columns)
                .finish(),
            Action::Update {
                table,
                values,
                conditions,
            } => f
                .debug_struct("Update")
                .field("table", table)
                .field("values", values)
                .field("conditions", conditions)
                .finish(),
            Action::Delete { table, conditions } => f
                .debug_struct("Delete")
                .field("table", table)
                .field("conditions", conditions)
                .finish(),
            Action::Copy {
                table,
                conflict_columns,
                from,
                to,
                conditions,
            } => f
                .debug_struct("Copy")
                .field("table", table)
                .field("conflict_columns", conflict_columns)
                .field("from", from)
                .field("to", to)
                .field("conditions", conditions)
                .finish(),
            Action::Multi(actions) => f.debug_tuple("Multi").field(actions).finish(),
            Action::Exec(_) => f.write_str("Exec(..)"),
        }
    }
}
