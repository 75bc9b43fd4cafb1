//! Rendering of actions to parameterized SQL
//!
//! Placeholders are numbered (`?1`, `?2`, ...) in the order their values
//! appear in `params`.

use super::action::{Action, Column, ColumnOp, Condition, CopySource};
use super::value::Value;
use crate::error::{Result, StrataError};

/// Parameterized SQL ready for an [`Executor`](crate::traits::Executor)
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

struct Builder {
    params: Vec<Value>,
}

impl Builder {
    fn new() -> Self {
        Self { params: Vec::new() }
    }

    fn bind(&mut self, value: &Value) -> String {
        self.params.push(value.clone());
        format!("?{}", self.params.len())
    }

    fn where_clause(&mut self, conditions: &[Condition]) -> String {
        self.qualified_where_clause(conditions, "")
    }

    /// `prefix` is prepended to every column name, e.g. `"src."`
    fn qualified_where_clause(&mut self, conditions: &[Condition], prefix: &str) -> String {
        let parts: Vec<String> = conditions
            .iter()
            .map(|cond| match cond {
                Condition::Eq(col, v) => format!("{}{} = {}", prefix, col, self.bind(v)),
                Condition::NotEq(col, v) => format!("{}{} <> {}", prefix, col, self.bind(v)),
                Condition::IsNull(col) => format!("{}{} IS NULL", prefix, col),
                Condition::LessThan(col, v) => format!("{}{} < {}", prefix, col, self.bind(v)),
                Condition::TextArrayContains(col, v) => format!(
                    "EXISTS (SELECT 1 FROM json_each({}{}) WHERE json_each.value = {})",
                    prefix,
                    col,
                    self.bind(&Value::Text(v.clone()))
                ),
            })
            .collect();
        parts.join(" AND ")
    }

    fn finish(self, sql: String) -> SqlStatement {
        SqlStatement {
            sql,
            params: self.params,
        }
    }
}

fn check_table(table: &str) -> Result<()> {
    if table.is_empty() {
        return Err(StrataError::NoTable);
    }
    Ok(())
}

fn check_values(columns: &[Column]) -> Result<()> {
    if columns.is_empty() {
        return Err(StrataError::NoValues);
    }
    Ok(())
}

fn check_conditions(conditions: &[Condition]) -> Result<()> {
    if conditions.is_empty() {
        return Err(StrataError::NoCondition);
    }
    Ok(())
}

/// Expression assigning `placeholder` to a column that already holds a value
fn assign(column: &Column, placeholder: &str) -> String {
    match column.op {
        ColumnOp::Set => placeholder.to_string(),
        ColumnOp::ArrayAppend => format!(
            "json_insert(coalesce({}, '[]'), '$[#]', {})",
            column.name, placeholder
        ),
        ColumnOp::ArrayRemove => format!(
            "(SELECT json_group_array(json_each.value) FROM json_each(coalesce({}, '[]')) WHERE json_each.value <> {})",
            column.name, placeholder
        ),
    }
}

/// Expression for a column of a freshly inserted row
fn initial(column: &Column, placeholder: &str) -> String {
    match column.op {
        ColumnOp::Set => placeholder.to_string(),
        ColumnOp::ArrayAppend => format!("json_array({})", placeholder),
        ColumnOp::ArrayRemove => "json_array()".to_string(),
    }
}

/// Returns the statement and the placeholder bound for each column
fn insert(b: &mut Builder, table: &str, columns: &[Column]) -> (String, Vec<String>) {
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let placeholders: Vec<String> = columns.iter().map(|c| b.bind(&c.value)).collect();
    let values: Vec<String> = columns
        .iter()
        .zip(&placeholders)
        .map(|(c, p)| initial(c, p))
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        names.join(", "),
        values.join(", ")
    );
    (sql, placeholders)
}

fn on_conflict(conflict_columns: &[String], updates: Vec<String>) -> String {
    if updates.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", conflict_columns.join(", "))
    } else {
        format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            conflict_columns.join(", "),
            updates.join(", ")
        )
    }
}

const COPY_ALIAS: &str = "copy_source";
const COPY_ALIAS_PREFIX: &str = "copy_source.";

/// Render a single table action. `NoOp`, `Multi` and `Exec` have no SQL of
/// their own and are rejected.
pub fn render(action: &Action) -> Result<SqlStatement> {
    let mut b = Builder::new();
    let sql = match action {
        Action::Create { table, columns } => {
            check_table(table)?;
            check_values(columns)?;
            insert(&mut b, table, columns).0
        }
        Action::Upsert {
            table,
            conflict_columns,
            columns,
        } => {
            check_table(table)?;
            check_values(columns)?;
            check_conditions_cols(conflict_columns)?;
            let (mut sql, placeholders) = insert(&mut b, table, columns);
            let updates: Vec<String> = columns
                .iter()
                .zip(&placeholders)
                .filter(|(c, _)| !conflict_columns.contains(&c.name))
                .map(|(c, p)| match c.op {
                    ColumnOp::Set => format!("{0} = excluded.{0}", c.name),
                    _ => format!("{} = {}", c.name, assign(c, p)),
                })
                .collect();
            sql.push_str(&on_conflict(conflict_columns, updates));
            sql
        }
        Action::Update {
            table,
            values,
            conditions,
        } => {
            check_table(table)?;
            check_values(values)?;
            check_conditions(conditions)?;
            let sets: Vec<String> = values
                .iter()
                .map(|c| {
                    let placeholder = b.bind(&c.value);
                    format!("{} = {}", c.name, assign(c, &placeholder))
                })
                .collect();
            let wheres = b.where_clause(conditions);
            format!("UPDATE {} SET {} WHERE {}", table, sets.join(", "), wheres)
        }
        Action::Delete { table, conditions } => {
            check_table(table)?;
            check_conditions(conditions)?;
            let wheres = b.where_clause(conditions);
            format!("DELETE FROM {} WHERE {}", table, wheres)
        }
        Action::Copy {
            table,
            conflict_columns,
            from,
            to,
            conditions,
        } => {
            check_table(table)?;
            check_conditions(conditions)?;
            if from.is_empty() || from.len() != to.len() {
                return Err(StrataError::NoValues);
            }
            let selected: Vec<String> = from
                .iter()
                .map(|source| match source {
                    CopySource::Column(name) => format!("{}{}", COPY_ALIAS_PREFIX, name),
                    CopySource::Value(v) => b.bind(v),
                })
                .collect();
            let wheres = b.qualified_where_clause(conditions, COPY_ALIAS_PREFIX);
            let mut sql = format!(
                "INSERT INTO {0} ({1}) SELECT {2} FROM {0} AS {3} WHERE {4}",
                table,
                to.join(", "),
                selected.join(", "),
                COPY_ALIAS,
                wheres
            );
            if !conflict_columns.is_empty() {
                let updates: Vec<String> = to
                    .iter()
                    .filter(|c| !conflict_columns.contains(c))
                    .map(|c| format!("{0} = excluded.{0}", c))
                    .collect();
                sql.push_str(&on_conflict(conflict_columns, updates));
            }
            sql
        }
        Action::NoOp | Action::Multi(_) | Action::Exec(_) => {
            return Err(StrataError::InvalidState(format!(
                "{:?} action cannot be rendered to a single statement",
                action.operation()
            )))
        }
    };
    Ok(b.finish(sql))
}

fn check_conditions_cols(cols: &[String]) -> Result<()> {
    if cols.is_empty() {
        return Err(StrataError::NoCondition);
    }
    Ok(())
}
