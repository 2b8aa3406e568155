//! The execution channel: the single path every merge statement takes.
//!
//! - [`ExecutionChannel`]: connection-level operations shared by the pipeline
//!   and all merge components
//! - [`Statement`]: SQL text plus bound parameters
//! - [`ExecutionMode`]: how mutating statements are treated
//!
//! Components never format data values into SQL. Identifiers are quoted with
//! [`crate::core::identifier`] and values travel as [`Statement::params`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::value::SqlValue;
use crate::error::Result;

/// How the pipeline treats mutating statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Execute everything; copy with a cross-database `INSERT ... SELECT`.
    #[default]
    Default,

    /// Send no mutating statement: DML becomes `EXPLAIN`, everything else a no-op.
    DryRun,

    /// Execute source-side work, but render the copy into a patch script.
    ImportFile,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Default => "default",
            ExecutionMode::DryRun => "dry_run",
            ExecutionMode::ImportFile => "import_file",
        };
        f.write_str(name)
    }
}

/// A SQL statement with positional `?` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Toggle the engine's foreign-key checking for this session.
    pub fn foreign_key_checks(enable: bool) -> Self {
        Self::new(format!("SET FOREIGN_KEY_CHECKS = {}", u8::from(enable)))
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

/// One result row, addressable by column label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Value of the column labelled `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|i| &self.values[i])
    }

    pub fn first(&self) -> Option<&SqlValue> {
        self.values.first()
    }
}

/// Rows and affected-row count returned by one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub rows: Vec<Row>,
    pub affected_rows: u64,
}

impl QueryOutcome {
    pub fn affected(affected_rows: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows,
        }
    }

    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            affected_rows: 0,
        }
    }
}

/// Receives streamed rows one at a time.
pub type RowSink<'a> = dyn FnMut(Row) -> Result<()> + Send + 'a;

/// Statement execution over one connection and one open transaction.
///
/// Implementations apply the [`ExecutionMode`] rewrite in [`execute`] and
/// [`stream`]; transaction control bypasses it. Any engine warning raised by
/// a statement is returned as an error.
///
/// [`execute`]: ExecutionChannel::execute
/// [`stream`]: ExecutionChannel::stream
#[async_trait]
pub trait ExecutionChannel: Send {
    /// Mode this channel was opened with.
    fn mode(&self) -> ExecutionMode;

    /// Name of the database this channel is connected to.
    fn database(&self) -> &str;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Execute a statement and collect its result.
    async fn execute(&mut self, stmt: &Statement) -> Result<QueryOutcome>;

    /// Execute a query and hand each row to `sink` as it arrives.
    ///
    /// Returns the number of rows streamed.
    async fn stream(&mut self, stmt: &Statement, sink: &mut RowSink<'_>) -> Result<u64>;

    /// Enable or disable foreign-key checking.
    async fn set_foreign_key_checks(&mut self, enable: bool) -> Result<()> {
        self.execute(&Statement::foreign_key_checks(enable)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_get_is_case_insensitive() {
        let row = Row::new(
            vec!["old_pk".into(), "NEW_PK".into()],
            vec![SqlValue::Int(1), SqlValue::Int(2)],
        );
        assert_eq!(row.get("OLD_PK"), Some(&SqlValue::Int(1)));
        assert_eq!(row.get("new_pk"), Some(&SqlValue::Int(2)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.first(), Some(&SqlValue::Int(1)));
    }

    #[test]
    fn test_foreign_key_checks_statement() {
        assert_eq!(
            Statement::foreign_key_checks(false).sql,
            "SET FOREIGN_KEY_CHECKS = 0"
        );
        assert_eq!(
            Statement::foreign_key_checks(true).sql,
            "SET FOREIGN_KEY_CHECKS = 1"
        );
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(ExecutionMode::DryRun.to_string(), "dry_run");
        assert_eq!(ExecutionMode::default(), ExecutionMode::Default);
    }
}
