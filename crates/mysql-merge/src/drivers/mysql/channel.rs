//! MySQL/MariaDB execution channel.
//!
//! Owns a single `mysql_async` connection for the whole merge of one source
//! database, so every phase runs inside the same session and transaction.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, SslOpts};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::core::traits::{ExecutionChannel, ExecutionMode, QueryOutcome, Row, RowSink, Statement};
use crate::core::value::SqlValue;
use crate::error::{MergeError, Result};

/// Statement sent in place of non-DML work during a dry run.
const NOOP_STATEMENT: &str = "SELECT 1";

/// How a statement is sent while dry-running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryRunPlan {
    /// Read-only: run as is.
    Unchanged,
    /// Mutating DML: run as `EXPLAIN <stmt>`.
    Explain,
    /// Anything else: replaced by a no-op.
    NoOp,
}

/// Classify a statement for dry-run execution.
///
/// A statement counts as DML when it mentions one of insert, select, update
/// or delete and never mentions alter.
pub fn plan_dry_run(sql: &str) -> DryRunPlan {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty());

    let first = words.next().unwrap_or_default();
    let mut has_alter = first == "alter";
    let mut has_dml = matches!(first, "insert" | "select" | "update" | "delete");
    for word in words {
        match word {
            "alter" => has_alter = true,
            "insert" | "select" | "update" | "delete" => has_dml = true,
            _ => {}
        }
    }

    if has_alter || !has_dml {
        DryRunPlan::NoOp
    } else if first == "select" {
        DryRunPlan::Unchanged
    } else {
        DryRunPlan::Explain
    }
}

/// Map a configured ssl_mode to mysql_async TLS options.
fn ssl_opts(ssl_mode: &str) -> Option<SslOpts> {
    match ssl_mode.to_lowercase().as_str() {
        "disable" => {
            warn!("MySQL TLS is disabled. Credentials will be transmitted in plaintext.");
            None
        }
        "prefer" | "require" => Some(SslOpts::default().with_danger_accept_invalid_certs(true)),
        "verify-ca" | "verify_ca" | "verify-full" | "verify_identity" => Some(SslOpts::default()),
        other => {
            warn!("Unknown ssl_mode '{}', defaulting to prefer", other);
            Some(SslOpts::default().with_danger_accept_invalid_certs(true))
        }
    }
}

/// Execution channel over one `mysql_async` connection.
pub struct MysqlChannel {
    conn: Conn,
    database: String,
    mode: ExecutionMode,
}

impl MysqlChannel {
    /// Open a connection to `config` in the given mode.
    pub async fn connect(config: &DatabaseConfig, mode: ExecutionMode) -> Result<Self> {
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port)
            .db_name(Some(&config.database))
            .user(Some(&config.user))
            .pass(Some(&config.password))
            .init(vec!["SET NAMES utf8mb4"]);

        if let Some(ssl) = ssl_opts(&config.ssl_mode) {
            builder = builder.ssl_opts(ssl);
        }

        let opts: Opts = builder.into();
        let conn = Conn::new(opts).await.map_err(|e| {
            MergeError::pool(
                e,
                format!(
                    "connecting to {}:{}/{}",
                    config.host, config.port, config.database
                ),
            )
        })?;

        info!(
            "Connected to MySQL: {}:{}/{} (mode: {})",
            config.host, config.port, config.database, mode
        );

        Ok(Self {
            conn,
            database: config.database.clone(),
            mode,
        })
    }

    /// Round-trip to the server.
    pub async fn ping(&mut self) -> Result<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| MergeError::pool(e, "pinging MySQL"))
    }

    /// Close the connection gracefully.
    pub async fn disconnect(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }

    /// Apply the dry-run rewrite; the flag is false when result rows must be discarded.
    fn rewrite(&self, stmt: &Statement) -> (Statement, bool) {
        if self.mode != ExecutionMode::DryRun {
            return (stmt.clone(), true);
        }
        match plan_dry_run(&stmt.sql) {
            DryRunPlan::Unchanged => (stmt.clone(), true),
            DryRunPlan::Explain => (
                Statement::with_params(format!("EXPLAIN {}", stmt.sql), stmt.params.clone()),
                false,
            ),
            DryRunPlan::NoOp => (Statement::new(NOOP_STATEMENT), false),
        }
    }

    /// Send a statement, feeding rows to `sink`. Returns the number of rows read.
    async fn run(&mut self, stmt: &Statement, sink: &mut RowSink<'_>) -> Result<u64> {
        debug!("SQL: {}", stmt.sql);
        let mut count = 0;
        if stmt.params.is_empty() {
            let mut result = self.conn.query_iter(stmt.sql.as_str()).await?;
            while let Some(row) = result.next().await? {
                sink(convert_row(row))?;
                count += 1;
            }
        } else {
            let params: Vec<mysql_async::Value> = stmt.params.iter().map(Into::into).collect();
            let mut result = self.conn.exec_iter(stmt.sql.as_str(), params).await?;
            while let Some(row) = result.next().await? {
                sink(convert_row(row))?;
                count += 1;
            }
        }
        self.check_warnings(&stmt.sql).await?;
        Ok(count)
    }

    /// Escalate engine warnings raised by the last statement.
    async fn check_warnings(&mut self, sql: &str) -> Result<()> {
        if self.conn.get_warnings() == 0 {
            return Ok(());
        }
        let rows: Vec<(String, u32, String)> = self.conn.query("SHOW WARNINGS").await?;
        let warnings: Vec<String> = rows
            .into_iter()
            .filter(|(level, _, _)| !level.eq_ignore_ascii_case("note"))
            .map(|(level, code, message)| format!("{} {}: {}", level, code, message))
            .collect();
        if warnings.is_empty() {
            return Ok(());
        }
        Err(MergeError::EngineWarning {
            statement: sql.to_string(),
            warnings,
        })
    }
}

fn convert_row(row: mysql_async::Row) -> Row {
    let columns = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().into_owned())
        .collect();
    let values = row.unwrap().into_iter().map(SqlValue::from).collect();
    Row::new(columns, values)
}

#[async_trait]
impl ExecutionChannel for MysqlChannel {
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn.query_drop("START TRANSACTION").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.query_drop("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn.query_drop("ROLLBACK").await?;
        Ok(())
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<QueryOutcome> {
        let (stmt, keep_rows) = self.rewrite(stmt);
        let mut rows = Vec::new();
        self.run(&stmt, &mut |row| {
            if keep_rows {
                rows.push(row);
            }
            Ok(())
        })
        .await?;
        let affected_rows = if keep_rows {
            self.conn.affected_rows()
        } else {
            0
        };
        Ok(QueryOutcome {
            rows,
            affected_rows,
        })
    }

    async fn stream(&mut self, stmt: &Statement, sink: &mut RowSink<'_>) -> Result<u64> {
        let (stmt, keep_rows) = self.rewrite(stmt);
        if keep_rows {
            self.run(&stmt, sink).await
        } else {
            self.run(&stmt, &mut |_| Ok(())).await?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_runs_unchanged() {
        assert_eq!(
            plan_dry_run("SELECT t1.id FROM users t1"),
            DryRunPlan::Unchanged
        );
        assert_eq!(
            plan_dry_run("  select engine from information_schema.TABLES"),
            DryRunPlan::Unchanged
        );
    }

    #[test]
    fn test_mutating_dml_is_explained() {
        assert_eq!(
            plan_dry_run("UPDATE `users` SET `id` = `id` + ?"),
            DryRunPlan::Explain
        );
        assert_eq!(
            plan_dry_run("INSERT INTO `dest`.`users` (`id`) SELECT `id` FROM `users`"),
            DryRunPlan::Explain
        );
        assert_eq!(
            plan_dry_run("DELETE c FROM `orders` c LEFT JOIN `users` p ON c.`user_id` = p.`id`"),
            DryRunPlan::Explain
        );
    }

    #[test]
    fn test_ddl_and_session_statements_are_noops() {
        assert_eq!(
            plan_dry_run("ALTER TABLE `orders` DROP FOREIGN KEY `fk_user`"),
            DryRunPlan::NoOp
        );
        assert_eq!(plan_dry_run("SET FOREIGN_KEY_CHECKS = 0"), DryRunPlan::NoOp);
        assert_eq!(
            plan_dry_run("ALTER TABLE `t` ENGINE=InnoDB"),
            DryRunPlan::NoOp
        );
    }

    #[test]
    fn test_alter_wins_over_dml_words() {
        assert_eq!(
            plan_dry_run(
                "ALTER TABLE `orders` ADD CONSTRAINT `fk` FOREIGN KEY (`user_id`) REFERENCES `users` (`id`) ON UPDATE CASCADE"
            ),
            DryRunPlan::NoOp
        );
    }

    #[test]
    fn test_column_names_do_not_count_as_keywords() {
        assert_eq!(
            plan_dry_run("SET @last_updated_at = NOW()"),
            DryRunPlan::NoOp
        );
    }

    #[test]
    fn test_ssl_opts_mapping() {
        assert!(ssl_opts("disable").is_none());
        assert!(ssl_opts("prefer").is_some());
        assert!(ssl_opts("verify-full").is_some());
        assert!(ssl_opts("bogus").is_some());
    }
}
