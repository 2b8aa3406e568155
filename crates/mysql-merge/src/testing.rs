//! In-memory execution channel that records statements and replays scripted results.

use async_trait::async_trait;

use crate::core::traits::{ExecutionChannel, ExecutionMode, QueryOutcome, Row, RowSink, Statement};
use crate::core::value::SqlValue;
use crate::error::{MergeError, Result};

#[derive(Clone)]
enum Reply {
    Outcome(QueryOutcome),
    Fail(String),
}

struct Rule {
    pattern: String,
    reply: Reply,
    once: bool,
}

/// Records every statement; the first rule whose pattern occurs in the SQL decides the reply.
pub struct RecordingChannel {
    mode: ExecutionMode,
    database: String,
    rules: Vec<Rule>,
    pub log: Vec<Statement>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::with_mode(ExecutionMode::Default)
    }

    pub fn with_mode(mode: ExecutionMode) -> Self {
        Self {
            mode,
            database: "source_db".to_string(),
            rules: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn on(mut self, pattern: &str, outcome: QueryOutcome) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            reply: Reply::Outcome(outcome),
            once: false,
        });
        self
    }

    pub fn on_rows(self, pattern: &str, rows: Vec<Row>) -> Self {
        self.on(pattern, QueryOutcome::rows(rows))
    }

    pub fn fail(mut self, pattern: &str, message: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            reply: Reply::Fail(message.to_string()),
            once: false,
        });
        self
    }

    pub fn fail_once(mut self, pattern: &str, message: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            reply: Reply::Fail(message.to_string()),
            once: true,
        });
        self
    }

    /// Executed SQL text, in order.
    pub fn sql(&self) -> Vec<String> {
        self.log.iter().map(|s| s.sql.clone()).collect()
    }

    /// Index of the first statement containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.log.iter().position(|s| s.sql.contains(pattern))
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.log.iter().filter(|s| s.sql.contains(pattern)).count()
    }

    fn reply(&mut self, stmt: &Statement) -> Result<QueryOutcome> {
        self.log.push(stmt.clone());
        let Some(idx) = self.rules.iter().position(|r| stmt.sql.contains(&r.pattern)) else {
            return Ok(QueryOutcome::default());
        };
        let reply = if self.rules[idx].once {
            self.rules.remove(idx).reply
        } else {
            self.rules[idx].reply.clone()
        };
        match reply {
            Reply::Outcome(outcome) => Ok(outcome),
            Reply::Fail(message) => Err(MergeError::EngineWarning {
                statement: stmt.sql.clone(),
                warnings: vec![message],
            }),
        }
    }
}

#[async_trait]
impl ExecutionChannel for RecordingChannel {
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn begin(&mut self) -> Result<()> {
        self.reply(&Statement::new("START TRANSACTION")).map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.reply(&Statement::new("COMMIT")).map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.reply(&Statement::new("ROLLBACK")).map(|_| ())
    }

    async fn execute(&mut self, stmt: &Statement) -> Result<QueryOutcome> {
        self.reply(stmt)
    }

    async fn stream(&mut self, stmt: &Statement, sink: &mut RowSink<'_>) -> Result<u64> {
        let outcome = self.reply(stmt)?;
        let mut count = 0;
        for row in outcome.rows {
            sink(row)?;
            count += 1;
        }
        Ok(count)
    }
}

/// Build a row from `(label, value)` pairs.
pub fn row(pairs: &[(&str, SqlValue)]) -> Row {
    Row::new(
        pairs.iter().map(|(c, _)| c.to_string()).collect(),
        pairs.iter().map(|(_, v)| v.clone()).collect(),
    )
}
