//! Patch scripts: rendering the copy as replayable SQL, and replaying it.

use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::identifier::{quote, quote_list};
use crate::core::schema::TableDescriptor;
use crate::core::traits::{ExecutionChannel, Row, Statement};
use crate::error::{MergeError, Result};

/// File name of the patch script for the source with ordinal `counter`.
pub fn patch_file_name(counter: u32, date: NaiveDate) -> String {
    format!("patch-{}-{}.sql", counter, date.format("%Y-%m-%d"))
}

/// A patch script being written, one statement per line.
pub struct PatchScript<W: Write> {
    writer: W,
    path: Option<PathBuf>,
    lines: u64,
}

impl PatchScript<BufWriter<File>> {
    /// Create (or truncate) the patch file for `counter` in `dir`.
    pub fn create(dir: &Path, counter: u32, date: NaiveDate) -> Result<Self> {
        let path = dir.join(patch_file_name(counter, date));
        let file = File::create(&path)?;
        info!("Writing patch script to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            path: Some(path),
            lines: 0,
        })
    }
}

impl<W: Write> PatchScript<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            path: None,
            lines: 0,
        }
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Flush and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Accumulates rows into multi-row `INSERT` statements.
pub struct InsertComposer {
    insert_part: String,
    integer_columns: Vec<bool>,
    values: Vec<String>,
}

impl InsertComposer {
    /// Composer for `columns` of `table`, in that order.
    pub fn new(table: &str, columns: &[String], descriptor: &TableDescriptor) -> Result<Self> {
        Ok(Self {
            insert_part: format!("INSERT INTO {} ({}) VALUES", quote(table)?, quote_list(columns)?),
            integer_columns: columns
                .iter()
                .map(|c| descriptor.is_integer_column(c))
                .collect(),
            values: Vec::new(),
        })
    }

    /// Render one row; values are positional, matching the column order.
    pub fn add_row(&mut self, row: &Row) {
        let rendered: Vec<String> = row
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| v.to_literal(self.integer_columns.get(i).copied().unwrap_or(false)))
            .collect();
        self.values.push(format!("({})", rendered.join(", ")));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The pending rows as one statement, resetting the composer.
    pub fn take_statement(&mut self) -> Option<String> {
        if self.values.is_empty() {
            return None;
        }
        let statement = format!("{}{};", self.insert_part, self.values.join(","));
        self.values.clear();
        Some(statement)
    }
}

/// Outcome of replaying a patch script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub statements: u64,
    pub commits: u64,
}

/// Replay a patch script through `channel`, one statement per line.
///
/// Blank lines and `--` comments are skipped. A commit is issued every
/// `batch_size` statements and at the end; any failure rolls back the open
/// batch and reports the offending line.
pub async fn apply_patch<R: BufRead + Send>(
    channel: &mut dyn ExecutionChannel,
    reader: R,
    batch_size: usize,
) -> Result<ApplyStats> {
    let batch_size = batch_size.max(1) as u64;
    let mut stats = ApplyStats::default();
    channel.begin().await?;

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let result: Result<bool> = async {
            let line = line?;
            let sql = line.trim();
            if sql.is_empty() || sql.starts_with("--") {
                return Ok(false);
            }
            debug!("Replaying line {}", line_no);
            channel.execute(&Statement::new(sql)).await?;
            Ok(true)
        }
        .await;

        match result {
            Ok(false) => {}
            Ok(true) => {
                stats.statements += 1;
                if stats.statements % batch_size == 0 {
                    channel.commit().await?;
                    channel.begin().await?;
                    stats.commits += 1;
                    info!("Applied {} statements", stats.statements);
                }
            }
            Err(e) => {
                if let Err(rollback) = channel.rollback().await {
                    warn!("Rollback failed: {}", rollback);
                }
                return Err(MergeError::phase(
                    format!("replaying patch statement at line {}", line_no),
                    e,
                ));
            }
        }
    }

    channel.commit().await?;
    stats.commits += 1;
    info!(
        "Patch applied: {} statements in {} commits",
        stats.statements, stats.commits
    );
    Ok(stats)
}
