//! Orphaned row repair.
//!
//! A child row whose foreign key points at a missing parent is either pointed
//! at a replacement value or, when the engine rejects that, deleted.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::MergeConfig;
use crate::core::identifier::quote;
use crate::core::schema::{ForeignKeyRef, SchemaMap};
use crate::core::traits::{ExecutionChannel, Statement};
use crate::error::{MergeError, Result};

/// How the orphans of one relation were repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum OrphanRepair {
    /// Foreign key set to the configured replacement value.
    Replaced { rows: u64 },
    /// Replacement rejected; orphaned rows deleted.
    Deleted { rows: u64 },
}

impl OrphanRepair {
    pub fn rows(&self) -> u64 {
        match self {
            OrphanRepair::Replaced { rows } | OrphanRepair::Deleted { rows } => *rows,
        }
    }
}

/// Repair applied to one child column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanReport {
    pub table: String,
    pub column: String,
    #[serde(flatten)]
    pub repair: OrphanRepair,
}

struct Relation<'a> {
    child: String,
    child_column: String,
    parent: String,
    parent_column: String,
    fk: &'a ForeignKeyRef,
}

impl<'a> Relation<'a> {
    fn new(table: &str, column: &str, fk: &'a ForeignKeyRef) -> Result<Self> {
        Ok(Self {
            child: quote(table)?,
            child_column: quote(column)?,
            parent: quote(&fk.parent)?,
            parent_column: quote(&fk.parent_column)?,
            fk,
        })
    }

    fn orphan_join(&self) -> String {
        format!(
            "{} c LEFT JOIN {} p ON c.{} = p.{}",
            self.child, self.parent, self.child_column, self.parent_column
        )
    }

    fn orphan_filter(&self) -> String {
        format!(
            "p.{} IS NULL AND c.{} IS NOT NULL",
            self.parent_column, self.child_column
        )
    }

    fn replace_statement(&self, config: &MergeConfig, column: &str) -> Statement {
        Statement::with_params(
            format!(
                "UPDATE {} SET c.{} = ? WHERE {}",
                self.orphan_join(),
                self.child_column,
                self.orphan_filter()
            ),
            vec![config.orphan_replacement(column)],
        )
    }

    fn delete_statement(&self) -> Statement {
        Statement::new(format!(
            "DELETE c FROM {} WHERE {}",
            self.orphan_join(),
            self.orphan_filter()
        ))
    }
}

/// Repair the orphaned rows of every physical relation.
///
/// Returns one report per relation that had orphans. Fails only when both
/// strategies fail for a relation.
pub async fn repair_orphans(
    channel: &mut dyn ExecutionChannel,
    map: &SchemaMap,
    config: &MergeConfig,
) -> Result<Vec<OrphanReport>> {
    let mut reports = Vec::new();
    for (table, descriptor) in map {
        for (column, fk) in &descriptor.fk_host {
            let relation = Relation::new(table, column, fk)?;
            let repair = repair_relation(channel, &relation, config, table, column).await?;
            if repair.rows() > 0 {
                info!(
                    "Repaired {} orphaned rows in {}.{} ({:?})",
                    repair.rows(),
                    table,
                    column,
                    repair
                );
                reports.push(OrphanReport {
                    table: table.clone(),
                    column: column.clone(),
                    repair,
                });
            }
        }
    }
    Ok(reports)
}

async fn repair_relation(
    channel: &mut dyn ExecutionChannel,
    relation: &Relation<'_>,
    config: &MergeConfig,
    table: &str,
    column: &str,
) -> Result<OrphanRepair> {
    let update_error = match channel
        .execute(&relation.replace_statement(config, column))
        .await
    {
        Ok(outcome) => {
            return Ok(OrphanRepair::Replaced {
                rows: outcome.affected_rows,
            })
        }
        Err(e) => e,
    };

    warn!(
        "Replacing orphans in {}.{} (FK {}) failed, deleting them instead: {}",
        table, column, relation.fk.constraint_name, update_error
    );

    match channel.execute(&relation.delete_statement()).await {
        Ok(outcome) => Ok(OrphanRepair::Deleted {
            rows: outcome.affected_rows,
        }),
        Err(delete_error) => Err(MergeError::OrphanRepair {
            table: table.to_string(),
            column: column.to_string(),
            update_error: update_error.to_string(),
            delete_error: delete_error.to_string(),
        }),
    }
}
