//! Unique-index conflict resolution.
//!
//! A shifted source row that matches a destination row on a unique index is
//! the same entity. Its key is rewritten to the destination's key, the
//! cascading foreign keys carry the new key to its dependents, and the row
//! itself is excluded from the copy. Self-referencing columns have no
//! cascade and are rewritten alongside the key.

use tracing::{debug, info};

use crate::core::identifier::{qualify, quote};
use crate::core::schema::SchemaMap;
use crate::core::traits::{ExecutionChannel, Statement};
use crate::core::value::SqlValue;
use crate::error::{MergeError, Result};

use super::constraints::{execute_without_checks, SelfReferences};

fn conflict_query(
    table: &str,
    pk: &str,
    destination_db: &str,
    columns: &[String],
) -> Result<Statement> {
    let pk = quote(pk)?;
    let join = columns
        .iter()
        .map(|c| {
            let c = quote(c)?;
            Ok(format!("t1.{c} = t2.{c} AND t2.{c} IS NOT NULL"))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" AND ");
    Ok(Statement::new(format!(
        "SELECT t1.{pk} AS old_pk, t2.{pk} AS new_pk FROM {} t1 INNER JOIN {} t2 ON {}",
        quote(table)?,
        qualify(destination_db, table)?,
        join
    )))
}

fn remap_statement(table: &str, pk: &str, old_pk: &SqlValue, new_pk: &SqlValue) -> Result<Statement> {
    let pk = quote(pk)?;
    Ok(Statement::with_params(
        format!("UPDATE {} SET {pk} = ? WHERE {pk} = ?", quote(table)?),
        vec![new_pk.clone(), old_pk.clone()],
    ))
}

/// Repoint the self-referencing columns of `table` from `from` to `to`.
async fn remap_self_references(
    channel: &mut dyn ExecutionChannel,
    table: &str,
    self_refs: &SelfReferences,
    from: &SqlValue,
    to: &SqlValue,
) -> Result<()> {
    let statements = self_refs
        .columns(table)
        .into_iter()
        .map(|column| remap_statement(table, column, from, to))
        .collect::<Result<Vec<_>>>()?;
    if statements.is_empty() {
        return Ok(());
    }
    execute_without_checks(channel, &statements).await
}

/// One primary key moved onto a destination key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRemap {
    pub table: String,
    pub column: String,
    pub index: String,
    pub old_pk: SqlValue,
    pub new_pk: SqlValue,
}

fn conflict_error(
    table: &str,
    index: &str,
    old_pk: &SqlValue,
    new_pk: &SqlValue,
    source: MergeError,
) -> MergeError {
    MergeError::UniqueConflict {
        table: table.to_string(),
        index: index.to_string(),
        old_pk: old_pk.to_string(),
        new_pk: new_pk.to_string(),
        source: Box::new(source),
    }
}

/// Remap source keys onto destination keys for rows colliding on a unique index.
///
/// Only tables with a single-column primary key that also exist in the
/// destination are considered. Indexes are processed in name order, so a
/// later index sees keys already remapped by an earlier one. Remapped keys
/// are recorded in `pk_changed_to_resolve_unique_conflicts`. Returns the
/// remaps performed, in order.
pub async fn resolve_unique_conflicts(
    channel: &mut dyn ExecutionChannel,
    map: &mut SchemaMap,
    self_refs: &SelfReferences,
    destination: &SchemaMap,
    destination_db: &str,
) -> Result<Vec<KeyRemap>> {
    let mut remaps = Vec::new();
    for table in map.table_names() {
        let Some(descriptor) = map.get(&table) else {
            continue;
        };
        let Some(pk) = descriptor.single_pk().map(str::to_string) else {
            debug!("Skipping conflict check on {}: no single-column key", table);
            continue;
        };
        let Some(dest) = destination.get(&table) else {
            continue;
        };
        let indexes = descriptor.indexes.clone();

        for (index, columns) in indexes {
            if !dest.columns.contains_key(&pk)
                || columns.iter().any(|c| !dest.columns.contains_key(c))
            {
                debug!(
                    "Skipping unique index {}.{}: not present in destination",
                    table, index
                );
                continue;
            }

            let query = conflict_query(&table, &pk, destination_db, &columns)?;
            let rows = channel
                .execute(&query)
                .await
                .map_err(|e| conflict_error(&table, &index, &SqlValue::Null, &SqlValue::Null, e))?
                .rows;

            for row in rows {
                let old_pk = row.get("old_pk").cloned().unwrap_or(SqlValue::Null);
                let new_pk = row.get("new_pk").cloned().unwrap_or(SqlValue::Null);

                if old_pk != new_pk {
                    let stmt = remap_statement(&table, &pk, &old_pk, &new_pk)?;
                    channel
                        .execute(&stmt)
                        .await
                        .map_err(|e| conflict_error(&table, &index, &old_pk, &new_pk, e))?;
                    remap_self_references(channel, &table, self_refs, &old_pk, &new_pk)
                        .await
                        .map_err(|e| conflict_error(&table, &index, &old_pk, &new_pk, e))?;
                    remaps.push(KeyRemap {
                        table: table.clone(),
                        column: pk.clone(),
                        index: index.clone(),
                        old_pk: old_pk.clone(),
                        new_pk: new_pk.clone(),
                    });
                }

                if let Some(t) = map.get_mut(&table) {
                    if !t.pk_changed_to_resolve_unique_conflicts.contains(&new_pk) {
                        t.pk_changed_to_resolve_unique_conflicts.push(new_pk);
                    }
                }
            }
        }
    }
    if !remaps.is_empty() {
        info!("Remapped {} rows onto existing destination rows", remaps.len());
    }
    Ok(remaps)
}

/// Move remapped keys back to their shifted values, newest first.
///
/// Run before the reverse shift so those rows, their self references and,
/// through cascade, their dependents return to their original keys too.
pub async fn undo_remaps(
    channel: &mut dyn ExecutionChannel,
    remaps: &[KeyRemap],
    self_refs: &SelfReferences,
) -> Result<usize> {
    for remap in remaps.iter().rev() {
        let undo = |e| conflict_error(&remap.table, &remap.index, &remap.new_pk, &remap.old_pk, e);
        let stmt = remap_statement(&remap.table, &remap.column, &remap.new_pk, &remap.old_pk)?;
        channel.execute(&stmt).await.map_err(undo)?;
        remap_self_references(channel, &remap.table, self_refs, &remap.new_pk, &remap.old_pk)
            .await
            .map_err(undo)?;
    }
    Ok(remaps.len())
}
