//! Reference-table deduplication.
//!
//! Lookup tables are expected to hold the same rows everywhere. They are
//! compared against the destination and, when identical, dropped from both
//! schema maps so no later phase shifts or copies them.

use tracing::{info, warn};

use crate::config::MergeConfig;
use crate::core::identifier::{qualify, quote};
use crate::core::schema::{SchemaMap, TableDescriptor};
use crate::core::traits::{ExecutionChannel, Statement};
use crate::error::{MergeError, Result};

/// Count of source rows with no identical destination counterpart.
///
/// Rows are joined on the full primary key; a row is incompatible when the
/// destination row is missing or any overlapping column differs.
fn incompatible_rows_query(
    table: &str,
    source: &TableDescriptor,
    destination: &TableDescriptor,
    destination_db: &str,
) -> Result<Statement> {
    if source.primary.is_empty() {
        return Err(MergeError::schema(
            table,
            "reference table has no primary key to compare on",
        ));
    }
    if let Some(missing) = source
        .primary
        .iter()
        .find(|c| !destination.columns.contains_key(*c))
    {
        return Err(MergeError::schema(
            table,
            format!("primary key column `{}` is missing in the destination", missing),
        ));
    }

    let join = source
        .primary
        .iter()
        .map(|c| {
            let c = quote(c)?;
            Ok(format!("s.{c} = d.{c}"))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" AND ");

    let mut differs = vec![format!("d.{} IS NULL", quote(&source.primary[0])?)];
    for column in source.overlapping_columns(destination) {
        if source.primary.contains(&column) {
            continue;
        }
        let c = quote(&column)?;
        differs.push(format!("NOT (s.{c} <=> d.{c})"));
    }

    Ok(Statement::new(format!(
        "SELECT COUNT(*) AS incompatible FROM {} s LEFT JOIN {} d ON {} WHERE {}",
        quote(table)?,
        qualify(destination_db, table)?,
        join,
        differs.join(" OR ")
    )))
}

/// Verify every configured reference table and remove it from both maps.
///
/// A table missing on either side is skipped with a warning. Any differing
/// row fails the run with [`MergeError::IncompatibleReferenceTable`].
/// Returns the tables removed.
pub async fn deduplicate_reference_tables(
    channel: &mut dyn ExecutionChannel,
    source: &mut SchemaMap,
    destination: &mut SchemaMap,
    destination_db: &str,
    config: &MergeConfig,
) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for table in &config.reference_tables {
        let (Some(src), Some(dst)) = (source.get(table), destination.get(table)) else {
            warn!(
                "Reference table {} is missing in the source or destination, skipping",
                table
            );
            continue;
        };

        let query = incompatible_rows_query(table, src, dst, destination_db)?;
        let outcome = channel.execute(&query).await?;
        let incompatible = outcome
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                MergeError::schema(table.as_str(), "could not read the count of differing rows")
            })?;

        if incompatible > 0 {
            return Err(MergeError::IncompatibleReferenceTable {
                table: table.clone(),
                rows: incompatible as u64,
            });
        }

        source.remove(table);
        destination.remove(table);
        info!("Reference table {} matches the destination, not merging it", table);
        removed.push(table.clone());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::fixtures::*;
    use crate::core::value::SqlValue;
    use crate::testing::{row, RecordingChannel};

    fn maps() -> (SchemaMap, SchemaMap) {
        let mut source = shop();
        source.insert("countries", with_text(table(&["id"]), "name"));
        let mut destination = shop();
        destination.insert("countries", with_text(table(&["id"]), "name"));
        (source, destination)
    }

    fn config() -> MergeConfig {
        let mut config = MergeConfig::default();
        config.reference_tables.insert("countries".into());
        config
    }

    fn count(n: i64) -> Vec<crate::core::traits::Row> {
        vec![row(&[("incompatible", SqlValue::Int(n))])]
    }

    #[tokio::test]
    async fn test_identical_reference_table_is_removed_from_both_maps() {
        let (mut source, mut destination) = maps();
        let mut channel = RecordingChannel::new().on_rows("COUNT(*)", count(0));

        let removed =
            deduplicate_reference_tables(&mut channel, &mut source, &mut destination, "dest", &config())
                .await
                .unwrap();

        assert_eq!(removed, vec!["countries"]);
        assert!(!source.contains("countries"));
        assert!(!destination.contains("countries"));
        assert_eq!(
            channel.log[0].sql,
            "SELECT COUNT(*) AS incompatible FROM `countries` s LEFT JOIN `dest`.`countries` d ON s.`id` = d.`id` WHERE d.`id` IS NULL OR NOT (s.`name` <=> d.`name`)"
        );
    }

    #[tokio::test]
    async fn test_differing_reference_table_fails_the_run() {
        let (mut source, mut destination) = maps();
        let mut channel = RecordingChannel::new().on_rows("COUNT(*)", count(1));

        let err =
            deduplicate_reference_tables(&mut channel, &mut source, &mut destination, "dest", &config())
                .await
                .unwrap_err();

        assert!(matches!(
            err,
            MergeError::IncompatibleReferenceTable { ref table, rows: 1 } if table == "countries"
        ));
        assert!(source.contains("countries"));
    }

    #[tokio::test]
    async fn test_missing_reference_table_is_skipped() {
        let (mut source, mut destination) = maps();
        destination.remove("countries");
        let mut channel = RecordingChannel::new();

        let removed =
            deduplicate_reference_tables(&mut channel, &mut source, &mut destination, "dest", &config())
                .await
                .unwrap();

        assert!(removed.is_empty());
        assert!(channel.sql().is_empty());
        assert!(source.contains("countries"));
    }

    #[tokio::test]
    async fn test_unreadable_count_keeps_the_table() {
        let (mut source, mut destination) = maps();
        let mut channel = RecordingChannel::new();

        let err =
            deduplicate_reference_tables(&mut channel, &mut source, &mut destination, "dest", &config())
                .await
                .unwrap_err();

        assert!(matches!(err, MergeError::SchemaInconsistency { ref table, .. } if table == "countries"));
        assert!(source.contains("countries"));
        assert!(destination.contains("countries"));
    }

    #[test]
    fn test_reference_table_without_key_is_inconsistent() {
        let mut src = with_text(table(&["id"]), "name");
        src.primary.clear();
        let err = incompatible_rows_query("countries", &src, &src.clone(), "dest").unwrap_err();
        assert!(matches!(err, MergeError::SchemaInconsistency { .. }));
    }
}
