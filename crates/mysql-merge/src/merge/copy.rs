//! Copying rows into the destination.
//!
//! Rows move either with one cross-database `INSERT ... SELECT` per table, or
//! are rendered into a [`PatchScript`] to be replayed against the destination
//! later.

use std::io::Write;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::MergeConfig;
use crate::core::identifier::{qualify, quote, quote_list};
use crate::core::schema::{SchemaMap, TableDescriptor};
use crate::core::traits::{ExecutionChannel, Statement};
use crate::core::value::SqlValue;
use crate::error::{MergeError, Result};

use super::patch::{InsertComposer, PatchScript};

/// Totals for one copy phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CopyStats {
    pub tables_copied: usize,
    pub tables_skipped: Vec<String>,
    /// Rows inserted, or rendered into the patch script.
    pub rows: u64,
}

/// `SELECT` of the overlapping columns, minus ignored and remapped keys.
fn select_statement(
    source_db: &str,
    table: &str,
    descriptor: &TableDescriptor,
    columns: &[String],
    config: &MergeConfig,
) -> Result<Statement> {
    let mut sql = format!(
        "SELECT {} FROM {}",
        quote_list(columns)?,
        qualify(source_db, table)?
    );

    let mut excluded: Vec<SqlValue> = config
        .ignored_ids(table)
        .iter()
        .copied()
        .map(SqlValue::Int)
        .collect();
    excluded.extend(
        descriptor
            .pk_changed_to_resolve_unique_conflicts
            .iter()
            .cloned(),
    );

    if !excluded.is_empty() {
        match descriptor.primary.first() {
            Some(pk) => {
                sql.push_str(&format!(
                    " WHERE {} NOT IN ({})",
                    quote(pk)?,
                    vec!["?"; excluded.len()].join(", ")
                ));
            }
            None => {
                warn!(
                    "Table {} has no primary key, excluded rows will be copied",
                    table
                );
                excluded.clear();
            }
        }
    }
    Ok(Statement::with_params(sql, excluded))
}

/// Copy every table present on both sides.
///
/// With `patch`, rows are streamed and rendered in batches of
/// `config.batch_size`; the script is wrapped in foreign-key check toggles.
/// Without it, each table is copied with one `INSERT ... SELECT` into
/// `destination_db`.
pub async fn copy_data<W: Write + Send>(
    channel: &mut dyn ExecutionChannel,
    source: &SchemaMap,
    destination: &SchemaMap,
    destination_db: &str,
    config: &MergeConfig,
    mut patch: Option<&mut PatchScript<W>>,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();

    let diff = source.non_overlapping_tables(destination);
    if !diff.only_in_source.is_empty() {
        warn!(
            "----> Skipping tables missing in the destination database: {:?}",
            diff.only_in_source
        );
    }
    if !diff.only_in_destination.is_empty() {
        info!(
            "----> Tables only present in the destination database: {:?}",
            diff.only_in_destination
        );
    }
    stats.tables_skipped = diff.only_in_source;

    if let Some(script) = patch.as_deref_mut() {
        script.write_line("SET FOREIGN_KEY_CHECKS = 0;")?;
    }

    let source_db = channel.database().to_string();
    for (table, descriptor) in source {
        let Some(dest) = destination.get(table) else {
            continue;
        };

        let columns_diff = descriptor.non_overlapping_columns(dest);
        if !columns_diff.is_empty() {
            warn!(
                "----> Skipping columns of {} missing on one side: source only {:?}, destination only {:?}",
                table, columns_diff.only_in_source, columns_diff.only_in_destination
            );
        }

        let columns = descriptor.overlapping_columns(dest);
        if columns.is_empty() {
            return Err(MergeError::schema(
                table,
                "no intersecting columns between source and destination",
            ));
        }

        let select = select_statement(&source_db, table, descriptor, &columns, config)?;
        let rows = match patch.as_deref_mut() {
            Some(script) => {
                render_table(channel, table, descriptor, &columns, &select, script, config.batch_size)
                    .await
            }
            None => insert_table(channel, table, &columns, &select, destination_db).await,
        }
        .map_err(|e| MergeError::copy(table, e))?;

        info!("Copied {} rows of {}", rows, table);
        stats.rows += rows;
        stats.tables_copied += 1;
    }

    if let Some(script) = patch.as_deref_mut() {
        script.write_line("SET FOREIGN_KEY_CHECKS = 1;")?;
    }
    Ok(stats)
}

async fn insert_table(
    channel: &mut dyn ExecutionChannel,
    table: &str,
    columns: &[String],
    select: &Statement,
    destination_db: &str,
) -> Result<u64> {
    let insert = Statement::with_params(
        format!(
            "INSERT INTO {} ({}) {}",
            qualify(destination_db, table)?,
            quote_list(columns)?,
            select.sql
        ),
        select.params.clone(),
    );
    Ok(channel.execute(&insert).await?.affected_rows)
}

async fn render_table<W: Write + Send>(
    channel: &mut dyn ExecutionChannel,
    table: &str,
    descriptor: &TableDescriptor,
    columns: &[String],
    select: &Statement,
    script: &mut PatchScript<W>,
    batch_size: usize,
) -> Result<u64> {
    let batch_size = batch_size.max(1);
    let mut composer = InsertComposer::new(table, columns, descriptor)?;

    let rows = channel
        .stream(select, &mut |row| {
            composer.add_row(&row);
            if composer.len() >= batch_size {
                if let Some(statement) = composer.take_statement() {
                    script.write_line(&statement)?;
                }
            }
            Ok(())
        })
        .await?;

    if let Some(statement) = composer.take_statement() {
        script.write_line(&statement)?;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::fixtures::*;
    use crate::core::traits::{ExecutionMode, QueryOutcome};
    use crate::testing::{row, RecordingChannel};

    fn destination() -> SchemaMap {
        let mut map = shop();
        map.remove("categories");
        map
    }

    #[tokio::test]
    async fn test_direct_copy_inserts_overlapping_columns() {
        let mut source = shop();
        source
            .get_mut("users")
            .unwrap()
            .columns
            .insert("legacy".into(), crate::core::schema::ColumnInfo::new("int", 9));
        let mut channel = RecordingChannel::new().on("INSERT", QueryOutcome::affected(4));

        let stats = copy_data::<Vec<u8>>(
            &mut channel,
            &source,
            &destination(),
            "dest",
            &MergeConfig::default(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            channel.sql(),
            vec![
                "INSERT INTO `dest`.`orders` (`id`, `user_id`, `total`) SELECT `id`, `user_id`, `total` FROM `source_db`.`orders`",
                "INSERT INTO `dest`.`users` (`id`, `name`) SELECT `id`, `name` FROM `source_db`.`users`",
            ]
        );
        assert_eq!(stats.tables_copied, 2);
        assert_eq!(stats.tables_skipped, vec!["categories"]);
        assert_eq!(stats.rows, 8);
    }

    #[tokio::test]
    async fn test_ignored_and_remapped_keys_are_excluded() {
        let mut source = destination();
        source
            .get_mut("users")
            .unwrap()
            .pk_changed_to_resolve_unique_conflicts
            .push(SqlValue::Int(17));
        let mut config = MergeConfig::default();
        config.ids_to_ignore.insert("users".into(), vec![1]);
        let mut channel = RecordingChannel::new();

        copy_data::<Vec<u8>>(&mut channel, &source, &destination(), "dest", &config, None)
            .await
            .unwrap();

        let users = &channel.log[1];
        assert!(users.sql.ends_with("FROM `source_db`.`users` WHERE `id` NOT IN (?, ?)"));
        assert_eq!(users.params, vec![SqlValue::Int(1), SqlValue::Int(17)]);
    }

    #[tokio::test]
    async fn test_patch_mode_renders_batched_inserts() {
        let mut source = SchemaMap::new();
        source.insert("users", with_text(table(&["id"]), "name"));
        let destination = source.clone();
        let mut config = MergeConfig::default();
        config.batch_size = 2;
        let mut channel = RecordingChannel::with_mode(ExecutionMode::ImportFile).on_rows(
            "SELECT",
            (1..=3)
                .map(|i| {
                    row(&[
                        ("id", SqlValue::Int(1_000_000 + i)),
                        ("name", SqlValue::Text(format!("user {}", i))),
                    ])
                })
                .collect(),
        );
        let mut script = PatchScript::new(Vec::new());

        let stats = copy_data(
            &mut channel,
            &source,
            &destination,
            "dest",
            &config,
            Some(&mut script),
        )
        .await
        .unwrap();

        assert_eq!(stats.rows, 3);
        assert_eq!(channel.count("INSERT"), 0);
        let text = String::from_utf8(script.finish().unwrap()).unwrap();
        assert_eq!(
            text,
            "SET FOREIGN_KEY_CHECKS = 0;\n\
             INSERT INTO `users` (`id`, `name`) VALUES(1000001, 'user 1'),(1000002, 'user 2');\n\
             INSERT INTO `users` (`id`, `name`) VALUES(1000003, 'user 3');\n\
             SET FOREIGN_KEY_CHECKS = 1;\n"
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_failure_carries_rerun_hint() {
        let source = destination();
        let mut channel = RecordingChannel::new()
            .fail("INSERT INTO `dest`.`orders`", "Duplicate entry '1000001' for key 'PRIMARY'");

        let err = copy_data::<Vec<u8>>(
            &mut channel,
            &source,
            &destination(),
            "dest",
            &MergeConfig::default(),
            None,
        )
        .await
        .unwrap_err();

        match err {
            MergeError::Copy { table, hint, .. } => {
                assert_eq!(table, "orders");
                assert_eq!(hint, Some(crate::error::DUPLICATE_RUN_HINT));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_intersecting_columns_is_a_schema_error() {
        let mut source = SchemaMap::new();
        source.insert("users", table(&["id"]));
        let mut destination = SchemaMap::new();
        destination.insert("users", table(&["uid"]));
        let mut channel = RecordingChannel::new();

        let err = copy_data::<Vec<u8>>(
            &mut channel,
            &source,
            &destination,
            "dest",
            &MergeConfig::default(),
            None,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MergeError::SchemaInconsistency { .. }));
    }
}
