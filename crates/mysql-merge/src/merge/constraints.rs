//! Foreign-key rewiring.
//!
//! Every physical foreign key is recreated with `ON UPDATE CASCADE` so that a
//! primary-key shift propagates to its dependents. Self-referencing keys are
//! dropped instead and tracked in [`SelfReferences`]; the engine refuses to
//! cascade into the table it is already updating, so those columns are shifted
//! explicitly and the constraints are restored once the merge is done.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::core::identifier::quote;
use crate::core::schema::{ForeignKeyRef, SchemaMap};
use crate::core::traits::{ExecutionChannel, Statement};
use crate::error::{MergeError, Result};

/// Self-referencing columns per table.
///
/// A column maps to the constraint that was dropped for it, or `None` when
/// the relation was only known logically and never existed physically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelfReferences {
    tables: BTreeMap<String, BTreeMap<String, Option<ForeignKeyRef>>>,
}

impl SelfReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, table: &str, column: &str, dropped: Option<ForeignKeyRef>) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), dropped);
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Self-referencing columns of `table`, in name order.
    pub fn columns(&self, table: &str) -> Vec<&str> {
        self.tables
            .get(table)
            .map(|cols| cols.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Constraints that were dropped and must be restored.
    pub fn dropped(&self) -> impl Iterator<Item = (&str, &str, &ForeignKeyRef)> {
        self.tables.iter().flat_map(|(table, cols)| {
            cols.iter().filter_map(move |(column, fk)| {
                fk.as_ref()
                    .map(|fk| (table.as_str(), column.as_str(), fk))
            })
        })
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Execute `statements` with foreign-key checks off, re-enabling them even
/// when a statement fails.
pub(crate) async fn execute_without_checks(
    channel: &mut dyn ExecutionChannel,
    statements: &[Statement],
) -> Result<()> {
    let result: Result<()> = async {
        channel.set_foreign_key_checks(false).await?;
        for stmt in statements {
            channel.execute(stmt).await?;
        }
        channel.set_foreign_key_checks(true).await
    }
    .await;

    if result.is_err() {
        if let Err(reenable) = channel.set_foreign_key_checks(true).await {
            warn!("Could not re-enable foreign key checks: {}", reenable);
        }
    }
    result
}

fn add_foreign_key_sql(
    table: &str,
    column: &str,
    fk: &ForeignKeyRef,
    cascade: bool,
) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}",
        quote(table)?,
        quote(&fk.constraint_name)?,
        quote(column)?,
        quote(&fk.parent)?,
        quote(&fk.parent_column)?,
        if cascade { " ON UPDATE CASCADE" } else { "" }
    ))
}

fn constraint_error(
    action: &'static str,
    table: &str,
    column: &str,
    fk: &ForeignKeyRef,
    source: MergeError,
) -> MergeError {
    MergeError::Constraint {
        action,
        constraint: fk.constraint_name.clone(),
        table: table.to_string(),
        column: column.to_string(),
        source: Box::new(source),
    }
}

/// Recreate every physical foreign key with `ON UPDATE CASCADE`.
///
/// Self-referencing keys are dropped and recorded in `self_refs`. Safe to
/// repeat on a schema that was already converted. Returns the number of
/// constraints recreated.
pub async fn convert_to_update_cascade(
    channel: &mut dyn ExecutionChannel,
    map: &SchemaMap,
    self_refs: &mut SelfReferences,
) -> Result<usize> {
    let mut converted = 0;
    for (table, descriptor) in map {
        for (column, fk) in &descriptor.fk_host {
            let result: Result<()> = async {
                let drop = format!(
                    "ALTER TABLE {} DROP FOREIGN KEY {}",
                    quote(table)?,
                    quote(&fk.constraint_name)?
                );
                channel.execute(&Statement::new(drop)).await?;

                if &fk.parent == table {
                    info!(
                        "---> self referencing table {} FK: {}",
                        table, fk.constraint_name
                    );
                    self_refs.record(table, column, Some(fk.clone()));
                    return Ok(());
                }

                let add = add_foreign_key_sql(table, column, fk, true)?;
                channel.execute(&Statement::new(add)).await?;
                converted += 1;
                Ok(())
            }
            .await;

            result.map_err(|e| {
                constraint_error("converting to ON UPDATE CASCADE", table, column, fk, e)
            })?;
        }
    }
    Ok(converted)
}

/// Create the pending relations as cascading constraints.
///
/// Each created relation moves from `fk_create` to `fk_host`. Pending
/// self-references are never created; they are recorded in `self_refs` so
/// the column still moves with its key. Returns the number created.
pub async fn materialize_pending(
    channel: &mut dyn ExecutionChannel,
    map: &mut SchemaMap,
    self_refs: &mut SelfReferences,
) -> Result<usize> {
    let mut created = 0;
    for table in map.table_names() {
        let pending: Vec<(String, ForeignKeyRef)> = match map.get(&table) {
            Some(t) => t.fk_create.clone().into_iter().collect(),
            None => continue,
        };

        for (column, fk) in pending {
            if fk.parent == table {
                debug!(
                    "Pending relation {}.{} is self referencing, not creating it",
                    table, column
                );
                self_refs.record(&table, &column, None);
                continue;
            }

            let sql = add_foreign_key_sql(&table, &column, &fk, true)
                .map_err(|e| constraint_error("creating", &table, &column, &fk, e))?;
            channel
                .execute(&Statement::new(sql))
                .await
                .map_err(|e| constraint_error("creating", &table, &column, &fk, e))?;

            if let Some(t) = map.get_mut(&table) {
                t.fk_create.remove(&column);
                t.fk_host.insert(column, fk);
            }
            created += 1;
        }
    }
    Ok(created)
}

/// Re-add the self-referencing constraints dropped by
/// [`convert_to_update_cascade`], under their original names.
pub async fn restore_self_references(
    channel: &mut dyn ExecutionChannel,
    self_refs: &SelfReferences,
) -> Result<usize> {
    let mut restored = 0;
    for (table, column, fk) in self_refs.dropped() {
        let sql = add_foreign_key_sql(table, column, fk, false)
            .map_err(|e| constraint_error("restoring", table, column, fk, e))?;
        channel
            .execute(&Statement::new(sql))
            .await
            .map_err(|e| constraint_error("restoring", table, column, fk, e))?;
        restored += 1;
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::fixtures::*;
    use crate::testing::RecordingChannel;

    #[tokio::test]
    async fn test_cascade_conversion_recreates_foreign_keys() {
        let map = shop();
        let mut channel = RecordingChannel::new();
        let mut self_refs = SelfReferences::new();

        let converted = convert_to_update_cascade(&mut channel, &map, &mut self_refs)
            .await
            .unwrap();

        assert_eq!(converted, 1);
        assert_eq!(
            channel.sql(),
            vec![
                "ALTER TABLE `categories` DROP FOREIGN KEY `fk_parent_id`",
                "ALTER TABLE `orders` DROP FOREIGN KEY `fk_user_id`",
                "ALTER TABLE `orders` ADD CONSTRAINT `fk_user_id` FOREIGN KEY (`user_id`) REFERENCES `users` (`id`) ON UPDATE CASCADE",
            ]
        );
    }

    #[tokio::test]
    async fn test_self_reference_is_dropped_and_recorded() {
        let map = shop();
        let mut channel = RecordingChannel::new();
        let mut self_refs = SelfReferences::new();

        convert_to_update_cascade(&mut channel, &map, &mut self_refs)
            .await
            .unwrap();

        assert!(self_refs.contains("categories"));
        assert!(!self_refs.contains("orders"));
        assert_eq!(self_refs.columns("categories"), vec!["parent_id"]);
        assert_eq!(channel.count("REFERENCES `categories`"), 0);
    }

    #[tokio::test]
    async fn test_conversion_repeats_cleanly_on_converted_schema() {
        let map = shop();
        let mut first = RecordingChannel::new();
        let mut self_refs = SelfReferences::new();
        convert_to_update_cascade(&mut first, &map, &mut self_refs)
            .await
            .unwrap();
        restore_self_references(&mut first, &self_refs).await.unwrap();

        // A second run over the same constraint names, now cascading and restored.
        let mut second = RecordingChannel::new();
        let mut rerun_refs = SelfReferences::new();
        let converted = convert_to_update_cascade(&mut second, &map, &mut rerun_refs)
            .await
            .unwrap();

        assert_eq!(converted, 1);
        assert_eq!(rerun_refs, self_refs);
        assert_eq!(
            second.sql(),
            first.sql()[..3].to_vec(),
            "a re-run drops and re-adds the same constraints"
        );
        assert_eq!(
            first.sql()[3],
            "ALTER TABLE `categories` ADD CONSTRAINT `fk_parent_id` FOREIGN KEY (`parent_id`) REFERENCES `categories` (`id`)"
        );
        assert!(second.sql()[0].ends_with("DROP FOREIGN KEY `fk_parent_id`"));
    }

    #[tokio::test]
    async fn test_checks_come_back_on_after_failure() {
        let mut channel = RecordingChannel::new().fail("UPDATE", "Out of range value");

        let err = execute_without_checks(
            &mut channel,
            &[Statement::new("UPDATE `categories` SET `parent_id` = 1")],
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MergeError::EngineWarning { .. }));
        assert_eq!(channel.sql()[0], "SET FOREIGN_KEY_CHECKS = 0");
        assert_eq!(
            channel.sql().last().map(String::as_str),
            Some("SET FOREIGN_KEY_CHECKS = 1")
        );
    }

    #[tokio::test]
    async fn test_conversion_failure_names_the_constraint() {
        let map = shop();
        let mut channel =
            RecordingChannel::new().fail("DROP FOREIGN KEY `fk_user_id`", "Can't DROP 'fk_user_id'");
        let mut self_refs = SelfReferences::new();

        let err = convert_to_update_cascade(&mut channel, &map, &mut self_refs)
            .await
            .unwrap_err();

        match err {
            MergeError::Constraint {
                constraint,
                table,
                column,
                ..
            } => {
                assert_eq!(constraint, "fk_user_id");
                assert_eq!(table, "orders");
                assert_eq!(column, "user_id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_materialize_promotes_pending_relations() {
        let mut map = shop();
        map.insert("coupons", table(&["id"]));
        map.get_mut("orders").unwrap().columns.insert(
            "coupon_id".into(),
            crate::core::schema::ColumnInfo::new("int(11)", 4),
        );
        map.get_mut("orders").unwrap().fk_create.insert(
            "coupon_id".into(),
            ForeignKeyRef::new("orders_coupon_id_dbmerge", "coupons", "id"),
        );
        let mut channel = RecordingChannel::new();
        let mut self_refs = SelfReferences::new();

        let created = materialize_pending(&mut channel, &mut map, &mut self_refs)
            .await
            .unwrap();

        assert_eq!(created, 1);
        assert_eq!(
            channel.sql(),
            vec![
                "ALTER TABLE `orders` ADD CONSTRAINT `orders_coupon_id_dbmerge` FOREIGN KEY (`coupon_id`) REFERENCES `coupons` (`id`) ON UPDATE CASCADE"
            ]
        );
        let orders = map.get("orders").unwrap();
        assert!(orders.fk_create.is_empty());
        assert_eq!(
            orders.fk_host.get("coupon_id").unwrap().constraint_name,
            "orders_coupon_id_dbmerge"
        );
    }

    #[tokio::test]
    async fn test_pending_self_reference_is_not_created() {
        let mut map = SchemaMap::new();
        let mut t = table(&["id", "manager_id"]);
        t.fk_create.insert(
            "manager_id".into(),
            ForeignKeyRef::new("staff_manager_id_dbmerge", "staff", "id"),
        );
        map.insert("staff", t);
        let mut channel = RecordingChannel::new();
        let mut self_refs = SelfReferences::new();

        let created = materialize_pending(&mut channel, &mut map, &mut self_refs)
            .await
            .unwrap();

        assert_eq!(created, 0);
        assert!(channel.sql().is_empty());
        assert_eq!(self_refs.columns("staff"), vec!["manager_id"]);
        assert_eq!(self_refs.dropped().count(), 0);
    }

    #[tokio::test]
    async fn test_restore_re_adds_dropped_self_references() {
        let mut self_refs = SelfReferences::new();
        self_refs.record(
            "categories",
            "parent_id",
            Some(ForeignKeyRef::new("fk_parent_id", "categories", "id")),
        );
        self_refs.record("staff", "manager_id", None);
        let mut channel = RecordingChannel::new();

        let restored = restore_self_references(&mut channel, &self_refs)
            .await
            .unwrap();

        assert_eq!(restored, 1);
        assert_eq!(
            channel.sql(),
            vec![
                "ALTER TABLE `categories` ADD CONSTRAINT `fk_parent_id` FOREIGN KEY (`parent_id`) REFERENCES `categories` (`id`)"
            ]
        );
    }
}
