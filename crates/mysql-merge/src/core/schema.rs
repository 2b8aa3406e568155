//! Schema map: the structural description of one database consumed by the merge.
//!
//! A [`SchemaMap`] is produced once per database by the introspector and then
//! owned by a single pipeline run. The constraint transformer and the
//! reference-table deduplicator mutate it in place; nothing reloads it mid-run.
//!
//! # Iteration order
//!
//! Tables, columns, foreign keys and indexes are stored in `BTreeMap`s and are
//! therefore visited in lexicographic order of their names. Every component
//! relies on this order: it decides which index wins a conflict tie-break and
//! the order tables appear in a patch script. Column lists handed to SQL use
//! the columns' ordinal position instead (see [`TableDescriptor::ordered_columns`]).

use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use tracing::{debug, warn};

use super::value::SqlValue;

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Declared SQL type, e.g. `int(11) unsigned`.
    pub data_type: String,
    /// Whether values are integers (rendered unquoted in patch scripts).
    pub is_integer: bool,
    /// 1-based position of the column in the table.
    pub ordinal: u32,
}

impl ColumnInfo {
    pub fn new(data_type: impl Into<String>, ordinal: u32) -> Self {
        let data_type = data_type.into();
        let is_integer = is_integer_type(&data_type);
        Self {
            data_type,
            is_integer,
            ordinal,
        }
    }
}

/// Whether a MySQL column type holds integers.
pub fn is_integer_type(data_type: &str) -> bool {
    let base = data_type
        .trim()
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .to_lowercase();
    matches!(
        base.as_str(),
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
    )
}

/// A foreign-key relation from a host column to a parent column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub constraint_name: String,
    pub parent: String,
    pub parent_column: String,
}

impl ForeignKeyRef {
    pub fn new(
        constraint_name: impl Into<String>,
        parent: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            constraint_name: constraint_name.into(),
            parent: parent.into(),
            parent_column: parent_column.into(),
        }
    }
}

/// Table metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Columns by name.
    pub columns: BTreeMap<String, ColumnInfo>,

    /// Primary key columns, in key order.
    pub primary: Vec<String>,

    /// Physical foreign keys, by host column.
    pub fk_host: BTreeMap<String, ForeignKeyRef>,

    /// Relations known by convention but not yet backed by a constraint, by host column.
    pub fk_create: BTreeMap<String, ForeignKeyRef>,

    /// Unique indexes (other than the primary key) by name.
    pub indexes: BTreeMap<String, Vec<String>>,

    /// Primary-key values remapped onto destination rows; excluded from the copy.
    #[serde(skip)]
    pub pk_changed_to_resolve_unique_conflicts: Vec<SqlValue>,
}

impl TableDescriptor {
    /// Column names in ordinal order.
    pub fn ordered_columns(&self) -> Vec<String> {
        let mut cols: Vec<(&String, &ColumnInfo)> = self.columns.iter().collect();
        cols.sort_by_key(|(_, info)| info.ordinal);
        cols.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// The primary key column when the key is not composite.
    pub fn single_pk(&self) -> Option<&str> {
        match self.primary.as_slice() {
            [pk] => Some(pk.as_str()),
            _ => None,
        }
    }

    pub fn is_integer_column(&self, column: &str) -> bool {
        self.columns.get(column).is_some_and(|c| c.is_integer)
    }

    /// Columns present in both tables, in this table's ordinal order.
    pub fn overlapping_columns(&self, other: &TableDescriptor) -> Vec<String> {
        self.ordered_columns()
            .into_iter()
            .filter(|c| other.columns.contains_key(c))
            .collect()
    }

    /// Columns present on one side only.
    pub fn non_overlapping_columns(&self, other: &TableDescriptor) -> Difference {
        Difference {
            only_in_source: self
                .ordered_columns()
                .into_iter()
                .filter(|c| !other.columns.contains_key(c))
                .collect(),
            only_in_destination: other
                .ordered_columns()
                .into_iter()
                .filter(|c| !self.columns.contains_key(c))
                .collect(),
        }
    }
}

/// Names present on only one side of a comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Difference {
    pub only_in_source: Vec<String>,
    pub only_in_destination: Vec<String>,
}

impl Difference {
    pub fn is_empty(&self) -> bool {
        self.only_in_source.is_empty() && self.only_in_destination.is_empty()
    }
}

/// Mapping from table name to table metadata for one database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaMap {
    tables: BTreeMap<String, TableDescriptor>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, table: TableDescriptor) {
        self.tables.insert(name.into(), table);
    }

    pub fn get(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TableDescriptor> {
        self.tables.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TableDescriptor> {
        self.tables.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, TableDescriptor> {
        self.tables.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, TableDescriptor> {
        self.tables.iter_mut()
    }

    /// Table names in processing order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Tables present on one side only.
    pub fn non_overlapping_tables(&self, other: &SchemaMap) -> Difference {
        Difference {
            only_in_source: self
                .tables
                .keys()
                .filter(|t| !other.contains(t))
                .cloned()
                .collect(),
            only_in_destination: other
                .tables
                .keys()
                .filter(|t| !self.contains(t))
                .cloned()
                .collect(),
        }
    }

    /// Infer pending relations from the `<parent>_id` naming convention.
    ///
    /// A column qualifies when it has no physical foreign key, is not the
    /// table's own primary key, and `<parent>` names a table with a
    /// single-column primary key. Returns the number of relations added.
    pub fn infer_pending_relations(&mut self) -> usize {
        let parents: BTreeMap<String, (String, String)> = self
            .tables
            .iter()
            .filter_map(|(name, t)| {
                t.single_pk()
                    .map(|pk| (name.to_lowercase(), (name.clone(), pk.to_string())))
            })
            .collect();

        let mut added = 0;
        for (table_name, table) in self.tables.iter_mut() {
            let candidates: Vec<String> = table.columns.keys().cloned().collect();
            for column in candidates {
                if table.fk_host.contains_key(&column)
                    || table.fk_create.contains_key(&column)
                    || table.primary.contains(&column)
                {
                    continue;
                }
                let lower = column.to_lowercase();
                let Some(stem) = lower.strip_suffix("_id") else {
                    continue;
                };
                let Some((parent, parent_column)) = parents.get(stem) else {
                    continue;
                };
                debug!(
                    "Pending relation {}.{} -> {}.{}",
                    table_name, column, parent, parent_column
                );
                table.fk_create.insert(
                    column.clone(),
                    ForeignKeyRef::new(
                        super::identifier::pending_constraint_name(table_name, &column),
                        parent.clone(),
                        parent_column.clone(),
                    ),
                );
                added += 1;
            }
        }
        added
    }

    /// Reconcile pending relations with the live schema.
    ///
    /// Drops pending entries whose column already carries a physical foreign
    /// key (an earlier, interrupted run may have created it) and entries whose
    /// parent table or column no longer exists. Safe to call repeatedly.
    pub fn reapply_fk_mapping(&mut self) -> usize {
        let existing: BTreeMap<String, Vec<String>> = self
            .tables
            .iter()
            .map(|(name, t)| (name.clone(), t.columns.keys().cloned().collect()))
            .collect();

        let mut removed = 0;
        for (table_name, table) in self.tables.iter_mut() {
            let fk_host = &table.fk_host;
            table.fk_create.retain(|column, fk| {
                if fk_host.contains_key(column) {
                    debug!(
                        "FK on {}.{} already materialized, skipping",
                        table_name, column
                    );
                    removed += 1;
                    return false;
                }
                let parent_ok = existing
                    .get(&fk.parent)
                    .is_some_and(|cols| cols.contains(&fk.parent_column));
                if !parent_ok {
                    warn!(
                        "Dropping pending FK {}.{}: parent {}.{} does not exist",
                        table_name, column, fk.parent, fk.parent_column
                    );
                    removed += 1;
                }
                parent_ok
            });
        }
        removed
    }
}

impl<'a> IntoIterator for &'a SchemaMap {
    type Item = (&'a String, &'a TableDescriptor);
    type IntoIter = btree_map::Iter<'a, String, TableDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tables.iter()
    }
}

impl FromIterator<(String, TableDescriptor)> for SchemaMap {
    fn from_iter<I: IntoIterator<Item = (String, TableDescriptor)>>(iter: I) -> Self {
        Self {
            tables: iter.into_iter().collect(),
        }
    }
}
