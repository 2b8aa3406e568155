//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::core::value::SqlValue;

/// Key under `increment_step` holding the fallback step.
pub const DEFAULT_STEP_KEY: &str = "default";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database every source is merged into.
    pub destination: DatabaseConfig,

    /// Source databases, merged in order. The counter of a source is its position + 1.
    pub sources: Vec<DatabaseConfig>,

    /// Merge behavior configuration.
    #[serde(default)]
    pub merge: MergeConfig,
}

/// Connection settings for one MySQL database.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 3306).
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database (schema) name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode: disable, prefer, require, verify-ca, verify-full (default: "prefer").
    #[serde(default = "default_prefer")]
    pub ssl_mode: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl DatabaseConfig {
    /// Whether both configs point at the same database on the same server.
    pub fn same_database(&self, other: &DatabaseConfig) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.database == other.database
    }
}

/// Merge behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Primary-key increment step, per table, with a `default` entry.
    #[serde(default = "default_increment_step")]
    pub increment_step: BTreeMap<String, i64>,

    /// Primary-key values that are never shifted nor copied, per table.
    #[serde(default)]
    pub ids_to_ignore: BTreeMap<String, Vec<i64>>,

    /// Replacement values for orphaned foreign keys.
    #[serde(default)]
    pub orphaned_rows_update_values: OrphanReplacements,

    /// Lookup tables expected to be identical everywhere; verified and never merged.
    #[serde(default)]
    pub reference_tables: BTreeSet<String>,

    /// Tables whose keys are never shifted, in either direction.
    #[serde(default)]
    pub shift_exempt_tables: BTreeSet<String>,

    /// Leave the source shifted after the copy (skips the reverse shift).
    #[serde(default)]
    pub skip_ids_decrement: bool,

    /// Rows per INSERT statement in the patch script.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Statements per transaction when replaying a patch script.
    #[serde(default = "default_import_batch_size")]
    pub import_batch_size: usize,

    /// Statements executed on the source before the merge starts.
    #[serde(default)]
    pub preprocess_queries: Vec<String>,

    /// Directory patch scripts are written to.
    #[serde(default = "default_patch_dir")]
    pub patch_dir: String,

    /// Infer `<parent>_id` columns as pending foreign keys.
    #[serde(default = "default_true")]
    pub convention_fks: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            increment_step: default_increment_step(),
            ids_to_ignore: BTreeMap::new(),
            orphaned_rows_update_values: OrphanReplacements::default(),
            reference_tables: BTreeSet::new(),
            shift_exempt_tables: BTreeSet::new(),
            skip_ids_decrement: false,
            batch_size: default_batch_size(),
            import_batch_size: default_import_batch_size(),
            preprocess_queries: Vec::new(),
            patch_dir: default_patch_dir(),
            convention_fks: true,
        }
    }
}

impl MergeConfig {
    /// Configured step for `table`, falling back to the `default` entry.
    pub fn increment_step_for(&self, table: &str) -> i64 {
        self.increment_step
            .get(table)
            .or_else(|| self.increment_step.get(DEFAULT_STEP_KEY))
            .copied()
            .unwrap_or(DEFAULT_INCREMENT_STEP)
    }

    /// Primary-key values excluded from shifting and copying for `table`.
    pub fn ignored_ids(&self, table: &str) -> &[i64] {
        self.ids_to_ignore
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Value written into an orphaned foreign-key column.
    pub fn orphan_replacement(&self, column: &str) -> SqlValue {
        self.orphaned_rows_update_values
            .columns
            .get(column)
            .map(ReplacementValue::to_sql_value)
            .unwrap_or(SqlValue::Null)
    }

    pub fn is_shift_exempt(&self, table: &str) -> bool {
        self.shift_exempt_tables.contains(table)
    }
}

/// Per-column replacement values for orphaned foreign keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrphanReplacements {
    #[serde(default)]
    pub columns: BTreeMap<String, ReplacementValue>,
}

/// A scalar literal from the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplacementValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl ReplacementValue {
    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            ReplacementValue::Null => SqlValue::Null,
            ReplacementValue::Int(v) => SqlValue::Int(*v),
            ReplacementValue::Float(v) => SqlValue::Float(*v),
            ReplacementValue::Text(v) => SqlValue::Text(v.clone()),
        }
    }
}

/// Step used when neither a table entry nor `default` is configured.
pub const DEFAULT_INCREMENT_STEP: i64 = 1_000_000;

fn default_increment_step() -> BTreeMap<String, i64> {
    BTreeMap::from([(DEFAULT_STEP_KEY.to_string(), DEFAULT_INCREMENT_STEP)])
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_prefer() -> String {
    "prefer".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_import_batch_size() -> usize {
    1_000
}

fn default_patch_dir() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}
