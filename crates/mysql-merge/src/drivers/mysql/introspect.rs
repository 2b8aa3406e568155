//! MySQL/MariaDB schema introspection.
//!
//! Builds a [`SchemaMap`] from information_schema using SQLx. Introspection
//! runs on its own small pool, outside the merge transaction.

use std::collections::BTreeMap;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::core::schema::{ColumnInfo, ForeignKeyRef, SchemaMap, TableDescriptor};
use crate::error::{MergeError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const COLUMNS_QUERY: &str = r#"
    SELECT
        CAST(c.TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
        CAST(c.COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
        CAST(c.COLUMN_TYPE AS CHAR(255)) AS COLUMN_TYPE,
        CAST(c.ORDINAL_POSITION AS SIGNED) AS ORDINAL_POSITION
    FROM INFORMATION_SCHEMA.COLUMNS c
    JOIN INFORMATION_SCHEMA.TABLES t
        ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
    WHERE c.TABLE_SCHEMA = ? AND t.TABLE_TYPE = 'BASE TABLE'
    ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
"#;

// REFERENTIAL_CONSTRAINTS restricts the non-primary rows to real foreign keys.
const KEYS_QUERY: &str = r#"
    SELECT
        CAST(k.TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
        CAST(k.COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME,
        CAST(k.CONSTRAINT_NAME AS CHAR(255)) AS CONSTRAINT_NAME,
        CAST(k.REFERENCED_TABLE_SCHEMA AS CHAR(255)) AS REFERENCED_TABLE_SCHEMA,
        CAST(k.REFERENCED_TABLE_NAME AS CHAR(255)) AS REFERENCED_TABLE_NAME,
        CAST(k.REFERENCED_COLUMN_NAME AS CHAR(255)) AS REFERENCED_COLUMN_NAME
    FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
    LEFT JOIN INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS r
        ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
        AND r.TABLE_NAME = k.TABLE_NAME
        AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
    WHERE k.TABLE_SCHEMA = ?
        AND (k.CONSTRAINT_NAME = 'PRIMARY' OR r.CONSTRAINT_NAME IS NOT NULL)
    ORDER BY k.TABLE_NAME, k.CONSTRAINT_NAME, k.ORDINAL_POSITION
"#;

const UNIQUE_INDEXES_QUERY: &str = r#"
    SELECT
        CAST(TABLE_NAME AS CHAR(255)) AS TABLE_NAME,
        CAST(INDEX_NAME AS CHAR(255)) AS INDEX_NAME,
        CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
    FROM INFORMATION_SCHEMA.STATISTICS
    WHERE TABLE_SCHEMA = ? AND NON_UNIQUE = 0 AND INDEX_NAME <> 'PRIMARY'
    ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX
"#;

#[derive(Debug, Clone)]
pub(crate) struct ColumnRecord {
    pub table: String,
    pub column: String,
    pub column_type: String,
    pub ordinal: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct KeyRecord {
    pub table: String,
    pub column: String,
    pub constraint: String,
    pub referenced_schema: Option<String>,
    pub referenced_table: Option<String>,
    pub referenced_column: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct IndexRecord {
    pub table: String,
    pub index: String,
    /// `None` for functional index parts.
    pub column: Option<String>,
}

fn sqlx_ssl_mode(ssl_mode: &str) -> MySqlSslMode {
    match ssl_mode.to_lowercase().as_str() {
        "disable" => MySqlSslMode::Disabled,
        "require" => MySqlSslMode::Required,
        "verify-ca" | "verify_ca" => MySqlSslMode::VerifyCa,
        "verify-full" | "verify_identity" => MySqlSslMode::VerifyIdentity,
        _ => MySqlSslMode::Preferred,
    }
}

/// Reads table, key and index metadata for one database.
pub struct MysqlIntrospector {
    pool: MySqlPool,
    database: String,
}

impl MysqlIntrospector {
    /// Create an introspector from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .ssl_mode(sqlx_ssl_mode(&config.ssl_mode));

        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MergeError::pool(e, "creating MySQL introspection pool"))?;

        debug!(
            "Introspection pool ready: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            pool,
            database: config.database.clone(),
        })
    }

    /// Build the schema map of the connected database.
    pub async fn map_database(&self, convention_fks: bool) -> Result<SchemaMap> {
        let columns = self.load_columns().await?;
        let keys = self.load_keys().await?;
        let indexes = self.load_unique_indexes().await?;

        let map = assemble(&self.database, columns, keys, indexes, convention_fks);
        info!(
            "Mapped database {}: {} tables",
            self.database,
            map.len()
        );
        Ok(map)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn fetch(&self, query: &str) -> Result<Vec<MySqlRow>> {
        Ok(sqlx::query(query)
            .bind(&self.database)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn load_columns(&self) -> Result<Vec<ColumnRecord>> {
        self.fetch(COLUMNS_QUERY)
            .await?
            .into_iter()
            .map(|row| -> Result<ColumnRecord> {
                Ok(ColumnRecord {
                    table: row.try_get("TABLE_NAME")?,
                    column: row.try_get("COLUMN_NAME")?,
                    column_type: row.try_get("COLUMN_TYPE")?,
                    ordinal: row.try_get::<i64, _>("ORDINAL_POSITION")?.max(0) as u32,
                })
            })
            .collect()
    }

    async fn load_keys(&self) -> Result<Vec<KeyRecord>> {
        self.fetch(KEYS_QUERY)
            .await?
            .into_iter()
            .map(|row| -> Result<KeyRecord> {
                Ok(KeyRecord {
                    table: row.try_get("TABLE_NAME")?,
                    column: row.try_get("COLUMN_NAME")?,
                    constraint: row.try_get("CONSTRAINT_NAME")?,
                    referenced_schema: row.try_get("REFERENCED_TABLE_SCHEMA")?,
                    referenced_table: row.try_get("REFERENCED_TABLE_NAME")?,
                    referenced_column: row.try_get("REFERENCED_COLUMN_NAME")?,
                })
            })
            .collect()
    }

    async fn load_unique_indexes(&self) -> Result<Vec<IndexRecord>> {
        self.fetch(UNIQUE_INDEXES_QUERY)
            .await?
            .into_iter()
            .map(|row| -> Result<IndexRecord> {
                Ok(IndexRecord {
                    table: row.try_get("TABLE_NAME")?,
                    index: row.try_get("INDEX_NAME")?,
                    column: row.try_get("COLUMN_NAME")?,
                })
            })
            .collect()
    }
}

/// Assemble information_schema records into a schema map.
pub(crate) fn assemble(
    database: &str,
    columns: Vec<ColumnRecord>,
    keys: Vec<KeyRecord>,
    indexes: Vec<IndexRecord>,
    convention_fks: bool,
) -> SchemaMap {
    let mut tables: BTreeMap<String, TableDescriptor> = BTreeMap::new();
    for c in columns {
        tables
            .entry(c.table)
            .or_default()
            .columns
            .insert(c.column, ColumnInfo::new(c.column_type, c.ordinal));
    }

    let mut fk_widths: BTreeMap<(String, String), usize> = BTreeMap::new();
    for k in keys.iter().filter(|k| k.constraint != "PRIMARY") {
        *fk_widths
            .entry((k.table.clone(), k.constraint.clone()))
            .or_default() += 1;
    }

    for k in keys {
        let Some(table) = tables.get_mut(&k.table) else {
            continue;
        };
        if k.constraint == "PRIMARY" {
            table.primary.push(k.column);
            continue;
        }
        let (Some(parent), Some(parent_column)) = (k.referenced_table, k.referenced_column) else {
            continue;
        };
        if k.referenced_schema.as_deref().is_some_and(|s| s != database) {
            debug!(
                "Ignoring cross-database FK {} on {}.{}",
                k.constraint, k.table, k.column
            );
            continue;
        }
        if fk_widths
            .get(&(k.table.clone(), k.constraint.clone()))
            .is_some_and(|&width| width > 1)
        {
            warn!(
                "Ignoring multi-column FK {} on table {}",
                k.constraint, k.table
            );
            continue;
        }
        table
            .fk_host
            .insert(k.column, ForeignKeyRef::new(k.constraint, parent, parent_column));
    }

    let mut unique: BTreeMap<(String, String), Option<Vec<String>>> = BTreeMap::new();
    for i in indexes {
        let entry = unique
            .entry((i.table, i.index))
            .or_insert_with(|| Some(Vec::new()));
        match (entry.as_mut(), i.column) {
            (Some(cols), Some(col)) => cols.push(col),
            _ => *entry = None,
        }
    }
    for ((table_name, index), cols) in unique {
        let Some(table) = tables.get_mut(&table_name) else {
            continue;
        };
        match cols {
            Some(cols) => {
                table.indexes.insert(index, cols);
            }
            None => debug!(
                "Ignoring functional unique index {} on table {}",
                index, table_name
            ),
        }
    }

    let mut map: SchemaMap = tables.into_iter().collect();
    if convention_fks {
        let inferred = map.infer_pending_relations();
        if inferred > 0 {
            info!("Inferred {} pending relations from column names", inferred);
        }
    }
    map
}
