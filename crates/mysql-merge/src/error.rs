//! Error types for the merge library.

use thiserror::Error;

/// Hint appended to copy failures caused by duplicate keys in the destination.
pub const DUPLICATE_RUN_HINT: &str =
    "HINT: looks like this source was already merged into this destination";

/// Main error type for merge operations.
#[derive(Error, Debug)]
pub enum MergeError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Statement failed on the merge connection
    #[error("Database error: {0}")]
    Database(#[from] mysql_async::Error),

    /// Schema introspection query failed
    #[error("Introspection error: {0}")]
    Introspection(#[from] sqlx::Error),

    /// Connection error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Source and destination schemas cannot be reconciled for a table
    #[error("Schema inconsistency in table `{table}`: {message}")]
    SchemaInconsistency { table: String, message: String },

    /// A reference table differs between source and destination
    #[error("Reference table `{table}` is incompatible with the destination ({rows} differing rows)")]
    IncompatibleReferenceTable { table: String, rows: u64 },

    /// Rewiring or creating a foreign key failed
    #[error("Error while {action} FK `{constraint}` on `{table}`.`{column}`: {source}")]
    Constraint {
        action: &'static str,
        constraint: String,
        table: String,
        column: String,
        #[source]
        source: Box<MergeError>,
    },

    /// Neither nulling nor deleting orphaned rows succeeded
    #[error(
        "Could not repair orphaned FK on `{table}`.`{column}`: update failed ({update_error}), delete failed ({delete_error})"
    )]
    OrphanRepair {
        table: String,
        column: String,
        update_error: String,
        delete_error: String,
    },

    /// Shifting a primary key failed
    #[error("Error while shifting PK `{table}`.`{column}` by {step}: {source}")]
    KeyShift {
        table: String,
        column: String,
        step: i64,
        #[source]
        source: Box<MergeError>,
    },

    /// Remapping a primary key onto the destination's key failed
    #[error(
        "Error while normalizing unique index `{table}`.`{index}` from value '{old_pk}' to value '{new_pk}': {source}"
    )]
    UniqueConflict {
        table: String,
        index: String,
        old_pk: String,
        new_pk: String,
        #[source]
        source: Box<MergeError>,
    },

    /// Moving rows to the destination failed
    #[error("Error while moving data between databases. Table: `{table}`{}: {source}", hint_suffix(.hint))]
    Copy {
        table: String,
        hint: Option<&'static str>,
        #[source]
        source: Box<MergeError>,
    },

    /// A whole phase failed outside of a per-table boundary
    #[error("Error while {phase}: {source}")]
    Phase {
        phase: String,
        #[source]
        source: Box<MergeError>,
    },

    /// The engine reported warnings for a statement
    #[error("Engine reported warnings for `{statement}`: {}", .warnings.join("; "))]
    EngineWarning {
        statement: String,
        warnings: Vec<String>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Merge was cancelled between source databases
    #[error("Merge cancelled")]
    Cancelled,
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    match hint {
        Some(h) => format!("\n--> {}", h),
        None => String::new(),
    }
}

impl MergeError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MergeError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a SchemaInconsistency error
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        MergeError::SchemaInconsistency {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Wrap an error raised while running `phase`.
    pub fn phase(phase: impl Into<String>, source: MergeError) -> Self {
        MergeError::Phase {
            phase: phase.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a copy failure, attaching the rerun hint for duplicate keys.
    pub fn copy(table: impl Into<String>, source: MergeError) -> Self {
        let hint = source.is_duplicate_key().then_some(DUPLICATE_RUN_HINT);
        MergeError::Copy {
            table: table.into(),
            hint,
            source: Box::new(source),
        }
    }

    /// Whether the engine rejected a statement because of a duplicate key.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            // ER_DUP_ENTRY
            MergeError::Database(mysql_async::Error::Server(e)) => e.code == 1062,
            MergeError::Database(_) => false,
            other => other.to_string().contains("Duplicate"),
        }
    }

    /// Exit status used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MergeError::Config(_) | MergeError::Yaml(_) | MergeError::Json(_) => 1,
            MergeError::Database(_) | MergeError::Introspection(_) | MergeError::Pool { .. } => 2,
            MergeError::SchemaInconsistency { .. } | MergeError::IncompatibleReferenceTable { .. } => 3,
            MergeError::Constraint { .. }
            | MergeError::OrphanRepair { .. }
            | MergeError::KeyShift { .. }
            | MergeError::UniqueConflict { .. } => 4,
            MergeError::Copy { .. } => 5,
            MergeError::EngineWarning { .. } => 6,
            MergeError::Io(_) => 7,
            MergeError::Cancelled => 8,
            MergeError::Phase { .. } => 9,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
