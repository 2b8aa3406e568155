//! # mysql-merge
//!
//! Merge several MySQL databases that share one schema into a single
//! destination database.
//!
//! Each source is merged inside one transaction on its own connection:
//!
//! - **Foreign keys** are rewritten to `ON UPDATE CASCADE`, and relations
//!   known only by naming convention are created as real constraints
//! - **Orphaned rows** are repointed at a configured value or deleted
//! - **Primary keys** are shifted into a range reserved for the source, so
//!   rows from different sources never collide
//! - **Unique conflicts** with rows already in the destination are mapped
//!   onto the destination's keys
//! - **Rows** are copied with `INSERT ... SELECT`, or rendered into a patch
//!   script for later replay
//!
//! The source is then shifted back and committed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_merge::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mysql_merge::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let result = Orchestrator::new(config).run(CancellationToken::new()).await?;
//!     println!("Merged {} rows", result.rows_copied());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, MergeConfig};
pub use crate::core::{ExecutionChannel, ExecutionMode, SchemaMap, SqlValue, Statement};
pub use drivers::{MysqlChannel, MysqlIntrospector};
pub use error::{MergeError, Result};
pub use merge::ApplyStats;
pub use orchestrator::{DatabaseHealth, HealthCheckResult, MergeResult, Orchestrator};
pub use pipeline::{MergeJob, MergePipeline, MergeReport};
