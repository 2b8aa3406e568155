//! MySQL/MariaDB database driver.
//!
//! This module provides MySQL-specific implementations for:
//! - [`MysqlChannel`]: the execution channel the merge pipeline runs on
//! - [`MysqlIntrospector`]: information_schema reader producing a schema map
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+

mod channel;
mod introspect;

pub use channel::{plan_dry_run, DryRunPlan, MysqlChannel};
pub use introspect::MysqlIntrospector;
