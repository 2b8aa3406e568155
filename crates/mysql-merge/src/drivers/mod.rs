//! Database driver implementations.
//!
//! - [`mysql`]: MySQL/MariaDB execution channel and schema introspection

pub mod mysql;

pub use mysql::{MysqlChannel, MysqlIntrospector};
