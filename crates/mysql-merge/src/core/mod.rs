//! Core abstractions shared by the merge components.
//!
//! - [`schema`]: the schema map (tables, keys, relations, unique indexes)
//! - [`value`]: SQL values and literal rendering
//! - [`traits`]: the execution channel every statement goes through
//! - [`identifier`]: identifier validation and quoting

pub mod identifier;
pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{ColumnInfo, Difference, ForeignKeyRef, SchemaMap, TableDescriptor};
pub use traits::{ExecutionChannel, ExecutionMode, QueryOutcome, Row, RowSink, Statement};
pub use value::SqlValue;
