//! Identifier validation and quoting for dynamically built statements.
//!
//! Table, column and constraint names come from the introspected schema and
//! cannot be bound as statement parameters. Every identifier placed in SQL
//! goes through [`quote`], which validates it and escapes backticks; data
//! values are always bound (see [`crate::core::traits::Statement`]).

use crate::error::{MergeError, Result};

/// Maximum identifier length accepted by MySQL.
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Characters kept from the table and column names in generated constraint names.
const CONSTRAINT_PART_LENGTH: usize = 25;

/// Suffix of constraints created for pending relations.
pub const CONSTRAINT_SUFFIX: &str = "_dbmerge";

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers longer than [`MAX_IDENTIFIER_LENGTH`] characters.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MergeError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MergeError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(MergeError::Config(format!(
            "Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a MySQL identifier using backticks.
///
/// ```ignore
/// assert_eq!(quote("users")?, "`users`");
/// assert_eq!(quote("table`name")?, "`table``name`");
/// ```
pub fn quote(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Qualify a table name with its database.
pub fn qualify(database: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote(database)?, quote(table)?))
}

/// Quote a list of column names and join them with `, `.
pub fn quote_list<S: AsRef<str>>(names: &[S]) -> Result<String> {
    let quoted = names
        .iter()
        .map(|n| quote(n.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// Deterministic name for a constraint materialized from a pending relation.
///
/// Table and column are truncated to 25 characters each so the result stays
/// within the 64-character identifier limit.
pub fn pending_constraint_name(table: &str, column: &str) -> String {
    let table: String = table.chars().take(CONSTRAINT_PART_LENGTH).collect();
    let column: String = column.chars().take(CONSTRAINT_PART_LENGTH).collect();
    format!("{}_{}{}", table, column, CONSTRAINT_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("users").unwrap(), "`users`");
        assert_eq!(quote("table`name").unwrap(), "`table``name`");
        assert_eq!(quote("a``b").unwrap(), "`a````b`");
    }

    #[test]
    fn test_quote_rejects_invalid() {
        assert!(quote("").is_err());
        assert!(quote("users\0; DROP TABLE x").is_err());
        assert!(quote(&"x".repeat(65)).is_err());
        assert!(quote(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify("shop", "users").unwrap(), "`shop`.`users`");
        assert!(qualify("", "users").is_err());
    }

    #[test]
    fn test_quote_list() {
        assert_eq!(quote_list(&["id", "name"]).unwrap(), "`id`, `name`");
        assert!(quote_list(&["id", ""]).is_err());
    }

    #[test]
    fn test_pending_constraint_name() {
        assert_eq!(
            pending_constraint_name("orders", "user_id"),
            "orders_user_id_dbmerge"
        );

        let long = pending_constraint_name(&"t".repeat(40), &"c".repeat(40));
        assert_eq!(long.len(), 25 + 1 + 25 + CONSTRAINT_SUFFIX.len());
        assert!(long.len() <= MAX_IDENTIFIER_LENGTH);
        assert!(validate_identifier(&long).is_ok());
    }
}
