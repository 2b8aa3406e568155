//! Configuration validation.

use super::{Config, DatabaseConfig, DEFAULT_STEP_KEY};
use crate::error::{MergeError, Result};

fn validate_database(config: &DatabaseConfig, label: &str) -> Result<()> {
    if config.host.is_empty() {
        return Err(MergeError::Config(format!("{}.host is required", label)));
    }
    if config.database.is_empty() {
        return Err(MergeError::Config(format!("{}.database is required", label)));
    }
    if config.user.is_empty() {
        return Err(MergeError::Config(format!("{}.user is required", label)));
    }
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_database(&config.destination, "destination")?;

    if config.sources.is_empty() {
        return Err(MergeError::Config(
            "at least one entry in sources is required".into(),
        ));
    }

    for (i, source) in config.sources.iter().enumerate() {
        let label = format!("sources[{}]", i);
        validate_database(source, &label)?;

        // Cannot merge a database into itself
        if source.same_database(&config.destination) {
            return Err(MergeError::Config(format!(
                "{} cannot be the same database as destination",
                label
            )));
        }

        if config.sources[..i].iter().any(|s| s.same_database(source)) {
            return Err(MergeError::Config(format!(
                "{} ({}) is listed more than once",
                label, source.database
            )));
        }
    }

    let merge = &config.merge;
    match merge.increment_step.get(DEFAULT_STEP_KEY) {
        None => {
            return Err(MergeError::Config(
                "merge.increment_step.default is required".into(),
            ))
        }
        Some(step) if *step <= 0 => {
            return Err(MergeError::Config(
                "merge.increment_step.default must be positive".into(),
            ))
        }
        _ => {}
    }
    if let Some((table, _)) = merge.increment_step.iter().find(|(_, step)| **step <= 0) {
        return Err(MergeError::Config(format!(
            "merge.increment_step.{} must be positive",
            table
        )));
    }

    // The last source shifts by `sources.len() * step`.
    let sources = config.sources.len() as i64;
    if let Some((table, _)) = merge
        .increment_step
        .iter()
        .find(|(_, step)| step.checked_mul(sources).is_none())
    {
        return Err(MergeError::Config(format!(
            "merge.increment_step.{} is too large for {} sources",
            table, sources
        )));
    }

    if merge.batch_size == 0 {
        return Err(MergeError::Config(
            "merge.batch_size must be at least 1".into(),
        ));
    }
    if merge.import_batch_size == 0 {
        return Err(MergeError::Config(
            "merge.import_batch_size must be at least 1".into(),
        ));
    }

    Ok(())
}
