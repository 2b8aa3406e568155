//! Primary-key shifting.
//!
//! Every integer primary key is moved by `counter * increment_step(table)` so
//! rows from different source databases land in disjoint key ranges. The
//! reverse pass applies the same step with the opposite sign.

use tracing::{debug, info};

use crate::config::MergeConfig;
use crate::core::identifier::quote;
use crate::core::schema::{SchemaMap, TableDescriptor};
use crate::core::traits::{ExecutionChannel, Statement};
use crate::core::value::SqlValue;
use crate::error::{MergeError, Result};

use super::constraints::{execute_without_checks, SelfReferences};

/// Direction of a key shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDirection {
    Forward,
    Reverse,
}

impl ShiftDirection {
    pub fn sign(self) -> i64 {
        match self {
            ShiftDirection::Forward => 1,
            ShiftDirection::Reverse => -1,
        }
    }
}

/// Step applied to `table` for the source with ordinal `counter`.
pub fn shift_step(
    config: &MergeConfig,
    table: &str,
    counter: u32,
    direction: ShiftDirection,
) -> Result<i64> {
    i64::from(counter)
        .checked_mul(config.increment_step_for(table))
        .and_then(|step| step.checked_mul(direction.sign()))
        .ok_or_else(|| {
            MergeError::Config(format!(
                "increment step of `{}` overflows for source #{}",
                table, counter
            ))
        })
}

/// Primary-key columns that are shifted directly.
///
/// Columns that are also foreign keys move through cascade from their
/// parent, and non-integer keys are left alone.
fn shiftable_columns(descriptor: &TableDescriptor) -> Vec<&str> {
    descriptor
        .primary
        .iter()
        .filter(|c| !descriptor.fk_host.contains_key(*c))
        .filter(|c| descriptor.is_integer_column(c))
        .map(String::as_str)
        .collect()
}

/// The table whose directly shifted key `table`'s key follows.
///
/// A key that is itself a foreign key moves by cascade with its parent, so
/// the chain of key-to-key relations is followed up to the first table with
/// a shiftable key. `None` when the key does not move at all.
fn key_origin<'a>(map: &'a SchemaMap, table: &'a str) -> Option<&'a str> {
    let mut current = table;
    for _ in 0..=map.len() {
        let descriptor = map.get(current)?;
        if !shiftable_columns(descriptor).is_empty() {
            return Some(current);
        }
        let fk = descriptor
            .primary
            .iter()
            .find_map(|c| descriptor.fk_host.get(c))?;
        if fk.parent == current {
            return None;
        }
        current = fk.parent.as_str();
    }
    None
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn ignored_params(ignored: &[i64]) -> Vec<SqlValue> {
    ignored.iter().copied().map(SqlValue::Int).collect()
}

/// `UPDATE t SET pk = pk + ? [WHERE pk NOT IN (...)]`
fn key_statement(table: &str, column: &str, step: i64, ignored: &[i64]) -> Result<Statement> {
    let column = quote(column)?;
    let mut sql = format!(
        "UPDATE {} SET {c} = {c} + ?",
        quote(table)?,
        c = column
    );
    let mut params = vec![SqlValue::Int(step)];
    if !ignored.is_empty() {
        sql.push_str(&format!(
            " WHERE {} NOT IN ({})",
            column,
            placeholders(ignored.len())
        ));
        params.extend(ignored_params(ignored));
    }
    Ok(Statement::with_params(sql, params))
}

/// One statement moving every self-referencing column of `table`.
///
/// References to ignored keys stay put, as their parent rows do.
fn self_reference_statement(
    table: &str,
    columns: &[&str],
    step: i64,
    ignored: &[i64],
) -> Result<Statement> {
    let mut assignments = Vec::with_capacity(columns.len());
    let mut params = Vec::new();
    for column in columns {
        let c = quote(column)?;
        if ignored.is_empty() {
            assignments.push(format!("{c} = {c} + ?"));
        } else {
            assignments.push(format!(
                "{c} = IF({c} IN ({}), {c}, {c} + ?)",
                placeholders(ignored.len())
            ));
            params.extend(ignored_params(ignored));
        }
        params.push(SqlValue::Int(step));
    }
    Ok(Statement::with_params(
        format!("UPDATE {} SET {}", quote(table)?, assignments.join(", ")),
        params,
    ))
}

/// Shift every eligible primary key in `map`.
///
/// Shift-exempt tables are skipped in both directions. Returns the number of
/// key columns shifted.
pub async fn shift_keys(
    channel: &mut dyn ExecutionChannel,
    map: &SchemaMap,
    self_refs: &SelfReferences,
    config: &MergeConfig,
    counter: u32,
    direction: ShiftDirection,
) -> Result<usize> {
    let mut shifted = 0;
    for (table, descriptor) in map {
        if config.is_shift_exempt(table) {
            debug!("Table {} is shift exempt", table);
            continue;
        }
        let step = shift_step(config, table, counter, direction)?;
        let ignored = config.ignored_ids(table);
        let columns = shiftable_columns(descriptor);

        for column in &columns {
            let stmt = key_statement(table, column, step, ignored)?;
            channel
                .execute(&stmt)
                .await
                .map_err(|e| shift_error(table, column, step, e))?;
            shifted += 1;
        }

        if !self_refs.contains(table) {
            continue;
        }
        if !columns.is_empty() {
            shift_self_references(channel, table, self_refs, step, ignored).await?;
            continue;
        }
        match key_origin(map, table) {
            Some(origin) if !config.is_shift_exempt(origin) => {
                let step = shift_step(config, origin, counter, direction)?;
                debug!("Key of {} follows {}, moving its self references with it", table, origin);
                shift_self_references(channel, table, self_refs, step, config.ignored_ids(origin))
                    .await?;
            }
            _ => debug!("Key of {} does not move, leaving its self references", table),
        }
    }
    info!("Shifted {} primary keys ({:?})", shifted, direction);
    Ok(shifted)
}

/// Move the self-referencing columns of `table` with checks suspended.
///
/// The primary key has already moved with checks on, so cascades into other
/// tables fired.
async fn shift_self_references(
    channel: &mut dyn ExecutionChannel,
    table: &str,
    self_refs: &SelfReferences,
    step: i64,
    ignored: &[i64],
) -> Result<()> {
    let columns = self_refs.columns(table);
    let stmt = self_reference_statement(table, &columns, step, ignored)?;
    execute_without_checks(channel, std::slice::from_ref(&stmt))
        .await
        .map_err(|e| shift_error(table, &columns.join(", "), step, e))
}

fn shift_error(table: &str, column: &str, step: i64, source: MergeError) -> MergeError {
    MergeError::KeyShift {
        table: table.to_string(),
        column: column.to_string(),
        step,
        source: Box::new(source),
    }
}
