//! The merge pipeline for one source database.
//!
//! Phases run in a fixed order inside one transaction on the source
//! connection. Foreign-key checks are suspended while constraints are
//! rewritten and rows are copied, and enabled while keys shift so that
//! cascades fire. Any failure rolls the transaction back and re-enables
//! checks before the error is returned.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use crate::core::identifier::quote;
use crate::core::traits::{ExecutionChannel, ExecutionMode, Statement};
use crate::core::value::SqlValue;
use crate::error::{MergeError, Result};
use crate::merge::{
    convert_to_update_cascade, copy_data, deduplicate_reference_tables, materialize_pending,
    repair_orphans, resolve_unique_conflicts, restore_self_references, shift_keys, undo_remaps,
    CopyStats, KeyRemap, PatchScript, SelfReferences, ShiftDirection,
};

use super::job::{MergeJob, MergeReport};

/// Runs every merge phase for one [`MergeJob`] over one channel.
pub struct MergePipeline<'c> {
    channel: &'c mut dyn ExecutionChannel,
    job: MergeJob,
    self_refs: SelfReferences,
    remaps: Vec<KeyRemap>,
    step: usize,
    total: usize,
}

impl<'c> MergePipeline<'c> {
    pub fn new(channel: &'c mut dyn ExecutionChannel, job: MergeJob) -> Self {
        let total = job.total_steps();
        Self {
            channel,
            job,
            self_refs: SelfReferences::new(),
            remaps: Vec::new(),
            step: 0,
            total,
        }
    }

    /// Run all phases and commit.
    pub async fn run(mut self) -> Result<MergeReport> {
        let mode = self.channel.mode();
        let mut report = MergeReport::start(&self.job, mode);
        info!(
            "Merging {} into {} (#{}, {} mode)",
            self.job.source_db, self.job.destination_db, self.job.counter, mode
        );

        self.channel.begin().await?;
        let outcome = match self.run_phases(&mut report).await {
            Ok(()) => {
                let started = self.next_step("Committing changes");
                let committed = self.channel.commit().await;
                report.record_phase("commit", started.elapsed());
                committed
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            self.abort().await;
            return Err(e);
        }

        report.finish();
        info!("{}", report.summary());
        Ok(report)
    }

    fn next_step(&mut self, title: &str) -> Instant {
        self.step += 1;
        info!("-> {}/{} {}", self.step, self.total, title);
        Instant::now()
    }

    async fn abort(&mut self) {
        warn!("Rolling back changes to {}", self.job.source_db);
        if let Err(e) = self.channel.rollback().await {
            warn!("Rollback failed: {}", e);
        }
        if let Err(e) = self.channel.set_foreign_key_checks(true).await {
            warn!("Could not re-enable foreign key checks: {}", e);
        }
    }

    async fn run_phases(&mut self, report: &mut MergeReport) -> Result<()> {
        let started = self.next_step("Executing preprocess queries");
        self.run_preprocess_queries().await?;
        report.record_phase("preprocess", started.elapsed());

        let started = self.next_step("Converting tables to InnoDB");
        self.normalize_engines().await?;
        report.record_phase("innodb", started.elapsed());

        self.channel.set_foreign_key_checks(false).await?;

        let started = self.next_step("Converting FKs to UPDATE CASCADE");
        report.constraints_converted =
            convert_to_update_cascade(self.channel, &self.job.source_map, &mut self.self_refs)
                .await?;
        report.record_phase("cascade", started.elapsed());

        let started = self.next_step("Converting mapped FKs to real FKs");
        report.constraints_created =
            materialize_pending(self.channel, &mut self.job.source_map, &mut self.self_refs)
                .await?;
        report.record_phase("materialize", started.elapsed());

        let started = self.next_step("Repairing orphaned FKs");
        report.orphans =
            repair_orphans(self.channel, &self.job.source_map, &self.job.config).await?;
        report.record_phase("orphans", started.elapsed());

        let started = self.next_step("Deduplicating reference tables");
        report.reference_tables = deduplicate_reference_tables(
            self.channel,
            &mut self.job.source_map,
            &mut self.job.destination_map,
            &self.job.destination_db,
            &self.job.config,
        )
        .await?;
        report.record_phase("reference_tables", started.elapsed());

        self.channel.set_foreign_key_checks(true).await?;

        let started = self.next_step("Incrementing PKs");
        report.keys_shifted = self.shift(ShiftDirection::Forward).await?;
        report.record_phase("shift_forward", started.elapsed());

        let started = self.next_step("Mapping PKs to destination on unique conflicts");
        self.remaps = resolve_unique_conflicts(
            self.channel,
            &mut self.job.source_map,
            &self.self_refs,
            &self.job.destination_map,
            &self.job.destination_db,
        )
        .await?;
        report.conflicts_resolved = self.remaps.len();
        report.record_phase("unique_conflicts", started.elapsed());

        self.channel.set_foreign_key_checks(false).await?;

        let started = self.next_step("Copying data to the destination db");
        let copied = self.copy(report).await?;
        report.copy = copied;
        report.record_phase("copy", started.elapsed());

        self.channel.set_foreign_key_checks(true).await?;

        if self.job.config.skip_ids_decrement {
            warn!("Leaving source keys shifted (skip_ids_decrement)");
        } else {
            let started = self.next_step("Decrementing PKs");
            undo_remaps(self.channel, &self.remaps, &self.self_refs).await?;
            self.shift(ShiftDirection::Reverse).await?;
            report.record_phase("shift_reverse", started.elapsed());
        }

        let started = self.next_step("Restoring self-referencing FKs");
        self.channel.set_foreign_key_checks(false).await?;
        restore_self_references(self.channel, &self.self_refs).await?;
        self.channel.set_foreign_key_checks(true).await?;
        report.record_phase("self_references", started.elapsed());

        Ok(())
    }

    async fn run_preprocess_queries(&mut self) -> Result<()> {
        for query in &self.job.config.preprocess_queries {
            info!("Preprocess: {}", query);
            self.channel
                .execute(&Statement::new(query.as_str()))
                .await
                .map_err(|e| MergeError::phase(format!("executing preprocess query `{}`", query), e))?;
        }
        Ok(())
    }

    /// Convert every mapped table that is not InnoDB; other engines ignore
    /// foreign keys and cannot roll back.
    async fn normalize_engines(&mut self) -> Result<usize> {
        let query = Statement::with_params(
            "SELECT TABLE_NAME AS table_name, ENGINE AS engine FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'",
            vec![SqlValue::Text(self.job.source_db.clone())],
        );
        let rows = self
            .channel
            .execute(&query)
            .await
            .map_err(|e| MergeError::phase("reading table engines", e))?
            .rows;

        let mut converted = 0;
        for row in rows {
            let (Some(table), Some(engine)) = (row.get("table_name"), row.get("engine")) else {
                continue;
            };
            let (table, engine) = (table.to_string(), engine.to_string());
            if engine.eq_ignore_ascii_case("InnoDB") || !self.job.source_map.contains(&table) {
                continue;
            }

            info!("Converting {} from {} to InnoDB", table, engine);
            let alter = Statement::new(format!("ALTER TABLE {} ENGINE = InnoDB", quote(&table)?));
            self.channel.execute(&alter).await.map_err(|e| {
                MergeError::phase(format!("converting table `{}` to InnoDB", table), e)
            })?;
            converted += 1;
        }
        Ok(converted)
    }

    async fn shift(&mut self, direction: ShiftDirection) -> Result<usize> {
        shift_keys(
            self.channel,
            &self.job.source_map,
            &self.self_refs,
            &self.job.config,
            self.job.counter,
            direction,
        )
        .await
    }

    async fn copy(&mut self, report: &mut MergeReport) -> Result<CopyStats> {
        if self.channel.mode() != ExecutionMode::ImportFile {
            return copy_data::<BufWriter<File>>(
                self.channel,
                &self.job.source_map,
                &self.job.destination_map,
                &self.job.destination_db,
                &self.job.config,
                None,
            )
            .await;
        }

        let dir = Path::new(&self.job.config.patch_dir);
        fs::create_dir_all(dir)?;
        let mut script =
            PatchScript::create(dir, self.job.counter, chrono::Local::now().date_naive())?;
        report.patch_file = script.path().map(|p| p.display().to_string());

        let stats = copy_data(
            self.channel,
            &self.job.source_map,
            &self.job.destination_map,
            &self.job.destination_db,
            &self.job.config,
            Some(&mut script),
        )
        .await?;
        info!("Patch script has {} statements", script.lines());
        script.finish()?;
        Ok(stats)
    }
}
