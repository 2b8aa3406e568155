//! Merge job: everything needed to merge one source database.
//!
//! A [`MergeJob`] is built by the orchestrator once both schemas are mapped
//! and handed to [`super::MergePipeline`]. The pipeline returns a
//! [`MergeReport`] describing what it did.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::config::MergeConfig;
use crate::core::schema::SchemaMap;
use crate::core::traits::ExecutionMode;
use crate::merge::{CopyStats, OrphanReport};

/// One source database to merge into the destination.
#[derive(Debug, Clone)]
pub struct MergeJob {
    /// Source database name.
    pub source_db: String,

    /// Destination database name, reachable from the source connection.
    pub destination_db: String,

    /// 1-based ordinal of this source in the run; scales the key shift.
    pub counter: u32,

    /// Merge options shared by every source.
    pub config: MergeConfig,

    /// Source schema, with convention foreign keys already applied.
    pub source_map: SchemaMap,

    /// Destination schema. Each job works on its own copy.
    pub destination_map: SchemaMap,
}

impl MergeJob {
    pub fn new(
        source_db: impl Into<String>,
        destination_db: impl Into<String>,
        counter: u32,
        config: MergeConfig,
    ) -> Self {
        Self {
            source_db: source_db.into(),
            destination_db: destination_db.into(),
            counter,
            config,
            source_map: SchemaMap::new(),
            destination_map: SchemaMap::new(),
        }
    }

    /// Set both schema maps.
    pub fn with_maps(mut self, source_map: SchemaMap, destination_map: SchemaMap) -> Self {
        self.source_map = source_map;
        self.destination_map = destination_map;
        self
    }

    /// Number of `-> n/total` steps the pipeline logs for this job.
    pub fn total_steps(&self) -> usize {
        if self.config.skip_ids_decrement {
            PHASE_COUNT - 1
        } else {
            PHASE_COUNT
        }
    }
}

/// Steps logged by a full run, the commit included.
pub const PHASE_COUNT: usize = 12;

/// Wall-clock time spent in one phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub duration_ms: u64,
}

/// What a merge did to one source database.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    /// Source database name.
    pub database: String,

    pub counter: u32,

    pub mode: ExecutionMode,

    /// "committed", or "dry_run" when nothing was changed.
    pub status: String,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    pub duration_seconds: f64,

    /// Foreign keys rewritten to `ON UPDATE CASCADE`.
    pub constraints_converted: usize,

    /// Inferred relations created as real constraints.
    pub constraints_created: usize,

    /// Orphaned rows repaired, per relation.
    pub orphans: Vec<OrphanReport>,

    /// Reference tables found identical and left out of the merge.
    pub reference_tables: Vec<String>,

    /// Primary-key columns shifted forward.
    pub keys_shifted: usize,

    /// Source rows mapped onto existing destination rows.
    pub conflicts_resolved: usize,

    #[serde(flatten)]
    pub copy: CopyStats,

    /// Patch script written in import-file mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_file: Option<String>,

    pub phases: Vec<PhaseTiming>,
}

impl MergeReport {
    /// Empty report for `job`, started now.
    pub fn start(job: &MergeJob, mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            database: job.source_db.clone(),
            counter: job.counter,
            mode,
            status: "running".to_string(),
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            constraints_converted: 0,
            constraints_created: 0,
            orphans: Vec::new(),
            reference_tables: Vec::new(),
            keys_shifted: 0,
            conflicts_resolved: 0,
            copy: CopyStats::default(),
            patch_file: None,
            phases: Vec::new(),
        }
    }

    pub fn record_phase(&mut self, phase: &str, elapsed: Duration) {
        self.phases.push(PhaseTiming {
            phase: phase.to_string(),
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    /// Stamp completion time and final status.
    pub fn finish(&mut self) {
        self.completed_at = Utc::now();
        self.duration_seconds =
            (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        self.status = match self.mode {
            ExecutionMode::DryRun => "dry_run",
            _ => "committed",
        }
        .to_string();
    }

    /// Total rows repaired across all relations.
    pub fn orphans_repaired(&self) -> u64 {
        self.orphans.iter().map(|o| o.repair.rows()).sum()
    }

    /// One-line summary for the log.
    pub fn summary(&self) -> String {
        format!(
            "Merged {} (#{}) in {:.1}s: {} tables, {} rows copied, {} skipped tables, {} conflicts, {} orphans repaired",
            self.database,
            self.counter,
            self.duration_seconds,
            self.copy.tables_copied,
            self.copy.rows,
            self.copy.tables_skipped.len(),
            self.conflicts_resolved,
            self.orphans_repaired()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::OrphanRepair;

    #[test]
    fn test_total_steps_drops_decrement_when_skipped() {
        let mut job = MergeJob::new("shop_eu", "shop", 1, MergeConfig::default());
        assert_eq!(job.total_steps(), 12);

        job.config.skip_ids_decrement = true;
        assert_eq!(job.total_steps(), 11);
    }

    #[test]
    fn test_report_finish_sets_status_by_mode() {
        let job = MergeJob::new("shop_eu", "shop", 2, MergeConfig::default());

        let mut report = MergeReport::start(&job, ExecutionMode::DryRun);
        report.finish();
        assert_eq!(report.status, "dry_run");

        let mut report = MergeReport::start(&job, ExecutionMode::ImportFile);
        report.finish();
        assert_eq!(report.status, "committed");
        assert!(report.completed_at >= report.started_at);
    }

    #[test]
    fn test_report_serializes_flat_copy_stats() {
        let job = MergeJob::new("shop_eu", "shop", 1, MergeConfig::default());
        let mut report = MergeReport::start(&job, ExecutionMode::Default);
        report.copy.rows = 42;
        report.orphans.push(OrphanReport {
            table: "orders".into(),
            column: "user_id".into(),
            repair: OrphanRepair::Replaced { rows: 3 },
        });
        report.record_phase("copy", Duration::from_millis(1500));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rows"], 42);
        assert_eq!(json["mode"], "default");
        assert_eq!(json["phases"][0]["duration_ms"], 1500);
        assert!(json.get("patch_file").is_none());
        assert_eq!(report.orphans_repaired(), 3);
    }
}
