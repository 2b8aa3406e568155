//! Merge orchestrator - runs the pipeline for every configured source.

use crate::config::{Config, DatabaseConfig};
use crate::core::schema::SchemaMap;
use crate::core::traits::ExecutionMode;
use crate::drivers::{MysqlChannel, MysqlIntrospector};
use crate::error::{MergeError, Result};
use crate::merge::{apply_patch, ApplyStats};
use crate::pipeline::{MergeJob, MergePipeline, MergeReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Merge orchestrator.
pub struct Orchestrator {
    config: Config,
    mode: ExecutionMode,
}

/// Result of a merge run over all sources.
#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    /// Unique run identifier.
    pub run_id: String,

    /// "completed", "dry_run" or "cancelled".
    pub status: String,

    pub mode: ExecutionMode,

    /// Destination database name.
    pub destination: String,

    /// SHA-256 of the configuration the run used.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// One report per merged source, in merge order.
    pub databases: Vec<MergeReport>,
}

/// Connection check for one database.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    /// "destination" or "source #n".
    pub role: String,
    pub database: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub databases: Vec<DatabaseHealth>,
}

impl Orchestrator {
    /// Create a new orchestrator running in [`ExecutionMode::Default`].
    pub fn new(config: Config) -> Self {
        Self {
            config,
            mode: ExecutionMode::Default,
        }
    }

    /// Set the execution mode for every source.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Merge every source into the destination, in configuration order.
    ///
    /// Cancellation is checked between sources; a source already running is
    /// always taken to commit or rollback.
    pub async fn run(&self, cancel: CancellationToken) -> Result<MergeResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Starting merge run {} ({} sources, {} mode)",
            run_id,
            self.config.sources.len(),
            self.mode
        );
        if self.config.merge.skip_ids_decrement {
            warn!("skip_ids_decrement is set: source keys stay shifted after the merge");
        }

        info!("Mapping destination database {}", self.config.destination.database);
        let destination_map = map_database(&self.config.destination, false).await?;
        info!("Destination has {} tables", destination_map.len());

        let mut databases = Vec::with_capacity(self.config.sources.len());
        let mut cancelled = false;
        for (index, source) in self.config.sources.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    "Cancelled before merging {}; {} of {} sources merged",
                    source.database,
                    databases.len(),
                    self.config.sources.len()
                );
                cancelled = true;
                break;
            }
            let counter = (index + 1) as u32;
            let report = self.merge_source(counter, source, &destination_map).await?;
            databases.push(report);
        }

        let completed_at = Utc::now();
        let status = if cancelled {
            "cancelled"
        } else if self.mode == ExecutionMode::DryRun {
            "dry_run"
        } else {
            "completed"
        };

        let result = MergeResult {
            run_id,
            status: status.to_string(),
            mode: self.mode,
            destination: self.config.destination.database.clone(),
            config_hash: self.config.hash(),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            databases,
        };

        info!(
            "Merge {}: {} databases, {} rows in {:.1}s",
            result.status,
            result.databases.len(),
            result.rows_copied(),
            result.duration_seconds
        );
        Ok(result)
    }

    async fn merge_source(
        &self,
        counter: u32,
        source: &DatabaseConfig,
        destination_map: &SchemaMap,
    ) -> Result<MergeReport> {
        info!("Mapping source database {} (#{})", source.database, counter);
        let mut source_map = map_database(source, self.config.merge.convention_fks).await?;
        let dropped = source_map.reapply_fk_mapping();
        if dropped > 0 {
            info!("Dropped {} pending relations already present or stale", dropped);
        }

        let job = MergeJob::new(
            source.database.clone(),
            self.config.destination.database.clone(),
            counter,
            self.config.merge.clone(),
        )
        .with_maps(source_map, destination_map.clone());

        let mut channel = MysqlChannel::connect(source, self.mode).await?;
        let result = MergePipeline::new(&mut channel, job).run().await;
        if let Err(e) = channel.disconnect().await {
            warn!("Error closing connection to {}: {}", source.database, e);
        }
        result
    }

    /// Replay a patch script against the destination.
    pub async fn apply_patch(&self, path: &Path) -> Result<ApplyStats> {
        let file = File::open(path)?;
        info!(
            "Applying {} to {}",
            path.display(),
            self.config.destination.database
        );

        let mut channel =
            MysqlChannel::connect(&self.config.destination, ExecutionMode::Default).await?;
        let result = apply_patch(
            &mut channel,
            BufReader::new(file),
            self.config.merge.import_batch_size,
        )
        .await;
        if let Err(e) = channel.disconnect().await {
            warn!("Error closing destination connection: {}", e);
        }
        result
    }

    /// Test connections to the destination and every source.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let mut databases = Vec::with_capacity(self.config.sources.len() + 1);
        databases.push(check_database("destination".to_string(), &self.config.destination).await);
        for (index, source) in self.config.sources.iter().enumerate() {
            databases.push(check_database(format!("source #{}", index + 1), source).await);
        }

        Ok(HealthCheckResult {
            healthy: databases.iter().all(|d| d.connected),
            databases,
        })
    }
}

async fn map_database(config: &DatabaseConfig, convention_fks: bool) -> Result<SchemaMap> {
    let introspector = MysqlIntrospector::connect(config).await?;
    let map = introspector.map_database(convention_fks).await;
    introspector.close().await;
    map
}

async fn check_database(role: String, config: &DatabaseConfig) -> DatabaseHealth {
    let start = Instant::now();
    let outcome: Result<()> = async {
        let mut channel = MysqlChannel::connect(config, ExecutionMode::Default).await?;
        channel.ping().await?;
        channel.disconnect().await
    }
    .await;
    let latency_ms = start.elapsed().as_millis() as u64;
    debug!("Health check {} {}: {:?}", role, config.database, outcome);

    DatabaseHealth {
        role,
        database: config.database.clone(),
        connected: outcome.is_ok(),
        latency_ms,
        error: outcome.err().map(|e| e.to_string()),
    }
}

impl MergeResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rows copied (or rendered) across all sources.
    pub fn rows_copied(&self) -> u64 {
        self.databases.iter().map(|d| d.copy.rows).sum()
    }

    /// Error to exit with when the run stopped early.
    pub fn into_outcome(self) -> Result<Self> {
        if self.status == "cancelled" {
            return Err(MergeError::Cancelled);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeConfig;

    fn result(status: &str) -> MergeResult {
        let job = MergeJob::new("shop_eu", "shop", 1, MergeConfig::default());
        let mut report = MergeReport::start(&job, ExecutionMode::Default);
        report.copy.rows = 7;
        report.finish();
        let now = Utc::now();
        MergeResult {
            run_id: "run".into(),
            status: status.into(),
            mode: ExecutionMode::Default,
            destination: "shop".into(),
            config_hash: "abc".into(),
            started_at: now,
            completed_at: now,
            duration_seconds: 0.0,
            databases: vec![report.clone(), report],
        }
    }

    #[test]
    fn test_rows_copied_sums_sources() {
        assert_eq!(result("completed").rows_copied(), 14);
    }

    #[test]
    fn test_result_json_lists_databases() {
        let json: serde_json::Value =
            serde_json::from_str(&result("completed").to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["databases"][1]["database"], "shop_eu");
        assert_eq!(json["databases"][0]["status"], "committed");
    }

    #[test]
    fn test_cancelled_run_maps_to_error() {
        assert!(matches!(
            result("cancelled").into_outcome(),
            Err(MergeError::Cancelled)
        ));
        assert!(result("dry_run").into_outcome().is_ok());
    }

    #[test]
    fn test_new_orchestrator_defaults_to_default_mode() {
        let config = Config::from_yaml(
            "destination: {host: db, database: shop, user: merge}\nsources:\n  - {host: db, database: shop_eu, user: merge}\n",
        )
        .unwrap();
        let orchestrator = Orchestrator::new(config).with_mode(ExecutionMode::DryRun);
        assert_eq!(orchestrator.mode, ExecutionMode::DryRun);
        assert_eq!(orchestrator.config().sources.len(), 1);
    }
}
