//! Per-source merge pipeline.
//!
//! - [`MergeJob`]: one source database, its counter and both schema maps
//! - [`MergePipeline`]: runs the merge phases for a job over one channel
//! - [`MergeReport`]: what the pipeline did, serializable for `--output-json`
//!
//! Phases, in order: preprocess queries, InnoDB conversion, cascade rewiring,
//! pending foreign keys, orphan repair, reference tables, forward key shift,
//! unique conflicts, copy, reverse key shift, self-reference restoration and
//! commit.

mod job;
mod runner;

pub use job::{MergeJob, MergeReport, PhaseTiming, PHASE_COUNT};
pub use runner::MergePipeline;
