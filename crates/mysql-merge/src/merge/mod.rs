//! Merge components, one per pipeline concern.
//!
//! Each component is a set of async functions taking the execution channel
//! and the schema maps explicitly; none of them keeps state between calls.
//! Tables, columns, foreign keys and indexes are always visited in name order.

pub mod conflicts;
pub mod constraints;
pub mod copy;
pub mod identity;
pub mod orphans;
pub mod patch;
pub mod reference;

pub use conflicts::{resolve_unique_conflicts, undo_remaps, KeyRemap};
pub use constraints::{
    convert_to_update_cascade, materialize_pending, restore_self_references, SelfReferences,
};
pub use copy::{copy_data, CopyStats};
pub use identity::{shift_keys, shift_step, ShiftDirection};
pub use orphans::{repair_orphans, OrphanRepair, OrphanReport};
pub use patch::{apply_patch, patch_file_name, ApplyStats, InsertComposer, PatchScript};
pub use reference::deduplicate_reference_tables;
