//! Atomic persistence of `PipelineState` and large run artifacts.
//!
//! The JSON file is the source of truth for the state machine; the SQLite
//! side table exists only for blobs too large to comfortably round-trip
//! through `PIPELINE_STATE.json` (quality gate reports, graph snapshots).

pub mod store;

pub use store::{ArtifactStore, StateStore};
