//! Persistence layer for the baton orchestrator
//!
//! This crate provides the snapshot store the orchestration engine uses
//! for restart recovery. The engine captures an
//! [`OrchestratorSnapshot`](baton_core::snapshot::OrchestratorSnapshot)
//! after state-mutating operations and loads it back on startup; this
//! crate persists those snapshots as a single JSON file.

pub mod error;
pub mod store;

pub use error::{Error, Result};
pub use store::JsonSnapshotStore;

/// Re-export core types for convenience
pub use baton_core as core;
