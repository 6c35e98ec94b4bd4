//! Orchestration components for the agent pool
//!
//! This module wires the four cooperating pieces of the core together:
//!
//! - [`router`]: typed message hub between the conductor and agent sessions
//! - [`lifecycle`]: authoritative agent store and state machine operations
//! - [`scheduler`]: task backlog and capability-based assignment
//! - [`workspace`]: isolated working copies, one per live agent
//!
//! [`engine::Orchestrator`] composes them behind the conductor-facing
//! capability interface; [`catalog`] supplies role profiles at spawn time.

pub mod catalog;
pub mod engine;
pub mod lifecycle;
pub mod router;
pub mod scheduler;
pub mod workspace;

pub use catalog::{RoleCatalog, RoleProfile, StaticRoleCatalog};
pub use engine::{Intent, IntentOutcome, Orchestrator, OrchestratorBuilder, OrchestratorStats};
pub use lifecycle::{AgentFilter, AgentManager, AgentStatistics, SpawnSpec};
pub use router::{MessageRouter, SessionHandle};
pub use scheduler::{QueueStatistics, TaskQueue};
pub use workspace::{Workspace, WorkspaceManager, WorkspaceStatus};
