//! Whole-state snapshots and the persistence seam
//!
//! The orchestrator persists its agent/task/workspace state as a single
//! [`OrchestratorSnapshot`] through whatever [`SnapshotStore`] collaborator
//! it is given, and rehydrates from one at startup. A snapshot that fails
//! [`OrchestratorSnapshot::validate`] must halt startup rather than
//! rehydrate partial state.

use crate::agent::{Agent, AgentState};
use crate::orchestration::workspace::Workspace;
use crate::task::Task;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Current snapshot format version
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Point-in-time copy of the whole orchestration state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSnapshot {
    pub format_version: u32,
    pub captured_at: DateTime<Utc>,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub workspaces: Vec<Workspace>,
    /// Per-base revision ledger backing merge-conflict detection
    pub base_revisions: HashMap<String, u64>,
}

impl OrchestratorSnapshot {
    /// Capture a snapshot at the current instant
    pub fn new(
        agents: Vec<Agent>,
        tasks: Vec<Task>,
        workspaces: Vec<Workspace>,
        base_revisions: HashMap<String, u64>,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            captured_at: Utc::now(),
            agents,
            tasks,
            workspaces,
            base_revisions,
        }
    }

    /// Check the structural invariants the live stores maintain.
    ///
    /// A failure here means the persisted state can not be trusted; the
    /// caller must refuse to rehydrate from it.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::corrupted_snapshot(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            if !agent_ids.insert(agent.id) {
                return Err(Error::corrupted_snapshot(format!(
                    "duplicate agent id {}",
                    agent.id
                )));
            }
        }
        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id) {
                return Err(Error::corrupted_snapshot(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
        }
        let mut workspace_ids = HashSet::new();
        for workspace in &self.workspaces {
            if !workspace_ids.insert(workspace.id) {
                return Err(Error::corrupted_snapshot(format!(
                    "duplicate workspace id {}",
                    workspace.id
                )));
            }
        }

        let mut live_names = HashSet::new();
        for agent in self.agents.iter().filter(|a| a.is_live()) {
            if !live_names.insert(agent.name.as_str()) {
                return Err(Error::corrupted_snapshot(format!(
                    "two live agents named '{}'",
                    agent.name
                )));
            }
        }

        for task in &self.tasks {
            for dependency in &task.depends_on {
                if !task_ids.contains(dependency) {
                    return Err(Error::corrupted_snapshot(format!(
                        "task {} depends on unknown task {}",
                        task.id, dependency
                    )));
                }
            }
        }

        // active tasks and working agents must form a bijection
        for task in self.tasks.iter().filter(|t| t.is_active()) {
            let agent_id = task.assigned_agent.ok_or_else(|| {
                Error::corrupted_snapshot(format!("active task {} has no assigned agent", task.id))
            })?;
            let agent = self
                .agents
                .iter()
                .find(|a| a.id == agent_id)
                .ok_or_else(|| {
                    Error::corrupted_snapshot(format!(
                        "task {} is assigned to unknown agent {}",
                        task.id, agent_id
                    ))
                })?;
            if agent.state != AgentState::Working || agent.current_task != Some(task.id) {
                return Err(Error::corrupted_snapshot(format!(
                    "task {} is active but agent {} does not hold it",
                    task.id, agent_id
                )));
            }
        }
        for agent in &self.agents {
            if agent.state == AgentState::Working {
                let task_id = agent.current_task.ok_or_else(|| {
                    Error::corrupted_snapshot(format!(
                        "working agent {} has no current task",
                        agent.id
                    ))
                })?;
                let task = self.tasks.iter().find(|t| t.id == task_id).ok_or_else(|| {
                    Error::corrupted_snapshot(format!(
                        "agent {} holds unknown task {}",
                        agent.id, task_id
                    ))
                })?;
                if !task.is_active() || task.assigned_agent != Some(agent.id) {
                    return Err(Error::corrupted_snapshot(format!(
                        "agent {} holds task {} which is not assigned to it",
                        agent.id, task_id
                    )));
                }
            } else if agent.current_task.is_some() {
                return Err(Error::corrupted_snapshot(format!(
                    "agent {} is {} but holds a current task",
                    agent.id,
                    agent.state.as_str()
                )));
            }
            if let Some(workspace) = agent.workspace {
                if !workspace_ids.contains(&workspace) {
                    return Err(Error::corrupted_snapshot(format!(
                        "agent {} references unknown workspace {}",
                        agent.id, workspace
                    )));
                }
            }
        }

        let mut holders: HashMap<Uuid, Uuid> = HashMap::new();
        for agent in self.agents.iter().filter(|a| a.is_live()) {
            if let Some(workspace) = agent.workspace {
                if let Some(previous) = holders.insert(workspace, agent.id) {
                    return Err(Error::corrupted_snapshot(format!(
                        "live agents {} and {} share workspace {}",
                        previous, agent.id, workspace
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Persistence collaborator for restart recovery
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot, replacing any previous one
    async fn save(&self, snapshot: &OrchestratorSnapshot) -> Result<()>;

    /// Load the latest snapshot; `Ok(None)` means a fresh start
    async fn load(&self) -> Result<Option<OrchestratorSnapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::workspace::WorkspaceStatus;
    use crate::task::TaskPriority;
    use std::path::PathBuf;

    fn agent(name: &str) -> Agent {
        Agent::builder()
            .name(name)
            .role("engineer")
            .capability("rust")
            .build()
            .unwrap()
    }

    fn task(description: &str) -> Task {
        Task::builder()
            .description(description)
            .priority(TaskPriority::Normal)
            .build()
            .unwrap()
    }

    fn workspace_for(agent_id: Uuid) -> Workspace {
        Workspace {
            id: Uuid::new_v4(),
            agent_id,
            label: "agent-deadbeef-0".to_string(),
            path: PathBuf::from("/tmp/agent-deadbeef-0"),
            base_ref: "main".to_string(),
            base_revision: 0,
            sequence: 0,
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
            released_at: None,
        }
    }

    fn consistent_world() -> OrchestratorSnapshot {
        let mut worker = agent("worker-1");
        worker.transition_to(AgentState::Idle).unwrap();
        let mut job = task("active job");
        job.assign_to(worker.id).unwrap();
        worker.begin_task(job.id).unwrap();

        let workspace = workspace_for(worker.id);
        worker.workspace = Some(workspace.id);

        OrchestratorSnapshot::new(
            vec![worker],
            vec![job, task("waiting job")],
            vec![workspace],
            HashMap::new(),
        )
    }

    #[test]
    fn test_consistent_snapshot_validates() {
        assert!(consistent_world().validate().is_ok());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut snapshot = consistent_world();
        snapshot.format_version = 99;
        let err = snapshot.validate().unwrap_err();
        assert!(matches!(err, Error::CorruptedSnapshot { .. }));
    }

    #[test]
    fn test_working_agent_without_task_rejected() {
        let mut snapshot = consistent_world();
        snapshot.agents[0].current_task = None;
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_active_task_with_idle_agent_rejected() {
        let mut snapshot = consistent_world();
        snapshot.agents[0].state = AgentState::Idle;
        snapshot.agents[0].current_task = None;
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut snapshot = consistent_world();
        snapshot.tasks[1].depends_on.push(Uuid::new_v4());
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_duplicate_live_names_rejected() {
        let mut snapshot = consistent_world();
        let mut twin = agent("worker-1");
        twin.transition_to(AgentState::Idle).unwrap();
        snapshot.agents.push(twin);
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_terminated_twin_name_allowed() {
        let mut snapshot = consistent_world();
        let mut gone = agent("worker-1");
        gone.transition_to(AgentState::Idle).unwrap();
        gone.transition_to(AgentState::Terminating).unwrap();
        gone.transition_to(AgentState::Terminated).unwrap();
        snapshot.agents.push(gone);
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_shared_workspace_rejected() {
        let mut snapshot = consistent_world();
        let workspace_id = snapshot.workspaces[0].id;
        let mut squatter = agent("worker-2");
        squatter.transition_to(AgentState::Idle).unwrap();
        squatter.workspace = Some(workspace_id);
        snapshot.agents.push(squatter);
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let snapshot = consistent_world();
        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        let parsed: OrchestratorSnapshot = serde_json::from_str(&json).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.tasks.len(), snapshot.tasks.len());
        // session bindings never survive a restart
        assert!(parsed.agents[0].session.is_none());
    }
}
