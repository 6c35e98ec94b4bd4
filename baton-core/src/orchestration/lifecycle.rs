//! Agent lifecycle manager
//!
//! [`AgentManager`] owns the authoritative agent table. Every functional
//! state change goes through one of its operations, each of which takes the
//! table's write lock, applies the transition through the [`Agent`] state
//! machine, and releases the lock before any I/O happens. Reads hand out
//! snapshots, never live references.
//!
//! Terminated agents stay in the table for audit; they drop out of the live
//! set and stop counting toward the agent cap.

use crate::agent::{Agent, AgentState};
use crate::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request to add a new agent to the pool
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub name: String,
    pub role: String,
    pub capabilities: Vec<String>,
}

impl SpawnSpec {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            capabilities,
        }
    }
}

/// Criteria applied by [`AgentManager::list`]
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub state: Option<AgentState>,
    pub role: Option<String>,
    pub capability: Option<String>,
    pub live_only: bool,
}

impl AgentFilter {
    /// Match every agent, including terminated history
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only agents in the live set
    pub fn live() -> Self {
        Self {
            live_only: true,
            ..Self::default()
        }
    }

    /// Match only agents in a specific state
    pub fn in_state(state: AgentState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Restrict to a role tag
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Restrict to agents carrying a capability tag
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    fn matches(&self, agent: &Agent) -> bool {
        if self.live_only && !agent.is_live() {
            return false;
        }
        if let Some(state) = self.state {
            if agent.state != state {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if &agent.role != role {
                return false;
            }
        }
        if let Some(capability) = &self.capability {
            if !agent.has_capability(capability) {
                return false;
            }
        }
        true
    }
}

/// Point-in-time agent counts for display collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatistics {
    pub total: usize,
    pub live: usize,
    pub spawning: usize,
    pub idle: usize,
    pub working: usize,
    pub terminating: usize,
    pub terminated: usize,
    pub errored: usize,
}

/// Authoritative store of agents and their lifecycle states
#[derive(Debug)]
pub struct AgentManager {
    agents: RwLock<HashMap<Uuid, Agent>>,
    max_live: u32,
}

impl AgentManager {
    /// Create a manager with an upper bound on the live set
    pub fn new(max_live: u32) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            max_live,
        }
    }

    /// Register a new agent in the `spawning` state.
    ///
    /// Fails with `DuplicateName` if a live agent already holds the name and
    /// with `ResourceExhausted` when the live set is at its cap.
    pub async fn register(&self, spec: SpawnSpec) -> Result<Agent> {
        let agent = Agent::new(spec.name, spec.role, spec.capabilities)?;

        let mut agents = self.agents.write().await;
        let live = agents.values().filter(|a| a.is_live()).count();
        if live >= self.max_live as usize {
            return Err(Error::resource_exhausted(
                "agents",
                format!("live agent cap of {} reached", self.max_live),
            ));
        }
        if agents
            .values()
            .any(|a| a.is_live() && a.name == agent.name)
        {
            return Err(Error::duplicate_name(agent.name));
        }
        agents.insert(agent.id, agent.clone());

        info!(
            agent_id = %agent.id,
            name = %agent.name,
            role = %agent.role,
            "Registered agent"
        );
        Ok(agent)
    }

    /// Record the workspace provisioned for an agent during spawn
    pub async fn attach_workspace(&self, agent_id: Uuid, workspace_id: Uuid) -> Result<Agent> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        agent.workspace = Some(workspace_id);
        Ok(agent.clone())
    }

    /// Bind a connected session to an agent.
    ///
    /// A `spawning` agent completes its handshake and becomes `idle`; an
    /// `idle` or `working` agent restored from a snapshot reconnects without
    /// a state change. An agent that already has a session is rejected.
    pub async fn bind_session(&self, agent_id: Uuid, session_id: Uuid) -> Result<Agent> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        if agent.session.is_some() {
            return Err(Error::validation(format!(
                "Agent {} already has a connected session",
                agent_id
            )));
        }
        match agent.state {
            AgentState::Spawning => {
                agent.transition_to(AgentState::Idle)?;
                agent.session = Some(session_id);
                agent.record_heartbeat();
                info!(agent_id = %agent_id, session_id = %session_id, "Agent spawn completed");
            }
            AgentState::Idle | AgentState::Working => {
                agent.session = Some(session_id);
                agent.record_heartbeat();
                info!(agent_id = %agent_id, session_id = %session_id, "Agent session reconnected");
            }
            other => {
                return Err(Error::invalid_transition(
                    format!("agent {}", agent_id),
                    other.as_str(),
                    AgentState::Idle.as_str(),
                ));
            }
        }
        Ok(agent.clone())
    }

    /// Atomically reserve an `idle` agent for a task, moving it to `working`
    pub async fn reserve_for_task(&self, agent_id: Uuid, task_id: Uuid) -> Result<Agent> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        agent.begin_task(task_id)?;
        debug!(agent_id = %agent_id, task_id = %task_id, "Reserved agent for task");
        Ok(agent.clone())
    }

    /// Return a `working` agent to `idle`, yielding the task it held
    pub async fn release_task(&self, agent_id: Uuid) -> Result<(Agent, Option<Uuid>)> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        let task = agent.finish_task()?;
        Ok((agent.clone(), task))
    }

    /// Move an agent to `error`, recording the fault.
    ///
    /// Returns the in-flight task the agent was holding, if any; the caller
    /// is responsible for requeueing it.
    pub async fn fault(&self, agent_id: Uuid, reason: impl Into<String>) -> Result<(Agent, Option<Uuid>)> {
        let reason = reason.into();
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        let in_flight = agent.current_task;
        agent.transition_to(AgentState::Error)?;
        agent.last_error = Some(reason.clone());
        warn!(agent_id = %agent_id, reason = %reason, "Agent faulted");
        Ok((agent.clone(), in_flight))
    }

    /// Operator action recovering an agent from `error` back to `idle`
    pub async fn recover(&self, agent_id: Uuid) -> Result<Agent> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        agent.transition_to(AgentState::Idle)?;
        info!(agent_id = %agent_id, "Agent recovered by operator");
        Ok(agent.clone())
    }

    /// Start tearing an agent down, moving it to `terminating`.
    ///
    /// Returns the in-flight task to requeue, if the agent was `working`.
    pub async fn begin_termination(&self, agent_id: Uuid) -> Result<(Agent, Option<Uuid>)> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        let in_flight = agent.current_task;
        agent.transition_to(AgentState::Terminating)?;
        info!(agent_id = %agent_id, "Agent termination started");
        Ok((agent.clone(), in_flight))
    }

    /// Complete teardown: `terminating -> terminated`, retained for audit
    pub async fn finish_termination(&self, agent_id: Uuid) -> Result<Agent> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        agent.transition_to(AgentState::Terminated)?;
        agent.session = None;
        info!(agent_id = %agent_id, name = %agent.name, "Agent terminated");
        Ok(agent.clone())
    }

    /// Refresh an agent's liveness timestamp without touching its state
    pub async fn record_heartbeat(&self, agent_id: Uuid) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = Self::live_mut(&mut agents, agent_id)?;
        agent.record_heartbeat();
        Ok(())
    }

    /// Snapshot of one agent, live or historical
    pub async fn get(&self, agent_id: Uuid) -> Option<Agent> {
        self.agents.read().await.get(&agent_id).cloned()
    }

    /// Live agent currently bound to a session
    pub async fn find_by_session(&self, session_id: Uuid) -> Option<Agent> {
        let agents = self.agents.read().await;
        agents
            .values()
            .find(|a| a.is_live() && a.session == Some(session_id))
            .cloned()
    }

    /// Live agent holding a name
    pub async fn find_by_name(&self, name: &str) -> Option<Agent> {
        let agents = self.agents.read().await;
        agents
            .values()
            .find(|a| a.is_live() && a.name == name)
            .cloned()
    }

    /// Filtered snapshot of the agent table, ordered by creation time
    pub async fn list(&self, filter: &AgentFilter) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut matched: Vec<Agent> = agents
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        matched.sort_by_key(|a| (a.created_at, a.id));
        matched
    }

    /// Snapshot of `idle` agents ordered by how long they have been waiting
    pub async fn idle_agents(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut idle: Vec<Agent> = agents
            .values()
            .filter(|a| a.is_available())
            .cloned()
            .collect();
        idle.sort_by_key(|a| (a.state_changed_at, a.id));
        idle
    }

    /// Number of agents counting toward the cap
    pub async fn live_count(&self) -> usize {
        let agents = self.agents.read().await;
        agents.values().filter(|a| a.is_live()).count()
    }

    /// Point-in-time counts by state
    pub async fn statistics(&self) -> AgentStatistics {
        let agents = self.agents.read().await;
        let mut stats = AgentStatistics {
            total: agents.len(),
            live: 0,
            spawning: 0,
            idle: 0,
            working: 0,
            terminating: 0,
            terminated: 0,
            errored: 0,
        };
        for agent in agents.values() {
            if agent.is_live() {
                stats.live += 1;
            }
            match agent.state {
                AgentState::Spawning => stats.spawning += 1,
                AgentState::Idle => stats.idle += 1,
                AgentState::Working => stats.working += 1,
                AgentState::Terminating => stats.terminating += 1,
                AgentState::Terminated => stats.terminated += 1,
                AgentState::Error => stats.errored += 1,
            }
        }
        stats
    }

    /// Copy of the whole table, for snapshotting
    pub async fn all(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut all: Vec<Agent> = agents.values().cloned().collect();
        all.sort_by_key(|a| (a.created_at, a.id));
        all
    }

    /// Rehydrate the table from a persisted snapshot.
    ///
    /// Session bindings are never persisted, so restored agents come back
    /// disconnected and reconnect (or lapse into `error`) on their own.
    pub async fn restore(&self, restored: Vec<Agent>) -> Result<()> {
        let mut agents = self.agents.write().await;
        debug!(count = restored.len(), "Restoring agent table");
        for agent in restored {
            agents.insert(agent.id, agent);
        }
        Ok(())
    }

    fn live_mut(agents: &mut HashMap<Uuid, Agent>, agent_id: Uuid) -> Result<&mut Agent> {
        let agent = agents
            .get_mut(&agent_id)
            .ok_or_else(|| Error::not_found("Agent", agent_id.to_string()))?;
        if !agent.is_live() {
            return Err(Error::not_found("Agent", agent_id.to_string()));
        }
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AgentManager {
        AgentManager::new(8)
    }

    fn spec(name: &str) -> SpawnSpec {
        SpawnSpec::new(name, "engineer", vec!["rust".to_string()])
    }

    async fn idle_agent(manager: &AgentManager, name: &str) -> Agent {
        let agent = manager.register(spec(name)).await.unwrap();
        manager
            .bind_session(agent.id, Uuid::new_v4())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_starts_spawning() {
        let manager = manager();
        let agent = manager.register(spec("builder-1")).await.unwrap();
        assert_eq!(agent.state, AgentState::Spawning);
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_live_name_rejected() {
        let manager = manager();
        manager.register(spec("builder-1")).await.unwrap();
        let result = manager.register(spec("builder-1")).await;
        assert!(matches!(result, Err(Error::DuplicateName { .. })));
    }

    #[tokio::test]
    async fn test_terminated_name_is_reusable() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        manager.begin_termination(agent.id).await.unwrap();
        manager.finish_termination(agent.id).await.unwrap();

        let fresh = manager.register(spec("builder-1")).await.unwrap();
        assert_ne!(fresh.id, agent.id);
        // history keeps the old record
        assert_eq!(manager.list(&AgentFilter::all()).await.len(), 2);
        assert_eq!(manager.list(&AgentFilter::live()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_live_cap_enforced() {
        let manager = AgentManager::new(1);
        manager.register(spec("one")).await.unwrap();
        let result = manager.register(spec("two")).await;
        assert!(matches!(result, Err(Error::ResourceExhausted { .. })));
    }

    #[tokio::test]
    async fn test_terminated_agents_free_cap() {
        let manager = AgentManager::new(1);
        let agent = idle_agent(&manager, "one").await;
        manager.begin_termination(agent.id).await.unwrap();
        manager.finish_termination(agent.id).await.unwrap();
        assert!(manager.register(spec("two")).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_session_completes_spawn() {
        let manager = manager();
        let agent = manager.register(spec("builder-1")).await.unwrap();
        let session = Uuid::new_v4();

        let bound = manager.bind_session(agent.id, session).await.unwrap();
        assert_eq!(bound.state, AgentState::Idle);
        assert_eq!(bound.session, Some(session));
        assert_eq!(manager.find_by_session(session).await.unwrap().id, agent.id);
    }

    #[tokio::test]
    async fn test_double_bind_rejected() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        let result = manager.bind_session(agent.id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn test_bind_session_rejects_errored_agent() {
        let manager = manager();
        let agent = manager.register(spec("builder-1")).await.unwrap();
        manager.fault(agent.id, "spawn timed out").await.unwrap();
        let result = manager.bind_session(agent.id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_preserves_working_state() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        let task = Uuid::new_v4();
        manager.reserve_for_task(agent.id, task).await.unwrap();

        // restored agents come back without a session
        let mut restored = manager.get(agent.id).await.unwrap();
        restored.session = None;
        manager.restore(vec![restored]).await.unwrap();

        let rebound = manager
            .bind_session(agent.id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(rebound.state, AgentState::Working);
        assert_eq!(rebound.current_task, Some(task));
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        let task = Uuid::new_v4();

        let reserved = manager.reserve_for_task(agent.id, task).await.unwrap();
        assert_eq!(reserved.state, AgentState::Working);
        assert_eq!(reserved.current_task, Some(task));
        assert!(manager.idle_agents().await.is_empty());

        let (released, finished) = manager.release_task(agent.id).await.unwrap();
        assert_eq!(released.state, AgentState::Idle);
        assert_eq!(finished, Some(task));
    }

    #[tokio::test]
    async fn test_reserve_requires_idle() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        manager
            .reserve_for_task(agent.id, Uuid::new_v4())
            .await
            .unwrap();
        let result = manager.reserve_for_task(agent.id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_fault_yields_in_flight_task() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        let task = Uuid::new_v4();
        manager.reserve_for_task(agent.id, task).await.unwrap();

        let (faulted, in_flight) = manager.fault(agent.id, "heartbeat lost").await.unwrap();
        assert_eq!(faulted.state, AgentState::Error);
        assert_eq!(faulted.last_error.as_deref(), Some("heartbeat lost"));
        assert_eq!(in_flight, Some(task));
        assert!(faulted.current_task.is_none());
    }

    #[tokio::test]
    async fn test_recover_returns_to_idle() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        manager.fault(agent.id, "heartbeat lost").await.unwrap();

        let recovered = manager.recover(agent.id).await.unwrap();
        assert_eq!(recovered.state, AgentState::Idle);
        assert!(recovered.last_error.is_none());

        // recovery is only valid out of the error state
        let result = manager.recover(agent.id).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_termination_roundtrip() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        let task = Uuid::new_v4();
        manager.reserve_for_task(agent.id, task).await.unwrap();

        let (terminating, in_flight) = manager.begin_termination(agent.id).await.unwrap();
        assert_eq!(terminating.state, AgentState::Terminating);
        assert_eq!(in_flight, Some(task));

        let terminated = manager.finish_termination(agent.id).await.unwrap();
        assert_eq!(terminated.state, AgentState::Terminated);
        assert!(terminated.session.is_none());
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_operations_reject_terminated_agents() {
        let manager = manager();
        let agent = idle_agent(&manager, "builder-1").await;
        manager.begin_termination(agent.id).await.unwrap();
        manager.finish_termination(agent.id).await.unwrap();

        assert!(matches!(
            manager.record_heartbeat(agent.id).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            manager.reserve_for_task(agent.id, Uuid::new_v4()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawning_agent_cannot_terminate_directly() {
        let manager = manager();
        let agent = manager.register(spec("builder-1")).await.unwrap();
        let result = manager.begin_termination(agent.id).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_filters() {
        let manager = manager();
        let worker = idle_agent(&manager, "worker-1").await;
        let reviewer = manager
            .register(SpawnSpec::new(
                "reviewer-1",
                "reviewer",
                vec!["review".to_string()],
            ))
            .await
            .unwrap();

        let idle = manager.list(&AgentFilter::in_state(AgentState::Idle)).await;
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, worker.id);

        let reviewers = manager.list(&AgentFilter::all().with_role("reviewer")).await;
        assert_eq!(reviewers.len(), 1);
        assert_eq!(reviewers[0].id, reviewer.id);

        let rusty = manager
            .list(&AgentFilter::live().with_capability("rust"))
            .await;
        assert_eq!(rusty.len(), 1);
        assert_eq!(rusty[0].id, worker.id);
    }

    #[tokio::test]
    async fn test_idle_agents_ordered_by_availability() {
        let manager = manager();
        let first = idle_agent(&manager, "first").await;
        let second = idle_agent(&manager, "second").await;

        // cycling through a task makes `first` the most recently available
        manager
            .reserve_for_task(first.id, Uuid::new_v4())
            .await
            .unwrap();
        manager.release_task(first.id).await.unwrap();

        let idle = manager.idle_agents().await;
        assert_eq!(idle[0].id, second.id);
        assert_eq!(idle[1].id, first.id);
    }

    #[tokio::test]
    async fn test_statistics() {
        let manager = manager();
        let working = idle_agent(&manager, "working").await;
        manager
            .reserve_for_task(working.id, Uuid::new_v4())
            .await
            .unwrap();
        idle_agent(&manager, "idle").await;
        manager.register(spec("spawning")).await.unwrap();

        let stats = manager.statistics().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.live, 3);
        assert_eq!(stats.working, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.spawning, 1);
        assert_eq!(stats.terminated, 0);
    }
}
