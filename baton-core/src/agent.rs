//! Agent domain model and lifecycle state machine
//!
//! This module provides the agent representation used by the orchestration
//! core: identity, capability tags, and the lifecycle state machine
//! `spawning -> idle <-> working -> terminating -> terminated` with an
//! `error` state reachable from any live, non-terminating state.
//!
//! # Examples
//!
//! ```rust
//! use baton_core::agent::{Agent, AgentState};
//! use uuid::Uuid;
//!
//! let mut agent = Agent::builder()
//!     .name("builder-1")
//!     .role("engineer")
//!     .capability("rust")
//!     .capability("backend")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(agent.state, AgentState::Spawning);
//! agent.transition_to(AgentState::Idle).unwrap();
//! agent.begin_task(Uuid::new_v4()).unwrap();
//! assert_eq!(agent.state, AgentState::Working);
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Workspace provisioning and session handshake in progress
    Spawning,
    /// Connected with no current task, eligible for assignment
    Idle,
    /// Holds exactly one current task
    Working,
    /// Workspace release and session teardown in progress
    Terminating,
    /// Removed from the live set, retained for audit
    Terminated,
    /// Session flagged unusable; recovery requires operator action
    Error,
}

impl AgentState {
    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Spawning => "spawning",
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Terminating => "terminating",
            AgentState::Terminated => "terminated",
            AgentState::Error => "error",
        }
    }

    /// Whether an agent in this state counts toward the live set
    pub fn is_live(&self) -> bool {
        !matches!(self, AgentState::Terminated)
    }

    /// Whether the state machine permits moving to `next`
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Spawning, Idle)
                | (Spawning, Error)
                | (Idle, Working)
                | (Idle, Terminating)
                | (Idle, Error)
                | (Working, Idle)
                | (Working, Terminating)
                | (Working, Error)
                | (Terminating, Terminated)
                | (Error, Idle)
                | (Error, Terminating)
        )
    }
}

/// An agent in the orchestration pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub role: String,
    /// Capability tags, immutable after creation
    pub capabilities: Vec<String>,
    pub state: AgentState,
    pub current_task: Option<Uuid>,
    pub workspace: Option<Uuid>,
    /// Session binding, present only while connected; never persisted
    #[serde(skip)]
    pub session: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Create a new agent in the `spawning` state with validation
    pub fn new(name: String, role: String, capabilities: Vec<String>) -> Result<Self> {
        Self::validate_name(&name)?;
        Self::validate_role(&role)?;
        Self::validate_capabilities(&capabilities)?;

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            role,
            capabilities,
            state: AgentState::Spawning,
            current_task: None,
            workspace: None,
            session: None,
            last_error: None,
            created_at: now,
            state_changed_at: now,
            last_heartbeat: now,
        })
    }

    /// Create a builder for constructing an Agent
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::validation("Agent name cannot be empty"));
        }
        if name.len() > 100 {
            return Err(Error::validation("Agent name cannot exceed 100 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::validation(
                "Agent name can only contain alphanumeric characters, hyphens, and underscores",
            ));
        }
        Ok(())
    }

    fn validate_role(role: &str) -> Result<()> {
        if role.trim().is_empty() {
            return Err(Error::validation("Agent role cannot be empty"));
        }
        Ok(())
    }

    fn validate_capabilities(capabilities: &[String]) -> Result<()> {
        if capabilities.is_empty() {
            return Err(Error::validation(
                "Agent must have at least one capability",
            ));
        }
        for capability in capabilities {
            if capability.trim().is_empty() {
                return Err(Error::validation("Capability tags cannot be empty"));
            }
            if capability.len() > 50 {
                return Err(Error::validation(
                    "Capability tags cannot exceed 50 characters",
                ));
            }
        }
        Ok(())
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    ///
    /// Leaving `working` always clears the current task reference; the
    /// caller is responsible for requeueing or completing the task itself.
    pub fn transition_to(&mut self, next: AgentState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::invalid_transition(
                format!("agent {}", self.id),
                self.state.as_str(),
                next.as_str(),
            ));
        }
        if self.state == AgentState::Working && next != AgentState::Working {
            self.current_task = None;
        }
        if self.state == AgentState::Error && next == AgentState::Idle {
            self.last_error = None;
        }
        self.state = next;
        self.state_changed_at = Utc::now();
        Ok(())
    }

    /// Take on a task, moving `idle -> working`
    pub fn begin_task(&mut self, task_id: Uuid) -> Result<()> {
        if self.state != AgentState::Idle {
            return Err(Error::invalid_transition(
                format!("agent {}", self.id),
                self.state.as_str(),
                AgentState::Working.as_str(),
            ));
        }
        self.transition_to(AgentState::Working)?;
        self.current_task = Some(task_id);
        Ok(())
    }

    /// Finish the current task, moving `working -> idle`; returns the task id
    pub fn finish_task(&mut self) -> Result<Option<Uuid>> {
        if self.state != AgentState::Working {
            return Err(Error::invalid_transition(
                format!("agent {}", self.id),
                self.state.as_str(),
                AgentState::Idle.as_str(),
            ));
        }
        let task = self.current_task.take();
        self.transition_to(AgentState::Idle)?;
        Ok(task)
    }

    /// Update the liveness timestamp without altering functional state
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Check whether the agent carries a specific capability tag
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Check whether the agent carries every tag in `required`
    pub fn has_all_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.has_capability(c))
    }

    /// Count how many of the `preferred` tags the agent carries
    pub fn preferred_match_count(&self, preferred: &[String]) -> usize {
        preferred.iter().filter(|c| self.has_capability(c)).count()
    }

    /// Whether the agent is eligible to take on a task
    pub fn is_available(&self) -> bool {
        self.state == AgentState::Idle
    }

    /// Whether the agent counts toward the live set
    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }
}

/// Builder for [`Agent`]
#[derive(Debug, Default)]
pub struct AgentBuilder {
    name: Option<String>,
    role: Option<String>,
    capabilities: Vec<String>,
}

impl AgentBuilder {
    /// Create a new empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent name
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the agent role tag
    pub fn role<S: Into<String>>(mut self, role: S) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Add a single capability tag
    pub fn capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    /// Add multiple capability tags
    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Build the agent, validating all fields
    pub fn build(self) -> Result<Agent> {
        let name = self
            .name
            .ok_or_else(|| Error::validation("Agent name is required"))?;
        let role = self
            .role
            .ok_or_else(|| Error::validation("Agent role is required"))?;
        Agent::new(name, role, self.capabilities)
    }
}
