//! Task domain model and queue status machine
//!
//! Tasks move through `queued -> assigned -> in_progress` toward one of the
//! terminal statuses `completed`, `failed`, or `cancelled`. An assigned or
//! in-progress task can also be returned to `queued` when its agent is
//! terminated or faults mid-task.
//!
//! # Examples
//!
//! ```rust
//! use baton_core::task::{Task, TaskPriority, TaskStatus};
//! use uuid::Uuid;
//!
//! let mut task = Task::builder()
//!     .description("Wire up the login form")
//!     .priority(TaskPriority::High)
//!     .required_capability("frontend")
//!     .preferred_capability("react")
//!     .build()
//!     .unwrap();
//!
//! let agent = Uuid::new_v4();
//! task.assign_to(agent).unwrap();
//! assert_eq!(task.status, TaskStatus::Assigned);
//! task.complete().unwrap();
//! assert!(task.completed_at.is_some());
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority tier of a task; later variants outrank earlier ones
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Wire name of the priority
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

/// Queue status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status ends the task's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the status machine permits moving to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Assigned)
                | (Queued, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (Assigned, Queued)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Queued)
        )
    }
}

/// A unit of work in the backlog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Tags an agent must carry to take this task
    pub required_capabilities: Vec<String>,
    /// Tags that improve an agent's score but are not required
    pub preferred_capabilities: Vec<String>,
    /// Tasks that must be completed before this one leaves `queued`
    pub depends_on: Vec<Uuid>,
    pub assigned_agent: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new queued task with validation
    pub fn new(
        description: String,
        priority: TaskPriority,
        required_capabilities: Vec<String>,
        preferred_capabilities: Vec<String>,
        depends_on: Vec<Uuid>,
    ) -> Result<Self> {
        Self::validate_description(&description)?;
        Self::validate_tags(&required_capabilities)?;
        Self::validate_tags(&preferred_capabilities)?;

        Ok(Self {
            id: Uuid::new_v4(),
            description,
            priority,
            status: TaskStatus::Queued,
            required_capabilities,
            preferred_capabilities,
            depends_on,
            assigned_agent: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        })
    }

    /// Create a builder for constructing a Task
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    fn validate_description(description: &str) -> Result<()> {
        if description.trim().is_empty() {
            return Err(Error::validation("Task description cannot be empty"));
        }
        if description.len() > 2000 {
            return Err(Error::validation(
                "Task description cannot exceed 2000 characters",
            ));
        }
        Ok(())
    }

    fn validate_tags(tags: &[String]) -> Result<()> {
        for tag in tags {
            if tag.trim().is_empty() {
                return Err(Error::validation("Capability tags cannot be empty"));
            }
            if tag.len() > 50 {
                return Err(Error::validation(
                    "Capability tags cannot exceed 50 characters",
                ));
            }
        }
        Ok(())
    }

    /// Move to `next`, rejecting edges the status machine does not allow
    pub fn set_status(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(
                format!("task {}", self.id),
                self.status.as_str(),
                next.as_str(),
            ));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        if next == TaskStatus::Queued {
            self.assigned_agent = None;
        }
        Ok(())
    }

    /// Assign the task to an agent, moving `queued -> assigned`
    pub fn assign_to(&mut self, agent_id: Uuid) -> Result<()> {
        if self.status != TaskStatus::Queued {
            return Err(Error::invalid_transition(
                format!("task {}", self.id),
                self.status.as_str(),
                TaskStatus::Assigned.as_str(),
            ));
        }
        self.set_status(TaskStatus::Assigned)?;
        self.assigned_agent = Some(agent_id);
        Ok(())
    }

    /// Mark execution underway, moving `assigned -> in_progress`
    pub fn start(&mut self) -> Result<()> {
        self.set_status(TaskStatus::InProgress)
    }

    /// Mark the task completed
    pub fn complete(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Completed)
    }

    /// Mark the task failed with a reason
    pub fn fail<S: Into<String>>(&mut self, reason: S) -> Result<()> {
        self.set_status(TaskStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Cancel the task; permitted only while `queued` or `assigned`
    pub fn cancel(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Cancelled)
    }

    /// Return the task to the queue, preserving its dependency state
    pub fn requeue(&mut self) -> Result<()> {
        self.set_status(TaskStatus::Queued)
    }

    /// Whether the task currently occupies an agent
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// Whether the task has reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Builder for [`Task`]
#[derive(Debug, Default)]
pub struct TaskBuilder {
    description: Option<String>,
    priority: Option<TaskPriority>,
    required_capabilities: Vec<String>,
    preferred_capabilities: Vec<String>,
    depends_on: Vec<Uuid>,
}

impl TaskBuilder {
    /// Create a new empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task description
    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the priority tier
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add a required capability tag
    pub fn required_capability<S: Into<String>>(mut self, tag: S) -> Self {
        self.required_capabilities.push(tag.into());
        self
    }

    /// Add multiple required capability tags
    pub fn required_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(tags.into_iter().map(Into::into));
        self
    }

    /// Add a preferred capability tag
    pub fn preferred_capability<S: Into<String>>(mut self, tag: S) -> Self {
        self.preferred_capabilities.push(tag.into());
        self
    }

    /// Add a dependency on another task
    pub fn depends_on(mut self, task_id: Uuid) -> Self {
        self.depends_on.push(task_id);
        self
    }

    /// Build the task, validating all fields
    pub fn build(self) -> Result<Task> {
        let description = self
            .description
            .ok_or_else(|| Error::validation("Task description is required"))?;
        Task::new(
            description,
            self.priority.unwrap_or(TaskPriority::Normal),
            self.required_capabilities,
            self.preferred_capabilities,
            self.depends_on,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task() -> Task {
        Task::builder()
            .description("Refactor the parser")
            .priority(TaskPriority::Normal)
            .required_capability("rust")
            .build()
            .unwrap()
    }

    #[test]
    fn test_task_builder() {
        let task = test_task();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert!(task.assigned_agent.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_priority_defaults_to_normal() {
        let task = Task::builder().description("anything").build().unwrap();
        assert_eq!(task.priority, TaskPriority::Normal);
    }

    #[test]
    fn test_description_validation() {
        assert!(Task::builder().build().is_err());
        assert!(Task::builder().description("   ").build().is_err());
        assert!(Task::builder()
            .description("x".repeat(2001))
            .build()
            .is_err());
    }

    #[test]
    fn test_tag_validation() {
        let result = Task::builder()
            .description("ok")
            .required_capability("")
            .build();
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_assignment_flow() {
        let mut task = test_task();
        let agent = Uuid::new_v4();

        task.assign_to(agent).unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_agent, Some(agent));

        task.start().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        task.complete().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        // the completing agent remains referenced for audit
        assert_eq!(task.assigned_agent, Some(agent));
    }

    #[test]
    fn test_double_assignment_rejected() {
        let mut task = test_task();
        task.assign_to(Uuid::new_v4()).unwrap();
        let result = task.assign_to(Uuid::new_v4());
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn test_failure_records_reason() {
        let mut task = test_task();
        task.assign_to(Uuid::new_v4()).unwrap();
        task.fail("compile error").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure_reason.as_deref(), Some("compile error"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_cancel_only_queued_or_assigned() {
        let mut task = test_task();
        task.cancel().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        let mut task = test_task();
        task.assign_to(Uuid::new_v4()).unwrap();
        task.cancel().unwrap();

        let mut task = test_task();
        task.assign_to(Uuid::new_v4()).unwrap();
        task.start().unwrap();
        assert!(task.cancel().is_err());
    }

    #[test]
    fn test_requeue_clears_agent_preserves_deps() {
        let dep = Uuid::new_v4();
        let mut task = Task::builder()
            .description("dependent work")
            .depends_on(dep)
            .build()
            .unwrap();
        task.assign_to(Uuid::new_v4()).unwrap();

        task.requeue().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.depends_on, vec![dep]);
    }

    #[test]
    fn test_terminal_statuses_are_final() {
        let mut task = test_task();
        task.assign_to(Uuid::new_v4()).unwrap();
        task.complete().unwrap();
        assert!(task.set_status(TaskStatus::Queued).is_err());
        assert!(task.cancel().is_err());
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&TaskPriority::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }
}
