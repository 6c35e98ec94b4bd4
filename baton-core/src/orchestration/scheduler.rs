//! Task queue with priority and dependency ordering
//!
//! [`TaskQueue`] owns the backlog. Ordering is priority first (critical
//! outranks high outranks normal outranks low), FIFO within a tier.
//! Eligibility re-derives dependency state from the table at each check
//! rather than caching it, so a dependency completing makes its dependents
//! visible on the very next pass.
//!
//! Agent matching lives in the assignment engine; [`TaskQueue::assign`] only
//! re-validates dependencies and required capabilities under the write lock
//! so a stale candidate list cannot slip an ineligible task through.

use crate::agent::Agent;
use crate::task::{Task, TaskStatus};
use crate::{Error, Result};
use std::cmp::Reverse;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Point-in-time task counts for display collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total: usize,
    pub queued: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Authoritative store of tasks and their queue statuses
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the backlog.
    ///
    /// Every id in the task's dependency list must already be in the queue;
    /// a reference to an unknown task is rejected outright rather than left
    /// to block forever.
    pub async fn submit(&self, task: Task) -> Result<Task> {
        if task.status != TaskStatus::Queued {
            return Err(Error::validation(format!(
                "Task {} must be queued at submission, not {}",
                task.id,
                task.status.as_str()
            )));
        }
        let mut tasks = self.tasks.write().await;
        if let Some(unknown) = task.depends_on.iter().find(|dep| !tasks.contains_key(dep)) {
            return Err(Error::validation(format!(
                "Task dependency {} does not reference a known task",
                unknown
            )));
        }
        let stored = task.clone();
        tasks.insert(task.id, task);
        info!(
            task_id = %stored.id,
            priority = %stored.priority.as_str(),
            "Task submitted"
        );
        Ok(stored)
    }

    /// Queued tasks in queue order: priority tier, then FIFO within a tier
    pub async fn queued_in_order(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut queued: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|t| (Reverse(t.priority), t.created_at, t.id));
        queued
    }

    /// Queued tasks whose dependencies are all completed, in queue order
    pub async fn eligible_in_order(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut eligible: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && Self::deps_completed(&tasks, t))
            .cloned()
            .collect();
        eligible.sort_by_key(|t| (Reverse(t.priority), t.created_at, t.id));
        eligible
    }

    /// Move a task to `assigned` for a specific agent.
    ///
    /// Dependencies and required capabilities are re-derived under the write
    /// lock; candidates picked from an earlier snapshot cannot bypass them.
    pub async fn assign(&self, task_id: Uuid, agent: &Agent) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        {
            let task = Self::known(&tasks, task_id)?;
            if let Some(dependency) = task
                .depends_on
                .iter()
                .find(|dep| !Self::dep_completed(&tasks, dep))
            {
                return Err(Error::dependency_unmet(task_id, *dependency));
            }
            if !agent.has_all_capabilities(&task.required_capabilities) {
                let missing: Vec<String> = task
                    .required_capabilities
                    .iter()
                    .filter(|c| !agent.has_capability(c))
                    .cloned()
                    .collect();
                return Err(Error::capability_mismatch(agent.id, missing));
            }
        }
        let task = Self::known_mut(&mut tasks, task_id)?;
        task.assign_to(agent.id)?;
        info!(task_id = %task_id, agent_id = %agent.id, "Task assigned");
        Ok(task.clone())
    }

    /// Mark execution underway, `assigned -> in_progress`
    pub async fn start(&self, task_id: Uuid) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = Self::known_mut(&mut tasks, task_id)?;
        task.start()?;
        debug!(task_id = %task_id, "Task started");
        Ok(task.clone())
    }

    /// Record an advisory progress note; status is unchanged
    pub async fn record_progress(&self, task_id: Uuid, note: &str) -> Result<Task> {
        let tasks = self.tasks.read().await;
        let task = Self::known(&tasks, task_id)?;
        if !task.is_active() {
            return Err(Error::validation(format!(
                "Task {} is {} and not accepting progress reports",
                task_id,
                task.status.as_str()
            )));
        }
        debug!(task_id = %task_id, note = %note, "Task progress");
        Ok(task.clone())
    }

    /// Mark a task completed, unblocking its dependents
    pub async fn complete(&self, task_id: Uuid) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = Self::known_mut(&mut tasks, task_id)?;
        task.complete()?;
        info!(task_id = %task_id, "Task completed");
        Ok(task.clone())
    }

    /// Mark a task failed; dependents stay blocked until resubmitted anew
    pub async fn fail(&self, task_id: Uuid, reason: impl Into<String>) -> Result<Task> {
        let reason = reason.into();
        let mut tasks = self.tasks.write().await;
        let task = Self::known_mut(&mut tasks, task_id)?;
        task.fail(reason.clone())?;
        info!(task_id = %task_id, reason = %reason, "Task failed");
        Ok(task.clone())
    }

    /// Cancel a `queued` or `assigned` task.
    ///
    /// The returned snapshot keeps the assigned-agent reference so the
    /// caller can free that agent.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = Self::known_mut(&mut tasks, task_id)?;
        task.cancel()?;
        info!(task_id = %task_id, "Task cancelled");
        Ok(task.clone())
    }

    /// Return an active task to `queued`, preserving its dependency state
    pub async fn requeue(&self, task_id: Uuid) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = Self::known_mut(&mut tasks, task_id)?;
        task.requeue()?;
        info!(task_id = %task_id, "Task requeued");
        Ok(task.clone())
    }

    /// Snapshot of one task
    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// Copy of the whole backlog ordered by creation time
    pub async fn all(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        all
    }

    /// Point-in-time counts by status
    pub async fn statistics(&self) -> QueueStatistics {
        let tasks = self.tasks.read().await;
        let mut stats = QueueStatistics {
            total: tasks.len(),
            queued: 0,
            assigned: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Rehydrate the backlog from a persisted snapshot
    pub async fn restore(&self, restored: Vec<Task>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        debug!(count = restored.len(), "Restoring task backlog");
        for task in restored {
            tasks.insert(task.id, task);
        }
        Ok(())
    }

    fn deps_completed(tasks: &HashMap<Uuid, Task>, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| Self::dep_completed(tasks, dep))
    }

    fn dep_completed(tasks: &HashMap<Uuid, Task>, dep: &Uuid) -> bool {
        tasks
            .get(dep)
            .map(|d| d.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    fn known(tasks: &HashMap<Uuid, Task>, task_id: Uuid) -> Result<&Task> {
        tasks
            .get(&task_id)
            .ok_or_else(|| Error::not_found("Task", task_id.to_string()))
    }

    fn known_mut(tasks: &mut HashMap<Uuid, Task>, task_id: Uuid) -> Result<&mut Task> {
        tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::not_found("Task", task_id.to_string()))
    }
}
