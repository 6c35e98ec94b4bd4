//! Workspace isolation manager
//!
//! Provisions one isolated working directory per agent, derived from a base
//! reference, and tracks agent→workspace bindings. Integration back into the
//! base uses a per-ref revision ledger: a merge-back release succeeds only if
//! the base has not moved since the workspace was provisioned, otherwise the
//! release fails with a merge conflict and the directory is preserved for
//! manual resolution.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status of an isolated working copy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    /// Bound to a live agent
    Active,
    /// Discarded or merged back; the directory is gone
    Released,
    /// Merge-back failed; the directory is preserved for manual resolution
    Conflicted,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Released => "released",
            WorkspaceStatus::Conflicted => "conflicted",
        }
    }
}

/// An isolated working copy bound to one agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub agent_id: Uuid,
    /// Derived label unique to the agent plus a monotonic disambiguator
    pub label: String,
    pub path: PathBuf,
    pub base_ref: String,
    /// Revision of `base_ref` observed at provision time
    pub base_revision: u64,
    /// Monotonic counter used in the label
    pub sequence: u64,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Workspace {
    /// Whether the workspace is still bound to its agent
    pub fn is_active(&self) -> bool {
        self.status == WorkspaceStatus::Active
    }
}

/// Manages isolated working copies under a shared root directory
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    workspaces: RwLock<HashMap<Uuid, Workspace>>,
    base_revisions: RwLock<HashMap<String, u64>>,
    sequence: AtomicU64,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`; the directory is created lazily
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            workspaces: RwLock::new(HashMap::new()),
            base_revisions: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Root directory all workspaces live under
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Provision an isolated copy of `base_ref` for an agent.
    ///
    /// Fails with `WorkspaceBusy` if the agent already holds an active
    /// workspace; the existing binding is left untouched.
    pub async fn provision(&self, agent_id: Uuid, base_ref: &str) -> Result<Workspace> {
        if base_ref.trim().is_empty() {
            return Err(Error::validation("Base ref cannot be empty"));
        }

        let base_revision = {
            let revisions = self.base_revisions.read().await;
            revisions.get(base_ref).copied().unwrap_or(0)
        };

        let workspace = {
            let mut workspaces = self.workspaces.write().await;
            if let Some(existing) = workspaces
                .values()
                .find(|w| w.agent_id == agent_id && w.is_active())
            {
                return Err(Error::workspace_busy(agent_id, existing.id));
            }

            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            let short_id = agent_id.simple().to_string();
            let label = format!("agent-{}-{}", &short_id[..8], sequence);
            let workspace = Workspace {
                id: Uuid::new_v4(),
                agent_id,
                path: self.root.join(&label),
                label,
                base_ref: base_ref.to_string(),
                base_revision,
                sequence,
                status: WorkspaceStatus::Active,
                created_at: Utc::now(),
                released_at: None,
            };
            workspaces.insert(workspace.id, workspace.clone());
            workspace
        };

        if let Err(e) = tokio::fs::create_dir_all(&workspace.path).await {
            let mut workspaces = self.workspaces.write().await;
            workspaces.remove(&workspace.id);
            return Err(Error::Io(format!(
                "failed to create workspace directory {}: {}",
                workspace.path.display(),
                e
            )));
        }

        info!(
            workspace_id = %workspace.id,
            agent_id = %agent_id,
            label = %workspace.label,
            base_ref = %base_ref,
            "Provisioned workspace"
        );
        Ok(workspace)
    }

    /// Release a workspace, either discarding the copy or merging it back.
    ///
    /// A merge-back against a base that moved since provision fails with
    /// `MergeConflict`; the directory and registry entry are preserved as
    /// `conflicted` so the operator can resolve manually.
    pub async fn release(&self, workspace_id: Uuid, merge: bool) -> Result<Workspace> {
        let workspace = {
            let workspaces = self.workspaces.read().await;
            workspaces
                .get(&workspace_id)
                .cloned()
                .ok_or_else(|| Error::not_found("Workspace", workspace_id.to_string()))?
        };
        if !workspace.is_active() {
            return Err(Error::invalid_transition(
                format!("workspace {}", workspace_id),
                workspace.status.as_str(),
                WorkspaceStatus::Released.as_str(),
            ));
        }

        let conflicted = if merge {
            let mut revisions = self.base_revisions.write().await;
            let current = revisions.entry(workspace.base_ref.clone()).or_insert(0);
            if *current != workspace.base_revision {
                true
            } else {
                *current += 1;
                false
            }
        } else {
            false
        };

        let released = {
            let mut workspaces = self.workspaces.write().await;
            let entry = workspaces
                .get_mut(&workspace_id)
                .ok_or_else(|| Error::not_found("Workspace", workspace_id.to_string()))?;
            if !entry.is_active() {
                return Err(Error::invalid_transition(
                    format!("workspace {}", workspace_id),
                    entry.status.as_str(),
                    WorkspaceStatus::Released.as_str(),
                ));
            }
            entry.status = if conflicted {
                WorkspaceStatus::Conflicted
            } else {
                WorkspaceStatus::Released
            };
            entry.released_at = Some(Utc::now());
            entry.clone()
        };

        if conflicted {
            warn!(
                workspace_id = %workspace_id,
                base_ref = %released.base_ref,
                "Merge-back conflicts with newer changes on base, preserving workspace"
            );
            return Err(Error::merge_conflict(workspace_id, released.base_ref));
        }

        if let Err(e) = tokio::fs::remove_dir_all(&released.path).await {
            // The binding is gone either way; a leftover directory is inert.
            warn!(
                workspace_id = %workspace_id,
                path = %released.path.display(),
                error = %e,
                "Failed to remove released workspace directory"
            );
        }

        info!(
            workspace_id = %workspace_id,
            agent_id = %released.agent_id,
            merged = merge,
            "Released workspace"
        );
        Ok(released)
    }

    /// Snapshot of workspaces currently bound to agents.
    ///
    /// Conflicted workspaces have no binding anymore and are not listed
    /// here; they stay visible through [`WorkspaceManager::list_all`].
    pub async fn list_active(&self) -> Vec<Workspace> {
        let workspaces = self.workspaces.read().await;
        let mut active: Vec<Workspace> = workspaces
            .values()
            .filter(|w| w.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|w| w.created_at);
        active
    }

    /// Snapshot of every workspace the manager knows about
    pub async fn list_all(&self) -> Vec<Workspace> {
        let workspaces = self.workspaces.read().await;
        let mut all: Vec<Workspace> = workspaces.values().cloned().collect();
        all.sort_by_key(|w| w.created_at);
        all
    }

    /// Look up a workspace by id
    pub async fn get(&self, workspace_id: Uuid) -> Option<Workspace> {
        let workspaces = self.workspaces.read().await;
        workspaces.get(&workspace_id).cloned()
    }

    /// The active workspace bound to an agent, if any
    pub async fn active_for_agent(&self, agent_id: Uuid) -> Option<Workspace> {
        let workspaces = self.workspaces.read().await;
        workspaces
            .values()
            .find(|w| w.agent_id == agent_id && w.is_active())
            .cloned()
    }

    /// Rehydrate bindings and the revision ledger from a persisted snapshot
    pub async fn restore(
        &self,
        restored: Vec<Workspace>,
        base_revisions: HashMap<String, u64>,
    ) -> Result<()> {
        let mut workspaces = self.workspaces.write().await;
        let next_sequence = restored
            .iter()
            .map(|w| w.sequence + 1)
            .max()
            .unwrap_or(0);
        self.sequence.store(next_sequence, Ordering::SeqCst);
        debug!(
            count = restored.len(),
            next_sequence, "Restoring workspace bindings"
        );
        for workspace in restored {
            workspaces.insert(workspace.id, workspace);
        }
        let mut revisions = self.base_revisions.write().await;
        *revisions = base_revisions;
        Ok(())
    }

    /// Copy of the per-base revision ledger, for snapshotting
    pub async fn base_revisions(&self) -> HashMap<String, u64> {
        self.base_revisions.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, WorkspaceManager) {
        let dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        (dir, manager)
    }

    #[tokio::test]
    async fn test_provision_creates_directory() {
        let (_dir, manager) = manager();
        let agent = Uuid::new_v4();

        let workspace = manager.provision(agent, "main").await.unwrap();
        assert!(workspace.path.exists());
        assert!(workspace.is_active());
        assert_eq!(workspace.agent_id, agent);
        assert_eq!(workspace.base_ref, "main");
    }

    #[tokio::test]
    async fn test_double_provision_is_busy() {
        let (_dir, manager) = manager();
        let agent = Uuid::new_v4();

        let first = manager.provision(agent, "main").await.unwrap();
        let result = manager.provision(agent, "main").await;
        assert!(matches!(result, Err(Error::WorkspaceBusy { .. })));

        // the original binding is unchanged
        let unchanged = manager.get(first.id).await.unwrap();
        assert!(unchanged.is_active());
        assert_eq!(unchanged.label, first.label);
        assert_eq!(manager.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_labels_stay_unique_across_respawn() {
        let (_dir, manager) = manager();
        let agent = Uuid::new_v4();

        let first = manager.provision(agent, "main").await.unwrap();
        manager.release(first.id, false).await.unwrap();
        let second = manager.provision(agent, "main").await.unwrap();

        assert_ne!(first.label, second.label);
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_independent_agents_do_not_interfere() {
        let (_dir, manager) = manager();
        let a = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        let b = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        assert_ne!(a.path, b.path);
        assert!(a.path.exists() && b.path.exists());
        assert_eq!(manager.list_active().await.len(), 2);
    }

    #[tokio::test]
    async fn test_discard_release_removes_directory() {
        let (_dir, manager) = manager();
        let workspace = manager.provision(Uuid::new_v4(), "main").await.unwrap();

        let released = manager.release(workspace.id, false).await.unwrap();
        assert_eq!(released.status, WorkspaceStatus::Released);
        assert!(released.released_at.is_some());
        assert!(!workspace.path.exists());
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_merge_release_advances_base() {
        let (_dir, manager) = manager();
        let workspace = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        assert_eq!(workspace.base_revision, 0);

        manager.release(workspace.id, true).await.unwrap();

        // a later provision observes the advanced base
        let next = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        assert_eq!(next.base_revision, 1);
    }

    #[tokio::test]
    async fn test_concurrent_merges_conflict() {
        let (_dir, manager) = manager();
        let first = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        let second = manager.provision(Uuid::new_v4(), "main").await.unwrap();

        manager.release(first.id, true).await.unwrap();
        let result = manager.release(second.id, true).await;
        assert!(matches!(result, Err(Error::MergeConflict { .. })));

        // the conflicted workspace is preserved for manual resolution,
        // outside the active set
        let preserved = manager.get(second.id).await.unwrap();
        assert_eq!(preserved.status, WorkspaceStatus::Conflicted);
        assert!(preserved.path.exists());
        assert!(manager.list_active().await.is_empty());
        assert_eq!(manager.list_all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_conflict_does_not_block_reprovision() {
        let (_dir, manager) = manager();
        let agent = Uuid::new_v4();
        let other = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        let mine = manager.provision(agent, "main").await.unwrap();

        manager.release(other.id, true).await.unwrap();
        assert!(manager.release(mine.id, true).await.is_err());

        // the failed release still ended the active binding
        let fresh = manager.provision(agent, "main").await.unwrap();
        assert!(fresh.is_active());
    }

    #[tokio::test]
    async fn test_release_unknown_workspace() {
        let (_dir, manager) = manager();
        let result = manager.release(Uuid::new_v4(), false).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_double_release_rejected() {
        let (_dir, manager) = manager();
        let workspace = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        manager.release(workspace.id, false).await.unwrap();
        let result = manager.release(workspace.id, false).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_restore_continues_sequence() {
        let (_dir, manager) = manager();
        let workspace = manager.provision(Uuid::new_v4(), "main").await.unwrap();
        let all = manager.list_all().await;
        let revisions = manager.base_revisions().await;

        let (_dir2, restored_manager) = self::manager();
        restored_manager.restore(all, revisions).await.unwrap();

        let binding = restored_manager.get(workspace.id).await.unwrap();
        assert_eq!(binding.label, workspace.label);

        let next = restored_manager
            .provision(Uuid::new_v4(), "main")
            .await
            .unwrap();
        assert!(next.sequence > workspace.sequence);
    }

    #[tokio::test]
    async fn test_empty_base_ref_rejected() {
        let (_dir, manager) = manager();
        let result = manager.provision(Uuid::new_v4(), "  ").await;
        assert!(matches!(result, Err(Error::Validation { .. })));
    }
}
