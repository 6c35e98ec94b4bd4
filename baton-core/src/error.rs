//! Error types for orchestration operations

use thiserror::Error;
use uuid::Uuid;

/// Core error type for orchestration operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Spawn timed out: agent {agent_id} saw no acknowledgement within {timeout_seconds}s")]
    SpawnTimeout { agent_id: Uuid, timeout_seconds: u64 },

    #[error("Duplicate name: a live agent is already named '{name}'")]
    DuplicateName { name: String },

    #[error("Target unavailable: session {target} is not connected")]
    TargetUnavailable { target: Uuid },

    #[error("Workspace busy: agent {agent_id} already holds workspace {workspace_id}")]
    WorkspaceBusy { agent_id: Uuid, workspace_id: Uuid },

    #[error("Merge conflict: workspace {workspace_id} conflicts with changes on '{base_ref}'")]
    MergeConflict { workspace_id: Uuid, base_ref: String },

    #[error("Invalid transition: {entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Dependency unmet: task {task_id} depends on incomplete task {dependency}")]
    DependencyUnmet { task_id: Uuid, dependency: Uuid },

    #[error("Capability mismatch: agent {agent_id} lacks required tags {missing:?}")]
    CapabilityMismatch { agent_id: Uuid, missing: Vec<String> },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Corrupted snapshot: {message}")]
    CorruptedSnapshot { message: String },

    #[error("Resource exhausted: {resource} - {message}")]
    ResourceExhausted { resource: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Error {
    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid-transition error for a named entity
    pub fn invalid_transition<S1, S2, S3>(entity: S1, from: S2, to: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::InvalidTransition {
            entity: entity.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a corrupted snapshot error
    pub fn corrupted_snapshot<S: Into<String>>(message: S) -> Self {
        Self::CorruptedSnapshot {
            message: message.into(),
        }
    }

    /// Create a spawn timeout error
    pub fn spawn_timeout(agent_id: Uuid, timeout_seconds: u64) -> Self {
        Self::SpawnTimeout {
            agent_id,
            timeout_seconds,
        }
    }

    /// Create a duplicate name error
    pub fn duplicate_name<S: Into<String>>(name: S) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Create a target unavailable error
    pub fn target_unavailable(target: Uuid) -> Self {
        Self::TargetUnavailable { target }
    }

    /// Create a workspace busy error
    pub fn workspace_busy(agent_id: Uuid, workspace_id: Uuid) -> Self {
        Self::WorkspaceBusy {
            agent_id,
            workspace_id,
        }
    }

    /// Create a merge conflict error
    pub fn merge_conflict(workspace_id: Uuid, base_ref: impl Into<String>) -> Self {
        Self::MergeConflict {
            workspace_id,
            base_ref: base_ref.into(),
        }
    }

    /// Create a dependency unmet error
    pub fn dependency_unmet(task_id: Uuid, dependency: Uuid) -> Self {
        Self::DependencyUnmet {
            task_id,
            dependency,
        }
    }

    /// Create a capability mismatch error
    pub fn capability_mismatch(agent_id: Uuid, missing: Vec<String>) -> Self {
        Self::CapabilityMismatch { agent_id, missing }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted<S1: Into<String>, S2: Into<String>>(
        resource: S1,
        message: S2,
    ) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is recoverable (the caller can retry later)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TargetUnavailable { .. }
                | Error::MergeConflict { .. }
                | Error::ResourceExhausted { .. }
        )
    }

    /// Get the error category, also used as the wire `error` code
    pub fn category(&self) -> &'static str {
        match self {
            Error::SpawnTimeout { .. } => "spawn_timeout",
            Error::DuplicateName { .. } => "duplicate_name",
            Error::TargetUnavailable { .. } => "target_unavailable",
            Error::WorkspaceBusy { .. } => "workspace_busy",
            Error::MergeConflict { .. } => "merge_conflict",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::DependencyUnmet { .. } => "dependency_unmet",
            Error::CapabilityMismatch { .. } => "capability_mismatch",
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Configuration { .. } => "configuration",
            Error::CorruptedSnapshot { .. } => "corrupted_snapshot",
            Error::ResourceExhausted { .. } => "resource_exhausted",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

/// Convenience result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let validation_err = Error::validation("Test validation error");
        assert!(validation_err.is_validation());
        assert!(!validation_err.is_not_found());
        assert_eq!(validation_err.category(), "validation");

        let not_found_err = Error::not_found("Agent", "123");
        assert!(not_found_err.is_not_found());
        assert_eq!(not_found_err.category(), "not_found");

        let spawn_err = Error::spawn_timeout(Uuid::new_v4(), 60);
        assert_eq!(spawn_err.category(), "spawn_timeout");
        assert!(!spawn_err.is_recoverable());
    }

    #[test]
    fn test_error_recoverability() {
        assert!(!Error::validation("Invalid input").is_recoverable());
        assert!(Error::target_unavailable(Uuid::new_v4()).is_recoverable());
        assert!(Error::merge_conflict(Uuid::new_v4(), "main").is_recoverable());
        assert!(Error::resource_exhausted("agents", "live agent cap reached").is_recoverable());
        assert!(!Error::duplicate_name("builder-1").is_recoverable());
    }

    #[test]
    fn test_error_from_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let core_err: Error = json_err.into();
        assert_eq!(core_err.category(), "serialization");

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let core_err: Error = io_err.into();
        assert_eq!(core_err.category(), "io");
    }

    #[test]
    fn test_error_display() {
        let err = Error::invalid_transition("agent", "terminated", "working");
        let display_str = format!("{}", err);
        assert!(display_str.contains("Invalid transition"));
        assert!(display_str.contains("terminated"));
        assert!(display_str.contains("working"));

        let err = Error::duplicate_name("builder-1");
        assert!(format!("{}", err).contains("builder-1"));
    }
}
