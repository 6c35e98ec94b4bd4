//! Message envelope and the closed wire taxonomy
//!
//! Every message exchanged between the conductor, the core, and agent
//! sessions is an [`Envelope`] carrying one of the [`MessageKind`] payloads.
//! Envelopes are immutable once constructed; the router touches only the
//! delivery-attempt counter.
//!
//! # Examples
//!
//! ```rust
//! use baton_core::message::{Envelope, MessageKind};
//! use uuid::Uuid;
//!
//! let core = Uuid::new_v4();
//! let agent = Uuid::new_v4();
//! let envelope = Envelope::to(
//!     core,
//!     agent,
//!     MessageKind::TaskComplete { task_id: Uuid::new_v4() },
//! );
//! assert!(!envelope.is_broadcast());
//! assert_eq!(envelope.kind.name(), "task_complete");
//! ```

use crate::agent::AgentState;
use crate::task::TaskPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of wire message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MessageKind {
    /// Conductor intent to spawn an agent
    SpawnRequest {
        role: String,
        name: String,
        capabilities: Vec<String>,
    },
    /// Spawn completed; the agent is idle in its workspace
    SpawnAck { agent_id: Uuid, workspace: String },
    /// Work dispatched to an agent session
    AssignTask {
        task_id: Uuid,
        description: String,
        priority: TaskPriority,
    },
    /// Advisory progress note; does not change task status
    TaskProgress { task_id: Uuid, note: String },
    TaskComplete { task_id: Uuid },
    TaskFailed { task_id: Uuid, reason: String },
    /// `agent_id` absent queries the whole pool
    StatusQuery { agent_id: Option<Uuid> },
    StatusReport {
        agent_id: Uuid,
        state: AgentState,
        current_task: Option<Uuid>,
    },
    TerminateRequest { agent_id: Uuid, force: bool },
    TerminateAck { agent_id: Uuid },
    /// Reserved liveness type; the router refreshes the sender's window
    Heartbeat,
    /// Handshake confirmation sent to a newly connected session
    ConnectionEstablished { session_id: Uuid },
    Error { code: String, message: String },
}

impl MessageKind {
    /// Wire name of the message type
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::SpawnRequest { .. } => "spawn_request",
            MessageKind::SpawnAck { .. } => "spawn_ack",
            MessageKind::AssignTask { .. } => "assign_task",
            MessageKind::TaskProgress { .. } => "task_progress",
            MessageKind::TaskComplete { .. } => "task_complete",
            MessageKind::TaskFailed { .. } => "task_failed",
            MessageKind::StatusQuery { .. } => "status_query",
            MessageKind::StatusReport { .. } => "status_report",
            MessageKind::TerminateRequest { .. } => "terminate_request",
            MessageKind::TerminateAck { .. } => "terminate_ack",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::ConnectionEstablished { .. } => "connection_established",
            MessageKind::Error { .. } => "error",
        }
    }

    /// Whether this is the reserved liveness type
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, MessageKind::Heartbeat)
    }
}

/// A routable message envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    pub sender: Uuid,
    /// Delivery target; `None` fans out to every other connected session
    pub target: Option<Uuid>,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
    pub delivery_attempts: u32,
}

impl Envelope {
    /// Create an envelope addressed to a specific session
    pub fn to(sender: Uuid, target: Uuid, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            target: Some(target),
            kind,
            sent_at: Utc::now(),
            delivery_attempts: 0,
        }
    }

    /// Create a broadcast envelope with no specific target
    pub fn broadcast(sender: Uuid, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            target: None,
            kind,
            sent_at: Utc::now(),
            delivery_attempts: 0,
        }
    }

    /// Create an `error` envelope from a domain error
    pub fn error_report(sender: Uuid, target: Uuid, error: &crate::Error) -> Self {
        Self::to(
            sender,
            target,
            MessageKind::Error {
                code: error.category().to_string(),
                message: error.to_string(),
            },
        )
    }

    /// Whether the envelope has no specific target
    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Record one delivery attempt; the only mutation the router performs
    pub fn note_delivery_attempt(&mut self) {
        self.delivery_attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_direct_and_broadcast_construction() {
        let sender = Uuid::new_v4();
        let target = Uuid::new_v4();

        let direct = Envelope::to(sender, target, MessageKind::Heartbeat);
        assert!(!direct.is_broadcast());
        assert_eq!(direct.target, Some(target));
        assert_eq!(direct.delivery_attempts, 0);

        let fanout = Envelope::broadcast(
            sender,
            MessageKind::Error {
                code: "internal".to_string(),
                message: "boom".to_string(),
            },
        );
        assert!(fanout.is_broadcast());
    }

    #[test]
    fn test_wire_shape() {
        let task_id = Uuid::new_v4();
        let envelope = Envelope::to(
            Uuid::new_v4(),
            Uuid::new_v4(),
            MessageKind::AssignTask {
                task_id,
                description: "Build the thing".to_string(),
                priority: TaskPriority::High,
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "assign_task");
        assert_eq!(value["taskId"], task_id.to_string());
        assert_eq!(value["priority"], "high");
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        let envelope = Envelope::to(Uuid::new_v4(), Uuid::new_v4(), MessageKind::Heartbeat);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(envelope.kind.is_heartbeat());
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::broadcast(
            Uuid::new_v4(),
            MessageKind::StatusReport {
                agent_id: Uuid::new_v4(),
                state: AgentState::Working,
                current_task: Some(Uuid::new_v4()),
            },
        );
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_error_report_carries_category() {
        let err = Error::duplicate_name("builder-1");
        let envelope = Envelope::error_report(Uuid::new_v4(), Uuid::new_v4(), &err);
        match &envelope.kind {
            MessageKind::Error { code, message } => {
                assert_eq!(code, "duplicate_name");
                assert!(message.contains("builder-1"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_delivery_attempts() {
        let mut envelope = Envelope::to(Uuid::new_v4(), Uuid::new_v4(), MessageKind::Heartbeat);
        envelope.note_delivery_attempt();
        assert_eq!(envelope.delivery_attempts, 1);
    }
}
