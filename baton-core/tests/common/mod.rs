//! Shared harness for the orchestration integration tests.
//!
//! Gives each test a started orchestrator on a temp workspace root, a
//! connected conductor session, and wire-level helpers so tests observe
//! the system the way a deployment does.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use tokio_test::assert_ok;
use uuid::Uuid;

use baton_core::agent::Agent;
use baton_core::config::OrchestratorConfig;
use baton_core::message::{Envelope, MessageKind};
use baton_core::orchestration::{Intent, IntentOutcome, Orchestrator, SessionHandle};
use baton_core::task::Task;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A started orchestrator plus the sessions tests speak through.
pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<Orchestrator>,
    pub conductor: SessionHandle,
    /// Extra session used only for flush queries, so its inbox carries
    /// nothing but the replies this harness asked for.
    probe: SessionHandle,
}

impl Harness {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let config = OrchestratorConfig::builder()
            .workspace_root(dir.path().join("workspaces"))
            .build()
            .unwrap();
        Self::start_with(dir, config).await
    }

    pub async fn start_with(dir: TempDir, config: OrchestratorConfig) -> Self {
        init_tracing();
        let engine = Orchestrator::builder().config(config).build().unwrap();
        engine.start().await.unwrap();
        let conductor = engine.connect_conductor().await.unwrap();
        let probe = engine.router().connect(Uuid::new_v4()).await.unwrap();
        Self {
            dir,
            engine,
            conductor,
            probe,
        }
    }

    pub async fn spawn(&self, name: &str, role: &str) -> Agent {
        self.spawn_with(name, role, &[]).await
    }

    pub async fn spawn_with(&self, name: &str, role: &str, extras: &[&str]) -> Agent {
        let outcome = self
            .engine
            .issue_intent(Intent::SpawnAgent {
                name: name.to_string(),
                role: role.to_string(),
                capabilities: extras.iter().map(|s| s.to_string()).collect(),
            })
            .await
            .unwrap();
        let IntentOutcome::AgentSpawning { agent } = outcome else {
            panic!("expected a spawning outcome");
        };
        agent
    }

    pub async fn spawn_connected(&self, name: &str, role: &str) -> (Agent, SessionHandle) {
        self.spawn_connected_with(name, role, &[]).await
    }

    pub async fn spawn_connected_with(
        &self,
        name: &str,
        role: &str,
        extras: &[&str],
    ) -> (Agent, SessionHandle) {
        let agent = self.spawn_with(name, role, extras).await;
        let handle = self.engine.connect_agent(agent.id).await.unwrap();
        let agent = self.engine.agent(agent.id).await.unwrap();
        (agent, handle)
    }

    pub async fn submit(&self, task: Task) -> (Task, bool) {
        let outcome = self
            .engine
            .issue_intent(Intent::SubmitTask { task })
            .await
            .unwrap();
        let IntentOutcome::TaskSubmitted { task, assigned } = outcome else {
            panic!("expected a submission outcome");
        };
        (task, assigned)
    }

    /// Send an envelope into the core the way an agent session does.
    pub async fn wire_send(&self, session_id: Uuid, kind: MessageKind) {
        tokio_test::assert_ok!(
            self.engine
                .router()
                .send(Envelope::to(session_id, self.engine.session_id(), kind))
                .await
        );
    }

    /// Report completion over the wire and wait for the conductor to see it.
    pub async fn report_complete(&mut self, handle: &SessionHandle, task_id: Uuid) {
        self.wire_send(handle.session_id, MessageKind::TaskComplete { task_id })
            .await;
        recv_kind(&mut self.conductor, "task_complete").await;
    }

    /// Report failure over the wire and wait for the conductor to see it.
    pub async fn report_failed(&mut self, handle: &SessionHandle, task_id: Uuid, reason: &str) {
        self.wire_send(
            handle.session_id,
            MessageKind::TaskFailed {
                task_id,
                reason: reason.to_string(),
            },
        )
        .await;
        recv_kind(&mut self.conductor, "task_failed").await;
    }

    /// Wait until the core has handled everything sent before this call.
    ///
    /// The dispatch loop is sequential, so once the probe's query reply
    /// comes back every earlier envelope has been fully processed.
    pub async fn settle_on(&mut self, agent_id: Uuid) {
        self.engine
            .router()
            .send(Envelope::to(
                self.probe.session_id,
                self.engine.session_id(),
                MessageKind::StatusQuery {
                    agent_id: Some(agent_id),
                },
            ))
            .await
            .unwrap();
        recv_kind(&mut self.probe, "status_report").await;
    }
}

pub fn task(description: &str, required: &[&str]) -> Task {
    let mut builder = Task::builder().description(description);
    for tag in required {
        builder = builder.required_capability(*tag);
    }
    builder.build().unwrap()
}

pub async fn recv(handle: &mut SessionHandle) -> Envelope {
    timeout(Duration::from_millis(500), handle.inbox.recv())
        .await
        .expect("timed out waiting for an envelope")
        .expect("inbox closed")
}

pub async fn recv_kind(handle: &mut SessionHandle, kind: &str) -> Envelope {
    loop {
        let envelope = recv(handle).await;
        if envelope.kind.name() == kind {
            return envelope;
        }
    }
}
