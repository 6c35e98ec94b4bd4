//! Orchestrator composing the router, agent table, task queue, and
//! workspace manager behind the conductor capability interface
//!
//! Conductor front-ends hand the engine an [`Intent`] and get back an
//! [`IntentOutcome`]; agent sessions talk to it in wire envelopes, which
//! [`Orchestrator::start`] drains from the core session inbox. Events flow
//! back out through the conductor session inbox and the router's observer
//! tap.
//!
//! The assignment pass runs after every mutation that could make a task
//! assignable: a submit, a completion or failure, a cancellation, an agent
//! connecting or recovering, and a termination that requeued work. Each
//! pass snapshots eligible tasks and idle agents, then commits one
//! assignment at a time by reserving the agent before the task and rolling
//! the reservation back if the queue refuses.
//!
//! Cross-store operations never hold two locks at once. Interleavings are
//! resolved by the per-store transition checks instead: whichever side
//! commits first wins, and the loser surfaces an `InvalidTransition` that
//! callers contain.

use crate::agent::{Agent, AgentState};
use crate::config::OrchestratorConfig;
use crate::message::{Envelope, MessageKind};
use crate::orchestration::catalog::{RoleCatalog, StaticRoleCatalog};
use crate::orchestration::lifecycle::{AgentFilter, AgentManager, AgentStatistics, SpawnSpec};
use crate::orchestration::router::{MessageRouter, SessionHandle};
use crate::orchestration::scheduler::{QueueStatistics, TaskQueue};
use crate::orchestration::workspace::{Workspace, WorkspaceManager};
use crate::snapshot::{OrchestratorSnapshot, SnapshotStore};
use crate::task::{Task, TaskStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A conductor command against the orchestration core
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Spawn an agent; `capabilities` are merged with the role profile's
    SpawnAgent {
        name: String,
        role: String,
        capabilities: Vec<String>,
    },
    /// Add a task to the backlog
    SubmitTask { task: Task },
    /// Cancel a `queued` or `assigned` task
    CancelTask { task_id: Uuid },
    /// Tear an agent down, gracefully or by force
    TerminateAgent { agent_id: Uuid, force: bool },
    /// Operator action bringing an `error` agent back to `idle`
    RecoverAgent { agent_id: Uuid },
    /// Snapshot one agent, or the whole live pool
    QueryStatus { agent_id: Option<Uuid> },
}

/// Synchronous result of an [`Intent`]
#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    /// The agent is registered and its workspace provisioned; the session
    /// handshake completes the spawn
    AgentSpawning { agent: Agent },
    /// The task is in the backlog; `assigned` reports whether the pass
    /// that followed dispatched it immediately
    TaskSubmitted { task: Task, assigned: bool },
    TaskCancelled { task: Task },
    /// Graceful teardown started; the agent session was asked to wind down
    TerminationStarted { agent: Agent },
    AgentTerminated { agent: Agent },
    /// `assigned` reports whether the recovered agent picked up work
    AgentRecovered { agent: Agent, assigned: bool },
    StatusReports { agents: Vec<Agent> },
}

/// Point-in-time counts across all stores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub agents: AgentStatistics,
    pub tasks: QueueStatistics,
    pub active_workspaces: usize,
}

/// The orchestration core
pub struct Orchestrator {
    config: OrchestratorConfig,
    router: Arc<MessageRouter>,
    agents: Arc<AgentManager>,
    queue: Arc<TaskQueue>,
    workspaces: Arc<WorkspaceManager>,
    catalog: Arc<dyn RoleCatalog>,
    store: Option<Arc<dyn SnapshotStore>>,
    /// Session the core itself occupies in the router
    core_session: Uuid,
    conductor: RwLock<Option<Uuid>>,
    spawn_watchdogs: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Handle back to the owning `Arc`, for background tasks
    weak: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Create a builder for constructing an Orchestrator
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Active configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Session id the core occupies; agent envelopes target this
    pub fn session_id(&self) -> Uuid {
        self.core_session
    }

    /// Router handle for session adapters
    pub fn router(&self) -> Arc<MessageRouter> {
        Arc::clone(&self.router)
    }

    /// Workspace manager handle, for manual conflict resolution
    pub fn workspaces(&self) -> Arc<WorkspaceManager> {
        Arc::clone(&self.workspaces)
    }

    /// Subscribe a read-only observer to all accepted traffic
    pub fn observe(&self) -> broadcast::Receiver<Envelope> {
        self.router.observe()
    }

    /// Snapshot of one agent, live or historical
    pub async fn agent(&self, agent_id: Uuid) -> Option<Agent> {
        self.agents.get(agent_id).await
    }

    /// Snapshot of one task
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.queue.get(task_id).await
    }

    /// Filtered snapshot of the agent table
    pub async fn list_agents(&self, filter: &AgentFilter) -> Vec<Agent> {
        self.agents.list(filter).await
    }

    /// Workspaces currently bound to agents
    pub async fn list_workspaces(&self) -> Vec<Workspace> {
        self.workspaces.list_active().await
    }

    /// Point-in-time counts across all stores
    pub async fn statistics(&self) -> OrchestratorStats {
        OrchestratorStats {
            agents: self.agents.statistics().await,
            tasks: self.queue.statistics().await,
            active_workspaces: self.workspaces.list_active().await.len(),
        }
    }

    /// Bring the core online.
    ///
    /// Connects the core session, rehydrates from the snapshot store when
    /// one is attached (a snapshot that fails validation halts startup),
    /// re-arms spawn watchdogs for agents persisted mid-spawn, and starts
    /// the dispatch and heartbeat-sweep loops.
    pub async fn start(&self) -> Result<()> {
        let engine = self
            .weak
            .upgrade()
            .ok_or_else(|| Error::Internal("orchestrator handle was dropped".to_string()))?;

        let handle = self.router.connect(self.core_session).await?;
        if let Err(e) = self.rehydrate().await {
            if self.router.disconnect(self.core_session).await.is_err() {
                debug!("Core session cleanup after failed rehydration");
            }
            return Err(e);
        }

        let mut inbox = handle.inbox;
        let dispatcher = Arc::clone(&engine);
        let dispatch = tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                // rejections were already answered toward the sender
                let _ = dispatcher.handle_envelope(envelope).await;
            }
            debug!("Dispatch loop stopped");
        });

        let sweeper = engine;
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.sweep_interval());
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.router.note_heartbeat(sweeper.core_session).await {
                    debug!(error = %e, "Core session heartbeat refresh failed");
                }
                sweeper.reclaim_stale(Utc::now()).await;
            }
        });

        let mut background = self.background.lock().await;
        background.push(dispatch);
        background.push(sweep);
        info!(session_id = %self.core_session, "Orchestrator started");
        Ok(())
    }

    async fn rehydrate(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let Some(snapshot) = store.load().await? else {
            return Ok(());
        };
        snapshot.validate()?;
        info!(
            agents = snapshot.agents.len(),
            tasks = snapshot.tasks.len(),
            workspaces = snapshot.workspaces.len(),
            captured_at = %snapshot.captured_at,
            "Rehydrating from snapshot"
        );
        let mid_spawn: Vec<Uuid> = snapshot
            .agents
            .iter()
            .filter(|a| a.state == AgentState::Spawning)
            .map(|a| a.id)
            .collect();
        let OrchestratorSnapshot {
            agents,
            tasks,
            workspaces,
            base_revisions,
            ..
        } = snapshot;
        self.agents.restore(agents).await?;
        self.queue.restore(tasks).await?;
        self.workspaces.restore(workspaces, base_revisions).await?;
        // a spawn that was pending at capture time gets a fresh window
        for agent_id in mid_spawn {
            self.arm_spawn_watchdog(agent_id).await;
        }
        Ok(())
    }

    /// Stop background work and persist a final snapshot
    pub async fn shutdown(&self) {
        {
            let mut background = self.background.lock().await;
            for handle in background.drain(..) {
                handle.abort();
            }
        }
        {
            let mut watchdogs = self.spawn_watchdogs.lock().await;
            for (_, handle) in watchdogs.drain() {
                handle.abort();
            }
        }
        if self.router.disconnect(self.core_session).await.is_err() {
            debug!("Core session was not connected at shutdown");
        }
        self.persist().await;
        info!("Orchestrator stopped");
    }

    /// Execute a conductor command
    pub async fn issue_intent(&self, intent: Intent) -> Result<IntentOutcome> {
        debug!(?intent, "Intent issued");
        match intent {
            Intent::SpawnAgent {
                name,
                role,
                capabilities,
            } => self.spawn_agent(name, role, capabilities).await,
            Intent::SubmitTask { task } => self.submit_task(task).await,
            Intent::CancelTask { task_id } => self.cancel_task(task_id).await,
            Intent::TerminateAgent { agent_id, force } => {
                self.terminate_agent(agent_id, force).await
            }
            Intent::RecoverAgent { agent_id } => self.recover_agent(agent_id).await,
            Intent::QueryStatus { agent_id } => self.query_status(agent_id).await,
        }
    }

    /// Register the conductor session, replacing any previous one
    pub async fn connect_conductor(&self) -> Result<SessionHandle> {
        let session_id = Uuid::new_v4();
        let handle = self.router.connect(session_id).await?;
        let previous = {
            let mut conductor = self.conductor.write().await;
            conductor.replace(session_id)
        };
        if let Some(previous) = previous {
            if self.router.disconnect(previous).await.is_err() {
                debug!(session_id = %previous, "Previous conductor session already gone");
            }
            info!(
                old_session = %previous,
                new_session = %session_id,
                "Conductor session replaced"
            );
        }
        let confirm = Envelope::to(
            self.core_session,
            session_id,
            MessageKind::ConnectionEstablished { session_id },
        );
        self.router.send(confirm).await?;
        info!(session_id = %session_id, "Conductor connected");
        Ok(handle)
    }

    /// Bind a fresh session to an agent.
    ///
    /// Completes the spawn handshake for a `spawning` agent, or reconnects
    /// an `idle`/`working` agent restored from a snapshot. A reconnected
    /// `working` agent has its in-flight task dispatched again.
    pub async fn connect_agent(&self, agent_id: Uuid) -> Result<SessionHandle> {
        let before = self
            .agents
            .get(agent_id)
            .await
            .ok_or_else(|| Error::not_found("Agent", agent_id.to_string()))?;
        let completing_spawn = before.state == AgentState::Spawning;

        let session_id = Uuid::new_v4();
        let handle = self.router.connect(session_id).await?;
        let agent = match self.agents.bind_session(agent_id, session_id).await {
            Ok(agent) => agent,
            Err(e) => {
                if self.router.disconnect(session_id).await.is_err() {
                    debug!(session_id = %session_id, "Session cleanup after failed bind");
                }
                return Err(e);
            }
        };
        self.disarm_spawn_watchdog(agent_id).await;

        let confirm = Envelope::to(
            self.core_session,
            session_id,
            MessageKind::ConnectionEstablished { session_id },
        );
        self.router.send(confirm).await?;

        if completing_spawn {
            let workspace = match agent.workspace {
                Some(workspace_id) => self
                    .workspaces
                    .get(workspace_id)
                    .await
                    .map(|w| w.label)
                    .unwrap_or_default(),
                None => String::new(),
            };
            self.notify_conductor(MessageKind::SpawnAck {
                agent_id,
                workspace,
            })
            .await;
            info!(agent_id = %agent_id, session_id = %session_id, "Spawn acknowledged");
        } else if agent.state == AgentState::Working {
            // restored mid-task; the new session needs its assignment again
            if let Some(task_id) = agent.current_task {
                if let Some(task) = self.queue.get(task_id).await {
                    let assignment = Envelope::to(
                        self.core_session,
                        session_id,
                        MessageKind::AssignTask {
                            task_id: task.id,
                            description: task.description.clone(),
                            priority: task.priority,
                        },
                    );
                    if let Err(e) = self.router.send(assignment).await {
                        warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "Re-dispatch after reconnect failed");
                    } else {
                        debug!(agent_id = %agent_id, task_id = %task_id, "Re-dispatched in-flight task");
                    }
                }
            }
        }

        self.notify_conductor(Self::report_kind(&agent)).await;
        self.assignment_pass().await;
        self.persist().await;
        Ok(handle)
    }

    /// Apply one wire envelope to the core.
    ///
    /// This is the entry point the dispatch loop drains the core inbox
    /// into; tests and embedded adapters may call it directly. A rejected
    /// envelope is answered with an `error` envelope and the rejection is
    /// also returned.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        let sender = envelope.sender;
        let kind = envelope.kind.name();
        if let Err(error) = self.dispatch_envelope(envelope).await {
            warn!(sender = %sender, kind, error = %error, "Rejected message");
            let reply = Envelope::error_report(self.core_session, sender, &error);
            if self.router.send(reply).await.is_err() {
                debug!(sender = %sender, "Error reply undeliverable");
            }
            return Err(error);
        }
        Ok(())
    }

    async fn dispatch_envelope(&self, envelope: Envelope) -> Result<()> {
        let sender = envelope.sender;
        match envelope.kind {
            MessageKind::Heartbeat => {
                // the router already refreshed the session window
                if let Some(agent) = self.agents.find_by_session(sender).await {
                    self.agents.record_heartbeat(agent.id).await?;
                }
                Ok(())
            }
            MessageKind::SpawnRequest {
                role,
                name,
                capabilities,
            } => {
                self.reply_with_outcome(
                    sender,
                    Intent::SpawnAgent {
                        name,
                        role,
                        capabilities,
                    },
                )
                .await
            }
            MessageKind::TerminateRequest { agent_id, force } => {
                self.reply_with_outcome(sender, Intent::TerminateAgent { agent_id, force })
                    .await
            }
            MessageKind::StatusQuery { agent_id } => {
                self.reply_with_outcome(sender, Intent::QueryStatus { agent_id })
                    .await
            }
            MessageKind::TaskProgress { task_id, note } => {
                self.on_task_progress(sender, task_id, note).await
            }
            MessageKind::TaskComplete { task_id } => self.on_task_complete(sender, task_id).await,
            MessageKind::TaskFailed { task_id, reason } => {
                self.on_task_failed(sender, task_id, reason).await
            }
            MessageKind::TerminateAck { agent_id } => self.on_terminate_ack(sender, agent_id).await,
            other => {
                debug!(sender = %sender, kind = other.name(), "Ignoring unexpected message kind");
                Ok(())
            }
        }
    }

    async fn reply_with_outcome(&self, sender: Uuid, intent: Intent) -> Result<()> {
        let outcome = self.issue_intent(intent).await?;
        match outcome {
            IntentOutcome::AgentSpawning { agent }
            | IntentOutcome::TerminationStarted { agent }
            | IntentOutcome::AgentTerminated { agent }
            | IntentOutcome::AgentRecovered { agent, .. } => {
                self.send_status_report(sender, &agent).await;
            }
            IntentOutcome::StatusReports { agents } => {
                for agent in &agents {
                    self.send_status_report(sender, agent).await;
                }
            }
            IntentOutcome::TaskSubmitted { .. } | IntentOutcome::TaskCancelled { .. } => {}
        }
        Ok(())
    }

    async fn spawn_agent(
        &self,
        name: String,
        role: String,
        extra_capabilities: Vec<String>,
    ) -> Result<IntentOutcome> {
        let profile = self.catalog.resolve(&role).await?;
        let mut capabilities = profile.capabilities;
        for tag in extra_capabilities {
            if !capabilities.contains(&tag) {
                capabilities.push(tag);
            }
        }

        let agent = self
            .agents
            .register(SpawnSpec::new(name, role, capabilities))
            .await?;

        let provisioned = self
            .bounded_workspace_io(
                agent.id,
                self.workspaces
                    .provision(agent.id, &self.config.default_base_ref),
            )
            .await;
        let workspace = match provisioned {
            Ok(workspace) => workspace,
            Err(e) => {
                // without a workspace the spawn cannot proceed
                if let Err(fault_err) = self.fault_agent(agent.id, e.clone()).await {
                    warn!(agent_id = %agent.id, error = %fault_err, "Could not fault agent after provisioning failure");
                }
                self.persist().await;
                return Err(e);
            }
        };
        let agent = self.agents.attach_workspace(agent.id, workspace.id).await?;

        // hand the spawn to the external runner through the observer tap
        self.router.publish(Envelope::broadcast(
            self.core_session,
            MessageKind::SpawnRequest {
                role: agent.role.clone(),
                name: agent.name.clone(),
                capabilities: agent.capabilities.clone(),
            },
        ));

        self.arm_spawn_watchdog(agent.id).await;
        self.persist().await;
        info!(
            agent_id = %agent.id,
            name = %agent.name,
            role = %agent.role,
            workspace = %workspace.label,
            "Agent spawning"
        );
        Ok(IntentOutcome::AgentSpawning { agent })
    }

    async fn submit_task(&self, task: Task) -> Result<IntentOutcome> {
        let task = self.queue.submit(task).await?;
        self.assignment_pass().await;
        let task = self.queue.get(task.id).await.unwrap_or(task);
        let assigned = task.status == TaskStatus::Assigned;
        self.persist().await;
        Ok(IntentOutcome::TaskSubmitted { task, assigned })
    }

    async fn cancel_task(&self, task_id: Uuid) -> Result<IntentOutcome> {
        let task = self.queue.cancel(task_id).await?;
        if let Some(agent_id) = task.assigned_agent {
            match self.agents.release_task(agent_id).await {
                Ok((agent, _)) => {
                    self.notify_conductor(Self::report_kind(&agent)).await;
                    self.assignment_pass().await;
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "Could not free agent of cancelled task")
                }
            }
        }
        self.persist().await;
        Ok(IntentOutcome::TaskCancelled { task })
    }

    async fn terminate_agent(&self, agent_id: Uuid, force: bool) -> Result<IntentOutcome> {
        let (agent, in_flight) = self.agents.begin_termination(agent_id).await?;
        if let Some(task_id) = in_flight {
            if let Err(e) = self.queue.requeue(task_id).await {
                warn!(task_id = %task_id, error = %e, "Could not requeue task of terminating agent");
            } else {
                info!(task_id = %task_id, agent_id = %agent_id, "Requeued in-flight task");
            }
        }

        let outcome = if force {
            let agent = self.teardown_agent(agent_id).await?;
            IntentOutcome::AgentTerminated { agent }
        } else {
            match agent.session {
                Some(session) => {
                    let request = Envelope::to(
                        self.core_session,
                        session,
                        MessageKind::TerminateRequest { agent_id, force },
                    );
                    match self.router.send(request).await {
                        Ok(()) => {
                            info!(agent_id = %agent_id, "Termination handshake started");
                            IntentOutcome::TerminationStarted { agent }
                        }
                        Err(e) => {
                            debug!(agent_id = %agent_id, error = %e, "Agent session unreachable, tearing down directly");
                            let agent = self.teardown_agent(agent_id).await?;
                            IntentOutcome::AgentTerminated { agent }
                        }
                    }
                }
                None => {
                    let agent = self.teardown_agent(agent_id).await?;
                    IntentOutcome::AgentTerminated { agent }
                }
            }
        };

        if in_flight.is_some() {
            self.assignment_pass().await;
        }
        self.persist().await;
        Ok(outcome)
    }

    async fn recover_agent(&self, agent_id: Uuid) -> Result<IntentOutcome> {
        let agent = self.agents.recover(agent_id).await?;
        self.notify_conductor(Self::report_kind(&agent)).await;
        self.assignment_pass().await;
        let agent = self.agents.get(agent_id).await.unwrap_or(agent);
        let assigned = agent.state == AgentState::Working;
        self.persist().await;
        Ok(IntentOutcome::AgentRecovered { agent, assigned })
    }

    async fn query_status(&self, agent_id: Option<Uuid>) -> Result<IntentOutcome> {
        let agents = match agent_id {
            Some(agent_id) => {
                let agent = self
                    .agents
                    .get(agent_id)
                    .await
                    .ok_or_else(|| Error::not_found("Agent", agent_id.to_string()))?;
                vec![agent]
            }
            None => self.agents.list(&AgentFilter::live()).await,
        };
        Ok(IntentOutcome::StatusReports { agents })
    }

    async fn on_task_progress(&self, sender: Uuid, task_id: Uuid, note: String) -> Result<()> {
        let agent = self.require_sender_agent(sender).await?;
        self.require_holds_task(&agent, task_id)?;
        self.queue.record_progress(task_id, &note).await?;
        self.notify_conductor(MessageKind::TaskProgress { task_id, note })
            .await;
        Ok(())
    }

    async fn on_task_complete(&self, sender: Uuid, task_id: Uuid) -> Result<()> {
        let agent = self.require_sender_agent(sender).await?;
        self.require_holds_task(&agent, task_id)?;
        self.queue.complete(task_id).await?;
        let (agent, _) = self.agents.release_task(agent.id).await?;
        info!(task_id = %task_id, agent_id = %agent.id, "Agent completed its task");
        self.notify_conductor(MessageKind::TaskComplete { task_id })
            .await;
        self.notify_conductor(Self::report_kind(&agent)).await;
        self.assignment_pass().await;
        self.persist().await;
        Ok(())
    }

    async fn on_task_failed(&self, sender: Uuid, task_id: Uuid, reason: String) -> Result<()> {
        let agent = self.require_sender_agent(sender).await?;
        self.require_holds_task(&agent, task_id)?;
        self.queue.fail(task_id, reason.clone()).await?;
        let (agent, _) = self.agents.release_task(agent.id).await?;
        warn!(task_id = %task_id, agent_id = %agent.id, reason = %reason, "Agent reported task failure");
        self.notify_conductor(MessageKind::TaskFailed { task_id, reason })
            .await;
        self.notify_conductor(Self::report_kind(&agent)).await;
        self.assignment_pass().await;
        self.persist().await;
        Ok(())
    }

    async fn on_terminate_ack(&self, sender: Uuid, agent_id: Uuid) -> Result<()> {
        let agent = self.require_sender_agent(sender).await?;
        if agent.id != agent_id {
            return Err(Error::validation(format!(
                "Session {} cannot acknowledge termination of agent {}",
                sender, agent_id
            )));
        }
        if agent.state != AgentState::Terminating {
            return Err(Error::invalid_transition(
                format!("agent {}", agent_id),
                agent.state.as_str(),
                AgentState::Terminated.as_str(),
            ));
        }
        self.teardown_agent(agent_id).await?;
        self.persist().await;
        Ok(())
    }

    /// Scan eligible tasks in queue order and dispatch what the idle pool
    /// can take. Returns the number of assignments committed.
    ///
    /// Safe to re-invoke at any time; a pass over an unchanged world
    /// commits nothing.
    pub async fn assignment_pass(&self) -> usize {
        let eligible = self.queue.eligible_in_order().await;
        if eligible.is_empty() {
            return 0;
        }
        // candidates need a session to dispatch to; restored agents that
        // have not reconnected yet are skipped, not faulted
        let mut idle: Vec<Agent> = self
            .agents
            .idle_agents()
            .await
            .into_iter()
            .filter(|a| a.session.is_some())
            .collect();
        let mut assigned = 0usize;

        for task in eligible {
            let best = idle
                .iter()
                .filter(|a| a.has_all_capabilities(&task.required_capabilities))
                .max_by(|x, y| {
                    x.preferred_match_count(&task.preferred_capabilities)
                        .cmp(&y.preferred_match_count(&task.preferred_capabilities))
                        .then_with(|| y.state_changed_at.cmp(&x.state_changed_at))
                        .then_with(|| y.id.cmp(&x.id))
                })
                .map(|a| a.id);
            let Some(agent_id) = best else {
                debug!(task_id = %task.id, "No idle agent satisfies the required tags");
                continue;
            };

            match self.commit_assignment(&task, agent_id).await {
                Ok(()) => assigned += 1,
                Err(e) => {
                    debug!(task_id = %task.id, agent_id = %agent_id, error = %e, "Assignment attempt failed");
                }
            }
            // taken or burned, the candidate is out of this pass
            idle.retain(|a| a.id != agent_id);
        }

        if assigned > 0 {
            debug!(assigned, "Assignment pass dispatched work");
            self.persist().await;
        }
        assigned
    }

    /// Bind one task to one agent and dispatch it.
    ///
    /// The agent is reserved first so a concurrent pass cannot double-book
    /// it; if the queue then refuses the task, the reservation is rolled
    /// back. A dispatch failure faults the agent and requeues the task.
    async fn commit_assignment(&self, task: &Task, agent_id: Uuid) -> Result<()> {
        let agent = self.agents.reserve_for_task(agent_id, task.id).await?;
        let assigned = match self.queue.assign(task.id, &agent).await {
            Ok(assigned) => assigned,
            Err(e) => {
                if let Err(rollback) = self.agents.release_task(agent_id).await {
                    warn!(agent_id = %agent_id, error = %rollback, "Reservation rollback failed");
                }
                return Err(e);
            }
        };

        let dispatched = match agent.session {
            Some(session) => {
                let assignment = Envelope::to(
                    self.core_session,
                    session,
                    MessageKind::AssignTask {
                        task_id: assigned.id,
                        description: assigned.description.clone(),
                        priority: assigned.priority,
                    },
                );
                self.router.send(assignment).await
            }
            None => Err(Error::validation(format!(
                "Agent {} has no connected session to dispatch to",
                agent_id
            ))),
        };

        if let Err(e) = dispatched {
            warn!(task_id = %task.id, agent_id = %agent_id, error = %e, "Dispatch failed, faulting agent");
            match self
                .agents
                .fault(agent_id, format!("assignment dispatch failed: {}", e))
                .await
            {
                Ok((_, Some(held))) => {
                    if let Err(requeue_err) = self.queue.requeue(held).await {
                        warn!(task_id = %held, error = %requeue_err, "Could not requeue undispatched task");
                    }
                }
                Ok((_, None)) => {}
                Err(fault_err) => {
                    warn!(agent_id = %agent_id, error = %fault_err, "Could not fault undispatchable agent")
                }
            }
            self.report_error(&e).await;
            return Err(e);
        }

        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            priority = assigned.priority.as_str(),
            "Task dispatched"
        );
        self.notify_conductor(Self::report_kind(
            &self.agents.get(agent_id).await.unwrap_or(agent),
        ))
        .await;
        Ok(())
    }

    /// Apply the reclamation policy to sessions whose heartbeat window
    /// lapsed as of `now`, and to restored agents that never reconnected.
    ///
    /// An `idle` or `working` agent is faulted with its task requeued; an
    /// agent stuck in `terminating` has its teardown pushed through.
    /// Returns the ids of reclaimed agents.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut reclaimed = Vec::new();

        for session_id in self.router.sweep_stale(now).await {
            let Some(agent) = self.agents.find_by_session(session_id).await else {
                // the conductor and the core have no agent to reclaim
                continue;
            };
            if self.reclaim_agent(&agent).await {
                reclaimed.push(agent.id);
            }
        }

        // agents restored without a session never enter the router's
        // staleness bookkeeping
        let window = self.config.heartbeat_window();
        for agent in self.agents.list(&AgentFilter::live()).await {
            if agent.session.is_some() || reclaimed.contains(&agent.id) {
                continue;
            }
            if now - agent.last_heartbeat > window && self.reclaim_agent(&agent).await {
                reclaimed.push(agent.id);
            }
        }

        if !reclaimed.is_empty() {
            self.persist().await;
        }
        reclaimed
    }

    async fn reclaim_agent(&self, agent: &Agent) -> bool {
        let result = match agent.state {
            AgentState::Idle | AgentState::Working => self
                .fault_agent(
                    agent.id,
                    Error::Internal(format!(
                        "agent {} missed the heartbeat window of {}s",
                        agent.id, self.config.heartbeat_window_seconds
                    )),
                )
                .await
                .map(|_| ()),
            AgentState::Terminating => {
                // the handshake never completed; push the teardown through
                self.teardown_agent(agent.id).await.map(|_| ())
            }
            // spawning agents belong to the spawn watchdog, and errored or
            // terminated ones have nothing left to reclaim
            _ => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Stale agent reclamation failed");
                false
            }
        }
    }

    /// Move an agent to `error`, requeue its in-flight work, and tell the
    /// conductor
    async fn fault_agent(&self, agent_id: Uuid, cause: Error) -> Result<Agent> {
        let (agent, in_flight) = self.agents.fault(agent_id, cause.to_string()).await?;
        if let Some(task_id) = in_flight {
            if let Err(e) = self.queue.requeue(task_id).await {
                warn!(task_id = %task_id, error = %e, "Could not requeue task of faulted agent");
            }
        }
        self.report_error(&cause).await;
        self.notify_conductor(Self::report_kind(&agent)).await;
        if in_flight.is_some() {
            self.assignment_pass().await;
        }
        Ok(agent)
    }

    /// Finish a termination: release the workspace, drop the session, and
    /// acknowledge the conductor
    async fn teardown_agent(&self, agent_id: Uuid) -> Result<Agent> {
        let session = self.agents.get(agent_id).await.and_then(|a| a.session);
        let agent = self.agents.finish_termination(agent_id).await?;

        if let Some(workspace) = self.workspaces.active_for_agent(agent_id).await {
            // release ends the binding before its blocking removal, so
            // even an expired release leaves nothing bound
            if let Err(e) = self
                .bounded_workspace_io(agent_id, self.workspaces.release(workspace.id, false))
                .await
            {
                warn!(
                    workspace_id = %workspace.id,
                    agent_id = %agent_id,
                    error = %e,
                    "Workspace release failed during teardown"
                );
            }
        }
        if let Some(session) = session {
            if self.router.disconnect(session).await.is_err() {
                debug!(session_id = %session, "Session already gone at teardown");
            }
        }

        self.notify_conductor(MessageKind::TerminateAck { agent_id })
            .await;
        Ok(agent)
    }

    /// Run a workspace operation under the spawn deadline.
    ///
    /// Provision and release are the only engine awaits that touch the
    /// filesystem; a stalled mount surfaces as `SpawnTimeout` instead of
    /// hanging the calling intent.
    async fn bounded_workspace_io<T>(
        &self,
        agent_id: Uuid,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.spawn_timeout(), operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::spawn_timeout(
                agent_id,
                self.config.spawn_timeout_seconds,
            )),
        }
    }

    async fn arm_spawn_watchdog(&self, agent_id: Uuid) {
        let weak = self.weak.clone();
        let timeout = self.config.spawn_timeout();
        let timeout_seconds = self.config.spawn_timeout_seconds;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(engine) = weak.upgrade() {
                engine.expire_spawn(agent_id, timeout_seconds).await;
            }
        });
        let mut watchdogs = self.spawn_watchdogs.lock().await;
        if let Some(previous) = watchdogs.insert(agent_id, handle) {
            previous.abort();
        }
    }

    async fn disarm_spawn_watchdog(&self, agent_id: Uuid) {
        let mut watchdogs = self.spawn_watchdogs.lock().await;
        if let Some(handle) = watchdogs.remove(&agent_id) {
            handle.abort();
        }
    }

    async fn expire_spawn(&self, agent_id: Uuid, timeout_seconds: u64) {
        {
            let mut watchdogs = self.spawn_watchdogs.lock().await;
            watchdogs.remove(&agent_id);
        }
        let Some(agent) = self.agents.get(agent_id).await else {
            return;
        };
        if agent.state != AgentState::Spawning {
            return;
        }
        warn!(agent_id = %agent_id, timeout_seconds, "Spawn acknowledgement never arrived");
        if let Err(e) = self
            .fault_agent(agent_id, Error::spawn_timeout(agent_id, timeout_seconds))
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "Could not fault timed-out agent");
        }
        self.persist().await;
    }

    async fn require_sender_agent(&self, sender: Uuid) -> Result<Agent> {
        self.agents.find_by_session(sender).await.ok_or_else(|| {
            Error::validation(format!("Session {} is not bound to an agent", sender))
        })
    }

    fn require_holds_task(&self, agent: &Agent, task_id: Uuid) -> Result<()> {
        if agent.current_task != Some(task_id) {
            return Err(Error::validation(format!(
                "Agent {} does not hold task {}",
                agent.id, task_id
            )));
        }
        Ok(())
    }

    fn report_kind(agent: &Agent) -> MessageKind {
        MessageKind::StatusReport {
            agent_id: agent.id,
            state: agent.state,
            current_task: agent.current_task,
        }
    }

    async fn send_status_report(&self, target: Uuid, agent: &Agent) {
        let report = Envelope::to(self.core_session, target, Self::report_kind(agent));
        if let Err(e) = self.router.send(report).await {
            debug!(target = %target, error = %e, "Status report undeliverable");
        }
    }

    /// Deliver an event to the conductor session, or publish it on the
    /// observer tap when no conductor is connected
    async fn notify_conductor(&self, kind: MessageKind) {
        let conductor = *self.conductor.read().await;
        match conductor {
            Some(conductor) => {
                let envelope = Envelope::to(self.core_session, conductor, kind);
                if let Err(e) = self.router.send(envelope.clone()).await {
                    debug!(error = %e, "Conductor unreachable, event lands on the tap only");
                    self.router.publish(envelope);
                }
            }
            None => {
                self.router
                    .publish(Envelope::broadcast(self.core_session, kind));
            }
        }
    }

    async fn report_error(&self, error: &Error) {
        self.notify_conductor(MessageKind::Error {
            code: error.category().to_string(),
            message: error.to_string(),
        })
        .await;
    }

    /// Capture the current state of every store
    pub async fn capture_snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot::new(
            self.agents.all().await,
            self.queue.all().await,
            self.workspaces.list_all().await,
            self.workspaces.base_revisions().await,
        )
    }

    /// Persist the current state when a store is attached.
    ///
    /// The capture reads each store in turn without a global lock, so a
    /// concurrent mutation can yield a momentarily inconsistent picture;
    /// such a capture is skipped and the next persist covers it. A failed
    /// write is contained: the in-memory state stays authoritative.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.capture_snapshot().await;
        if let Err(e) = snapshot.validate() {
            debug!(error = %e, "Skipped snapshot of a transient state");
            return;
        }
        if let Err(e) = store.save(&snapshot).await {
            warn!(error = %e, "Snapshot write failed, continuing with in-memory state");
        }
    }
}

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    catalog: Option<Arc<dyn RoleCatalog>>,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl OrchestratorBuilder {
    /// Set the configuration
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the role catalog consulted at spawn time
    pub fn catalog(mut self, catalog: Arc<dyn RoleCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Attach a persistence collaborator
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the orchestrator, validating the configuration.
    ///
    /// The engine is handed out behind an `Arc`; its background tasks keep
    /// weak handles back to it.
    pub fn build(self) -> Result<Arc<Orchestrator>> {
        self.config.validate()?;
        let router = Arc::new(MessageRouter::new(
            self.config.heartbeat_window(),
            self.config.event_capacity,
        ));
        let agents = Arc::new(AgentManager::new(self.config.max_agents));
        let queue = Arc::new(TaskQueue::new());
        let workspaces = Arc::new(WorkspaceManager::new(self.config.workspace_root.clone()));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(StaticRoleCatalog::with_defaults()));
        Ok(Arc::new_cyclic(|weak| Orchestrator {
            config: self.config,
            router,
            agents,
            queue,
            workspaces,
            catalog,
            store: self.store,
            core_session: Uuid::new_v4(),
            conductor: RwLock::new(None),
            spawn_watchdogs: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            weak: weak.clone(),
        }))
    }
}
