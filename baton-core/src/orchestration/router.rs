//! Message router and session hub
//!
//! The router owns the set of connected sessions and moves [`Envelope`]s
//! between them. Delivery is enqueue-and-return: a targeted send lands
//! exactly once in the target's inbox if it is connected at call time and
//! fails with `TargetUnavailable` otherwise; a broadcast fans out to every
//! other currently-connected session. Because each send enqueues before
//! returning, messages from one sender reach a given receiver in the order
//! they were sent.
//!
//! Heartbeats are handled inside the router: a `heartbeat` envelope
//! refreshes the sender's window, and [`MessageRouter::sweep_stale`] marks
//! sessions whose window lapsed without disconnecting them. Reclamation
//! policy belongs to the lifecycle layer.
//!
//! Read-only collaborators watch traffic through the observer tap
//! ([`MessageRouter::observe`]); dropping the receiver unsubscribes.

use crate::message::Envelope;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Liveness classification of a connected session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLiveness {
    Live,
    Stale,
}

#[derive(Debug)]
struct Session {
    tx: mpsc::UnboundedSender<Envelope>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    stale: bool,
}

/// Receiving half of a session connection
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
}

/// Hub delivering envelopes between the conductor and agent sessions
#[derive(Debug)]
pub struct MessageRouter {
    sessions: RwLock<HashMap<Uuid, Session>>,
    events: broadcast::Sender<Envelope>,
    heartbeat_window: Duration,
}

impl MessageRouter {
    /// Create a router with the given staleness window and tap capacity
    pub fn new(heartbeat_window: Duration, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
            heartbeat_window,
        }
    }

    /// Register a session and hand back its inbox
    pub async fn connect(&self, session_id: Uuid) -> Result<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(Error::validation(format!(
                "Session {} is already connected",
                session_id
            )));
        }
        let (tx, inbox) = mpsc::unbounded_channel();
        let now = Utc::now();
        sessions.insert(
            session_id,
            Session {
                tx,
                connected_at: now,
                last_heartbeat: now,
                stale: false,
            },
        );
        debug!(session_id = %session_id, "Session connected");
        Ok(SessionHandle { session_id, inbox })
    }

    /// Remove a session; queued messages already delivered remain readable
    pub async fn disconnect(&self, session_id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(&session_id).is_none() {
            return Err(Error::not_found("Session", session_id.to_string()));
        }
        debug!(session_id = %session_id, "Session disconnected");
        Ok(())
    }

    /// Deliver an envelope.
    ///
    /// Targeted envelopes land exactly once or fail with
    /// `TargetUnavailable`; broadcasts fan out to every other connected
    /// session, skipping inboxes that are gone. Accepted envelopes are
    /// mirrored onto the observer tap.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if envelope.kind.is_heartbeat() {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&envelope.sender) {
                session.last_heartbeat = Utc::now();
                session.stale = false;
            }
        }

        match envelope.target {
            Some(target) => {
                let failed = {
                    let sessions = self.sessions.read().await;
                    let Some(session) = sessions.get(&target) else {
                        return Err(Error::target_unavailable(target));
                    };
                    let mut delivery = envelope.clone();
                    delivery.note_delivery_attempt();
                    session.tx.send(delivery).is_err()
                };
                if failed {
                    // the inbox was dropped without a disconnect
                    let mut sessions = self.sessions.write().await;
                    sessions.remove(&target);
                    warn!(target = %target, "Dropping session with a closed inbox");
                    return Err(Error::target_unavailable(target));
                }
                trace!(
                    message_id = %envelope.id,
                    kind = envelope.kind.name(),
                    target = %target,
                    "Delivered message"
                );
            }
            None => {
                let sessions = self.sessions.read().await;
                let mut receivers = 0usize;
                for (session_id, session) in sessions.iter() {
                    if *session_id == envelope.sender {
                        continue;
                    }
                    let mut delivery = envelope.clone();
                    delivery.note_delivery_attempt();
                    if session.tx.send(delivery).is_err() {
                        debug!(session_id = %session_id, "Broadcast skipped closed inbox");
                        continue;
                    }
                    receivers += 1;
                }
                trace!(
                    message_id = %envelope.id,
                    kind = envelope.kind.name(),
                    receivers,
                    "Broadcast message"
                );
            }
        }

        self.publish(envelope);
        Ok(())
    }

    /// Mirror an envelope onto the observer tap without session delivery.
    ///
    /// Used for traffic that has no session target, such as spawn requests
    /// relayed toward the external agent runner.
    pub fn publish(&self, envelope: Envelope) {
        if let Err(e) = self.events.send(envelope) {
            trace!("No observers for event: {}", e);
        }
    }

    /// Subscribe a read-only observer to all accepted traffic
    pub fn observe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    /// Refresh a session's heartbeat window explicitly
    pub async fn note_heartbeat(&self, session_id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| Error::not_found("Session", session_id.to_string()))?;
        session.last_heartbeat = Utc::now();
        session.stale = false;
        Ok(())
    }

    /// Mark sessions whose heartbeat window lapsed as of `now`.
    ///
    /// Returns only newly stale sessions; already-stale ones are not
    /// reported again. Stale sessions stay connected; reclamation is the
    /// lifecycle manager's call.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut sessions = self.sessions.write().await;
        let mut newly_stale = Vec::new();
        for (session_id, session) in sessions.iter_mut() {
            if !session.stale && now - session.last_heartbeat > self.heartbeat_window {
                session.stale = true;
                newly_stale.push(*session_id);
                warn!(
                    session_id = %session_id,
                    last_heartbeat = %session.last_heartbeat,
                    "Session went stale"
                );
            }
        }
        newly_stale
    }

    /// Whether a session is currently connected
    pub async fn is_connected(&self, session_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    /// Liveness of a connected session
    pub async fn liveness(&self, session_id: Uuid) -> Option<SessionLiveness> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).map(|s| {
            if s.stale {
                SessionLiveness::Stale
            } else {
                SessionLiveness::Live
            }
        })
    }

    /// Snapshot of currently connected session ids
    pub async fn connected_sessions(&self) -> Vec<Uuid> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = sessions
            .iter()
            .map(|(id, s)| (s.connected_at, *id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }
}
