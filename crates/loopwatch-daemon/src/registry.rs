//! Connection registry: the single source of truth for who is connected,
//! what each connection subscribed to, and whether it is still answering
//! liveness probes.
//!
//! Every operation is one short critical section. Nothing awaits while the
//! lock is held, so message handlers, the router and the heartbeat can
//! interleave freely between calls.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use loopwatch_core::{ChangeEvent, ServerMessage};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::lock;

/// Opaque per-connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Transport-level liveness probe.
    Ping,
}

/// Transport side of a connection as seen by the registry: a bounded outbound
/// queue and a token that tears the connection down.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self { sender, cancel }
    }
}

struct Connection {
    handle: ConnectionHandle,
    subscriptions: BTreeSet<String>,
    alive: bool,
    last_liveness_at: Instant,
    connected_at: DateTime<Utc>,
}

/// Read-only view of a connection, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub subscriptions: Vec<String>,
    pub alive: bool,
    pub connected_at: DateTime<Utc>,
}

/// Result of fanning one event out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Subscribers whose queue was full; they miss this event.
    pub backpressured: usize,
    /// Subscribers whose transport had gone away; they were removed.
    pub closed: usize,
}

/// Result of one heartbeat sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub probed: usize,
    pub terminated: Vec<ConnectionId>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened transport. It starts alive with no
    /// subscriptions.
    pub fn connect(&self, handle: ConnectionHandle, now: Instant) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.connections).insert(
            id,
            Connection {
                handle,
                subscriptions: BTreeSet::new(),
                alive: true,
                last_liveness_at: now,
                connected_at: Utc::now(),
            },
        );
        tracing::debug!(conn_id = %id, "registry: connected");
        id
    }

    /// Add `project_ids` to the connection's set. Returns the full set
    /// afterwards, or `None` if the connection is gone.
    pub fn subscribe(&self, id: ConnectionId, project_ids: &[String]) -> Option<Vec<String>> {
        let mut conns = lock(&self.connections);
        let conn = conns.get_mut(&id)?;
        conn.subscriptions.extend(project_ids.iter().cloned());
        Some(conn.subscriptions.iter().cloned().collect())
    }

    /// Remove `project_ids` from the set; ids that were never subscribed are
    /// ignored. Returns the requested list back, or `None` if the connection
    /// is gone.
    pub fn unsubscribe(&self, id: ConnectionId, project_ids: &[String]) -> Option<Vec<String>> {
        let mut conns = lock(&self.connections);
        let conn = conns.get_mut(&id)?;
        for project_id in project_ids {
            conn.subscriptions.remove(project_id);
        }
        Some(project_ids.to_vec())
    }

    /// Record a liveness proof (transport pong or client ping).
    pub fn mark_alive(&self, id: ConnectionId, now: Instant) -> bool {
        match lock(&self.connections).get_mut(&id) {
            Some(conn) => {
                conn.alive = true;
                conn.last_liveness_at = now;
                true
            }
            None => false,
        }
    }

    /// Remove the connection and tear its transport down. Returns `false` if
    /// it was already removed, so cleanup runs exactly once.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = lock(&self.connections).remove(&id);
        match removed {
            Some(conn) => {
                conn.handle.cancel.cancel();
                tracing::debug!(conn_id = %id, "registry: disconnected");
                true
            }
            None => false,
        }
    }

    /// Queue a `file:change` message on every connection subscribed to the
    /// event's project. Never waits: a full queue skips that connection, a
    /// closed one is cleaned up like a disconnect.
    pub fn broadcast(&self, event: &ChangeEvent) -> Delivery {
        let text = match ServerMessage::from(event).to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "registry: failed to encode change event");
                return Delivery::default();
            }
        };

        let mut delivery = Delivery::default();
        let mut gone = Vec::new();
        {
            let mut conns = lock(&self.connections);
            for (id, conn) in conns.iter() {
                if !conn.subscriptions.contains(&event.project_id) {
                    continue;
                }
                match conn.handle.sender.try_send(Outbound::Text(text.clone())) {
                    Ok(()) => delivery.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        delivery.backpressured += 1;
                        tracing::debug!(conn_id = %id, project_id = %event.project_id, "registry: queue full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
            for id in &gone {
                if let Some(conn) = conns.remove(id) {
                    conn.handle.cancel.cancel();
                }
            }
        }

        delivery.closed = gone.len();
        for id in gone {
            tracing::debug!(conn_id = %id, "registry: transport closed during broadcast, removed");
        }
        delivery
    }

    /// One heartbeat pass.
    ///
    /// A connection still unconfirmed since the previous pass is terminated
    /// once `timeout` has elapsed since its last liveness proof. Every other
    /// connection is marked unconfirmed and sent a probe.
    pub fn sweep(&self, now: Instant, timeout: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut conns = lock(&self.connections);

        for (id, conn) in conns.iter_mut() {
            if !conn.alive && now.saturating_duration_since(conn.last_liveness_at) >= timeout {
                outcome.terminated.push(*id);
                continue;
            }
            conn.alive = false;
            match conn.handle.sender.try_send(Outbound::Ping) {
                // A probe lost to a full queue still counts; the timeout decides.
                Ok(()) | Err(TrySendError::Full(_)) => outcome.probed += 1,
                Err(TrySendError::Closed(_)) => outcome.terminated.push(*id),
            }
        }

        for id in &outcome.terminated {
            if let Some(conn) = conns.remove(id) {
                conn.handle.cancel.cancel();
            }
        }
        outcome.terminated.sort();
        outcome
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        lock(&self.connections).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Option<Vec<String>> {
        lock(&self.connections)
            .get(&id)
            .map(|c| c.subscriptions.iter().cloned().collect())
    }

    pub fn is_alive(&self, id: ConnectionId) -> Option<bool> {
        lock(&self.connections).get(&id).map(|c| c.alive)
    }

    /// All connections ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let conns = lock(&self.connections);
        let mut out: Vec<ConnectionSnapshot> = conns
            .iter()
            .map(|(id, c)| ConnectionSnapshot {
                id: *id,
                subscriptions: c.subscriptions.iter().cloned().collect(),
                alive: c.alive,
                connected_at: c.connected_at,
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}
