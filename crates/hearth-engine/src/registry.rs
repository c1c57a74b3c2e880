use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use hearth_core::auth::Identity;
use hearth_core::envelope::{Envelope, Namespace};
use hearth_core::ids::{ConnectionId, OrgId, UserId};
use hearth_core::types::Role;

/// Connections with no heartbeat for this long are evicted by the sweep.
pub const STALE_TIMEOUT: Duration = Duration::from_secs(60);
/// How often the sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A live duplex connection. Created on successful authentication, destroyed
/// on close or stale-eviction. Owned exclusively by the registry.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub org_id: OrgId,
    pub role: Role,
    pub channel: Namespace,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_heartbeat: AtomicU64,
}

impl Connection {
    fn new(identity: &Identity, channel: Namespace, tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id: identity.user_id.clone(),
            org_id: identity.org_id.clone(),
            role: identity.role,
            channel,
            tx,
            connected: AtomicBool::new(true),
            last_heartbeat: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Refresh the heartbeat timestamp. Every inbound envelope counts.
    pub fn touch(&self) {
        self.last_heartbeat.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        let last = self.last_heartbeat.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) >= timeout.as_secs()
    }

    /// Queue an already-serialized envelope. Returns false when the peer is
    /// gone or its queue is full.
    pub fn try_send_raw(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping envelope"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.connected.store(false, Ordering::Relaxed);
                false
            }
        }
    }

    /// Serialize and queue an envelope for this one connection.
    pub fn send(&self, envelope: &Envelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(json) => self.try_send_raw(json),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize envelope");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, secs: u64) {
        self.last_heartbeat.store(secs, Ordering::Relaxed);
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all live connections, indexed by connection id and by user id.
/// A user may hold multiple simultaneous connections (one per channel or
/// more).
pub struct ConnectionRegistry {
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    by_user: DashMap<UserId, Vec<ConnectionId>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection for an authenticated identity. Returns the
    /// connection handle and the receiver its writer task drains.
    pub fn register(
        &self,
        identity: &Identity,
        channel: Namespace,
    ) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(identity, channel, tx));

        self.by_id.insert(conn.id.clone(), Arc::clone(&conn));
        self.by_user
            .entry(conn.user_id.clone())
            .or_default()
            .push(conn.id.clone());

        (conn, rx)
    }

    /// Remove a connection from both indexes. Presence consequences are the
    /// caller's concern; the registry has no presence awareness.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.by_id.remove(id)?;
        conn.connected.store(false, Ordering::Relaxed);

        if let Some(mut ids) = self.by_user.get_mut(&conn.user_id) {
            ids.retain(|c| c != id);
        }
        self.by_user
            .remove_if(&conn.user_id, |_, ids| ids.is_empty());

        Some(conn)
    }

    pub fn connections_for_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let ids: Vec<ConnectionId> = match self.by_user.get(user_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id).map(|c| Arc::clone(&c)))
            .collect()
    }

    pub fn has_connections(&self, user_id: &UserId) -> bool {
        self.by_user
            .get(user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    /// Whether the user holds any live connection on the given channel.
    pub fn has_channel(&self, user_id: &UserId, channel: Namespace) -> bool {
        self.connections_for_user(user_id)
            .iter()
            .any(|c| c.channel == channel)
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    /// Send an envelope to every live connection of a user, minus an optional
    /// excluded connection. A delivery failure removes only the dead
    /// connection and never fails the broadcast. Returns the delivered count.
    pub fn broadcast_to_user(
        &self,
        user_id: &UserId,
        envelope: &Envelope,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize envelope");
                return 0;
            }
        };

        let mut delivered = 0;
        for conn in self.connections_for_user(user_id) {
            if Some(&conn.id) == exclude {
                continue;
            }
            if conn.try_send_raw(json.clone()) {
                delivered += 1;
            } else {
                tracing::debug!(connection_id = %conn.id, "dead connection, removing");
                self.remove(&conn.id);
            }
        }
        delivered
    }

    /// Send an envelope to every connection on a logical channel. Rarely
    /// used (admin stats fan-out).
    pub fn broadcast_to_channel(
        &self,
        channel: Namespace,
        envelope: &Envelope,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize envelope");
                return 0;
            }
        };

        let conns: Vec<Arc<Connection>> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().channel == channel)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for conn in conns {
            if Some(&conn.id) == exclude {
                continue;
            }
            if conn.try_send_raw(json.clone()) {
                delivered += 1;
            } else {
                self.remove(&conn.id);
            }
        }
        delivered
    }

    /// Collect and remove connections whose heartbeat exceeds the timeout.
    /// The caller routes each eviction through the normal disconnect cleanup.
    pub fn evict_stale(&self, timeout: Duration) -> Vec<Arc<Connection>> {
        let stale: Vec<ConnectionId> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().is_stale(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .iter()
            .filter_map(|id| {
                let conn = self.remove(id)?;
                tracing::info!(connection_id = %conn.id, user_id = %conn.user_id, "evicted stale connection");
                Some(conn)
            })
            .collect()
    }
}
