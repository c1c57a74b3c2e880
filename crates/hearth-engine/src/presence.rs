use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::instrument;

use hearth_core::envelope::{kinds, Envelope, HeartbeatPayload, Namespace, PresenceUpdatePayload};
use hearth_core::ids::UserId;
use hearth_core::types::PresenceStatus;
use hearth_store::pairings::PairingRepo;
use hearth_store::presence::PresenceRepo;
use hearth_store::settings::SettingsRepo;
use hearth_store::Database;

use crate::error::EngineError;
use crate::policy;
use crate::registry::{Connection, ConnectionRegistry};

/// A user whose heartbeat is older than this is treated as unreachable for
/// push-notification purposes.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

struct ViewEntry {
    status: PresenceStatus,
    last_heartbeat: u64,
}

/// Tracks each user's reachability and fans status changes out to paired
/// counterparts, subject to the visibility rules in [`crate::policy`].
pub struct PresenceCoordinator {
    registry: Arc<ConnectionRegistry>,
    presence: PresenceRepo,
    settings: SettingsRepo,
    pairings: PairingRepo,
    /// Best-effort in-memory mirror of the presence table.
    view: DashMap<UserId, ViewEntry>,
    heartbeat_timeout: Duration,
}

impl PresenceCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, db: Database) -> Self {
        Self {
            registry,
            presence: PresenceRepo::new(db.clone()),
            settings: SettingsRepo::new(db.clone()),
            pairings: PairingRepo::new(db),
            view: DashMap::new(),
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
        }
    }

    /// A user connected on the presence channel: mark online, persist, notify
    /// counterparts (once, regardless of how many connections they hold), and
    /// push the initial state snapshot to the new connection.
    #[instrument(skip(self, conn), fields(user_id = %conn.user_id))]
    pub fn handle_connect(&self, conn: &Connection) -> Result<(), EngineError> {
        let changed = self.transition(&conn.user_id, PresenceStatus::Online, None)?;
        if changed {
            self.notify_counterparts(&conn.user_id)?;
        }
        self.send_snapshot(conn)
    }

    /// Periodic keep-alive, optionally carrying a status change.
    pub fn handle_heartbeat(
        &self,
        conn: &Connection,
        payload: HeartbeatPayload,
    ) -> Result<(), EngineError> {
        match payload.status {
            Some(status) => {
                let changed =
                    self.transition(&conn.user_id, status, payload.metadata.as_ref())?;
                if changed {
                    self.notify_counterparts(&conn.user_id)?;
                }
            }
            None => {
                self.refresh(&conn.user_id);
                self.presence.touch(&conn.user_id)?;
            }
        }
        Ok(())
    }

    /// User-initiated status change. A user may only mutate their own record.
    pub fn handle_update(
        &self,
        conn: &Connection,
        payload: PresenceUpdatePayload,
    ) -> Result<(), EngineError> {
        if payload.user_id != conn.user_id {
            return Err(EngineError::Forbidden(
                "presence records may only be mutated by their owner".into(),
            ));
        }
        let changed =
            self.transition(&conn.user_id, payload.status, payload.metadata.as_ref())?;
        if changed {
            self.notify_counterparts(&conn.user_id)?;
        }
        Ok(())
    }

    /// Called after any connection of the user closes. Only the last
    /// connection (across all channels) drives the offline transition.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn handle_disconnect(&self, user_id: &UserId) -> Result<(), EngineError> {
        if self.registry.has_connections(user_id) {
            return Ok(());
        }
        if self.transition(user_id, PresenceStatus::Offline, None)? {
            self.notify_counterparts(user_id)?;
        }
        Ok(())
    }

    /// Whether the user's heartbeat has gone stale (or was never seen).
    /// Consulted by the chat relay before triggering a push notification.
    pub fn is_stale(&self, user_id: &UserId) -> bool {
        match self.view.get(user_id) {
            Some(entry) => now_secs().saturating_sub(entry.last_heartbeat)
                >= self.heartbeat_timeout.as_secs(),
            None => true,
        }
    }

    pub fn status_of(&self, user_id: &UserId) -> PresenceStatus {
        self.view
            .get(user_id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    /// Persist-then-commit a status change. The per-user view entry is held
    /// for the duration so concurrent transitions for the same user
    /// serialize; returns whether the status actually changed.
    fn transition(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool, EngineError> {
        let mut entry = self
            .view
            .entry(user_id.clone())
            .or_insert_with(|| ViewEntry {
                status: PresenceStatus::Offline,
                last_heartbeat: now_secs(),
            });
        let changed = entry.status != status;

        self.presence.save(user_id, status, metadata)?;

        entry.status = status;
        entry.last_heartbeat = now_secs();
        Ok(changed)
    }

    fn refresh(&self, user_id: &UserId) {
        if let Some(mut entry) = self.view.get_mut(user_id) {
            entry.last_heartbeat = now_secs();
        }
    }

    /// Fan the subject's current status out to every active-pairing
    /// counterpart the subject is visible to.
    fn notify_counterparts(&self, subject: &UserId) -> Result<(), EngineError> {
        let settings = self.settings.get(subject)?;
        let status = self.status_of(subject);
        let now = Utc::now();

        for pairing in self.pairings.active_for_user(subject)? {
            let Some(role) = pairing.role_of(subject) else {
                continue;
            };
            if policy::suppress_presence_notification(role, &settings, now) {
                tracing::debug!(user_id = %subject, pairing_id = %pairing.id, "presence notification suppressed");
                continue;
            }
            let Some(counterpart) = pairing.other_member(subject) else {
                continue;
            };

            let envelope = Envelope::new(
                Namespace::Presence,
                kinds::PARTNER_PRESENCE_UPDATE,
                serde_json::json!({
                    "userId": subject,
                    "pairingId": &pairing.id,
                    "status": status,
                }),
            )
            .with_user(subject.clone());

            self.registry.broadcast_to_user(counterpart, &envelope, None);
        }
        Ok(())
    }

    /// Initial presence push: the requesting connection gets its own record
    /// plus the visibility-filtered records of all active counterparts.
    fn send_snapshot(&self, conn: &Connection) -> Result<(), EngineError> {
        let own = self.presence.get(&conn.user_id)?;
        let now = Utc::now();
        let mut partners = Vec::new();

        for pairing in self.pairings.active_for_user(&conn.user_id)? {
            let Some(counterpart) = pairing.other_member(&conn.user_id) else {
                continue;
            };
            let Some(role) = pairing.role_of(counterpart) else {
                continue;
            };
            let counterpart_settings = self.settings.get(counterpart)?;
            if policy::suppress_presence_notification(role, &counterpart_settings, now) {
                continue;
            }
            if let Some(row) = self.presence.get(counterpart)? {
                partners.push(serde_json::json!({
                    "pairingId": pairing.id,
                    "record": row,
                }));
            }
        }

        let envelope = Envelope::new(
            Namespace::Presence,
            kinds::PRESENCE_STATE,
            serde_json::json!({ "self": own, "partners": partners }),
        );
        conn.send(&envelope);
        Ok(())
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
