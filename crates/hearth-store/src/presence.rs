use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hearth_core::ids::UserId;
use hearth_core::types::PresenceStatus;

use crate::database::Database;
use crate::error::StoreError;

/// Authoritative presence row, one per user.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRow {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_heartbeat: String,
    pub metadata: Option<serde_json::Value>,
    pub updated_at: String,
}

pub struct PresenceRepo {
    db: Database,
}

impl PresenceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a user's presence record.
    #[instrument(skip(self, metadata), fields(user_id = %user_id, status = %status))]
    pub fn save(
        &self,
        user_id: &UserId,
        status: PresenceStatus,
        metadata: Option<&serde_json::Value>,
    ) -> Result<PresenceRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        let metadata_json = metadata.map(|m| m.to_string());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO presence (user_id, status, last_heartbeat, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                     status = excluded.status,
                     last_heartbeat = excluded.last_heartbeat,
                     metadata = COALESCE(excluded.metadata, presence.metadata),
                     updated_at = excluded.updated_at",
                rusqlite::params![user_id.as_str(), status.to_string(), now, metadata_json, now],
            )?;

            Ok(PresenceRow {
                user_id: user_id.clone(),
                status,
                last_heartbeat: now.clone(),
                metadata: metadata.cloned(),
                updated_at: now.clone(),
            })
        })
    }

    /// Refresh only the heartbeat timestamp.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn touch(&self, user_id: &UserId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE presence SET last_heartbeat = ?1, updated_at = ?1 WHERE user_id = ?2",
                rusqlite::params![now, user_id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, user_id: &UserId) -> Result<Option<PresenceRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, status, last_heartbeat, metadata, updated_at
                 FROM presence WHERE user_id = ?1",
            )?;
            let mut rows = stmt.query([user_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_presence(row)?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_presence(row: &rusqlite::Row<'_>) -> Result<PresenceRow, StoreError> {
    let user_id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let metadata: Option<String> = row.get(3)?;

    Ok(PresenceRow {
        user_id: UserId::from_raw(user_id),
        status: status.parse().map_err(|_| StoreError::CorruptRow {
            table: "presence",
            column: "status",
            detail: format!("unknown variant: {status}"),
        })?,
        last_heartbeat: row.get(2)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        updated_at: row.get(4)?,
    })
}
