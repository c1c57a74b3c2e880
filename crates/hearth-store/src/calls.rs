use serde::{Deserialize, Serialize};
use tracing::instrument;

use hearth_core::ids::{CallId, PairingId, UserId};
use hearth_core::types::{CallStatus, EndReason, MediaType};

use crate::database::Database;
use crate::error::StoreError;

/// Durable audit mirror of an in-memory call session. `call_id` is the
/// client-supplied correlation id and may repeat across rows (it is unique
/// only while a call is live); `row_id` is the server-side key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRow {
    #[serde(default)]
    pub row_id: i64,
    pub call_id: CallId,
    pub pairing_id: PairingId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub media_type: MediaType,
    pub status: CallStatus,
    pub reason: Option<EndReason>,
    pub started_at: String,
    pub connected_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_secs: i64,
}

pub struct CallRepo {
    db: Database,
}

impl CallRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a fresh audit row; returns the server-generated row id.
    #[instrument(skip(self, row), fields(call_id = %row.call_id, caller = %row.caller_id))]
    pub fn create(&self, row: &CallRow) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calls
                     (call_id, pairing_id, caller_id, callee_id, media_type, status, reason,
                      started_at, connected_at, ended_at, duration_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    row.call_id.as_str(),
                    row.pairing_id.as_str(),
                    row.caller_id.as_str(),
                    row.callee_id.as_str(),
                    row.media_type.to_string(),
                    row.status.to_string(),
                    row.reason.map(|r| r.to_string()),
                    row.started_at,
                    row.connected_at,
                    row.ended_at,
                    row.duration_secs,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    #[instrument(skip(self, row), fields(call_id = %row.call_id, status = %row.status))]
    pub fn update(&self, row: &CallRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE calls SET status = ?1, reason = ?2, connected_at = ?3,
                                  ended_at = ?4, duration_secs = ?5
                 WHERE row_id = ?6",
                rusqlite::params![
                    row.status.to_string(),
                    row.reason.map(|r| r.to_string()),
                    row.connected_at,
                    row.ended_at,
                    row.duration_secs,
                    row.row_id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("call {}", row.call_id)));
            }
            Ok(())
        })
    }

    /// Latest audit row for a client call id (ids may repeat across calls).
    pub fn get(&self, id: &CallId) -> Result<Option<CallRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT row_id, call_id, pairing_id, caller_id, callee_id, media_type,
                        status, reason, started_at, connected_at, ended_at, duration_secs
                 FROM calls WHERE call_id = ?1 ORDER BY row_id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_call(row)?)),
                None => Ok(None),
            }
        })
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> Result<CallRow, StoreError> {
    let call_id: String = row.get(1)?;
    let pairing_id: String = row.get(2)?;
    let caller_id: String = row.get(3)?;
    let callee_id: String = row.get(4)?;
    let media_type: String = row.get(5)?;
    let status: String = row.get(6)?;
    let reason: Option<String> = row.get(7)?;

    Ok(CallRow {
        row_id: row.get(0)?,
        call_id: CallId::from_raw(call_id),
        pairing_id: PairingId::from_raw(pairing_id),
        caller_id: UserId::from_raw(caller_id),
        callee_id: UserId::from_raw(callee_id),
        media_type: media_type.parse().map_err(|_| StoreError::CorruptRow {
            table: "calls",
            column: "media_type",
            detail: format!("unknown variant: {media_type}"),
        })?,
        status: status.parse().map_err(|_| StoreError::CorruptRow {
            table: "calls",
            column: "status",
            detail: format!("unknown variant: {status}"),
        })?,
        reason: match reason {
            Some(r) => Some(r.parse().map_err(|_| StoreError::CorruptRow {
                table: "calls",
                column: "reason",
                detail: format!("unknown variant: {r}"),
            })?),
            None => None,
        },
        started_at: row.get(8)?,
        connected_at: row.get(9)?,
        ended_at: row.get(10)?,
        duration_secs: row.get(11)?,
    })
}
