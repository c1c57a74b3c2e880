use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hearth_core::ids::{MessageId, PairingId, UserId};
use hearth_core::types::MessageKind;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: MessageId,
    pub pairing_id: PairingId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(rename = "messageType")]
    pub kind: MessageKind,
    pub read_at: Option<String>,
    pub created_at: String,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message. Happens-before any delivery broadcast.
    #[instrument(skip(self, content), fields(pairing_id = %pairing_id, sender_id = %sender_id))]
    pub fn create(
        &self,
        pairing_id: &PairingId,
        sender_id: &UserId,
        content: &str,
        kind: MessageKind,
    ) -> Result<MessageRow, StoreError> {
        let id = MessageId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, pairing_id, sender_id, content, type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    pairing_id.as_str(),
                    sender_id.as_str(),
                    content,
                    kind.to_string(),
                    now,
                ],
            )?;

            Ok(MessageRow {
                id,
                pairing_id: pairing_id.clone(),
                sender_id: sender_id.clone(),
                content: content.to_string(),
                kind,
                read_at: None,
                created_at: now,
            })
        })
    }

    pub fn get(&self, id: &MessageId) -> Result<Option<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, pairing_id, sender_id, content, type, read_at, created_at
                 FROM messages WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_message(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Stamp read-at on a message. Returns the updated row.
    #[instrument(skip(self), fields(message_id = %id))]
    pub fn mark_read(&self, id: &MessageId) -> Result<MessageRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET read_at = ?1 WHERE id = ?2 AND read_at IS NULL",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                // Either unknown or already read; the caller distinguishes via get.
                tracing::debug!(message_id = %id, "mark_read changed no rows");
            }
            Ok(())
        })?;

        self.get(id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    /// Recent history for a pairing, newest last.
    pub fn list_for_pairing(
        &self,
        pairing_id: &PairingId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, pairing_id, sender_id, content, type, read_at, created_at
                 FROM (SELECT * FROM messages WHERE pairing_id = ?1
                       ORDER BY created_at DESC LIMIT ?2)
                 ORDER BY created_at ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![pairing_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let id: String = row.get(0)?;
    let pairing_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let kind: String = row.get(4)?;

    Ok(MessageRow {
        id: MessageId::from_raw(id),
        pairing_id: PairingId::from_raw(pairing_id),
        sender_id: UserId::from_raw(sender_id),
        content: row.get(3)?,
        kind: kind.parse().map_err(|_| StoreError::CorruptRow {
            table: "messages",
            column: "type",
            detail: format!("unknown variant: {kind}"),
        })?,
        read_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}
