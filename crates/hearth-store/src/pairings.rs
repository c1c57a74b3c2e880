use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hearth_core::ids::{PairingId, UserId};
use hearth_core::types::{PairingStatus, Role};

use crate::database::Database;
use crate::error::StoreError;

/// The durable relationship between exactly two users. Referenced, never
/// mutated, by the realtime core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pairing {
    pub id: PairingId,
    pub primary_user_id: UserId,
    pub companion_user_id: UserId,
    pub status: PairingStatus,
    pub created_at: String,
}

impl Pairing {
    pub fn is_member(&self, user_id: &UserId) -> bool {
        &self.primary_user_id == user_id || &self.companion_user_id == user_id
    }

    /// The member on the other side of the pairing.
    pub fn other_member(&self, user_id: &UserId) -> Option<&UserId> {
        if &self.primary_user_id == user_id {
            Some(&self.companion_user_id)
        } else if &self.companion_user_id == user_id {
            Some(&self.primary_user_id)
        } else {
            None
        }
    }

    pub fn role_of(&self, user_id: &UserId) -> Option<Role> {
        if &self.primary_user_id == user_id {
            Some(Role::Primary)
        } else if &self.companion_user_id == user_id {
            Some(Role::Companion)
        } else {
            None
        }
    }
}

pub struct PairingRepo {
    db: Database,
}

impl PairingRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a pairing. Administrative surface; the realtime core only reads.
    #[instrument(skip(self), fields(primary = %primary_user_id, companion = %companion_user_id))]
    pub fn create(
        &self,
        primary_user_id: &UserId,
        companion_user_id: &UserId,
        status: PairingStatus,
    ) -> Result<Pairing, StoreError> {
        let id = PairingId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pairings (id, primary_user_id, companion_user_id, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    primary_user_id.as_str(),
                    companion_user_id.as_str(),
                    status.to_string(),
                    now,
                ],
            )?;

            Ok(Pairing {
                id,
                primary_user_id: primary_user_id.clone(),
                companion_user_id: companion_user_id.clone(),
                status,
                created_at: now,
            })
        })
    }

    pub fn get(&self, id: &PairingId) -> Result<Option<Pairing>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, primary_user_id, companion_user_id, status, created_at
                 FROM pairings WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_pairing(row)?)),
                None => Ok(None),
            }
        })
    }

    /// All `active` pairings the user is a member of.
    pub fn active_for_user(&self, user_id: &UserId) -> Result<Vec<Pairing>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, primary_user_id, companion_user_id, status, created_at
                 FROM pairings
                 WHERE status = 'active' AND (primary_user_id = ?1 OR companion_user_id = ?1)
                 ORDER BY created_at",
            )?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_pairing(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_pairing(row: &rusqlite::Row<'_>) -> Result<Pairing, StoreError> {
    let id: String = row.get(0)?;
    let primary: String = row.get(1)?;
    let companion: String = row.get(2)?;
    let status: String = row.get(3)?;

    Ok(Pairing {
        id: PairingId::from_raw(id),
        primary_user_id: UserId::from_raw(primary),
        companion_user_id: UserId::from_raw(companion),
        status: status.parse().map_err(|_| StoreError::CorruptRow {
            table: "pairings",
            column: "status",
            detail: format!("unknown variant: {status}"),
        })?,
        created_at: row.get(4)?,
    })
}
