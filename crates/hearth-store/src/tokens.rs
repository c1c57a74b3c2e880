use tracing::instrument;

use hearth_core::auth::Identity;
use hearth_core::ids::{OrgId, UserId};
use hearth_core::types::Role;

use crate::database::Database;
use crate::error::StoreError;

/// Bearer-token lookup table backing the default AuthVerifier implementation.
/// Token issuance itself lives in the administrative surface, not here.
pub struct TokenRepo {
    db: Database,
}

impl TokenRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, token), fields(user_id = %identity.user_id))]
    pub fn insert(&self, token: &str, identity: &Identity) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO auth_tokens (token, user_id, org_id, role)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    token,
                    identity.user_id.as_str(),
                    identity.org_id.as_str(),
                    identity.role.to_string(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn lookup(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id, org_id, role FROM auth_tokens WHERE token = ?1")?;
            let mut rows = stmt.query([token])?;
            match rows.next()? {
                Some(row) => {
                    let user_id: String = row.get(0)?;
                    let org_id: String = row.get(1)?;
                    let role: String = row.get(2)?;
                    Ok(Some(Identity {
                        user_id: UserId::from_raw(user_id),
                        org_id: OrgId::from_raw(org_id),
                        role: role.parse::<Role>().map_err(|_| StoreError::CorruptRow {
                            table: "auth_tokens",
                            column: "role",
                            detail: format!("unknown variant: {role}"),
                        })?,
                    }))
                }
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let repo = TokenRepo::new(Database::in_memory().unwrap());
        let identity = Identity {
            user_id: UserId::new(),
            org_id: OrgId::new(),
            role: Role::Companion,
        };

        repo.insert("tok-abc", &identity).unwrap();
        let found = repo.lookup("tok-abc").unwrap().unwrap();
        assert_eq!(found, identity);
    }

    #[test]
    fn unknown_token_is_none() {
        let repo = TokenRepo::new(Database::in_memory().unwrap());
        assert!(repo.lookup("nope").unwrap().is_none());
    }
}
