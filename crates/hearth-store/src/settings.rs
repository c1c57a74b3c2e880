use serde::{Deserialize, Serialize};
use tracing::instrument;

use hearth_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;

/// Per-user notification preferences consulted by the presence visibility
/// rule. Quiet hours are minutes-since-midnight in the user's local time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub user_id: UserId,
    pub share_presence: bool,
    pub do_not_disturb: bool,
    pub quiet_hours_start: Option<u16>,
    pub quiet_hours_end: Option<u16>,
    pub timezone_offset_minutes: i32,
}

impl UserSettings {
    /// Defaults applied when a user has never saved settings.
    pub fn defaults(user_id: UserId) -> Self {
        Self {
            user_id,
            share_presence: true,
            do_not_disturb: false,
            quiet_hours_start: None,
            quiet_hours_end: None,
            timezone_offset_minutes: 0,
        }
    }
}

pub struct SettingsRepo {
    db: Database,
}

impl SettingsRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, settings), fields(user_id = %settings.user_id))]
    pub fn save(&self, settings: &UserSettings) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO user_settings
                     (user_id, share_presence, do_not_disturb, quiet_hours_start,
                      quiet_hours_end, timezone_offset_minutes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                     share_presence = excluded.share_presence,
                     do_not_disturb = excluded.do_not_disturb,
                     quiet_hours_start = excluded.quiet_hours_start,
                     quiet_hours_end = excluded.quiet_hours_end,
                     timezone_offset_minutes = excluded.timezone_offset_minutes",
                rusqlite::params![
                    settings.user_id.as_str(),
                    settings.share_presence,
                    settings.do_not_disturb,
                    settings.quiet_hours_start,
                    settings.quiet_hours_end,
                    settings.timezone_offset_minutes,
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch settings, falling back to defaults for unknown users.
    pub fn get(&self, user_id: &UserId) -> Result<UserSettings, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, share_presence, do_not_disturb, quiet_hours_start,
                        quiet_hours_end, timezone_offset_minutes
                 FROM user_settings WHERE user_id = ?1",
            )?;
            let mut rows = stmt.query([user_id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw_id: String = row.get(0)?;
                    Ok(UserSettings {
                        user_id: UserId::from_raw(raw_id),
                        share_presence: row.get(1)?,
                        do_not_disturb: row.get(2)?,
                        quiet_hours_start: row.get(3)?,
                        quiet_hours_end: row.get(4)?,
                        timezone_offset_minutes: row.get(5)?,
                    })
                }
                None => Ok(UserSettings::defaults(user_id.clone())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_gets_defaults() {
        let repo = SettingsRepo::new(Database::in_memory().unwrap());
        let user = UserId::new();
        let settings = repo.get(&user).unwrap();
        assert!(settings.share_presence);
        assert!(!settings.do_not_disturb);
        assert!(settings.quiet_hours_start.is_none());
    }

    #[test]
    fn save_and_get_roundtrip() {
        let repo = SettingsRepo::new(Database::in_memory().unwrap());
        let user = UserId::new();
        let settings = UserSettings {
            user_id: user.clone(),
            share_presence: false,
            do_not_disturb: true,
            quiet_hours_start: Some(22 * 60),
            quiet_hours_end: Some(7 * 60),
            timezone_offset_minutes: -300,
        };

        repo.save(&settings).unwrap();
        assert_eq!(repo.get(&user).unwrap(), settings);
    }

    #[test]
    fn save_is_an_upsert() {
        let repo = SettingsRepo::new(Database::in_memory().unwrap());
        let user = UserId::new();
        let mut settings = UserSettings::defaults(user.clone());
        repo.save(&settings).unwrap();

        settings.do_not_disturb = true;
        repo.save(&settings).unwrap();

        assert!(repo.get(&user).unwrap().do_not_disturb);
    }
}
