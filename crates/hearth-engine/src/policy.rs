use chrono::{DateTime, Duration, Timelike, Utc};

use hearth_core::types::Role;
use hearth_store::settings::UserSettings;

/// Whether a presence notification about `subject` should be withheld from
/// their counterpart. Persisting the presence record is never suppressed,
/// only the outbound notification.
pub fn suppress_presence_notification(
    subject_role: Role,
    settings: &UserSettings,
    now: DateTime<Utc>,
) -> bool {
    if subject_role == Role::Primary && !settings.share_presence {
        return true;
    }
    if settings.do_not_disturb {
        return true;
    }
    in_quiet_hours(settings, now)
}

/// Quiet-hours check in the user's local time. The window may wrap midnight
/// (e.g. 22:00 to 07:00).
pub fn in_quiet_hours(settings: &UserSettings, now: DateTime<Utc>) -> bool {
    let (Some(start), Some(end)) = (settings.quiet_hours_start, settings.quiet_hours_end) else {
        return false;
    };
    if start == end {
        return false;
    }

    let local = now + Duration::minutes(settings.timezone_offset_minutes as i64);
    let minute_of_day = (local.hour() * 60 + local.minute()) as u16;

    if start < end {
        minute_of_day >= start && minute_of_day < end
    } else {
        minute_of_day >= start || minute_of_day < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::ids::UserId;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        format!("2026-03-01T{hour:02}:{minute:02}:00Z")
            .parse()
            .unwrap()
    }

    fn settings() -> UserSettings {
        UserSettings::defaults(UserId::new())
    }

    #[test]
    fn default_settings_never_suppress() {
        let s = settings();
        assert!(!suppress_presence_notification(Role::Primary, &s, at(12, 0)));
        assert!(!suppress_presence_notification(Role::Companion, &s, at(12, 0)));
    }

    #[test]
    fn hidden_primary_is_suppressed_but_companion_is_not() {
        let mut s = settings();
        s.share_presence = false;
        assert!(suppress_presence_notification(Role::Primary, &s, at(12, 0)));
        // Visibility flag only applies to primaries.
        assert!(!suppress_presence_notification(Role::Companion, &s, at(12, 0)));
    }

    #[test]
    fn do_not_disturb_suppresses_any_role() {
        let mut s = settings();
        s.do_not_disturb = true;
        assert!(suppress_presence_notification(Role::Primary, &s, at(12, 0)));
        assert!(suppress_presence_notification(Role::Companion, &s, at(12, 0)));
    }

    #[test]
    fn quiet_hours_same_day_window() {
        let mut s = settings();
        s.quiet_hours_start = Some(13 * 60);
        s.quiet_hours_end = Some(14 * 60);

        assert!(!in_quiet_hours(&s, at(12, 59)));
        assert!(in_quiet_hours(&s, at(13, 0)));
        assert!(in_quiet_hours(&s, at(13, 59)));
        assert!(!in_quiet_hours(&s, at(14, 0)));
    }

    #[test]
    fn quiet_hours_wrapping_midnight() {
        let mut s = settings();
        s.quiet_hours_start = Some(22 * 60);
        s.quiet_hours_end = Some(7 * 60);

        assert!(in_quiet_hours(&s, at(23, 30)));
        assert!(in_quiet_hours(&s, at(3, 0)));
        assert!(!in_quiet_hours(&s, at(12, 0)));
        assert!(!in_quiet_hours(&s, at(7, 0)));
    }

    #[test]
    fn quiet_hours_respect_timezone_offset() {
        let mut s = settings();
        s.quiet_hours_start = Some(22 * 60);
        s.quiet_hours_end = Some(23 * 60);
        s.timezone_offset_minutes = -300; // UTC-5

        // 03:30 UTC is 22:30 local
        assert!(in_quiet_hours(&s, at(3, 30)));
        // 22:30 UTC is 17:30 local
        assert!(!in_quiet_hours(&s, at(22, 30)));
    }

    #[test]
    fn unset_window_is_inactive() {
        let s = settings();
        assert!(!in_quiet_hours(&s, at(0, 0)));
    }
}
