/// SQL DDL for the hearth-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 2;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS presence (
    user_id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'offline',
    last_heartbeat TEXT NOT NULL,
    metadata TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_settings (
    user_id TEXT PRIMARY KEY,
    share_presence INTEGER NOT NULL DEFAULT 1,
    do_not_disturb INTEGER NOT NULL DEFAULT 0,
    quiet_hours_start INTEGER,
    quiet_hours_end INTEGER,
    timezone_offset_minutes INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS pairings (
    id TEXT PRIMARY KEY,
    primary_user_id TEXT NOT NULL,
    companion_user_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    pairing_id TEXT NOT NULL REFERENCES pairings(id),
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'text',
    read_at TEXT,
    created_at TEXT NOT NULL
);

-- call_id is client-supplied and only unique while the call is live, so the
-- audit rows key on their own rowid and call_id may repeat across rows.
CREATE TABLE IF NOT EXISTS calls (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    call_id TEXT NOT NULL,
    pairing_id TEXT NOT NULL REFERENCES pairings(id),
    caller_id TEXT NOT NULL,
    callee_id TEXT NOT NULL,
    media_type TEXT NOT NULL DEFAULT 'video',
    status TEXT NOT NULL DEFAULT 'initiated',
    reason TEXT,
    started_at TEXT NOT NULL,
    connected_at TEXT,
    ended_at TEXT,
    duration_secs INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    org_id TEXT NOT NULL,
    role TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pairings_primary ON pairings(primary_user_id);
CREATE INDEX IF NOT EXISTS idx_pairings_companion ON pairings(companion_user_id);
CREATE INDEX IF NOT EXISTS idx_messages_pairing ON messages(pairing_id, created_at);
CREATE INDEX IF NOT EXISTS idx_calls_call_id ON calls(call_id);
CREATE INDEX IF NOT EXISTS idx_calls_pairing ON calls(pairing_id);
CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id);
CREATE INDEX IF NOT EXISTS idx_calls_callee ON calls(callee_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
