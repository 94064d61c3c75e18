/// Schema version stored in `PRAGMA user_version` once all migrations ran.
pub const SCHEMA_VERSION: i32 = 2;

/// Migrations in order; entry `n` upgrades a store from version `n` to `n + 1`.
pub const MIGRATIONS: &[&str] = &[V1, V2];

const V1: &str = r#"
-- Submissions captured while offline
CREATE TABLE IF NOT EXISTS unsynced_reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    auth_token TEXT NOT NULL,
    captured_at TEXT NOT NULL
);

-- Deferred-sync tags waiting for a connectivity change
CREATE TABLE IF NOT EXISTS sync_registrations (
    tag TEXT PRIMARY KEY,
    registered_at TEXT NOT NULL
);
"#;

const V2: &str = r#"
-- Entries that could not be decoded, kept out of the replay path
CREATE TABLE IF NOT EXISTS quarantined_reports (
    id INTEGER PRIMARY KEY,
    payload TEXT NOT NULL,
    auth_token TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    quarantined_at TEXT NOT NULL
);
"#;
