//! v001 -- Initial schema creation.
//!
//! Creates the record table, the mutation log, the profile cache, the
//! sync-meta singleton and the orchestrator's alias / applied-entry ledgers.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Records (posts and pinned-content entries)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS records (
    content_id       TEXT PRIMARY KEY NOT NULL,   -- content hash or local-<uuid>
    kind             TEXT NOT NULL,               -- post | pin
    owner_id         TEXT NOT NULL,               -- hex-encoded Ed25519 pubkey
    payload          TEXT NOT NULL,               -- JSON
    synced           INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    modified         INTEGER NOT NULL DEFAULT 0,
    deleted          INTEGER NOT NULL DEFAULT 0,
    last_modified_at TEXT NOT NULL,               -- RFC-3339, fixed width
    local_created_at TEXT,
    conflict         TEXT                         -- JSON {remoteVersion, detectedAt}
);

CREATE INDEX IF NOT EXISTS idx_records_owner    ON records(owner_id);
CREATE INDEX IF NOT EXISTS idx_records_synced   ON records(synced);
CREATE INDEX IF NOT EXISTS idx_records_modified ON records(modified);
CREATE INDEX IF NOT EXISTS idx_records_deleted  ON records(deleted);

-- ----------------------------------------------------------------
-- Mutation log (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS mutation_log (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    id                TEXT NOT NULL UNIQUE,        -- UUID v4
    entity_type       TEXT NOT NULL,               -- post | profile | pin
    entity_id         TEXT NOT NULL,
    action            TEXT NOT NULL,               -- create | update | delete | conflict
    timestamp         TEXT NOT NULL,
    conflict_resolved INTEGER NOT NULL DEFAULT 0,
    payload           TEXT NOT NULL                -- JSON snapshot
);

CREATE INDEX IF NOT EXISTS idx_mutation_log_timestamp ON mutation_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_mutation_log_entity    ON mutation_log(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_mutation_log_action    ON mutation_log(action);
CREATE INDEX IF NOT EXISTS idx_mutation_log_resolved  ON mutation_log(conflict_resolved);

-- ----------------------------------------------------------------
-- Per-user profile cache
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profiles (
    user_id      TEXT PRIMARY KEY NOT NULL,
    display_name TEXT,
    bio          TEXT,
    avatar_id    TEXT,
    updated_at   TEXT NOT NULL,
    modified     INTEGER NOT NULL DEFAULT 0,
    synced       INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Sync meta (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_meta (
    key                     TEXT PRIMARY KEY NOT NULL CHECK (key = 'sync-meta'),
    device_id               TEXT NOT NULL,
    last_sync_attempt_at    TEXT,
    last_successful_sync_at TEXT,
    network_status          TEXT NOT NULL DEFAULT 'offline'
);

-- ----------------------------------------------------------------
-- Orchestrator ledgers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS id_aliases (
    alias_id   TEXT PRIMARY KEY NOT NULL,     -- remote-confirmed id
    content_id TEXT NOT NULL                  -- local key it maps to
);

CREATE TABLE IF NOT EXISTS applied_entries (
    entry_id   TEXT PRIMARY KEY NOT NULL,     -- inbound mutation entry UUID
    applied_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
