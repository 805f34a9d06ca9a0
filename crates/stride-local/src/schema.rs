//! SQL schema for the local platform.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Rows of every logical table. `data` is a JSON object that always carries
-- its own `id`, equal to the row id.
CREATE TABLE IF NOT EXISTS rows (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name  TEXT NOT NULL,
    data        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS rows_table_idx ON rows(table_name);

CREATE TABLE IF NOT EXISTS objects (
    bucket        TEXT NOT NULL,
    key           TEXT NOT NULL,
    content_type  TEXT NOT NULL,
    sha256        TEXT NOT NULL,   -- hex digest of data
    data          BLOB NOT NULL,
    created_at    TEXT NOT NULL,
    PRIMARY KEY (bucket, key)
);

CREATE TABLE IF NOT EXISTS sessions (
    access_token  TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id       INTEGER NOT NULL REFERENCES rows(id) ON DELETE CASCADE,
    user_id               TEXT NOT NULL,
    last_read_message_id  INTEGER,
    PRIMARY KEY (conversation_id, user_id)
);

PRAGMA user_version = 1;
";
