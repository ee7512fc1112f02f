//! v001 -- attachment metadata and chunk tables.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Attachment metadata (one row per message with an attachment)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS attachment_metadata (
    id         TEXT PRIMARY KEY NOT NULL,   -- message id (UUID)
    name       TEXT NOT NULL,
    mime       TEXT NOT NULL,
    size       INTEGER NOT NULL,            -- declared total bytes
    ratio      REAL NOT NULL DEFAULT 0,
    failed     INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    created_at TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Attachment chunks (singly linked list, first id = message id)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS attachment_chunks (
    id            TEXT PRIMARY KEY NOT NULL,  -- UUID
    data          BLOB NOT NULL,
    next_chunk_id TEXT                        -- NULL on the last chunk
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
