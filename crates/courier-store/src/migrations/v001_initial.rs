//! v001 -- Initial schema creation.
//!
//! One table per snapshot section: `profile`, `chats`, `messages`, `peers`,
//! `drafts`, `blocked`, plus a key/value `meta` table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Local profile (single row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profile (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    user_id      TEXT NOT NULL,               -- hex-encoded 32-byte Ed25519 pubkey
    display_name TEXT
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id            TEXT PRIMARY KEY NOT NULL,  -- direct_<lo>_<hi>
    participants  TEXT NOT NULL,              -- JSON array of hex user ids
    last_message  TEXT,
    last_activity TEXT NOT NULL,              -- RFC-3339, nanosecond precision
    unread_count  INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,
    chat_id      TEXT NOT NULL,
    sender       TEXT NOT NULL,
    recipient    TEXT NOT NULL,
    content      BLOB NOT NULL,               -- nonce || XChaCha20-Poly1305 ciphertext
    ciphertext   BLOB,                        -- wire ciphertext of outgoing messages
    nonce        BLOB,
    timestamp    TEXT NOT NULL,
    status       TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    reply_to     TEXT,
    reactions    TEXT NOT NULL DEFAULT '{}',  -- JSON: emoji -> [user ids]
    edited       INTEGER NOT NULL DEFAULT 0,
    outgoing     INTEGER NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts
    ON messages(chat_id, timestamp, id);

-- ----------------------------------------------------------------
-- Peers
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS peers (
    id           TEXT PRIMARY KEY NOT NULL,
    display_name TEXT,
    nickname     TEXT,
    presence     TEXT NOT NULL DEFAULT 'offline',
    last_seen    TEXT
);

-- ----------------------------------------------------------------
-- Drafts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS drafts (
    chat_id TEXT PRIMARY KEY NOT NULL,
    content BLOB NOT NULL,                    -- sealed like messages.content

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Blocked users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocked (
    user_id TEXT PRIMARY KEY NOT NULL
);

-- ----------------------------------------------------------------
-- Misc
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
