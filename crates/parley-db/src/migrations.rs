use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT PRIMARY KEY,
            username      TEXT NOT NULL UNIQUE,
            password      TEXT NOT NULL,
            is_online     INTEGER NOT NULL DEFAULT 0,
            last_seen_at  TEXT NOT NULL DEFAULT (datetime('now')),
            created_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            user_id          TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            author_id        TEXT NOT NULL REFERENCES users(id),
            content          TEXT NOT NULL,
            thread_id        TEXT REFERENCES messages(id),
            is_edited        INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id);

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        -- Append-only: rows are inserted at most once per (message, user)
        -- and never deleted by the server.
        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS pins (
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            message_id       TEXT NOT NULL REFERENCES messages(id),
            pinned_at        TEXT NOT NULL,
            PRIMARY KEY (conversation_id, message_id)
        );

        CREATE TABLE IF NOT EXISTS polls (
            id               TEXT PRIMARY KEY,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id),
            author_id        TEXT NOT NULL REFERENCES users(id),
            question         TEXT NOT NULL,
            allow_multiple   INTEGER NOT NULL DEFAULT 0,
            expires_at       TEXT,
            is_active        INTEGER NOT NULL DEFAULT 1,
            created_at       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS poll_options (
            id       TEXT PRIMARY KEY,
            poll_id  TEXT NOT NULL REFERENCES polls(id),
            idx      INTEGER NOT NULL,
            label    TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_poll_options_poll
            ON poll_options(poll_id, idx);

        CREATE TABLE IF NOT EXISTS poll_votes (
            option_id  TEXT NOT NULL REFERENCES poll_options(id),
            user_id    TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (option_id, user_id)
        );

        -- Seed the default general conversation
        INSERT OR IGNORE INTO conversations (id, name)
            VALUES ('00000000-0000-0000-0000-000000000001', 'general');
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
