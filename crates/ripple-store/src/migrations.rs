use rusqlite::Connection;
use tracing::info;

use crate::StoreResult;

/// Ordered migration steps. `PRAGMA user_version` records how many have
/// been applied; opening an older store runs the remainder, each in its
/// own transaction, before first access.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    "
    CREATE TABLE messages (
        id          TEXT PRIMARY KEY,
        channel_id  TEXT NOT NULL,
        author_id   TEXT NOT NULL,
        content     TEXT,
        attachments TEXT,
        reactions   TEXT,
        mentions    TEXT,
        edited      TEXT
    );

    CREATE INDEX idx_messages_channel
        ON messages(channel_id, id);

    CREATE TABLE users (
        id            TEXT PRIMARY KEY,
        username      TEXT NOT NULL,
        display_name  TEXT,
        avatar        TEXT,
        relationship  TEXT NOT NULL DEFAULT 'none',
        presence      TEXT
    );

    CREATE TABLE channels (
        id               TEXT PRIMARY KEY,
        server_id        TEXT,
        name             TEXT NOT NULL,
        kind             TEXT NOT NULL,
        last_message_id  TEXT
    );

    CREATE TABLE servers (
        id        TEXT PRIMARY KEY,
        name      TEXT NOT NULL,
        owner_id  TEXT NOT NULL
    );

    CREATE TABLE members (
        server_id  TEXT NOT NULL,
        user_id    TEXT NOT NULL,
        nickname   TEXT,
        roles      TEXT NOT NULL,
        PRIMARY KEY (server_id, user_id)
    );

    CREATE TABLE emojis (
        id          TEXT PRIMARY KEY,
        parent_id   TEXT NOT NULL,
        creator_id  TEXT NOT NULL,
        name        TEXT NOT NULL
    );

    CREATE TABLE unreads (
        user_id       TEXT NOT NULL,
        channel_id    TEXT NOT NULL,
        last_read_id  TEXT,
        mentions      TEXT NOT NULL,
        PRIMARY KEY (user_id, channel_id)
    );
    ",
    // v2: author index for the retention orphan sweep
    "
    CREATE INDEX idx_messages_author
        ON messages(author_id);
    ",
];

pub fn run(conn: &mut Connection) -> StoreResult<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    for (i, step) in MIGRATIONS.iter().enumerate().skip(version as usize) {
        let target = (i + 1) as i64;
        let tx = conn.transaction()?;
        tx.execute_batch(step)?;
        tx.pragma_update(None, "user_version", target)?;
        tx.commit()?;
        info!("Store migrated to schema v{}", target);
    }

    Ok(())
}
