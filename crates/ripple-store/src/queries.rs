use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use ripple_types::models::{
    Channel, ChannelKind, Emoji, Entity, EntityKind, Member, Message, Presence, Relationship,
    Server, UnreadMarker, User,
};

use crate::{Store, StoreError, StoreResult};

/// What an upsert transaction actually did, split by whether the primary
/// key already existed. Feeds the write gateway's change stream.
#[derive(Debug, Default)]
pub struct UpsertOutcome {
    pub inserted: Vec<Entity>,
    pub modified: Vec<Entity>,
}

impl Store {
    // -- Mutating contract (all transactional) --

    pub fn upsert(&self, entity: &Entity) -> StoreResult<UpsertOutcome> {
        self.upsert_batch(std::slice::from_ref(entity))
    }

    /// Write a batch in one transaction: either every change lands or none.
    pub fn upsert_batch(&self, entities: &[Entity]) -> StoreResult<UpsertOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut outcome = UpsertOutcome::default();
            for entity in entities {
                let existed = entity_exists(&tx, entity.kind(), &entity.key())?;
                write_entity(&tx, entity)?;
                if existed {
                    outcome.modified.push(entity.clone());
                } else {
                    outcome.inserted.push(entity.clone());
                }
            }
            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Delete one record. Returns whether it existed.
    pub fn delete_by_key(&self, kind: EntityKind, key: &str) -> StoreResult<bool> {
        Ok(!self.delete_batch(kind, std::slice::from_ref(&key.to_string()))?.is_empty())
    }

    /// Delete a set of records in one transaction. Returns the keys that
    /// were actually present.
    pub fn delete_batch(&self, kind: EntityKind, keys: &[String]) -> StoreResult<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut deleted = Vec::new();
            for key in keys {
                let affected = match split_key(kind, key)? {
                    (a, None) => tx.execute(
                        &format!("DELETE FROM {} WHERE {} = ?1", table(kind), pk_col(kind)),
                        [a],
                    )?,
                    (a, Some(b)) => tx.execute(
                        &format!(
                            "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
                            table(kind),
                            pk_cols(kind).0,
                            pk_cols(kind).1
                        ),
                        [a, b],
                    )?,
                };
                if affected > 0 {
                    deleted.push(key.clone());
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
    }

    /// Clear every table in one transaction.
    pub fn wipe_all(&self) -> StoreResult<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for kind in EntityKind::ALL {
                tx.execute(&format!("DELETE FROM {}", table(kind)), [])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // -- Read contract --

    pub fn fetch_all(&self, kind: EntityKind) -> StoreResult<Vec<Entity>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM {}", columns(kind), table(kind));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| read_entity(kind, row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn fetch_by_key(&self, kind: EntityKind, key: &str) -> StoreResult<Option<Entity>> {
        let (a, b) = split_key(kind, key)?;
        self.with_conn(|conn| {
            let row = match b {
                None => {
                    let sql = format!(
                        "SELECT {} FROM {} WHERE {} = ?1",
                        columns(kind),
                        table(kind),
                        pk_col(kind)
                    );
                    conn.query_row(&sql, [a], |row| read_entity(kind, row)).optional()?
                }
                Some(b) => {
                    let (c1, c2) = pk_cols(kind);
                    let sql = format!(
                        "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2",
                        columns(kind),
                        table(kind),
                        c1,
                        c2
                    );
                    conn.query_row(&sql, [a, b], |row| read_entity(kind, row)).optional()?
                }
            };
            Ok(row)
        })
    }

    /// Full scan with an in-process predicate. Fine for a local store;
    /// hot paths use the typed queries below instead.
    pub fn fetch_filtered<F>(&self, kind: EntityKind, predicate: F) -> StoreResult<Vec<Entity>>
    where
        F: Fn(&Entity) -> bool,
    {
        let mut all = self.fetch_all(kind)?;
        all.retain(|e| predicate(e));
        Ok(all)
    }

    // -- Typed message queries (window + retention paths) --

    /// The most recent `limit` messages of a channel, oldest first.
    pub fn recent_messages(&self, channel_id: &str, limit: u32) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_id, author_id, content, attachments, reactions, mentions, edited
                 FROM messages WHERE channel_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut rows = stmt
                .query_map(params![channel_id, limit], read_message)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// Up to `limit` messages strictly older than `before`, oldest first.
    pub fn messages_before(
        &self,
        channel_id: &str,
        before: &str,
        limit: u32,
    ) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_id, author_id, content, attachments, reactions, mentions, edited
                 FROM messages WHERE channel_id = ?1 AND id < ?2
                 ORDER BY id DESC LIMIT ?3",
            )?;
            let mut rows = stmt
                .query_map(params![channel_id, before, limit], read_message)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    pub fn message_count(&self, channel_id: &str) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
                [channel_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Every channel that still has at least one stored message.
    pub fn channel_ids_with_messages(&self) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT channel_id FROM messages")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Message ids lexicographically below `cutoff_id` — i.e. created
    /// before the instant the cutoff id encodes.
    pub fn message_ids_older_than(&self, cutoff_id: &str) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM messages WHERE id < ?1")?;
            let ids = stmt
                .query_map([cutoff_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Ids of messages past the newest `cap` of a channel, i.e. everything
    /// that a per-channel cap sweep should drop.
    pub fn message_ids_beyond_cap(&self, channel_id: &str, cap: u32) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages WHERE channel_id = ?1
                 ORDER BY id DESC LIMIT -1 OFFSET ?2",
            )?;
            let ids = stmt
                .query_map(params![channel_id, cap], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// All user ids referenced by remaining messages, as author or mention.
    pub fn referenced_user_ids(&self) -> StoreResult<HashSet<String>> {
        self.with_conn(|conn| {
            let mut refs = HashSet::new();

            let mut stmt = conn.prepare("SELECT DISTINCT author_id FROM messages")?;
            for id in stmt.query_map([], |row| row.get::<_, String>(0))? {
                refs.insert(id?);
            }

            let mut stmt =
                conn.prepare("SELECT mentions FROM messages WHERE mentions IS NOT NULL")?;
            for mentions in stmt.query_map([], |row| row.get::<_, String>(0))? {
                let ids: Vec<String> = serde_json::from_str(&mentions?)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt mentions: {}", e)))?;
                refs.extend(ids);
            }

            Ok(refs)
        })
    }

    /// Users with no active relationship — the orphan-sweep candidates.
    pub fn inactive_user_ids(&self) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM users WHERE relationship = 'none'")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Typed user queries --

    pub fn user_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        Ok(self.fetch_by_key(EntityKind::User, id)?.and_then(|e| match e {
            Entity::User(u) => Some(u),
            _ => None,
        }))
    }

    pub fn users_by_ids(&self, ids: &[String]) -> StoreResult<Vec<User>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, username, display_name, avatar, relationship, presence
                 FROM users WHERE id IN ({})",
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
            let rows = stmt
                .query_map(params.as_slice(), read_user)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

// -- Table metadata --

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Message => "messages",
        EntityKind::User => "users",
        EntityKind::Channel => "channels",
        EntityKind::Server => "servers",
        EntityKind::Member => "members",
        EntityKind::Emoji => "emojis",
        EntityKind::Unread => "unreads",
    }
}

fn columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Message => {
            "id, channel_id, author_id, content, attachments, reactions, mentions, edited"
        }
        EntityKind::User => "id, username, display_name, avatar, relationship, presence",
        EntityKind::Channel => "id, server_id, name, kind, last_message_id",
        EntityKind::Server => "id, name, owner_id",
        EntityKind::Member => "server_id, user_id, nickname, roles",
        EntityKind::Emoji => "id, parent_id, creator_id, name",
        EntityKind::Unread => "user_id, channel_id, last_read_id, mentions",
    }
}

fn pk_col(kind: EntityKind) -> &'static str {
    debug_assert!(!is_composite(kind));
    "id"
}

fn pk_cols(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::Member => ("server_id", "user_id"),
        EntityKind::Unread => ("user_id", "channel_id"),
        _ => unreachable!("single-key kind"),
    }
}

fn is_composite(kind: EntityKind) -> bool {
    matches!(kind, EntityKind::Member | EntityKind::Unread)
}

/// Split a composite `a:b` key into its parts. Single-key kinds pass
/// through untouched.
fn split_key(kind: EntityKind, key: &str) -> StoreResult<(String, Option<String>)> {
    if !is_composite(kind) {
        return Ok((key.to_string(), None));
    }
    match key.split_once(':') {
        Some((a, b)) => Ok((a.to_string(), Some(b.to_string()))),
        None => Err(StoreError::Unavailable(format!(
            "malformed composite key '{}' for {}",
            key, kind
        ))),
    }
}

fn entity_exists(conn: &Connection, kind: EntityKind, key: &str) -> StoreResult<bool> {
    let exists = match split_key(kind, key)? {
        (a, None) => conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE {} = ?1", table(kind), pk_col(kind)),
                [a],
                |_| Ok(()),
            )
            .optional()?
            .is_some(),
        (a, Some(b)) => {
            let (c1, c2) = pk_cols(kind);
            conn.query_row(
                &format!("SELECT 1 FROM {} WHERE {} = ?1 AND {} = ?2", table(kind), c1, c2),
                [a, b],
                |_| Ok(()),
            )
            .optional()?
            .is_some()
        }
    };
    Ok(exists)
}

/// Idempotent upsert: insert, or replace every field on key conflict.
fn write_entity(conn: &Connection, entity: &Entity) -> StoreResult<()> {
    match entity {
        Entity::Message(m) => {
            conn.execute(
                "INSERT INTO messages (id, channel_id, author_id, content, attachments, reactions, mentions, edited)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    channel_id = excluded.channel_id,
                    author_id = excluded.author_id,
                    content = excluded.content,
                    attachments = excluded.attachments,
                    reactions = excluded.reactions,
                    mentions = excluded.mentions,
                    edited = excluded.edited",
                params![
                    m.id,
                    m.channel_id,
                    m.author_id,
                    m.content,
                    to_json(&m.attachments)?,
                    to_json(&m.reactions)?,
                    to_json(&m.mentions)?,
                    m.edited.map(|t| t.to_rfc3339()),
                ],
            )?;
        }
        Entity::User(u) => {
            conn.execute(
                "INSERT INTO users (id, username, display_name, avatar, relationship, presence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    display_name = excluded.display_name,
                    avatar = excluded.avatar,
                    relationship = excluded.relationship,
                    presence = excluded.presence",
                params![
                    u.id,
                    u.username,
                    u.display_name,
                    u.avatar,
                    relationship_str(u.relationship),
                    u.presence.map(presence_str),
                ],
            )?;
        }
        Entity::Channel(c) => {
            conn.execute(
                "INSERT INTO channels (id, server_id, name, kind, last_message_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    server_id = excluded.server_id,
                    name = excluded.name,
                    kind = excluded.kind,
                    last_message_id = excluded.last_message_id",
                params![c.id, c.server_id, c.name, channel_kind_str(c.kind), c.last_message_id],
            )?;
        }
        Entity::Server(s) => {
            conn.execute(
                "INSERT INTO servers (id, name, owner_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    owner_id = excluded.owner_id",
                params![s.id, s.name, s.owner_id],
            )?;
        }
        Entity::Member(m) => {
            conn.execute(
                "INSERT INTO members (server_id, user_id, nickname, roles)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(server_id, user_id) DO UPDATE SET
                    nickname = excluded.nickname,
                    roles = excluded.roles",
                params![m.server_id, m.user_id, m.nickname, json_string(&m.roles)?],
            )?;
        }
        Entity::Emoji(e) => {
            conn.execute(
                "INSERT INTO emojis (id, parent_id, creator_id, name)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    creator_id = excluded.creator_id,
                    name = excluded.name",
                params![e.id, e.parent_id, e.creator_id, e.name],
            )?;
        }
        Entity::Unread(u) => {
            conn.execute(
                "INSERT INTO unreads (user_id, channel_id, last_read_id, mentions)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, channel_id) DO UPDATE SET
                    last_read_id = excluded.last_read_id,
                    mentions = excluded.mentions",
                params![u.user_id, u.channel_id, u.last_read_id, json_string(&u.mentions)?],
            )?;
        }
    }
    Ok(())
}

// -- Row readers (stored representation -> plain value types) --

fn read_entity(kind: EntityKind, row: &rusqlite::Row) -> rusqlite::Result<Entity> {
    Ok(match kind {
        EntityKind::Message => Entity::Message(read_message(row)?),
        EntityKind::User => Entity::User(read_user(row)?),
        EntityKind::Channel => Entity::Channel(read_channel(row)?),
        EntityKind::Server => Entity::Server(Server {
            id: row.get(0)?,
            name: row.get(1)?,
            owner_id: row.get(2)?,
        }),
        EntityKind::Member => Entity::Member(Member {
            server_id: row.get(0)?,
            user_id: row.get(1)?,
            nickname: row.get(2)?,
            roles: json_col(3, row.get(3)?)?,
        }),
        EntityKind::Emoji => Entity::Emoji(Emoji {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            creator_id: row.get(2)?,
            name: row.get(3)?,
        }),
        EntityKind::Unread => Entity::Unread(UnreadMarker {
            user_id: row.get(0)?,
            channel_id: row.get(1)?,
            last_read_id: row.get(2)?,
            mentions: json_col(3, row.get(3)?)?,
        }),
    })
}

fn read_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        author_id: row.get(2)?,
        content: row.get(3)?,
        attachments: json_col_opt(4, row.get(4)?)?,
        reactions: json_col_opt(5, row.get(5)?)?,
        mentions: json_col_opt(6, row.get(6)?)?,
        edited: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_rfc3339(7, &s))
            .transpose()?,
    })
}

fn read_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar: row.get(3)?,
        relationship: relationship_from_str(&row.get::<_, String>(4)?),
        presence: row.get::<_, Option<String>>(5)?.and_then(|s| presence_from_str(&s)),
    })
}

fn read_channel(row: &rusqlite::Row) -> rusqlite::Result<Channel> {
    let kind_str: String = row.get(3)?;
    Ok(Channel {
        id: row.get(0)?,
        server_id: row.get(1)?,
        name: row.get(2)?,
        kind: channel_kind_from_str(3, &kind_str)?,
        last_message_id: row.get(4)?,
    })
}

// -- Column codecs --

fn to_json<T: Serialize>(value: &Option<T>) -> StoreResult<Option<String>> {
    value
        .as_ref()
        .map(|v| {
            serde_json::to_string(v)
                .map_err(|e| StoreError::Unavailable(format!("encode json column: {}", e)))
        })
        .transpose()
}

fn json_string<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::Unavailable(format!("encode json column: {}", e)))
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col_opt<T: DeserializeOwned>(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<T>> {
    raw.map(|s| json_col(idx, s)).transpose()
}

fn parse_rfc3339(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn relationship_str(r: Relationship) -> &'static str {
    match r {
        Relationship::None => "none",
        Relationship::Friend => "friend",
        Relationship::Blocked => "blocked",
        Relationship::BlockedOther => "blocked_other",
        Relationship::Incoming => "incoming",
        Relationship::Outgoing => "outgoing",
        Relationship::User => "user",
    }
}

/// Unknown values read back as `None` rather than failing the row.
fn relationship_from_str(s: &str) -> Relationship {
    match s {
        "friend" => Relationship::Friend,
        "blocked" => Relationship::Blocked,
        "blocked_other" => Relationship::BlockedOther,
        "incoming" => Relationship::Incoming,
        "outgoing" => Relationship::Outgoing,
        "user" => Relationship::User,
        _ => Relationship::None,
    }
}

fn presence_str(p: Presence) -> &'static str {
    match p {
        Presence::Online => "online",
        Presence::Idle => "idle",
        Presence::Busy => "busy",
        Presence::Invisible => "invisible",
    }
}

fn presence_from_str(s: &str) -> Option<Presence> {
    match s {
        "online" => Some(Presence::Online),
        "idle" => Some(Presence::Idle),
        "busy" => Some(Presence::Busy),
        "invisible" => Some(Presence::Invisible),
        _ => None,
    }
}

fn channel_kind_str(k: ChannelKind) -> &'static str {
    match k {
        ChannelKind::Text => "text",
        ChannelKind::Voice => "voice",
        ChannelKind::DirectMessage => "direct_message",
        ChannelKind::Group => "group",
    }
}

fn channel_kind_from_str(idx: usize, s: &str) -> rusqlite::Result<ChannelKind> {
    match s {
        "text" => Ok(ChannelKind::Text),
        "voice" => Ok(ChannelKind::Voice),
        "direct_message" => Ok(ChannelKind::DirectMessage),
        "group" => Ok(ChannelKind::Group),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown channel kind '{}'", other).into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ripple_types::models::Attachment;
    use ripple_types::ulid;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn message(id: &str, channel: &str, author: &str) -> Entity {
        Entity::Message(Message {
            id: id.to_string(),
            channel_id: channel.to_string(),
            author_id: author.to_string(),
            content: Some("hello".into()),
            attachments: None,
            reactions: None,
            mentions: None,
            edited: None,
        })
    }

    fn user(id: &str, relationship: Relationship) -> Entity {
        Entity::User(User {
            id: id.to_string(),
            username: format!("{}-name", id),
            display_name: None,
            avatar: None,
            relationship,
            presence: None,
        })
    }

    #[test]
    fn upsert_is_idempotent_for_every_kind() {
        let store = store();
        let entities = vec![
            message("01AAAAAAAAAAAAAAAAAAAAAAAA", "chn1", "usr1"),
            user("usr1", Relationship::Friend),
            Entity::Channel(Channel {
                id: "chn1".into(),
                server_id: Some("srv1".into()),
                name: "general".into(),
                kind: ChannelKind::Text,
                last_message_id: None,
            }),
            Entity::Server(Server {
                id: "srv1".into(),
                name: "home".into(),
                owner_id: "usr1".into(),
            }),
            Entity::Member(Member {
                server_id: "srv1".into(),
                user_id: "usr1".into(),
                nickname: Some("nick".into()),
                roles: vec!["admin".into()],
            }),
            Entity::Emoji(Emoji {
                id: "emj1".into(),
                parent_id: "srv1".into(),
                creator_id: "usr1".into(),
                name: "wave".into(),
            }),
            Entity::Unread(UnreadMarker {
                user_id: "usr1".into(),
                channel_id: "chn1".into(),
                last_read_id: None,
                mentions: vec![],
            }),
        ];

        for entity in &entities {
            let first = store.upsert(entity).unwrap();
            assert_eq!(first.inserted.len(), 1);
            let second = store.upsert(entity).unwrap();
            assert_eq!(second.modified.len(), 1);

            let all = store.fetch_all(entity.kind()).unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(&all[0], entity);
        }
    }

    #[test]
    fn upsert_last_write_wins() {
        let store = store();
        store.upsert(&user("usr1", Relationship::None)).unwrap();
        store.upsert(&user("usr1", Relationship::Friend)).unwrap();

        let fetched = store.user_by_id("usr1").unwrap().unwrap();
        assert_eq!(fetched.relationship, Relationship::Friend);
    }

    #[test]
    fn message_round_trips_json_columns() {
        let store = store();
        let mut reactions = std::collections::BTreeMap::new();
        reactions.insert(
            "wave".to_string(),
            ["usr2".to_string()].into_iter().collect(),
        );
        let edited = Utc::now() - Duration::minutes(5);
        let msg = Entity::Message(Message {
            id: ulid::generate(),
            channel_id: "chn1".into(),
            author_id: "usr1".into(),
            content: None,
            attachments: Some(vec![Attachment {
                id: "att1".into(),
                filename: "cat.png".into(),
                content_type: "image/png".into(),
                size: 1024,
            }]),
            reactions: Some(reactions),
            mentions: Some(vec!["usr2".into()]),
            edited: Some(edited),
        });
        store.upsert(&msg).unwrap();

        let fetched = store.fetch_by_key(EntityKind::Message, &msg.key()).unwrap().unwrap();
        assert_eq!(fetched, msg);
    }

    #[test]
    fn delete_by_composite_key() {
        let store = store();
        let member = Entity::Member(Member {
            server_id: "srv1".into(),
            user_id: "usr1".into(),
            nickname: None,
            roles: vec![],
        });
        store.upsert(&member).unwrap();
        assert!(store.delete_by_key(EntityKind::Member, "srv1:usr1").unwrap());
        assert!(!store.delete_by_key(EntityKind::Member, "srv1:usr1").unwrap());
        assert!(store.fetch_by_key(EntityKind::Member, "srv1:usr1").unwrap().is_none());
    }

    #[test]
    fn wipe_all_clears_every_table() {
        let store = store();
        store.upsert(&message("01AAAAAAAAAAAAAAAAAAAAAAAA", "chn1", "usr1")).unwrap();
        store.upsert(&user("usr1", Relationship::Friend)).unwrap();
        store.wipe_all().unwrap();
        for kind in EntityKind::ALL {
            assert!(store.fetch_all(kind).unwrap().is_empty());
        }
    }

    #[test]
    fn recent_and_before_pagination() {
        let store = store();
        let base = Utc::now() - Duration::hours(1);
        let ids: Vec<String> = (0..10)
            .map(|i| ulid::from_timestamp(base + Duration::seconds(i)))
            .collect();
        let batch: Vec<Entity> = ids.iter().map(|id| message(id, "chn1", "usr1")).collect();
        store.upsert_batch(&batch).unwrap();
        // Another channel's message must not leak in
        store.upsert(&message(&ulid::generate(), "chn2", "usr1")).unwrap();

        let recent = store.recent_messages("chn1", 4).unwrap();
        let recent_ids: Vec<&str> = recent.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(recent_ids, ids[6..].iter().map(String::as_str).collect::<Vec<_>>());

        let older = store.messages_before("chn1", &ids[6], 4).unwrap();
        let older_ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(older_ids, ids[2..6].iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn beyond_cap_returns_oldest_excess() {
        let store = store();
        let base = Utc::now() - Duration::hours(1);
        let ids: Vec<String> = (0..7)
            .map(|i| ulid::from_timestamp(base + Duration::seconds(i)))
            .collect();
        let batch: Vec<Entity> = ids.iter().map(|id| message(id, "chn1", "usr1")).collect();
        store.upsert_batch(&batch).unwrap();

        let mut excess = store.message_ids_beyond_cap("chn1", 5).unwrap();
        excess.sort();
        assert_eq!(excess, ids[..2].to_vec());
        assert!(store.message_ids_beyond_cap("chn1", 10).unwrap().is_empty());
    }

    #[test]
    fn fetch_filtered_applies_predicate() {
        let store = store();
        store.upsert(&user("usr1", Relationship::Friend)).unwrap();
        store.upsert(&user("usr2", Relationship::None)).unwrap();
        store.upsert(&user("usr3", Relationship::Blocked)).unwrap();

        let active = store
            .fetch_filtered(EntityKind::User, |e| match e {
                Entity::User(u) => u.relationship.is_active(),
                _ => false,
            })
            .unwrap();
        let mut keys: Vec<String> = active.iter().map(Entity::key).collect();
        keys.sort();
        assert_eq!(keys, vec!["usr1".to_string(), "usr3".to_string()]);
    }

    #[test]
    fn referenced_users_cover_authors_and_mentions() {
        let store = store();
        let mut msg = Message {
            id: ulid::generate(),
            channel_id: "chn1".into(),
            author_id: "alice".into(),
            content: None,
            attachments: None,
            reactions: None,
            mentions: Some(vec!["bob".into()]),
            edited: None,
        };
        store.upsert(&Entity::Message(msg.clone())).unwrap();
        msg.id = ulid::generate();
        msg.author_id = "carol".into();
        msg.mentions = None;
        store.upsert(&Entity::Message(msg)).unwrap();

        let refs = store.referenced_user_ids().unwrap();
        assert_eq!(
            refs,
            ["alice", "bob", "carol"].iter().map(|s| s.to_string()).collect()
        );
    }
}
