use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ulid;

/// A file attached to a message. Only the fields the cache needs to
/// round-trip; rendering details stay with the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// ULID — lexicographic order is creation order.
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
    /// emoji -> set of reactor ids
    pub reactions: Option<BTreeMap<String, BTreeSet<String>>>,
    pub mentions: Option<Vec<String>>,
    pub edited: Option<DateTime<Utc>>,
}

impl Message {
    /// Creation time decoded from the id's timestamp prefix.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        ulid::decode_timestamp(&self.id)
    }

    /// All user ids this message references: the author plus any mentions.
    pub fn referenced_users(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.author_id.as_str())
            .chain(self.mentions.iter().flatten().map(String::as_str))
    }
}

/// Relationship between the local account and another user. Anything other
/// than `None` keeps the user record retained regardless of references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    #[default]
    None,
    Friend,
    Blocked,
    BlockedOther,
    Incoming,
    Outgoing,
    /// The local account itself.
    User,
}

impl Relationship {
    pub fn is_active(self) -> bool {
        self != Relationship::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Online,
    Idle,
    Busy,
    Invisible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub relationship: Relationship,
    pub presence: Option<Presence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
    DirectMessage,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub server_id: Option<String>,
    pub name: String,
    pub kind: ChannelKind,
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub owner_id: String,
}

/// Membership of a user in a server. Composite key `server_id:user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub server_id: String,
    pub user_id: String,
    pub nickname: Option<String>,
    pub roles: Vec<String>,
}

impl Member {
    pub fn key(&self) -> String {
        composite_key(&self.server_id, &self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emoji {
    pub id: String,
    pub parent_id: String,
    pub creator_id: String,
    pub name: String,
}

/// Per-user, per-channel read position. Composite key `user_id:channel_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadMarker {
    pub user_id: String,
    pub channel_id: String,
    pub last_read_id: Option<String>,
    pub mentions: Vec<String>,
}

impl UnreadMarker {
    pub fn key(&self) -> String {
        composite_key(&self.user_id, &self.channel_id)
    }
}

pub fn composite_key(a: &str, b: &str) -> String {
    format!("{}:{}", a, b)
}

/// The entity types the store holds, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    User,
    Channel,
    Server,
    Member,
    Emoji,
    Unread,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Message,
        EntityKind::User,
        EntityKind::Channel,
        EntityKind::Server,
        EntityKind::Member,
        EntityKind::Emoji,
        EntityKind::Unread,
    ];
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Message => "message",
            EntityKind::User => "user",
            EntityKind::Channel => "channel",
            EntityKind::Server => "server",
            EntityKind::Member => "member",
            EntityKind::Emoji => "emoji",
            EntityKind::Unread => "unread",
        };
        f.write_str(name)
    }
}

/// A domain entity together with its type, as written to and read from the
/// store. The conversions to and from rows live in ripple-store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Entity {
    Message(Message),
    User(User),
    Channel(Channel),
    Server(Server),
    Member(Member),
    Emoji(Emoji),
    Unread(UnreadMarker),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Message(_) => EntityKind::Message,
            Entity::User(_) => EntityKind::User,
            Entity::Channel(_) => EntityKind::Channel,
            Entity::Server(_) => EntityKind::Server,
            Entity::Member(_) => EntityKind::Member,
            Entity::Emoji(_) => EntityKind::Emoji,
            Entity::Unread(_) => EntityKind::Unread,
        }
    }

    /// Primary key. Composite for members and unread markers.
    pub fn key(&self) -> String {
        match self {
            Entity::Message(m) => m.id.clone(),
            Entity::User(u) => u.id.clone(),
            Entity::Channel(c) => c.id.clone(),
            Entity::Server(s) => s.id.clone(),
            Entity::Member(m) => m.key(),
            Entity::Emoji(e) => e.id.clone(),
            Entity::Unread(u) => u.key(),
        }
    }
}
