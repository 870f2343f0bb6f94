use serde::{Deserialize, Serialize};

use crate::models::{Entity, EntityKind};

/// A committed change batch emitted by the write gateway after every
/// successful transaction. Inserted and modified records carry their full
/// payload; deletions carry only the primary key — the row is gone.
#[derive(Debug, Clone)]
pub enum StoreChange {
    Batch {
        kind: EntityKind,
        inserted: Vec<Entity>,
        modified: Vec<Entity>,
        deleted: Vec<String>,
    },
    /// The whole store was cleared.
    Wiped,
}

impl StoreChange {
    pub fn is_empty(&self) -> bool {
        match self {
            StoreChange::Batch {
                inserted,
                modified,
                deleted,
                ..
            } => inserted.is_empty() && modified.is_empty() && deleted.is_empty(),
            StoreChange::Wiped => false,
        }
    }
}

/// Whether a notification reflects the first read of existing cached data
/// or a change that happened after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    InitialLoad,
    Incremental,
}

/// Scope-qualified notifications published to the presentation layer.
/// Subscribers filter on the attached identifiers instead of diffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CacheEvent {
    /// Messages changed in the listed channels.
    MessagesUpdated {
        phase: LoadPhase,
        channel_ids: Vec<String>,
    },
    UsersUpdated {
        phase: LoadPhase,
        user_ids: Vec<String>,
    },
    ChannelsUpdated {
        phase: LoadPhase,
        channel_ids: Vec<String>,
    },
    ServersUpdated {
        phase: LoadPhase,
        server_ids: Vec<String>,
    },
    /// Keys are `server_id:user_id`.
    MembersUpdated {
        phase: LoadPhase,
        keys: Vec<String>,
    },
    EmojisUpdated {
        phase: LoadPhase,
        emoji_ids: Vec<String>,
    },
    /// Keys are `user_id:channel_id`.
    UnreadsUpdated {
        phase: LoadPhase,
        keys: Vec<String>,
    },
    StoreWiped,
}

impl CacheEvent {
    /// The entity type this event concerns, if any.
    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            CacheEvent::MessagesUpdated { .. } => Some(EntityKind::Message),
            CacheEvent::UsersUpdated { .. } => Some(EntityKind::User),
            CacheEvent::ChannelsUpdated { .. } => Some(EntityKind::Channel),
            CacheEvent::ServersUpdated { .. } => Some(EntityKind::Server),
            CacheEvent::MembersUpdated { .. } => Some(EntityKind::Member),
            CacheEvent::EmojisUpdated { .. } => Some(EntityKind::Emoji),
            CacheEvent::UnreadsUpdated { .. } => Some(EntityKind::Unread),
            CacheEvent::StoreWiped => None,
        }
    }

    /// The scope identifiers attached to this event.
    pub fn scope(&self) -> &[String] {
        match self {
            CacheEvent::MessagesUpdated { channel_ids, .. } => channel_ids,
            CacheEvent::UsersUpdated { user_ids, .. } => user_ids,
            CacheEvent::ChannelsUpdated { channel_ids, .. } => channel_ids,
            CacheEvent::ServersUpdated { server_ids, .. } => server_ids,
            CacheEvent::MembersUpdated { keys, .. } => keys,
            CacheEvent::EmojisUpdated { emoji_ids, .. } => emoji_ids,
            CacheEvent::UnreadsUpdated { keys, .. } => keys,
            CacheEvent::StoreWiped => &[],
        }
    }
}
