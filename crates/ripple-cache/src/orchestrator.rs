use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use ripple_types::models::Entity;

use crate::client::{MessageBundle, NetworkClient};
use crate::gateway::WriteGateway;

/// The deduplication key space: one fetch per (operation kind, target id)
/// pair may be in flight at a time for the guarded operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FetchKind {
    ChannelHistory,
    Members,
}

/// Bridges network fetches to store writes. The presentation layer never
/// calls the network; it asks the orchestrator, and results arrive as
/// change notifications.
pub struct SyncOrchestrator {
    network: Arc<dyn NetworkClient>,
    gateway: WriteGateway,
    page_size: u32,
    in_flight: Mutex<HashSet<(FetchKind, String)>>,
}

impl SyncOrchestrator {
    pub fn new(network: Arc<dyn NetworkClient>, gateway: WriteGateway, page_size: u32) -> Self {
        Self {
            network,
            gateway,
            page_size,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Fetch the latest page of a channel and write it through the
    /// gateway. Deduplicated: while one sync for this channel is in
    /// flight, further calls return false without a network request.
    /// The marker clears on success or failure, so retries are never
    /// permanently blocked.
    pub async fn sync_channel_messages(&self, channel_id: &str) -> bool {
        let Some(_guard) = self.try_begin(FetchKind::ChannelHistory, channel_id) else {
            debug!("Channel sync already in flight for {}", channel_id);
            return false;
        };
        match self
            .network
            .fetch_history(channel_id, self.page_size, None)
            .await
        {
            Ok(bundle) => self.apply(bundle).await,
            Err(e) => {
                warn!("Channel sync failed for {}: {}", channel_id, e);
                false
            }
        }
    }

    /// Fetch a page strictly older than `before_id`. Not deduplicated —
    /// the window manager already guards its own load-more.
    pub async fn sync_more_messages(&self, channel_id: &str, before_id: &str) -> bool {
        match self
            .network
            .fetch_history(channel_id, self.page_size, Some(before_id))
            .await
        {
            Ok(bundle) => self.apply(bundle).await,
            Err(e) => {
                warn!("Pagination sync failed for {}: {}", channel_id, e);
                false
            }
        }
    }

    /// Fetch a message plus its surroundings, for jump-to-message. Not
    /// deduplicated: rare, user-initiated, latency-sensitive.
    pub async fn sync_target_message(&self, message_id: &str, channel_id: &str) -> bool {
        match self
            .network
            .fetch_nearby(channel_id, message_id, self.page_size)
            .await
        {
            Ok(bundle) => self.apply(bundle).await,
            Err(e) => {
                warn!("Target sync failed for {}/{}: {}", channel_id, message_id, e);
                false
            }
        }
    }

    pub async fn sync_single_message(&self, channel_id: &str, message_id: &str) -> bool {
        match self.network.fetch_message(channel_id, message_id).await {
            Ok(bundle) => self.apply(bundle).await,
            Err(e) => {
                warn!("Message sync failed for {}/{}: {}", channel_id, message_id, e);
                false
            }
        }
    }

    pub async fn sync_user(&self, user_id: &str) -> bool {
        match self.network.fetch_user(user_id).await {
            Ok(user) => match self.gateway.upsert(Entity::User(user)).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("User write failed for {}: {}", user_id, e);
                    false
                }
            },
            Err(e) => {
                warn!("User sync failed for {}: {}", user_id, e);
                false
            }
        }
    }

    /// Fetch a server's member list. Deduplicated like channel history.
    pub async fn sync_server_members(&self, server_id: &str) -> bool {
        let Some(_guard) = self.try_begin(FetchKind::Members, server_id) else {
            debug!("Member sync already in flight for {}", server_id);
            return false;
        };
        match self.network.fetch_members(server_id).await {
            Ok(members) => {
                let entities: Vec<Entity> = members.into_iter().map(Entity::Member).collect();
                match self.gateway.upsert_batch(entities).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Member write failed for {}: {}", server_id, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Member sync failed for {}: {}", server_id, e);
                false
            }
        }
    }

    async fn apply(&self, bundle: MessageBundle) -> bool {
        let mut entities: Vec<Entity> = bundle.users.into_iter().map(Entity::User).collect();
        entities.extend(bundle.messages.into_iter().map(Entity::Message));
        match self.gateway.upsert_batch(entities).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Sync write failed: {}", e);
                false
            }
        }
    }

    fn try_begin(&self, kind: FetchKind, target: &str) -> Option<InFlightGuard<'_>> {
        let mut set = match self.in_flight.lock() {
            Ok(set) => set,
            Err(e) => {
                warn!("In-flight set poisoned: {}", e);
                return None;
            }
        };
        if !set.insert((kind, target.to_string())) {
            return None;
        }
        Some(InFlightGuard {
            orchestrator: self,
            key: (kind, target.to_string()),
        })
    }
}

/// Clears the in-flight marker when the fetch ends, however it ends.
struct InFlightGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
    key: (FetchKind, String),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.orchestrator.in_flight.lock() {
            set.remove(&self.key);
        }
    }
}
