use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ripple_store::{Store, StoreResult};
use ripple_types::events::{CacheEvent, LoadPhase, StoreChange};
use ripple_types::models::{Entity, EntityKind};

use crate::gateway::WriteGateway;
use crate::notifier::Notifier;

const BASE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct KindHealth {
    healthy: AtomicBool,
    lag_events: AtomicU64,
}

/// Explicit subscription health, one slot per entity type. A stream that
/// lags or closes is visible here instead of silently going dark.
pub struct ObserverHealth {
    slots: HashMap<EntityKind, KindHealth>,
}

impl ObserverHealth {
    fn new() -> Self {
        let slots = EntityKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    KindHealth {
                        healthy: AtomicBool::new(false),
                        lag_events: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        Self { slots }
    }

    pub fn is_healthy(&self, kind: EntityKind) -> bool {
        self.slots[&kind].healthy.load(Ordering::Relaxed)
    }

    pub fn lag_count(&self, kind: EntityKind) -> u64 {
        self.slots[&kind].lag_events.load(Ordering::Relaxed)
    }

    fn set_healthy(&self, kind: EntityKind, healthy: bool) {
        self.slots[&kind].healthy.store(healthy, Ordering::Relaxed);
    }

    fn record_lag(&self, kind: EntityKind, missed: u64) {
        self.slots[&kind].lag_events.fetch_add(missed, Ordering::Relaxed);
    }
}

/// Spawn one supervised observer task per entity type. Each consumes the
/// gateway's change stream, resolves the affected scope, and republishes
/// scope-qualified events on the notifier.
pub fn spawn_observers(
    store: Arc<Store>,
    gateway: &WriteGateway,
    notifier: Notifier,
) -> (Arc<ObserverHealth>, Vec<JoinHandle<()>>) {
    let health = Arc::new(ObserverHealth::new());
    let handles = EntityKind::ALL
        .into_iter()
        .map(|kind| {
            tokio::spawn(observe_kind(
                kind,
                store.clone(),
                gateway.clone(),
                notifier.clone(),
                health.clone(),
            ))
        })
        .collect();
    (health, handles)
}

async fn observe_kind(
    kind: EntityKind,
    store: Arc<Store>,
    gateway: WriteGateway,
    notifier: Notifier,
    health: Arc<ObserverHealth>,
) {
    let mut backoff = BASE_BACKOFF;
    loop {
        // Subscribe before the snapshot so no commit falls in between.
        let mut rx = gateway.subscribe_changes();

        // First notification is the initial load of whatever is cached.
        match current_scope(kind, &store).await {
            Ok(scope) => {
                health.set_healthy(kind, true);
                notifier.publish(event_for(kind, LoadPhase::InitialLoad, scope));
            }
            Err(e) => {
                health.set_healthy(kind, false);
                warn!("Observer for {} failed initial read: {}", kind, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        }
        backoff = BASE_BACKOFF;

        loop {
            match rx.recv().await {
                Ok(StoreChange::Batch {
                    kind: batch_kind,
                    inserted,
                    modified,
                    deleted,
                }) => {
                    if batch_kind != kind {
                        continue;
                    }
                    match resolve_scope(kind, &store, &inserted, &modified, &deleted).await {
                        Ok(scope) if !scope.is_empty() => {
                            notifier.publish(event_for(kind, LoadPhase::Incremental, scope));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Observer for {} failed scope resolution: {}", kind, e);
                        }
                    }
                }
                Ok(StoreChange::Wiped) => {
                    // One designated observer forwards the wipe so
                    // subscribers see it exactly once.
                    if kind == EntityKind::Message {
                        notifier.publish(CacheEvent::StoreWiped);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    health.record_lag(kind, missed);
                    warn!("Observer for {} lagged, {} changes missed", kind, missed);
                    // Payloads are gone; fall back to the full current scope
                    // so nothing stays stale.
                    if let Ok(scope) = current_scope(kind, &store).await {
                        notifier.publish(event_for(kind, LoadPhase::Incremental, scope));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    health.set_healthy(kind, false);
                    warn!("Observer for {} lost its change stream, resubscribing", kind);
                    break;
                }
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
        debug!("Observer for {} resubscribing", kind);
    }
}

/// Scope for an incremental batch. For messages: channel ids read off the
/// inserted/modified payloads; a deletions-only batch carries no payload,
/// so fall back to the channels still present in the store. Other kinds
/// scope by primary key directly.
async fn resolve_scope(
    kind: EntityKind,
    store: &Arc<Store>,
    inserted: &[Entity],
    modified: &[Entity],
    deleted: &[String],
) -> StoreResult<Vec<String>> {
    if kind == EntityKind::Message {
        let mut channels: BTreeSet<String> = inserted
            .iter()
            .chain(modified)
            .filter_map(|e| match e {
                Entity::Message(m) => Some(m.channel_id.clone()),
                _ => None,
            })
            .collect();
        if channels.is_empty() && !deleted.is_empty() {
            let store = store.clone();
            channels = blocking_read(move || store.channel_ids_with_messages()).await?
                .into_iter()
                .collect();
        }
        return Ok(channels.into_iter().collect());
    }

    let keys: BTreeSet<String> = inserted
        .iter()
        .chain(modified)
        .map(Entity::key)
        .chain(deleted.iter().cloned())
        .collect();
    Ok(keys.into_iter().collect())
}

/// The full current scope of a kind, used for the initial-load
/// notification and the post-lag refresh.
async fn current_scope(kind: EntityKind, store: &Arc<Store>) -> StoreResult<Vec<String>> {
    let store = store.clone();
    blocking_read(move || match kind {
        EntityKind::Message => store.channel_ids_with_messages(),
        other => Ok(store.fetch_all(other)?.iter().map(Entity::key).collect()),
    })
    .await
}

async fn blocking_read<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ripple_store::StoreError::Unavailable(format!("read task join error: {}", e)))?
}

fn event_for(kind: EntityKind, phase: LoadPhase, scope: Vec<String>) -> CacheEvent {
    match kind {
        EntityKind::Message => CacheEvent::MessagesUpdated { phase, channel_ids: scope },
        EntityKind::User => CacheEvent::UsersUpdated { phase, user_ids: scope },
        EntityKind::Channel => CacheEvent::ChannelsUpdated { phase, channel_ids: scope },
        EntityKind::Server => CacheEvent::ServersUpdated { phase, server_ids: scope },
        EntityKind::Member => CacheEvent::MembersUpdated { phase, keys: scope },
        EntityKind::Emoji => CacheEvent::EmojisUpdated { phase, emoji_ids: scope },
        EntityKind::Unread => CacheEvent::UnreadsUpdated { phase, keys: scope },
    }
}
