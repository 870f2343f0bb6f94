use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error};

use ripple_store::{Store, StoreError, StoreResult, UpsertOutcome};
use ripple_types::events::StoreChange;
use ripple_types::models::{Entity, EntityKind};

enum Command {
    UpsertBatch(Vec<Entity>, oneshot::Sender<StoreResult<()>>),
    DeleteBatch(EntityKind, Vec<String>, oneshot::Sender<StoreResult<()>>),
    WipeAll(oneshot::Sender<StoreResult<()>>),
}

/// The single serialized write path to the store. All mutations queue
/// into one actor task; a second caller's write lands strictly after the
/// first's commit. Every successful commit fans out a [`StoreChange`]
/// batch on the change stream the observers consume.
#[derive(Clone)]
pub struct WriteGateway {
    tx: mpsc::Sender<Command>,
    changes: broadcast::Sender<StoreChange>,
}

impl WriteGateway {
    pub fn spawn(store: Arc<Store>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let (changes, _) = broadcast::channel(1024);
        tokio::spawn(run(store, rx, changes.clone()));
        Self { tx, changes }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    pub async fn upsert(&self, entity: Entity) -> StoreResult<()> {
        self.upsert_batch(vec![entity]).await
    }

    pub async fn upsert_batch(&self, entities: Vec<Entity>) -> StoreResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        self.send(|reply| Command::UpsertBatch(entities, reply)).await
    }

    pub async fn delete(&self, kind: EntityKind, key: &str) -> StoreResult<()> {
        self.delete_batch(kind, vec![key.to_string()]).await
    }

    pub async fn delete_batch(&self, kind: EntityKind, keys: Vec<String>) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.send(|reply| Command::DeleteBatch(kind, keys, reply)).await
    }

    pub async fn wipe_all(&self) -> StoreResult<()> {
        self.send(Command::WipeAll).await
    }

    async fn send<F>(&self, make: F) -> StoreResult<()>
    where
        F: FnOnce(oneshot::Sender<StoreResult<()>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StoreError::Unavailable("write gateway stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| StoreError::Unavailable("write gateway dropped reply".into()))?
    }
}

async fn run(
    store: Arc<Store>,
    mut rx: mpsc::Receiver<Command>,
    changes: broadcast::Sender<StoreChange>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::UpsertBatch(entities, reply) => {
                let store = store.clone();
                let result =
                    blocking(move || store.upsert_batch(&entities)).await;
                match result {
                    Ok(outcome) => {
                        for change in split_outcome(outcome) {
                            let _ = changes.send(change);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        error!("Gateway upsert failed: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::DeleteBatch(kind, keys, reply) => {
                let store = store.clone();
                let result = blocking(move || store.delete_batch(kind, &keys)).await;
                match result {
                    Ok(deleted) => {
                        if !deleted.is_empty() {
                            let _ = changes.send(StoreChange::Batch {
                                kind,
                                inserted: vec![],
                                modified: vec![],
                                deleted,
                            });
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        error!("Gateway delete failed: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::WipeAll(reply) => {
                let store = store.clone();
                let result = blocking(move || store.wipe_all()).await;
                match result {
                    Ok(()) => {
                        let _ = changes.send(StoreChange::Wiped);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        error!("Gateway wipe failed: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }
    debug!("Write gateway stopped");
}

/// Run blocking store work off the async runtime, inside the actor's
/// single loop so writes still never interleave.
async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("write task join error: {}", e)))?
}

/// A mixed upsert batch becomes one change per entity kind, matching the
/// per-entity-type streams the observers hold.
fn split_outcome(outcome: UpsertOutcome) -> Vec<StoreChange> {
    let mut by_kind: HashMap<EntityKind, (Vec<Entity>, Vec<Entity>)> = HashMap::new();
    for entity in outcome.inserted {
        by_kind.entry(entity.kind()).or_default().0.push(entity);
    }
    for entity in outcome.modified {
        by_kind.entry(entity.kind()).or_default().1.push(entity);
    }
    by_kind
        .into_iter()
        .map(|(kind, (inserted, modified))| StoreChange::Batch {
            kind,
            inserted,
            modified,
            deleted: vec![],
        })
        .collect()
}
