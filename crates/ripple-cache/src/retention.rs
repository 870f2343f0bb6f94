use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use ripple_store::{Store, StoreError, StoreResult};
use ripple_types::models::EntityKind;
use ripple_types::ulid;

use crate::config::CacheConfig;
use crate::gateway::WriteGateway;

/// What a cleanup cycle removed, phase by phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_messages: usize,
    pub capped_messages: usize,
    pub orphaned_users: usize,
}

/// Background job bounding total storage independent of any view: TTL
/// expiry, per-channel caps, then orphaned users. Deletions go through
/// the write gateway so they fire the same change notifications as any
/// other mutation.
pub struct RetentionService {
    store: Arc<Store>,
    gateway: WriteGateway,
    config: CacheConfig,
    /// A cycle is running. A timer fire during a long cycle is skipped
    /// rather than stacked.
    running: AtomicBool,
}

impl RetentionService {
    pub fn new(store: Arc<Store>, gateway: WriteGateway, config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            config,
            running: AtomicBool::new(false),
        })
    }

    /// Periodic loop. Runs until the task is aborted.
    pub async fn run_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.retention_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.force_cleanup().await {
                Some(report) => {
                    if report != CleanupReport::default() {
                        info!(
                            "Retention: {} expired, {} over cap, {} orphaned users",
                            report.expired_messages, report.capped_messages, report.orphaned_users
                        );
                    }
                }
                None => debug!("Retention cycle still running, tick skipped"),
            }
        }
    }

    /// Run all three phases now — the app's background/termination hook.
    /// Returns `None` when a cycle is already in progress. Each phase is
    /// its own transaction; a failing phase is logged and the next one
    /// still runs.
    pub async fn force_cleanup(&self) -> Option<CleanupReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let mut report = CleanupReport::default();

        match self.sweep_expired().await {
            Ok(count) => report.expired_messages = count,
            Err(e) => warn!("Retention TTL sweep failed: {}", e),
        }
        match self.sweep_channel_caps().await {
            Ok(count) => report.capped_messages = count,
            Err(e) => warn!("Retention cap sweep failed: {}", e),
        }
        match self.sweep_orphans().await {
            Ok(count) => report.orphaned_users = count,
            Err(e) => warn!("Retention orphan sweep failed: {}", e),
        }

        Some(report)
    }

    /// Phase 1: delete messages older than the TTL. The cutoff instant is
    /// encoded into a minimal id, so one indexed range scan finds every
    /// message created before it.
    async fn sweep_expired(&self) -> StoreResult<usize> {
        let ttl = ChronoDuration::from_std(self.config.message_ttl)
            .map_err(|e| StoreError::Unavailable(format!("ttl out of range: {}", e)))?;
        let cutoff_id = ulid::min_for_timestamp(Utc::now() - ttl);

        let store = self.store.clone();
        let expired = blocking_read(move || store.message_ids_older_than(&cutoff_id)).await?;
        let count = expired.len();
        if count > 0 {
            self.gateway.delete_batch(EntityKind::Message, expired).await?;
        }
        Ok(count)
    }

    /// Phase 2: per channel, keep only the newest `per_channel_cap`
    /// messages. All excess ids across channels are deleted in one
    /// transaction.
    async fn sweep_channel_caps(&self) -> StoreResult<usize> {
        let cap = self.config.per_channel_cap;
        let store = self.store.clone();
        let excess = blocking_read(move || {
            let mut excess = Vec::new();
            for channel_id in store.channel_ids_with_messages()? {
                excess.extend(store.message_ids_beyond_cap(&channel_id, cap)?);
            }
            Ok(excess)
        })
        .await?;

        let count = excess.len();
        if count > 0 {
            self.gateway.delete_batch(EntityKind::Message, excess).await?;
        }
        Ok(count)
    }

    /// Phase 3: delete users that no remaining message references (as
    /// author or mention) and that have no active relationship.
    async fn sweep_orphans(&self) -> StoreResult<usize> {
        let store = self.store.clone();
        let orphans = blocking_read(move || {
            let referenced = store.referenced_user_ids()?;
            let mut orphans = store.inactive_user_ids()?;
            orphans.retain(|id| !referenced.contains(id));
            Ok(orphans)
        })
        .await?;

        let count = orphans.len();
        if count > 0 {
            self.gateway.delete_batch(EntityKind::User, orphans).await?;
        }
        Ok(count)
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn blocking_read<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("read task join error: {}", e)))?
}
