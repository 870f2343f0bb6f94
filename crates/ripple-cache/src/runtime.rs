use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use ripple_store::Store;

use crate::client::NetworkClient;
use crate::config::CacheConfig;
use crate::gateway::WriteGateway;
use crate::notifier::Notifier;
use crate::observer::{self, ObserverHealth};
use crate::orchestrator::SyncOrchestrator;
use crate::retention::{CleanupReport, RetentionService};
use crate::window::ChannelWindow;

/// Composition root for the cache subsystem. Everything is injected —
/// store handle and network client come from the caller — so tests can
/// swap in doubles; no hidden global state.
pub struct CacheRuntime {
    store: Arc<Store>,
    gateway: WriteGateway,
    orchestrator: Arc<SyncOrchestrator>,
    notifier: Notifier,
    health: Arc<ObserverHealth>,
    retention: Arc<RetentionService>,
    config: CacheConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl CacheRuntime {
    /// Wire up and spawn the gateway actor, the change observers, and the
    /// retention loop.
    pub fn start(
        store: Arc<Store>,
        network: Arc<dyn NetworkClient>,
        config: CacheConfig,
    ) -> Self {
        let gateway = WriteGateway::spawn(store.clone());
        let notifier = Notifier::new();
        let (health, mut tasks) = observer::spawn_observers(store.clone(), &gateway, notifier.clone());

        let orchestrator = Arc::new(SyncOrchestrator::new(
            network,
            gateway.clone(),
            config.page_size,
        ));

        let retention = RetentionService::new(store.clone(), gateway.clone(), config.clone());
        tasks.push(tokio::spawn(retention.clone().run_loop()));

        info!("Cache runtime started");
        Self {
            store,
            gateway,
            orchestrator,
            notifier,
            health,
            retention,
            config,
            tasks,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn gateway(&self) -> &WriteGateway {
        &self.gateway
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn observer_health(&self) -> &ObserverHealth {
        &self.health
    }

    /// A bounded window over one channel, backed by this runtime's store
    /// and orchestrator.
    pub fn open_window(&self, channel_id: &str) -> ChannelWindow {
        ChannelWindow::new(
            channel_id,
            self.store.clone(),
            self.orchestrator.clone(),
            self.config.page_size,
            self.config.max_messages_in_memory,
        )
    }

    /// Run retention immediately — the background/termination hook.
    pub async fn force_cleanup(&self) -> Option<CleanupReport> {
        self.retention.force_cleanup().await
    }

    /// Stop the background tasks. In-flight gateway writes drain once all
    /// handles to it are dropped.
    pub fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Cache runtime stopped");
    }
}

impl Drop for CacheRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
