pub mod client;
pub mod config;
pub mod gateway;
pub mod notifier;
pub mod observer;
pub mod orchestrator;
pub mod retention;
pub mod runtime;
pub mod window;

pub use client::{MessageBundle, NetworkClient, SyncError};
pub use config::CacheConfig;
pub use gateway::WriteGateway;
pub use notifier::Notifier;
pub use observer::ObserverHealth;
pub use orchestrator::SyncOrchestrator;
pub use retention::{CleanupReport, RetentionService};
pub use runtime::CacheRuntime;
pub use window::{ChannelWindow, WindowState};
