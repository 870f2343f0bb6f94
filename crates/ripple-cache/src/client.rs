use async_trait::async_trait;
use thiserror::Error;

use ripple_types::models::{Member, Message, User};

/// Network fetch failures. The orchestrator logs these and swallows them;
/// the caller sees no state change and may simply retry.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("decode failure: {0}")]
    Decode(String),
}

/// A page of fetched messages plus the user records the server bundled
/// alongside them, so authors resolve without a second round trip.
#[derive(Debug, Clone, Default)]
pub struct MessageBundle {
    pub messages: Vec<Message>,
    pub users: Vec<User>,
}

/// The wire client collaborator. The real HTTP/WebSocket implementation
/// lives outside this subsystem; tests inject a scripted double.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Message history for a channel, newest first, optionally only
    /// messages strictly older than `before`.
    async fn fetch_history(
        &self,
        channel_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<MessageBundle, SyncError>;

    /// A target message plus a window of surrounding messages, for
    /// jump-to-message.
    async fn fetch_nearby(
        &self,
        channel_id: &str,
        message_id: &str,
        limit: u32,
    ) -> Result<MessageBundle, SyncError>;

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<MessageBundle, SyncError>;

    async fn fetch_user(&self, user_id: &str) -> Result<User, SyncError>;

    async fn fetch_members(&self, server_id: &str) -> Result<Vec<Member>, SyncError>;
}
