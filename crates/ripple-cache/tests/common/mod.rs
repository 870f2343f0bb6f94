//! Shared test doubles: an in-memory scripted network and entity builders.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ripple_cache::{MessageBundle, NetworkClient, SyncError};
use ripple_types::models::{Member, Message, Relationship, User};
use ripple_types::ulid;

/// Route tracing output through the test harness; `RUST_LOG` filters as usual.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "ripple=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
struct Script {
    /// Per-channel full history, ascending by id.
    messages: HashMap<String, Vec<Message>>,
    users: HashMap<String, User>,
}

/// A network collaborator that serves a scripted history and counts
/// fetches, with an optional per-request delay for concurrency tests.
#[derive(Default)]
pub struct MockNetwork {
    script: Mutex<Script>,
    pub history_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    delay: Mutex<Duration>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_messages(&self, channel_id: &str, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        self.script
            .lock()
            .unwrap()
            .messages
            .entry(channel_id.to_string())
            .or_default()
            .extend(messages);
    }

    pub fn seed_user(&self, user: User) {
        self.script.lock().unwrap().users.insert(user.id.clone(), user);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn bundle(&self, messages: Vec<Message>) -> MessageBundle {
        let script = self.script.lock().unwrap();
        let users = messages
            .iter()
            .flat_map(Message::referenced_users)
            .filter_map(|id| script.users.get(id).cloned())
            .collect();
        MessageBundle { messages, users }
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl NetworkClient for MockNetwork {
    async fn fetch_history(
        &self,
        channel_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<MessageBundle, SyncError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;

        let page = {
            let script = self.script.lock().unwrap();
            let all = script.messages.get(channel_id).cloned().unwrap_or_default();
            let mut eligible: Vec<Message> = all
                .into_iter()
                .filter(|m| before.is_none_or(|b| m.id.as_str() < b))
                .collect();
            let start = eligible.len().saturating_sub(limit as usize);
            eligible.split_off(start)
        };
        Ok(self.bundle(page))
    }

    async fn fetch_nearby(
        &self,
        channel_id: &str,
        message_id: &str,
        limit: u32,
    ) -> Result<MessageBundle, SyncError> {
        let page = {
            let script = self.script.lock().unwrap();
            let all = script.messages.get(channel_id).cloned().unwrap_or_default();
            let center = all
                .iter()
                .position(|m| m.id == message_id)
                .ok_or_else(|| SyncError::Network(format!("no such message {}", message_id)))?;
            let half = (limit as usize) / 2;
            let start = center.saturating_sub(half);
            let end = (center + half + 1).min(all.len());
            all[start..end].to_vec()
        };
        Ok(self.bundle(page))
    }

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<MessageBundle, SyncError> {
        let found = {
            let script = self.script.lock().unwrap();
            script
                .messages
                .get(channel_id)
                .and_then(|all| all.iter().find(|m| m.id == message_id).cloned())
        };
        match found {
            Some(message) => Ok(self.bundle(vec![message])),
            None => Err(SyncError::Network(format!("no such message {}", message_id))),
        }
    }

    async fn fetch_user(&self, user_id: &str) -> Result<User, SyncError> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| SyncError::Network(format!("no such user {}", user_id)))
    }

    async fn fetch_members(&self, _server_id: &str) -> Result<Vec<Member>, SyncError> {
        Ok(vec![])
    }
}

pub fn message_at(channel_id: &str, author_id: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: ulid::from_timestamp(at),
        channel_id: channel_id.to_string(),
        author_id: author_id.to_string(),
        content: Some("hello".into()),
        attachments: None,
        reactions: None,
        mentions: None,
        edited: None,
    }
}

pub fn user(id: &str, relationship: Relationship) -> User {
    User {
        id: id.to_string(),
        username: format!("{}-name", id),
        display_name: None,
        avatar: None,
        relationship,
        presence: None,
    }
}
