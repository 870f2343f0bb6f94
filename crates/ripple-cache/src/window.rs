use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::warn;

use ripple_store::{Store, StoreError, StoreResult};
use ripple_types::models::{Message, User};

use crate::orchestrator::SyncOrchestrator;

/// Lifecycle of a channel view's message window. `Loaded` is the stable
/// state between user actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Empty,
    Loading,
    Loaded,
    LoadingMore,
}

struct WindowInner {
    state: WindowState,
    /// Oldest first — display order.
    messages: Vec<Message>,
    /// Sorted id index mirroring `messages`.
    ids: Vec<String>,
    /// View-local user records; trimming sweeps this, never the store.
    users: HashMap<String, User>,
    /// Oldest loaded id — the boundary for the next older page.
    cursor: Option<String>,
    has_more: bool,
}

impl Default for WindowInner {
    fn default() -> Self {
        Self {
            state: WindowState::Empty,
            messages: Vec::new(),
            ids: Vec::new(),
            users: HashMap::new(),
            cursor: None,
            has_more: false,
        }
    }
}

/// One bounded, paginated slice of a channel, plus the user records it
/// references. Holds at most `max_messages` messages; the oldest go
/// first when trimmed.
pub struct ChannelWindow {
    channel_id: String,
    store: Arc<Store>,
    orchestrator: Arc<SyncOrchestrator>,
    page_size: u32,
    max_messages: usize,
    /// A load is in flight. Concurrent loads return false immediately.
    busy: AtomicBool,
    inner: Mutex<WindowInner>,
}

impl ChannelWindow {
    pub fn new(
        channel_id: impl Into<String>,
        store: Arc<Store>,
        orchestrator: Arc<SyncOrchestrator>,
        page_size: u32,
        max_messages: usize,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            store,
            orchestrator,
            page_size,
            max_messages,
            busy: AtomicBool::new(false),
            inner: Mutex::new(WindowInner::default()),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    // -- Loading --

    /// Load the most recent page. Valid only from `Empty`; any other
    /// state (or a load already in flight) is a no-op returning false.
    pub async fn load_initial(&self) -> StoreResult<bool> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let _busy = BusyGuard(&self.busy);

        {
            let mut inner = self.inner.lock().await;
            if inner.state != WindowState::Empty {
                return Ok(false);
            }
            inner.state = WindowState::Loading;
        }

        // Network first so a cold cache fills up; failures are logged by
        // the orchestrator and the store read proceeds with what we have.
        self.orchestrator.sync_channel_messages(&self.channel_id).await;

        let loaded = async {
            let messages = self.read_recent().await?;
            let users = self.read_users(&messages).await?;
            Ok::<_, StoreError>((messages, users))
        }
        .await;

        let mut inner = self.inner.lock().await;
        match loaded {
            Ok((messages, users)) => {
                inner.ids = messages.iter().map(|m| m.id.clone()).collect();
                inner.cursor = messages.first().map(|m| m.id.clone());
                inner.has_more = messages.len() as u32 == self.page_size;
                inner.messages = messages;
                inner.users = users;
                inner.state = WindowState::Loaded;
                Ok(true)
            }
            Err(e) => {
                inner.state = WindowState::Empty;
                Err(e)
            }
        }
    }

    /// Load the next older page. Valid only from `Loaded` with more
    /// history available; returns false without fetching when a load is
    /// already in flight or the history is exhausted. Returns whether
    /// any messages were added.
    pub async fn load_more(&self) -> StoreResult<bool> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let _busy = BusyGuard(&self.busy);

        let cursor = {
            let mut inner = self.inner.lock().await;
            if inner.state != WindowState::Loaded || !inner.has_more {
                return Ok(false);
            }
            let Some(cursor) = inner.cursor.clone() else {
                return Ok(false);
            };
            inner.state = WindowState::LoadingMore;
            cursor
        };

        self.orchestrator
            .sync_more_messages(&self.channel_id, &cursor)
            .await;

        let loaded = async {
            let older = self.read_before(&cursor).await?;
            let users = self.read_users(&older).await?;
            Ok::<_, StoreError>((older, users))
        }
        .await;

        let mut inner = self.inner.lock().await;
        inner.state = WindowState::Loaded;
        let (older, users) = loaded?;

        let added = !older.is_empty();
        inner.has_more = older.len() as u32 == self.page_size;
        if added {
            inner.cursor = older.first().map(|m| m.id.clone());

            let mut ids: Vec<String> = older.iter().map(|m| m.id.clone()).collect();
            ids.append(&mut inner.ids);
            inner.ids = ids;

            let mut messages = older;
            messages.append(&mut inner.messages);
            inner.messages = messages;

            inner.users.extend(users);
            trim(&mut inner, self.max_messages);
        }
        Ok(added)
    }

    // -- Incremental updates from the notification path --

    /// Insert or replace a message. Messages for other channels are
    /// ignored. A new message is placed by id order (in practice: the
    /// end), its author loaded if the view does not hold it yet.
    pub async fn add_message(&self, message: Message) -> StoreResult<bool> {
        if message.channel_id != self.channel_id {
            return Ok(false);
        }

        let load_author = {
            let mut inner = self.inner.lock().await;
            match inner.ids.binary_search(&message.id) {
                Ok(pos) => {
                    // Already present: edit/update semantics.
                    inner.messages[pos] = message.clone();
                    None
                }
                Err(pos) => {
                    inner.ids.insert(pos, message.id.clone());
                    inner.messages.insert(pos, message.clone());
                    if inner.cursor.is_none() {
                        inner.cursor = Some(message.id.clone());
                    }
                    let missing = !inner.users.contains_key(&message.author_id);
                    trim(&mut inner, self.max_messages);
                    // Only chase the author if the message survived the trim
                    (missing && inner.ids.binary_search(&message.id).is_ok())
                        .then(|| message.author_id.clone())
                }
            }
        };

        if let Some(author_id) = load_author {
            match self.read_user(&author_id).await? {
                Some(user) => {
                    let mut inner = self.inner.lock().await;
                    inner.users.insert(author_id, user);
                }
                None => {
                    // Not cached yet: fetch in the background, the result
                    // lands via the store and its change notifications.
                    let orchestrator = self.orchestrator.clone();
                    tokio::spawn(async move {
                        orchestrator.sync_user(&author_id).await;
                    });
                }
            }
        }
        Ok(true)
    }

    /// Replace a message in place. Returns false if the id is not held.
    pub async fn update_message(&self, message: Message) -> bool {
        if message.channel_id != self.channel_id {
            return false;
        }
        let mut inner = self.inner.lock().await;
        match inner.ids.binary_search(&message.id) {
            Ok(pos) => {
                inner.messages[pos] = message;
                true
            }
            Err(_) => false,
        }
    }

    /// Remove a message from the list and the id index.
    pub async fn delete_message(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.ids.binary_search(&id.to_string()) {
            Ok(pos) => {
                inner.ids.remove(pos);
                inner.messages.remove(pos);
                if pos == 0 {
                    inner.cursor = inner.ids.first().cloned();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Reset to `Empty`, discarding all in-memory state. Called when the
    /// view is dismissed; in-flight fetches still land in the store.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        *inner = WindowInner::default();
    }

    // -- Snapshots --

    pub async fn state(&self) -> WindowState {
        self.inner.lock().await.state
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn message_ids(&self) -> Vec<String> {
        self.inner.lock().await.ids.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.messages.is_empty()
    }

    pub async fn cursor(&self) -> Option<String> {
        self.inner.lock().await.cursor.clone()
    }

    pub async fn has_more(&self) -> bool {
        self.inner.lock().await.has_more
    }

    pub async fn user(&self, id: &str) -> Option<User> {
        self.inner.lock().await.users.get(id).cloned()
    }

    // -- Store reads (blocking work off the async runtime) --

    async fn read_recent(&self) -> StoreResult<Vec<Message>> {
        let store = self.store.clone();
        let channel = self.channel_id.clone();
        let limit = self.page_size;
        blocking_read(move || store.recent_messages(&channel, limit)).await
    }

    async fn read_before(&self, cursor: &str) -> StoreResult<Vec<Message>> {
        let store = self.store.clone();
        let channel = self.channel_id.clone();
        let cursor = cursor.to_string();
        let limit = self.page_size;
        blocking_read(move || store.messages_before(&channel, &cursor, limit)).await
    }

    async fn read_user(&self, id: &str) -> StoreResult<Option<User>> {
        let store = self.store.clone();
        let id = id.to_string();
        blocking_read(move || store.user_by_id(&id)).await
    }

    async fn read_users(&self, messages: &[Message]) -> StoreResult<HashMap<String, User>> {
        let ids: Vec<String> = messages
            .iter()
            .flat_map(Message::referenced_users)
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let store = self.store.clone();
        let users = blocking_read(move || store.users_by_ids(&ids)).await?;
        Ok(users.into_iter().map(|u| (u.id.clone(), u)).collect())
    }
}

/// Enforce the window bound: drop the oldest excess, advance the cursor,
/// and sweep the view-local user index for users no remaining message
/// references.
fn trim(inner: &mut WindowInner, max: usize) {
    if inner.messages.len() <= max {
        return;
    }
    let excess = inner.messages.len() - max;
    inner.messages.drain(..excess);
    inner.ids.drain(..excess);
    inner.cursor = inner.ids.first().cloned();

    let referenced: HashSet<&str> = inner
        .messages
        .iter()
        .flat_map(Message::referenced_users)
        .collect();
    inner.users.retain(|id, _| referenced.contains(id.as_str()));
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
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
        .map_err(|e| {
            warn!("Window read join error: {}", e);
            StoreError::Unavailable(format!("read task join error: {}", e))
        })?
}
