use tokio::sync::broadcast;

use ripple_types::events::CacheEvent;

/// Process-wide notification channel for the presentation layer. All
/// cache events flow through one broadcast sender so every subscriber
/// sees the same ordered stream.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<CacheEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody is listening —
    /// a dismissed view simply has no consumer left.
    pub fn publish(&self, event: CacheEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
