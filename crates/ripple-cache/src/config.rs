use std::time::Duration;

/// Cache tuning knobs. Defaults match the shipped client; every value can
/// be overridden through `RIPPLE_*` environment variables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Messages fetched per page by the window manager.
    pub page_size: u32,
    /// Hard bound on messages a single view holds in memory.
    pub max_messages_in_memory: usize,
    /// How often the retention service runs.
    pub retention_interval: Duration,
    /// Messages older than this are swept.
    pub message_ttl: Duration,
    /// Per-channel stored message cap.
    pub per_channel_cap: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_messages_in_memory: 150,
            retention_interval: Duration::from_secs(60 * 60),
            message_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            per_channel_cap: 500,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            page_size: env_parse("RIPPLE_PAGE_SIZE", defaults.page_size),
            max_messages_in_memory: env_parse(
                "RIPPLE_MAX_WINDOW_MESSAGES",
                defaults.max_messages_in_memory,
            ),
            retention_interval: Duration::from_secs(env_parse(
                "RIPPLE_RETENTION_INTERVAL_SECS",
                defaults.retention_interval.as_secs(),
            )),
            message_ttl: Duration::from_secs(
                env_parse("RIPPLE_MESSAGE_TTL_DAYS", 30u64) * 24 * 60 * 60,
            ),
            per_channel_cap: env_parse("RIPPLE_CHANNEL_CAP", defaults.per_channel_cap),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
