use std::env;

use herd_queue::QueueConfig;

/// Application settings, read from the environment (after `.env` is loaded)
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub queue: QueueConfig,
    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
    /// Posts enqueued by the demo binary on startup
    pub demo_posts: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            queue: QueueConfig::from_lookup(&get),
            log_json: get("LOG_FORMAT").is_some_and(|format| format.eq_ignore_ascii_case("json")),
            demo_posts: get("DEMO_POSTS").and_then(|raw| raw.parse().ok()).unwrap_or(5),
        }
    }
}
