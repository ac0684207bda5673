pub mod background;
pub mod config;
pub mod store;

use std::sync::Arc;

pub use background::BackgroundSystem;
pub use config::AppConfig;
pub use store::{MemoryPostStore, PostStore};

/// Build the background system over an in-memory post store
pub fn build(config: &AppConfig) -> anyhow::Result<BackgroundSystem> {
    let posts: Arc<dyn PostStore> = Arc::new(MemoryPostStore::new());
    BackgroundSystem::new(posts, config.queue.clone())
}
