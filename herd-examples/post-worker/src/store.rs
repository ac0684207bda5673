//! Post persistence used by the background jobs.
//!
//! Jobs can run more than once for the same job id, so every write that a
//! job performs is keyed on that id and replays as a no-op.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub content: String,
    pub images: Vec<String>,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a post about to be created
#[derive(Debug, Clone)]
pub struct NewPost {
    pub content: String,
    pub images: Vec<String>,
    pub author_id: String,
}

/// Partial update; `None` leaves the field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Create a post for `request_id`, or return the one already created for it
    async fn create_post(&self, request_id: &str, post: NewPost) -> Result<Post>;

    /// The post, if it exists and belongs to `author_id`
    async fn find_owned(&self, post_id: &str, author_id: &str) -> Result<Option<Post>>;

    async fn update_post(&self, post_id: &str, update: PostUpdate) -> Result<Post>;

    async fn get(&self, post_id: &str) -> Result<Option<Post>>;

    async fn count(&self) -> Result<usize>;
}

#[derive(Default)]
struct Posts {
    by_id: HashMap<String, Post>,
    by_request: HashMap<String, String>,
}

/// In-process [`PostStore`]. `fail_next_writes` injects outages for demos and tests.
#[derive(Default)]
pub struct MemoryPostStore {
    posts: RwLock<Posts>,
    failing_writes: AtomicU32,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail as if the database were down
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let outage = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            bail!("post database unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn create_post(&self, request_id: &str, post: NewPost) -> Result<Post> {
        self.check_available()?;
        let mut posts = self.posts.write();

        if let Some(existing) = posts.by_request.get(request_id).and_then(|id| posts.by_id.get(id)) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let created = Post {
            id: Uuid::new_v4().to_string(),
            content: post.content,
            images: post.images,
            author_id: post.author_id,
            created_at: now,
            updated_at: now,
        };
        posts.by_request.insert(request_id.to_string(), created.id.clone());
        posts.by_id.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn find_owned(&self, post_id: &str, author_id: &str) -> Result<Option<Post>> {
        Ok(self
            .posts
            .read()
            .by_id
            .get(post_id)
            .filter(|post| post.author_id == author_id)
            .cloned())
    }

    async fn update_post(&self, post_id: &str, update: PostUpdate) -> Result<Post> {
        self.check_available()?;
        let mut posts = self.posts.write();
        let Some(post) = posts.by_id.get_mut(post_id) else {
            bail!("post {} does not exist", post_id);
        };

        if let Some(content) = update.content {
            post.content = content;
        }
        if let Some(images) = update.images {
            post.images = images;
        }
        post.updated_at = Utc::now();
        Ok(post.clone())
    }

    async fn get(&self, post_id: &str) -> Result<Option<Post>> {
        Ok(self.posts.read().by_id.get(post_id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.posts.read().by_id.len())
    }
}
