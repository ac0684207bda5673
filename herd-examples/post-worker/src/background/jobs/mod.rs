pub mod create_post;
pub mod update_post;

pub use create_post::{CreatePost, CreatePostJob};
pub use update_post::UpdatePostJob;

use std::sync::Arc;

use crate::store::PostStore;

/// Queue that carries every post job
pub const POST_QUEUE: &str = "post-creation";

/// Dependencies shared by the post jobs
#[derive(Clone)]
pub struct PostContext {
    pub posts: Arc<dyn PostStore>,
}

impl PostContext {
    pub fn new(posts: Arc<dyn PostStore>) -> Self {
        Self { posts }
    }
}
