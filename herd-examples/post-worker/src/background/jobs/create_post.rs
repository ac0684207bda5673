use async_trait::async_trait;
use herd_queue::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{PostContext, POST_QUEUE};
use crate::store::{NewPost, Post};

/// Post body as submitted by the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatePost {
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostJob {
    pub post_data: CreatePost,
    pub user_id: String,
    /// Paths of uploaded files; these become the post's images
    #[serde(default)]
    pub file_urls: Vec<String>,
}

#[async_trait]
impl Job for CreatePostJob {
    type Context = PostContext;
    type Output = Post;

    const QUEUE: &'static str = POST_QUEUE;
    const JOB_TYPE: &'static str = "create-post";
    const PRIORITY: JobPriority = JobPriority::HIGHEST;

    async fn execute(&self, ctx: Self::Context, run: &JobRun) -> Result<Self::Output, JobError> {
        info!("Processing post creation job {} for user {}", run.job_id, self.user_id);

        let post = NewPost {
            content: self.post_data.content.clone(),
            images: self.file_urls.clone(),
            author_id: self.user_id.clone(),
        };

        let created = ctx
            .posts
            .create_post(run.job_id.as_str(), post)
            .await
            .map_err(|e| {
                error!("Failed to create post for user {}: {}", self.user_id, e);
                JobError::retryable(e.to_string())
            })?;

        info!("Successfully created post {}", created.id);
        Ok(created)
    }

    fn validate(&self) -> Result<(), String> {
        if self.post_data.content.trim().is_empty() {
            return Err("content must not be empty".to_string());
        }
        if self.user_id.is_empty() {
            return Err("user_id is required".to_string());
        }
        Ok(())
    }
}
