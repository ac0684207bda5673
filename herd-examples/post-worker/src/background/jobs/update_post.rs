use async_trait::async_trait;
use herd_queue::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{PostContext, POST_QUEUE};
use crate::store::{Post, PostUpdate};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePostJob {
    pub post_id: String,
    #[serde(rename = "updateData")]
    pub update: PostUpdate,
    pub user_id: String,
}

#[async_trait]
impl Job for UpdatePostJob {
    type Context = PostContext;
    type Output = Post;

    const QUEUE: &'static str = POST_QUEUE;
    const JOB_TYPE: &'static str = "update-post";

    async fn execute(&self, ctx: Self::Context, run: &JobRun) -> Result<Self::Output, JobError> {
        info!("Processing post update job {} for post {}", run.job_id, self.post_id);

        let owned = ctx
            .posts
            .find_owned(&self.post_id, &self.user_id)
            .await
            .map_err(|e| JobError::retryable(e.to_string()))?;
        if owned.is_none() {
            return Err(JobError::permanent("Post not found or unauthorized"));
        }

        let updated = ctx
            .posts
            .update_post(&self.post_id, self.update.clone())
            .await
            .map_err(|e| {
                error!("Failed to update post {}: {}", self.post_id, e);
                JobError::retryable(e.to_string())
            })?;

        info!("Successfully updated post {}", self.post_id);
        Ok(updated)
    }

    fn validate(&self) -> Result<(), String> {
        if self.post_id.is_empty() {
            return Err("post_id is required".to_string());
        }
        Ok(())
    }
}
