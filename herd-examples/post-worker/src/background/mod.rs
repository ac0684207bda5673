/// Background processing for posts: producers enqueue and return at once,
/// workers write to the post store.
pub mod jobs;

use anyhow::{anyhow, Result};
use herd_queue::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::store::{PostStore, PostUpdate};

pub use jobs::*;

pub struct BackgroundSystem {
    adapter: Arc<QueueAdapter<MemoryStore>>,
    posts: Arc<dyn PostStore>,
    worker_handle: Option<WorkerHandle>,
}

impl BackgroundSystem {
    /// Register the post jobs on a fresh queue
    pub fn new(posts: Arc<dyn PostStore>, config: QueueConfig) -> Result<Self> {
        let adapter = Arc::new(QueueAdapter::with_config(MemoryStore::new(), config));
        let context = PostContext::new(posts.clone());

        adapter.register_job::<CreatePostJob>(context.clone())?;
        adapter.register_job::<UpdatePostJob>(context)?;
        adapter.on_failed(|record: &JobRecord| {
            error!(
                "Job {} ({}) moved to failed after {} attempt(s): {}",
                record.id,
                record.job_type(),
                record.attempts,
                record.error.as_deref().unwrap_or("unknown error")
            );
        });

        Ok(Self {
            adapter,
            posts,
            worker_handle: None,
        })
    }

    /// Start background processing workers
    pub fn start(&mut self) -> Result<()> {
        if self.worker_handle.is_some() {
            return Err(anyhow!("background workers already running"));
        }
        self.worker_handle = Some(self.adapter.start()?);
        info!("Background processing started for queue {}", POST_QUEUE);
        Ok(())
    }

    /// Queue a new post and answer before it is written
    pub async fn create_post(&self, post_data: CreatePost, user_id: &str, file_urls: Vec<String>) -> Result<Value> {
        let job = CreatePostJob {
            post_data,
            user_id: user_id.to_string(),
            file_urls,
        };
        let job_id = self
            .adapter
            .enqueue_job(&job, Some(EnqueueOptions::new().remove_on_complete()))
            .await?;

        Ok(json!({
            "message": "Post creation queued successfully",
            "jobId": job_id,
            "status": "processing",
        }))
    }

    pub async fn update_post(&self, post_id: &str, update: PostUpdate, user_id: &str) -> Result<JobId> {
        let job = UpdatePostJob {
            post_id: post_id.to_string(),
            update,
            user_id: user_id.to_string(),
        };
        Ok(self.adapter.enqueue_job(&job, None).await?)
    }

    /// Per-state counts for the post queue
    pub async fn queue_stats(&self) -> Result<Value> {
        let stats = self.adapter.get_stats(POST_QUEUE).await?;
        Ok(stats.to_json(POST_QUEUE))
    }

    /// Up while the job store answers, down with the error otherwise
    pub async fn queue_health(&self) -> Value {
        let status = match self.adapter.get_stats(POST_QUEUE).await {
            Ok(stats) => json!({
                "status": "up",
                "active": stats.active,
                "waiting": stats.waiting,
            }),
            Err(e) => json!({
                "status": "down",
                "message": e.to_string(),
            }),
        };

        let mut health = Map::new();
        health.insert(format!("queue:{}", POST_QUEUE), status);
        Value::Object(health)
    }

    pub fn adapter(&self) -> &Arc<QueueAdapter<MemoryStore>> {
        &self.adapter
    }

    pub fn posts(&self) -> &Arc<dyn PostStore> {
        &self.posts
    }

    /// Stop claiming and wait for in-flight posts
    pub async fn shutdown(self) -> Result<()> {
        if let Some(handle) = self.worker_handle {
            handle.shutdown().await?;
        }
        let totals = self.adapter.observability().metrics().snapshot().global;
        info!(
            "Background processing system shutdown complete ({} completed, {} failed, {:.1}% success)",
            totals.jobs_completed,
            totals.jobs_failed,
            totals.success_rate()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPostStore;
    use std::time::Duration;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        }
        .with_backoff(Backoff::Fixed { delay: 10 })
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_create_post_answers_before_processing() {
        let posts = Arc::new(MemoryPostStore::new());
        let system = BackgroundSystem::new(posts.clone(), fast_config()).unwrap();

        let post = CreatePost { content: "hello".into(), images: vec![] };
        let response = system.create_post(post, "user-1", vec![]).await.unwrap();

        assert_eq!(response["message"], "Post creation queued successfully");
        assert_eq!(response["status"], "processing");
        assert!(response["jobId"].is_string());
        assert_eq!(posts.count().await.unwrap(), 0);
        assert_eq!(system.queue_stats().await.unwrap()["waiting"], 1);
    }

    #[tokio::test]
    async fn test_post_is_written_despite_transient_outage() {
        let posts = Arc::new(MemoryPostStore::new());
        posts.fail_next_writes(2);
        let mut system = BackgroundSystem::new(posts.clone(), fast_config()).unwrap();
        system.start().unwrap();

        let post = CreatePost { content: "hello".into(), images: vec![] };
        system
            .create_post(post, "user-1", vec!["uploads/cat.png".into()])
            .await
            .unwrap();

        let mut written = false;
        for _ in 0..300 {
            if posts.count().await.unwrap() == 1 {
                written = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let adapter = system.adapter().clone();
        let drained = eventually(|| adapter.observability().metrics().jobs_completed() == 1).await;
        system.shutdown().await.unwrap();

        assert!(written);
        assert!(drained);
        let stats = adapter.get_stats(POST_QUEUE).await.unwrap();
        assert_eq!(stats.total, 0);
        // Removed on completion
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_update_of_foreign_post_fails_without_retry() {
        let posts = Arc::new(MemoryPostStore::new());
        let mut system = BackgroundSystem::new(posts.clone(), fast_config()).unwrap();
        system.start().unwrap();

        let update = PostUpdate { content: Some("hijacked".into()), images: None };
        let job_id = system.update_post("missing-post", update, "user-2").await.unwrap();

        let adapter = system.adapter().clone();
        let mut record = adapter.get_job(&job_id).await.unwrap();
        for _ in 0..300 {
            if record.state == JobState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = adapter.get_job(&job_id).await.unwrap();
        }
        system.shutdown().await.unwrap();

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.error.as_deref(), Some("Post not found or unauthorized"));
    }

    #[tokio::test]
    async fn test_empty_post_is_rejected_at_enqueue() {
        let system = BackgroundSystem::new(Arc::new(MemoryPostStore::new()), fast_config()).unwrap();

        let result = system.create_post(CreatePost::default(), "user-1", vec![]).await;

        assert!(result.is_err());
        assert_eq!(system.queue_stats().await.unwrap()["total"], 0);
    }

    #[tokio::test]
    async fn test_queue_health_reports_store_state() {
        let system = BackgroundSystem::new(Arc::new(MemoryPostStore::new()), fast_config()).unwrap();

        let health = system.queue_health().await;
        assert_eq!(health["queue:post-creation"]["status"], "up");

        system.adapter().store().close();
        let health = system.queue_health().await;
        assert_eq!(health["queue:post-creation"]["status"], "down");
        assert!(health["queue:post-creation"]["message"].as_str().unwrap().contains("unavailable"));
    }
}
