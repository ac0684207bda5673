//! SQLite job store. Every transition is a single conditional `UPDATE`, so
//! two workers racing for the same row can never both win it.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{query, query_as, query_scalar, FromRow};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    QueueResult, QueueError, JobId, JobRecord, JobState, JobEvent, QueueStats,
    backend::{chrono_duration, BoxStream, JobStore},
    types::{Clock, EnqueueRequest, JobDefaults, JobMessage, Retention, SystemClock, WorkerId},
};

const STALLED_ERROR: &str = "job stalled more than allowable limit";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS herd_jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        queue TEXT NOT NULL,
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        backoff TEXT NOT NULL,
        retention TEXT NOT NULL,
        state TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_run_at INTEGER NOT NULL,
        result TEXT,
        error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        worker_id TEXT,
        locked_until INTEGER,
        stalled_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS herd_jobs_dispatch
        ON herd_jobs (queue, state, priority, created_at, seq);
    CREATE INDEX IF NOT EXISTS herd_jobs_delayed
        ON herd_jobs (state, next_run_at);
"#;

/// Raw row; timestamps are unix milliseconds
#[derive(FromRow, Debug)]
struct JobRow {
    seq: i64,
    id: String,
    queue: String,
    job_type: String,
    payload: String,
    priority: i64,
    max_attempts: i64,
    backoff: String,
    retention: String,
    state: String,
    attempts: i64,
    next_run_at: i64,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
    worker_id: Option<String>,
    locked_until: Option<i64>,
    stalled_count: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRow) -> QueueResult<Self> {
        let message = JobMessage {
            queue: row.queue,
            job_type: row.job_type,
            payload: serde_json::from_str(&row.payload)?,
            priority: (row.priority as i32).into(),
            max_attempts: row.max_attempts as u32,
            backoff: serde_json::from_str(&row.backoff)?,
            retention: serde_json::from_str(&row.retention)?,
        };

        Ok(Self {
            id: JobId::from(row.id),
            message,
            state: JobState::from_str(&row.state).map_err(QueueError::Internal)?,
            attempts: row.attempts as u32,
            next_run_at: from_millis(row.next_run_at)?,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            error: row.error,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            worker_id: row.worker_id.map(WorkerId::from),
            locked_until: row.locked_until.map(from_millis).transpose()?,
            stalled_count: row.stalled_count as u32,
            seq: row.seq as u64,
        })
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> QueueResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Internal(format!("timestamp out of range: {}", ms)))
}

fn into_records(rows: Vec<JobRow>) -> QueueResult<Vec<JobRecord>> {
    rows.into_iter().map(JobRecord::try_from).collect()
}

/// Durable job store on a SQLite database
pub struct SqliteStore {
    pool: SqlitePool,
    defaults: JobDefaults,
    clock: Arc<dyn Clock>,
    event_broadcaster: broadcast::Sender<JobEvent>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and run migrations.
    /// In-memory URLs are pinned to a single connection so every caller sees
    /// the same database.
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!("Connected SQLite job store at {}", url);
        Ok(store)
    }

    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);
        Self {
            pool,
            defaults: JobDefaults::default(),
            clock: Arc::new(SystemClock),
            event_broadcaster,
        }
    }

    pub fn with_defaults(mut self, defaults: JobDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create the jobs table and its indexes
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool; later operations fail with `StoreUnavailable`
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    /// Work out why a guarded UPDATE touched no row
    async fn rejected(&self, job_id: &JobId, to: JobState) -> QueueError {
        match self.get(job_id).await {
            Err(err) => err,
            Ok(record) if record.state != JobState::Active => QueueError::InvalidTransition {
                job_id: job_id.clone(),
                from: record.state,
                to,
            },
            Ok(_) => QueueError::LockMismatch(job_id.clone()),
        }
    }

    async fn delete_completed(&self, job_id: &JobId) -> QueueResult<bool> {
        let done = query("DELETE FROM herd_jobs WHERE id = ? AND state = 'completed'")
            .bind(job_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<JobId> {
        let now = self.clock.now();
        let message = JobMessage::resolve(request, &self.defaults)?;
        let job_id = JobId::new();

        query(
            r#"
            INSERT INTO herd_jobs
                (id, queue, job_type, payload, priority, max_attempts, backoff, retention,
                 state, attempts, next_run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'waiting', 0, ?, ?, ?)
            "#,
        )
        .bind(job_id.as_str())
        .bind(&message.queue)
        .bind(&message.job_type)
        .bind(serde_json::to_string(&message.payload)?)
        .bind(message.priority.value())
        .bind(message.max_attempts as i64)
        .bind(serde_json::to_string(&message.backoff)?)
        .bind(serde_json::to_string(&message.retention)?)
        .bind(millis(now))
        .bind(millis(now))
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(|err| match QueueError::from(err) {
            QueueError::Internal(reason) => QueueError::EnqueueFailure(reason),
            other => other,
        })?;

        debug!("Enqueued job {} ({}/{})", job_id, message.queue, message.job_type);
        self.emit(JobEvent::Enqueued {
            job_id: job_id.clone(),
            queue: message.queue,
            job_type: message.job_type,
            at: now,
        });
        Ok(job_id)
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lock_duration: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let now = self.clock.now();
        let locked_until = now + chrono_duration(lock_duration);

        let row: Option<JobRow> = query_as(
            r#"
            UPDATE herd_jobs
               SET state = 'active', worker_id = ?, locked_until = ?, updated_at = ?
             WHERE seq = (
                    SELECT seq FROM herd_jobs
                     WHERE queue = ? AND state = 'waiting' AND next_run_at <= ?
                     ORDER BY priority ASC, created_at ASC, seq ASC
                     LIMIT 1
                   )
               AND state = 'waiting'
            RETURNING *
            "#,
        )
        .bind(worker_id.as_str())
        .bind(millis(locked_until))
        .bind(millis(now))
        .bind(queue)
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = JobRecord::try_from(row)?;

        self.emit(JobEvent::Claimed {
            job_id: record.id.clone(),
            queue: queue.to_string(),
            worker_id: worker_id.clone(),
            locked_until,
            at: now,
        });
        Ok(Some(record))
    }

    async fn extend_lock(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        lock_duration: Duration,
    ) -> QueueResult<()> {
        let now = self.clock.now();
        let done = query(
            r#"
            UPDATE herd_jobs SET locked_until = ?, updated_at = ?
             WHERE id = ? AND state = 'active' AND worker_id = ?
            "#,
        )
        .bind(millis(now + chrono_duration(lock_duration)))
        .bind(millis(now))
        .bind(job_id.as_str())
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobState::Active).await);
        }
        Ok(())
    }

    async fn mark_completed(&self, job_id: &JobId, worker_id: &WorkerId, result: Value) -> QueueResult<()> {
        let now = self.clock.now();
        let row: Option<JobRow> = query_as(
            r#"
            UPDATE herd_jobs
               SET state = 'completed', result = ?, worker_id = NULL, locked_until = NULL, updated_at = ?
             WHERE id = ? AND state = 'active' AND worker_id = ?
            RETURNING *
            "#,
        )
        .bind(serde_json::to_string(&result)?)
        .bind(millis(now))
        .bind(job_id.as_str())
        .bind(worker_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(self.rejected(job_id, JobState::Completed).await);
        };
        let record = JobRecord::try_from(row)?;
        let queue = record.queue().to_string();
        self.emit(JobEvent::Completed { job_id: job_id.clone(), queue: queue.clone(), at: now });

        match record.message.retention {
            Retention::Keep => {}
            Retention::Remove => {
                if self.delete_completed(job_id).await? {
                    self.emit(JobEvent::Pruned { job_id: job_id.clone(), queue, at: now });
                }
            }
            Retention::KeepLast(keep) => {
                self.prune_completed(&queue, keep).await?;
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<JobRecord> {
        let now = self.clock.now();
        let retry_at = retry_at.map(millis);

        let row: Option<JobRow> = query_as(
            r#"
            UPDATE herd_jobs
               SET state = CASE WHEN ?1 IS NOT NULL AND attempts + 1 < max_attempts
                                THEN 'delayed' ELSE 'failed' END,
                   next_run_at = CASE WHEN ?1 IS NOT NULL AND attempts + 1 < max_attempts
                                      THEN ?1 ELSE next_run_at END,
                   attempts = MIN(attempts + 1, max_attempts),
                   error = ?2,
                   worker_id = NULL,
                   locked_until = NULL,
                   updated_at = ?3
             WHERE id = ?4 AND state = 'active' AND worker_id = ?5
            RETURNING *
            "#,
        )
        .bind(retry_at)
        .bind(&error)
        .bind(millis(now))
        .bind(job_id.as_str())
        .bind(worker_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(self.rejected(job_id, JobState::Failed).await);
        };
        let record = JobRecord::try_from(row)?;

        let queue = record.queue().to_string();
        match record.state {
            JobState::Delayed => self.emit(JobEvent::Delayed {
                job_id: job_id.clone(),
                queue,
                attempts: record.attempts,
                retry_at: record.next_run_at,
                error,
                at: now,
            }),
            _ => self.emit(JobEvent::Failed { job_id: job_id.clone(), queue, error, at: now }),
        }
        Ok(record)
    }

    async fn sweep_delayed(&self) -> QueueResult<usize> {
        let now = self.clock.now();
        let promoted: Vec<(String, String)> = query_as(
            r#"
            UPDATE herd_jobs SET state = 'waiting', updated_at = ?
             WHERE state = 'delayed' AND next_run_at <= ?
            RETURNING id, queue
            "#,
        )
        .bind(millis(now))
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;

        let count = promoted.len();
        for (job_id, queue) in promoted {
            self.emit(JobEvent::Promoted { job_id: JobId::from(job_id), queue, at: now });
        }
        if count > 0 {
            debug!("Promoted {} delayed jobs", count);
        }
        Ok(count)
    }

    async fn reclaim_stalled(&self, max_stalled_count: u32) -> QueueResult<Vec<JobRecord>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let failed: Vec<JobRow> = query_as(
            r#"
            UPDATE herd_jobs
               SET state = 'failed', stalled_count = stalled_count + 1, error = ?,
                   worker_id = NULL, locked_until = NULL, updated_at = ?
             WHERE state = 'active' AND locked_until < ? AND stalled_count + 1 > ?
            RETURNING *
            "#,
        )
        .bind(STALLED_ERROR)
        .bind(millis(now))
        .bind(millis(now))
        .bind(max_stalled_count as i64)
        .fetch_all(&mut *tx)
        .await?;

        let requeued: Vec<JobRow> = query_as(
            r#"
            UPDATE herd_jobs
               SET state = 'waiting', stalled_count = stalled_count + 1, next_run_at = ?,
                   worker_id = NULL, locked_until = NULL, updated_at = ?
             WHERE state = 'active' AND locked_until < ?
            RETURNING *
            "#,
        )
        .bind(millis(now))
        .bind(millis(now))
        .bind(millis(now))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut reclaimed = into_records(requeued)?;
        reclaimed.extend(into_records(failed)?);

        for record in &reclaimed {
            let queue = record.queue().to_string();
            self.emit(JobEvent::Stalled {
                job_id: record.id.clone(),
                queue: queue.clone(),
                stalled_count: record.stalled_count,
                at: now,
            });
            if record.state == JobState::Failed {
                self.emit(JobEvent::Failed {
                    job_id: record.id.clone(),
                    queue,
                    error: STALLED_ERROR.to_string(),
                    at: now,
                });
            }
        }
        Ok(reclaimed)
    }

    async fn prune_completed(&self, queue: &str, keep: usize) -> QueueResult<usize> {
        let now = self.clock.now();
        let pruned: Vec<String> = query_scalar(
            r#"
            DELETE FROM herd_jobs
             WHERE seq IN (
                    SELECT seq FROM herd_jobs
                     WHERE queue = ? AND state = 'completed'
                     ORDER BY updated_at DESC, seq DESC
                     LIMIT -1 OFFSET ?
                   )
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(keep as i64)
        .fetch_all(&self.pool)
        .await?;

        let count = pruned.len();
        for job_id in pruned {
            self.emit(JobEvent::Pruned { job_id: JobId::from(job_id), queue: queue.to_string(), at: now });
        }
        Ok(count)
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<JobRecord> {
        let row: Option<JobRow> = query_as("SELECT * FROM herd_jobs WHERE id = ?")
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| QueueError::JobNotFound(job_id.clone()))
            .and_then(JobRecord::try_from)
    }

    async fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        let counts: Vec<(String, i64)> = query_as(
            "SELECT state, COUNT(*) FROM herd_jobs WHERE queue = ? GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (state, count) in counts {
            let state = JobState::from_str(&state).map_err(QueueError::Internal)?;
            stats.add(state, count as usize);
        }
        Ok(stats)
    }

    async fn list(&self, queue: &str, state: JobState, limit: usize) -> QueueResult<Vec<JobRecord>> {
        let rows: Vec<JobRow> = query_as(
            r#"
            SELECT * FROM herd_jobs
             WHERE queue = ? AND state = ?
             ORDER BY created_at ASC, seq ASC
             LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(state.name())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_records(rows)
    }

    async fn queues(&self) -> QueueResult<Vec<String>> {
        let queues: Vec<String> = query_scalar("SELECT DISTINCT queue FROM herd_jobs ORDER BY queue")
            .fetch_all(&self.pool)
            .await?;
        Ok(queues)
    }

    fn event_stream(&self) -> BoxStream<JobEvent> {
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(self.event_broadcaster.subscribe())
            .filter_map(|result| result.ok());
        Box::pin(stream)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
