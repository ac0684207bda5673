use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use herd_queue::{
    backend::JobStore, Backoff, EnqueueOptions, EnqueueRequest, HandlerRegistry, JobError,
    JobExecutor, JobId, JobPriority, JobRecord, JobState, ManualClock, MemoryStore, QueueAdapter,
    QueueConfig, QueueError, WorkerId, ExecutionOutcome,
};

const QUEUE: &str = "post-creation";
const JOB_TYPE: &str = "create-post";
const LOCK: Duration = Duration::from_secs(30);

fn request(n: usize) -> EnqueueRequest {
    EnqueueRequest::new(QUEUE, JOB_TYPE, json!({ "n": n }))
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        poll_interval: Duration::from_millis(10),
        sweep_interval: Duration::from_millis(10),
        stalled_interval: Duration::from_millis(20),
        lock_renew_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(1),
        ..QueueConfig::default()
    }
    .with_backoff(Backoff::Fixed { delay: 10 })
}

async fn wait_for_state<S: JobStore + ?Sized>(store: &S, job_id: &JobId, state: JobState) -> JobRecord {
    let mut record = store.get(job_id).await.unwrap();
    for _ in 0..300 {
        if record.state == state {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        record = store.get(job_id).await.unwrap();
    }
    record
}

async fn claim_order(store: &MemoryStore) -> Vec<u64> {
    let worker = WorkerId::from("w1");
    let mut order = Vec::new();
    while let Some(record) = store.claim_next(QUEUE, &worker, LOCK).await.unwrap() {
        order.push(record.payload()["n"].as_u64().unwrap());
    }
    order
}

/// Lower priority values first, then insertion order
#[tokio::test]
async fn test_claim_order_follows_priority_then_fifo() {
    let store = MemoryStore::new().with_clock(Arc::new(ManualClock::starting_now()));

    for (n, priority) in [(0, 10), (1, 1), (2, 10), (3, 100), (4, 1)] {
        let options = EnqueueOptions::new().with_priority(priority);
        store.enqueue(request(n).with_options(options)).await.unwrap();
    }

    assert_eq!(claim_order(&store).await, vec![1, 4, 0, 2, 3]);
}

proptest! {
    #[test]
    fn prop_claim_order_is_stable_priority_sort(priorities in prop::collection::vec(0i32..4, 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let order = runtime.block_on(async {
            let store = MemoryStore::new().with_clock(Arc::new(ManualClock::starting_now()));
            for (n, priority) in priorities.iter().enumerate() {
                let options = EnqueueOptions::new().with_priority(*priority);
                store.enqueue(request(n).with_options(options)).await.unwrap();
            }
            claim_order(&store).await
        });

        let mut expected: Vec<u64> = (0..priorities.len() as u64).collect();
        expected.sort_by_key(|n| priorities[*n as usize]);
        prop_assert_eq!(order, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_job() {
    let store = Arc::new(MemoryStore::new());
    for n in 0..50 {
        store.enqueue(request(n)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let worker = WorkerId::from(format!("w{}", w));
            let mut claimed = Vec::new();
            while let Some(record) = store.claim_next(QUEUE, &worker, LOCK).await.unwrap() {
                claimed.push(record.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();

    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
    assert_eq!(store.stats(QUEUE).await.unwrap().active, 50);
}

#[tokio::test]
async fn test_retry_delays_double_until_attempts_run_out() {
    let clock = ManualClock::starting_now();
    let store = Arc::new(MemoryStore::new().with_clock(Arc::new(clock.clone())));

    let mut registry = HandlerRegistry::new();
    registry
        .register_fn(QUEUE, JOB_TYPE, |_run| async move { Err::<Value, _>(JobError::retryable("upload timed out")) })
        .unwrap();
    let executor = JobExecutor::new(store.clone(), Arc::new(registry), LOCK);

    let options = EnqueueOptions::new().with_base_delay_ms(1000).with_max_attempts(4);
    let job_id = store.enqueue(request(0).with_options(options)).await.unwrap();
    let worker = WorkerId::from("w1");

    for (failures, delay_ms) in [(1u32, 1000i64), (2, 2000), (3, 4000)] {
        let claimed = store.claim_next(QUEUE, &worker, LOCK).await.unwrap().unwrap();
        let outcome = executor.execute(claimed, &worker).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Retrying { attempts: failures });

        let record = store.get(&job_id).await.unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert_eq!(record.next_run_at - store.now(), chrono::Duration::milliseconds(delay_ms));
        assert_eq!(record.error.as_deref(), Some("upload timed out"));

        // Not claimable before the backoff elapses
        assert!(store.claim_next(QUEUE, &worker, LOCK).await.unwrap().is_none());
        clock.advance_ms(delay_ms);
        assert_eq!(store.sweep_delayed().await.unwrap(), 1);
    }

    let claimed = store.claim_next(QUEUE, &worker, LOCK).await.unwrap().unwrap();
    let outcome = executor.execute(claimed, &worker).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Failed { attempts: 4 });

    let record = store.get(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 4);
    assert!(record.attempts <= record.max_attempts());
}

#[tokio::test]
async fn test_second_completion_is_rejected() {
    let store = MemoryStore::new();
    let worker = WorkerId::from("w1");
    let job_id = store.enqueue(request(0)).await.unwrap();
    store.claim_next(QUEUE, &worker, LOCK).await.unwrap().unwrap();

    store.mark_completed(&job_id, &worker, json!("first")).await.unwrap();
    let err = assert_err!(store.mark_completed(&job_id, &worker, json!("second")).await);

    assert!(err.is_invalid_transition());
    assert_eq!(store.get(&job_id).await.unwrap().result, Some(json!("first")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_claimers_one_job() {
    let store = Arc::new(MemoryStore::new());
    store.enqueue(request(0)).await.unwrap();

    let start = Arc::new(tokio::sync::Barrier::new(2));
    let mut claimers = Vec::new();
    for name in ["dispatcher-a", "dispatcher-b"] {
        let store = store.clone();
        let start = start.clone();
        claimers.push(tokio::spawn(async move {
            let worker = WorkerId::from(name);
            start.wait().await;
            store.claim_next(QUEUE, &worker, LOCK).await.unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for claimer in claimers {
        claimed.extend(claimer.await.unwrap());
    }

    assert_eq!(claimed.len(), 1);
    assert_eq!(store.stats(QUEUE).await.unwrap().active, 1);
}

#[tokio::test]
async fn test_unavailable_store_writes_nothing() {
    let store = MemoryStore::new();
    store.close();

    let err = assert_err!(store.enqueue(request(0)).await);
    assert!(matches!(err, QueueError::StoreUnavailable(_)));
    assert!(err.is_unavailable());

    store.reopen();
    let stats = assert_ok!(store.stats(QUEUE).await);
    assert_eq!(stats.total, 0);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn test_event_stream_reports_lifecycle() {
    let store = MemoryStore::new();
    let mut events = store.event_stream();
    let worker = WorkerId::from("w1");

    let job_id = store.enqueue(request(0)).await.unwrap();
    store.claim_next(QUEUE, &worker, LOCK).await.unwrap().unwrap();
    store.mark_completed(&job_id, &worker, json!({ "ok": true })).await.unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended");
        assert_eq!(event.job_id(), &job_id);
        names.push(event.event_name());
    }

    assert_eq!(names, vec!["enqueued", "claimed", "completed"]);
}

#[test_log::test(tokio::test)]
async fn test_flaky_handler_completes_after_retries() {
    let adapter = QueueAdapter::with_config(MemoryStore::new(), fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        adapter
            .register_fn(QUEUE, JOB_TYPE, move |run| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(JobError::retryable(format!("attempt {} failed", run.attempt)));
                    }
                    Ok(json!({ "attempt": run.attempt }))
                }
            })
            .unwrap();
    }

    let workers = adapter.start().unwrap();
    let job_id = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({ "content": "hello" }), EnqueueOptions::new())
        .await
        .unwrap();

    let record = wait_for_state(adapter.store().as_ref(), &job_id, JobState::Completed).await;
    workers.shutdown().await.unwrap();

    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.result, Some(json!({ "attempt": 3 })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test_log::test(tokio::test)]
async fn test_permanent_failure_fires_hook_once() {
    let adapter = QueueAdapter::with_config(MemoryStore::new(), fast_config());
    adapter
        .register_fn(QUEUE, JOB_TYPE, |_run| async move {
            Err::<Value, _>(JobError::permanent("Post not found or unauthorized"))
        })
        .unwrap();

    let failed: Arc<Mutex<Vec<JobRecord>>> = Arc::default();
    let sink = failed.clone();
    adapter.on_failed(move |record| sink.lock().push(record.clone()));

    let workers = adapter.start().unwrap();
    let job_id = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new().with_max_attempts(5))
        .await
        .unwrap();

    let record = wait_for_state(adapter.store().as_ref(), &job_id, JobState::Failed).await;
    workers.shutdown().await.unwrap();

    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 1);

    let failed = failed.lock();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, job_id);
    assert_eq!(failed[0].error.as_deref(), Some("Post not found or unauthorized"));

    let dead = adapter.failed_jobs(QUEUE, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_job_of_crashed_worker_is_reclaimed_and_finished() {
    let adapter = QueueAdapter::with_config(MemoryStore::new(), fast_config());
    adapter
        .register_fn(QUEUE, JOB_TYPE, |run| async move { Ok(json!({ "stalls": run.attempt })) })
        .unwrap();

    let job_id = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    // A worker claims the job and dies without a heartbeat
    let store = adapter.store().clone();
    store.claim_next(QUEUE, &WorkerId::from("crashed"), LOCK).await.unwrap().unwrap();
    store.force_lock_expiry(&job_id).unwrap();

    let workers = adapter.start().unwrap();
    let record = wait_for_state(store.as_ref(), &job_id, JobState::Completed).await;
    workers.shutdown().await.unwrap();

    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.stalled_count, 1);
    assert_eq!(record.attempts, 0);
}

#[tokio::test]
async fn test_stats_and_priority_through_adapter() {
    let adapter = QueueAdapter::new(MemoryStore::new());
    adapter
        .register_fn(QUEUE, JOB_TYPE, |run| async move { Ok(run.payload) })
        .unwrap();

    let urgent = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new().with_priority(JobPriority::HIGHEST))
        .await
        .unwrap();
    adapter.enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new()).await.unwrap();

    let stats = adapter.get_stats(QUEUE).await.unwrap();
    assert_eq!(stats.waiting, 2);
    assert_eq!(stats.total, 2);

    let claimed = adapter
        .store()
        .claim_next(QUEUE, &WorkerId::from("w1"), LOCK)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, urgent);

    let stats = adapter.get_stats("unknown-queue").await.unwrap();
    assert_eq!(stats.total, 0);
}

#[test_log::test(tokio::test)]
async fn test_hook_registered_after_start_fires() {
    let adapter = QueueAdapter::with_config(MemoryStore::new(), fast_config());
    adapter
        .register_fn(QUEUE, JOB_TYPE, |_run| async move {
            Err::<Value, _>(JobError::permanent("rejected"))
        })
        .unwrap();

    let workers = adapter.start().unwrap();

    let failed: Arc<Mutex<Vec<JobId>>> = Arc::default();
    let sink = failed.clone();
    adapter.on_failed(move |record| sink.lock().push(record.id.clone()));

    let job_id = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    let record = wait_for_state(adapter.store().as_ref(), &job_id, JobState::Failed).await;
    workers.shutdown().await.unwrap();

    assert_eq!(record.state, JobState::Failed);
    assert_eq!(*failed.lock(), vec![job_id]);
}

#[test_log::test(tokio::test)]
async fn test_promoted_retry_runs_without_waiting_for_poll() {
    let config = QueueConfig {
        poll_interval: Duration::from_secs(5),
        ..fast_config()
    };
    let adapter = QueueAdapter::with_config(MemoryStore::new(), config);
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        adapter
            .register_fn(QUEUE, JOB_TYPE, move |_run| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(JobError::retryable("first attempt fails"));
                    }
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }

    let workers = adapter.start().unwrap();
    let started = tokio::time::Instant::now();
    let job_id = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    let record = wait_for_state(adapter.store().as_ref(), &job_id, JobState::Completed).await;
    let elapsed = started.elapsed();
    workers.shutdown().await.unwrap();

    assert_eq!(record.state, JobState::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(elapsed < Duration::from_secs(2), "retry waited {:?}", elapsed);
}

#[test_log::test(tokio::test)]
async fn test_oversized_renew_interval_keeps_slow_job_locked() {
    let config = QueueConfig {
        lock_duration: Duration::from_millis(100),
        lock_renew_interval: Duration::from_secs(10),
        ..fast_config()
    };
    let adapter = QueueAdapter::with_config(MemoryStore::new(), config);
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        adapter
            .register_fn(QUEUE, JOB_TYPE, move |_run| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(400)).await;
                    Ok(Value::Null)
                }
            })
            .unwrap();
    }

    let workers = adapter.start().unwrap();
    let job_id = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    let record = wait_for_state(adapter.store().as_ref(), &job_id, JobState::Completed).await;
    workers.shutdown().await.unwrap();

    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.stalled_count, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_stalls_are_reclaimed_while_workers_drain() {
    let config = QueueConfig {
        stalled_interval: Duration::from_millis(50),
        ..fast_config()
    };
    let adapter = QueueAdapter::with_config(MemoryStore::new(), config);
    adapter
        .register_fn(QUEUE, JOB_TYPE, |_run| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(Value::Null)
        })
        .unwrap();

    let workers = adapter.start().unwrap();
    let store = adapter.store().clone();
    let slow = adapter
        .enqueue(QUEUE, JOB_TYPE, json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    wait_for_state(store.as_ref(), &slow, JobState::Active).await;

    // Claimed by a worker that dies just as shutdown begins
    let orphan = store.enqueue(request(1)).await.unwrap();
    store.claim_next(QUEUE, &WorkerId::from("crashed"), LOCK).await.unwrap().unwrap();
    store.force_lock_expiry(&orphan).unwrap();
    workers.shutdown().await.unwrap();

    assert_eq!(store.get(&slow).await.unwrap().state, JobState::Completed);
    let orphan = store.get(&orphan).await.unwrap();
    assert_eq!(orphan.state, JobState::Waiting);
    assert_eq!(orphan.stalled_count, 1);
}
