//! Integration tests for the job engine against the in-memory store.
//!
//! This test suite validates:
//! - Retry with backoff, then dead-lettering after the last attempt
//! - Exactly-once execution with several workers on one queue
//! - Reclaiming leases abandoned by a crashed worker
//! - Leasing queued jobs only when a concurrency slot frees up
//! - Quiet-hours deferral that does not consume an attempt
//! - Immediate dead-lettering of undecodable payloads

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use ethos_db::MemoryStore;
use ethos_jobs::handlers::NotifyHandler;
use ethos_jobs::{
    Category, Clock, Follower, Job, JobContext, JobEngine, JobHandler, JobPayload, JobRepository,
    JobResult, JobStage, ManualClock, NoOpHandler, NotifyPayload, PushMessage, PushSender,
    PushSubscription, Result, RunSummary, ScoreBrandPayload, ScoreDelta, UserWeights,
    WorkerBuilder, WorkerConfig,
};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
}

fn score_payload() -> JobPayload {
    JobPayload::ScoreBrand(ScoreBrandPayload {
        brand_id: Uuid::new_v4(),
    })
}

fn engine_with<H: JobHandler + 'static>(
    store: &MemoryStore,
    clock: &ManualClock,
    worker_id: &str,
    handler: H,
) -> JobEngine {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    WorkerBuilder::new(Arc::new(store.clone()))
        .with_config(WorkerConfig::default().with_worker_id(worker_id))
        .with_clock(clock)
        .with_handler(handler)
        .build()
}

/// Run invocations until one selects nothing.
async fn drain(engine: &JobEngine) -> RunSummary {
    let mut total = RunSummary::default();
    loop {
        let summary = engine.run_once().await.expect("run_once");
        if summary.selected == 0 {
            return total;
        }
        total.succeeded += summary.succeeded;
        total.retried += summary.retried;
        total.dead_lettered += summary.dead_lettered;
        total.deferred += summary.deferred;
        total.lost += summary.lost;
    }
}

/// Fails the first `failures` attempts of every job.
struct FlakyHandler {
    failures: i32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    fn stage(&self) -> JobStage {
        JobStage::ScoreBrand
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        if ctx.attempts() < self.failures {
            JobResult::Failed(format!("transient failure {}", ctx.attempts() + 1))
        } else {
            JobResult::Success
        }
    }
}

/// Counts executions per job id.
#[derive(Clone, Default)]
struct CountingHandler {
    runs: Arc<Mutex<HashMap<Uuid, usize>>>,
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn stage(&self) -> JobStage {
        JobStage::ScoreBrand
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        tokio::task::yield_now().await;
        *self.runs.lock().unwrap().entry(ctx.job_id()).or_default() += 1;
        JobResult::Success
    }
}

#[derive(Clone, Default)]
struct RecordingSender {
    sent: Arc<Mutex<Vec<PushMessage>>>,
}

#[async_trait]
impl PushSender for RecordingSender {
    async fn send(&self, message: &PushMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

// ============================================================================
// RETRIES
// ============================================================================

#[tokio::test]
async fn test_job_retries_with_backoff_then_dead_letters() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let id = store.enqueue(&score_payload(), t0(), t0()).await.unwrap();
    let engine = engine_with(&store, &clock, "w-1", FlakyHandler { failures: 3 });

    let first = engine.run_once().await.unwrap();
    assert_eq!(first.retried, 1);
    let job = store.get(id).await.unwrap().expect("still queued");
    assert_eq!(job.attempts, 1);
    assert_eq!(job.not_before, t0() + Duration::seconds(1));
    assert!(!job.is_locked());

    // Not due yet.
    assert_eq!(engine.run_once().await.unwrap().selected, 0);

    clock.advance(Duration::seconds(1));
    assert_eq!(engine.run_once().await.unwrap().retried, 1);
    let job = store.get(id).await.unwrap().expect("still queued");
    assert_eq!(job.attempts, 2);
    assert_eq!(job.not_before, t0() + Duration::seconds(6));

    clock.advance(Duration::seconds(5));
    assert_eq!(engine.run_once().await.unwrap().dead_lettered, 1);

    assert!(store.get(id).await.unwrap().is_none());
    let dead = store.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].last_error.as_deref(), Some("transient failure 3"));
}

#[tokio::test]
async fn test_job_succeeding_on_last_attempt_is_not_dead_lettered() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let id = store.enqueue(&score_payload(), t0(), t0()).await.unwrap();
    let engine = engine_with(&store, &clock, "w-1", FlakyHandler { failures: 2 });

    engine.run_once().await.unwrap();
    clock.advance(Duration::seconds(1));
    engine.run_once().await.unwrap();
    clock.advance(Duration::seconds(5));
    assert_eq!(engine.run_once().await.unwrap().succeeded, 1);

    assert!(store.get(id).await.unwrap().is_none());
    assert!(store.dead_letters().is_empty());
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_execute_each_job_once() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(store.enqueue(&score_payload(), t0(), t0()).await.unwrap());
    }

    let handler = CountingHandler::default();
    let a = Arc::new(engine_with(&store, &clock, "w-a", handler.clone()));
    let b = Arc::new(engine_with(&store, &clock, "w-b", handler.clone()));

    let run_a = tokio::spawn({
        let a = Arc::clone(&a);
        async move { drain(&a).await }
    });
    let run_b = tokio::spawn({
        let b = Arc::clone(&b);
        async move { drain(&b).await }
    });
    let (sa, sb) = (run_a.await.unwrap(), run_b.await.unwrap());

    assert_eq!(sa.succeeded + sb.succeeded, 20);
    assert!(store.jobs().is_empty());

    let runs = handler.runs.lock().unwrap();
    assert_eq!(runs.len(), 20);
    for id in &ids {
        assert_eq!(runs.get(id), Some(&1), "job {id} ran more than once");
    }
}

#[tokio::test]
async fn test_stale_lease_is_reclaimed() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let id = store.enqueue(&score_payload(), t0(), t0()).await.unwrap();

    let leased = store.try_lease(id, "crashed-worker", t0()).await.unwrap();
    assert!(leased.is_some());

    let engine = engine_with(&store, &clock, "w-live", NoOpHandler::new(JobStage::ScoreBrand));

    clock.advance(Duration::seconds(60));
    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.released, 0);
    assert_eq!(summary.selected, 0);

    clock.set(t0() + Duration::seconds(121));
    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.released, 1);
    assert_eq!(summary.succeeded, 1);

    // The crashed worker's late acknowledgement changes nothing.
    assert!(!store.complete(id, "crashed-worker").await.unwrap());
    assert!(store.dead_letters().is_empty());
}

/// Records which worker ran each job.
#[derive(Clone, Default)]
struct RunLog {
    runs: Arc<Mutex<HashMap<Uuid, Vec<&'static str>>>>,
}

impl RunLog {
    fn record(&self, job_id: Uuid, worker: &'static str) {
        self.runs.lock().unwrap().entry(job_id).or_default().push(worker);
    }

    fn runs_of(&self, job_id: Uuid) -> Vec<&'static str> {
        self.runs.lock().unwrap().get(&job_id).cloned().unwrap_or_default()
    }
}

struct LoggingHandler {
    worker: &'static str,
    log: RunLog,
}

#[async_trait]
impl JobHandler for LoggingHandler {
    fn stage(&self) -> JobStage {
        JobStage::ScoreBrand
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.log.record(ctx.job_id(), self.worker);
        JobResult::Success
    }
}

/// Overruns the stale lock age on its first job and lets a second worker
/// run a full invocation before returning.
struct OverrunningHandler {
    log: RunLog,
    clock: ManualClock,
    rival: Arc<JobEngine>,
    overran: AtomicBool,
}

#[async_trait]
impl JobHandler for OverrunningHandler {
    fn stage(&self) -> JobStage {
        JobStage::ScoreBrand
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.log.record(ctx.job_id(), "w-a");
        if !self.overran.swap(true, Ordering::SeqCst) {
            self.clock.advance(Duration::seconds(125));
            self.rival.run_once().await.expect("rival run_once");
        }
        JobResult::Success
    }
}

#[tokio::test]
async fn test_queued_job_is_not_leased_until_a_slot_frees() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let first = store.enqueue(&score_payload(), t0(), t0()).await.unwrap();
    let second = store.enqueue(&score_payload(), t0(), t0()).await.unwrap();

    let log = RunLog::default();
    let rival = Arc::new(engine_with(
        &store,
        &clock,
        "w-b",
        LoggingHandler {
            worker: "w-b",
            log: log.clone(),
        },
    ));

    let clock_dyn: Arc<dyn Clock> = Arc::new(clock.clone());
    let engine = WorkerBuilder::new(Arc::new(store.clone()))
        .with_config(
            WorkerConfig::default()
                .with_worker_id("w-a")
                .with_max_concurrent(1),
        )
        .with_clock(clock_dyn)
        .with_handler(OverrunningHandler {
            log: log.clone(),
            clock: clock.clone(),
            rival,
            overran: AtomicBool::new(false),
        })
        .build();

    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.selected, 2);
    // Only the first job was leased; the second was gone by the time a slot
    // opened, and the overrun job's completion was refused.
    assert_eq!(summary.leased, 1);
    assert_eq!(summary.lost, 2);
    assert_eq!(summary.succeeded, 0);

    // The overrun job was reclaimed once its lease went stale.
    assert_eq!(log.runs_of(first), vec!["w-a", "w-b"]);
    // The queued job ran exactly once.
    assert_eq!(log.runs_of(second), vec!["w-b"]);

    assert!(store.jobs().is_empty());
    assert!(store.dead_letters().is_empty());
}

// ============================================================================
// DEFERRAL AND PERMANENT FAILURES
// ============================================================================

#[tokio::test]
async fn test_quiet_hours_defer_without_consuming_attempts() {
    let store = MemoryStore::new();
    let night = Utc.with_ymd_and_hms(2026, 6, 1, 23, 0, 0).unwrap();
    let clock = ManualClock::new(night + Duration::minutes(6));

    let brand_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    store.upsert_brand(brand_id, Default::default());
    store.upsert_follower(Follower {
        user_id,
        brand_id,
        subscription: PushSubscription {
            endpoint: "https://push.example/u1".into(),
            p256dh: "k".into(),
            auth: "a".into(),
        },
        weights: UserWeights::uniform(user_id),
        min_delta: 0.5,
        notifications_enabled: true,
    });

    let payload = JobPayload::SendPushForScoreChange(NotifyPayload {
        brand_id,
        bucket_start: night - Duration::minutes(5),
        events: vec![ScoreDelta {
            category: Category::Labor,
            previous: 0.0,
            current: -2.0,
            delta: -2.0,
            observed_at: night - Duration::minutes(2),
        }],
    });
    let id = store.enqueue(&payload, night, night).await.unwrap();

    let sender = RecordingSender::default();
    let clock_dyn: Arc<dyn Clock> = Arc::new(clock.clone());
    let engine = WorkerBuilder::new(Arc::new(store.clone()))
        .with_clock(clock_dyn)
        .with_handler(NotifyHandler::new(store.stores(), Arc::new(sender.clone())))
        .build();

    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.deferred, 1);

    let job = store.get(id).await.unwrap().expect("still queued");
    assert_eq!(job.attempts, 0);
    assert!(!job.is_locked());
    assert_eq!(
        job.not_before,
        Utc.with_ymd_and_hms(2026, 6, 2, 7, 0, 0).unwrap()
    );
    assert!(sender.sent.lock().unwrap().is_empty());

    clock.set(Utc.with_ymd_and_hms(2026, 6, 2, 7, 0, 0).unwrap());
    assert_eq!(engine.run_once().await.unwrap().succeeded, 1);
    assert!(store.get(id).await.unwrap().is_none());

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].category, Category::Labor);
    assert_eq!(store.push_log().len(), 1);
}

#[tokio::test]
async fn test_undecodable_payload_is_dead_lettered_immediately() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let id = Uuid::new_v4();
    store.insert_job(Job {
        id,
        stage: JobStage::ScoreBrand,
        payload: json!({ "brand": "not-a-uuid" }),
        not_before: t0(),
        locked_by: None,
        locked_at: None,
        attempts: 0,
        last_error: None,
        coalesce_key: None,
        created_at: t0(),
    });

    let engine = engine_with(&store, &clock, "w-1", NoOpHandler::new(JobStage::ScoreBrand));
    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.retried, 0);

    let dead = store.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0].last_error.is_some());
    assert!(store.jobs().is_empty());
}
