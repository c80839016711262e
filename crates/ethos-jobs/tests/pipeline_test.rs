//! End-to-end tests for the evidence-to-push pipeline.
//!
//! This test suite validates:
//! - Ingest, verify, score, publish and notify chained through the queue
//! - Flood control suppressing scoring for bursty brands
//! - Concurrent producers merging into one notification bucket
//! - Per-user push rate limits and best-effort delivery
//! - Dealbreakers notifying regardless of weights

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use ethos_db::MemoryStore;
use ethos_jobs::handlers::{
    IngestHandler, NotifyHandler, ScoreHandler, SnapshotHandler, VerifyHandler,
};
use ethos_jobs::{
    event_fingerprint, Category, CategoryVector, Clock, Coalescer, Error, EventCandidate,
    EventRepository, Follower, FollowerRepository, IngestEventPayload, JobEngine, JobPayload,
    JobRepository, JobStage, ManualClock, NewBrandEvent, NotifyPayload, PushMessage, PushSender,
    PushSubscription, Result, RunSummary, ScoreBrandPayload, ScoreDelta, ScoreRepository, ScoringEngine,
    UserWeights, Verification, WorkerBuilder,
};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 12, 2, 0).unwrap()
}

#[derive(Clone, Default)]
struct RecordingSender {
    sent: Arc<Mutex<Vec<PushMessage>>>,
}

impl RecordingSender {
    fn endpoints(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subscription.endpoint.clone())
            .collect()
    }
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

struct FailingSender;

#[async_trait]
impl PushSender for FailingSender {
    async fn send(&self, _message: &PushMessage) -> Result<()> {
        Err(Error::Push("gateway returned 502".into()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

fn full_engine(store: &MemoryStore, clock: &ManualClock, sender: Arc<dyn PushSender>) -> JobEngine {
    let stores = store.stores();
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    WorkerBuilder::new(Arc::clone(&stores.jobs))
        .with_clock(clock)
        .with_handler(IngestHandler::new(stores.clone()))
        .with_handler(VerifyHandler::new(stores.clone()))
        .with_handler(ScoreHandler::new(stores.clone(), ScoringEngine::default()))
        .with_handler(NotifyHandler::new(stores.clone(), sender))
        .with_handler(SnapshotHandler::new(stores))
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
    }
}

fn follower(brand_id: Uuid, endpoint: &str, weights: CategoryVector) -> Follower {
    let user_id = Uuid::new_v4();
    Follower {
        user_id,
        brand_id,
        subscription: PushSubscription {
            endpoint: endpoint.into(),
            p256dh: "k".into(),
            auth: "a".into(),
        },
        weights: UserWeights {
            user_id,
            weights,
            dealbreakers: HashMap::new(),
        },
        min_delta: 0.5,
        notifications_enabled: true,
    }
}

/// A corroborated labor story 45 days old that moves the score by -1.2.
fn wage_theft() -> EventCandidate {
    EventCandidate {
        title: "Warehouse wage theft settlement".into(),
        url: "https://www.news.example/2026/wage-theft?utm_source=feed".into(),
        occurred_at: t0() - Duration::days(45),
        category_hint: Category::Labor,
        severity_hint: 0.8,
        impact: Some(CategoryVector::single(Category::Labor, -4.0)),
        credibility: Some(1.0),
        verification: Some(Verification::Corroborated),
    }
}

async fn enqueue_ingest(store: &MemoryStore, brand_id: Uuid, candidate: EventCandidate) {
    let payload = JobPayload::IngestEvent(IngestEventPayload {
        brand_id,
        adapter: "test".into(),
        candidate,
    });
    store.enqueue(&payload, t0(), t0()).await.unwrap();
}

fn labor_drop(previous: f64, current: f64, at: DateTime<Utc>) -> ScoreDelta {
    ScoreDelta {
        category: Category::Labor,
        previous,
        current,
        delta: current - previous,
        observed_at: at,
    }
}

async fn enqueue_notify(store: &MemoryStore, brand_id: Uuid, events: Vec<ScoreDelta>) -> Uuid {
    let payload = JobPayload::SendPushForScoreChange(NotifyPayload {
        brand_id,
        bucket_start: Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
        events,
    });
    store.enqueue(&payload, t0(), t0()).await.unwrap()
}

// ============================================================================
// FULL PIPELINE
// ============================================================================

#[tokio::test]
async fn test_evidence_flows_through_to_a_push() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let brand_id = Uuid::new_v4();
    store.upsert_brand(brand_id, CategoryVector::default());
    store.upsert_follower(follower(
        brand_id,
        "https://push.example/labor-fan",
        CategoryVector::single(Category::Labor, 1.0),
    ));

    let sender = RecordingSender::default();
    let engine = full_engine(&store, &clock, Arc::new(sender.clone()));
    enqueue_ingest(&store, brand_id, wage_theft()).await;

    let summary = drain(&engine).await;
    assert_eq!(summary.retried, 0);
    assert_eq!(summary.dead_lettered, 0);
    // ingest, verify, score, publish
    assert_eq!(summary.succeeded, 4);

    let event_id = event_fingerprint(brand_id, Category::Labor, &wage_theft().title);
    let event = store.get_event(event_id).await.unwrap().expect("stored");
    assert_eq!(event.sources.len(), 1);
    assert_eq!(event.sources[0].domain, "news.example");

    let labor = store
        .current_scores(brand_id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.category == Category::Labor)
        .expect("labor score");
    assert!((labor.score + 1.2).abs() < 1e-9);

    let snapshot = store.get_snapshot(brand_id).await.unwrap().expect("published");
    assert!(!snapshot.baseline_only);
    assert_eq!(snapshot.scores.len(), 4);

    // Only the notification remains, waiting for its bucket to close.
    let queued = store.jobs();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].stage, JobStage::SendPushForScoreChange);
    assert!(sender.sent.lock().unwrap().is_empty());

    clock.set(Utc.with_ymd_and_hms(2026, 6, 1, 12, 5, 0).unwrap());
    assert_eq!(drain(&engine).await.succeeded, 1);

    let sent = sender.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].brand_id, brand_id);
    assert_eq!(sent[0].category, Category::Labor);
    assert!((sent[0].delta + 1.2).abs() < 1e-9);
    assert_eq!(store.push_log().len(), 1);
    assert!(store.jobs().is_empty());
    assert!(store.dead_letters().is_empty());
}

#[tokio::test]
async fn test_flooded_brand_is_flagged_and_not_scored() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let brand_id = Uuid::new_v4();
    store.upsert_brand(brand_id, CategoryVector::default());

    for i in 0..30 {
        let event = NewBrandEvent {
            event_id: Uuid::new_v4(),
            brand_id,
            category: Category::Social,
            title: format!("Viral post {i}"),
            occurred_at: t0() - Duration::hours(2),
            severity: 0.2,
            credibility: 0.3,
            verification: Verification::Unverified,
            impact: CategoryVector::single(Category::Social, -1.0),
        };
        store
            .upsert_event(&event, t0() - Duration::hours(1))
            .await
            .unwrap();
    }

    let engine = full_engine(&store, &clock, Arc::new(RecordingSender::default()));
    enqueue_ingest(&store, brand_id, wage_theft()).await;
    assert_eq!(engine.run_once().await.unwrap().succeeded, 1);

    let event_id = event_fingerprint(brand_id, Category::Labor, &wage_theft().title);
    let event = store.get_event(event_id).await.unwrap().expect("stored");
    assert!(event.flagged_for_review);
    assert!(event.review_reason.is_some());

    let stages: Vec<JobStage> = store.jobs().iter().map(|j| j.stage).collect();
    assert_eq!(stages, vec![JobStage::VerifyEvent]);
}

#[tokio::test]
async fn test_flood_leaves_an_already_scored_event_alone() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let brand_id = Uuid::new_v4();
    store.upsert_brand(brand_id, CategoryVector::default());

    let engine = full_engine(&store, &clock, Arc::new(RecordingSender::default()));
    enqueue_ingest(&store, brand_id, wage_theft()).await;
    drain(&engine).await;

    for i in 0..30 {
        let event = NewBrandEvent {
            event_id: Uuid::new_v4(),
            brand_id,
            category: Category::Social,
            title: format!("Viral post {i}"),
            occurred_at: t0() - Duration::hours(2),
            severity: 0.2,
            credibility: 0.3,
            verification: Verification::Unverified,
            impact: CategoryVector::single(Category::Social, -1.0),
        };
        store.upsert_event(&event, t0()).await.unwrap();
    }

    // Same story, new outlet, arriving mid-flood.
    let mut repeat = wage_theft();
    repeat.url = "https://wire.example/wage-theft-settlement".into();
    enqueue_ingest(&store, brand_id, repeat).await;
    drain(&engine).await;

    let event_id = event_fingerprint(brand_id, Category::Labor, &wage_theft().title);
    let event = store.get_event(event_id).await.unwrap().expect("stored");
    assert!(!event.flagged_for_review);
    assert!(event.review_reason.is_none());
    assert_eq!(event.sources.len(), 2);

    // A later rescore still counts it.
    let rescore = JobPayload::ScoreBrand(ScoreBrandPayload { brand_id });
    store.enqueue(&rescore, t0(), t0()).await.unwrap();
    drain(&engine).await;

    let labor = store
        .current_scores(brand_id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.category == Category::Labor)
        .expect("labor score");
    assert!((labor.score + 1.2).abs() < 1e-9);
}

// ============================================================================
// COALESCING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_producers_share_one_bucket() {
    let store = MemoryStore::new();
    let brand_id = Uuid::new_v4();
    let coalescer = Coalescer::new(Arc::new(store.clone()));

    let first = tokio::spawn({
        let coalescer = coalescer.clone();
        async move {
            coalescer
                .signal(brand_id, &[labor_drop(0.0, -1.0, t0())], t0())
                .await
        }
    });
    let second = tokio::spawn({
        let coalescer = coalescer.clone();
        let at = t0() + Duration::seconds(30);
        async move {
            coalescer
                .signal(brand_id, &[labor_drop(-1.0, -2.0, at)], at)
                .await
        }
    });
    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a, b);

    let jobs = store.jobs();
    assert_eq!(jobs.len(), 1);
    let payload = JobPayload::decode(jobs[0].stage, &jobs[0].payload).unwrap();
    let JobPayload::SendPushForScoreChange(notify) = payload else {
        panic!("expected a notification payload");
    };
    assert_eq!(notify.events.len(), 2);
}

// ============================================================================
// DELIVERY LIMITS
// ============================================================================

#[tokio::test]
async fn test_rate_limited_follower_is_skipped() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let brand_id = Uuid::new_v4();
    store.upsert_brand(brand_id, CategoryVector::default());

    let busy = follower(brand_id, "https://push.example/busy", CategoryVector::splat(1.0));
    let quiet = follower(brand_id, "https://push.example/quiet", CategoryVector::splat(1.0));
    for h in 1..=5 {
        store
            .record_push(busy.user_id, Uuid::new_v4(), t0() - Duration::hours(h))
            .await
            .unwrap();
    }
    store.upsert_follower(busy);
    store.upsert_follower(quiet);

    let sender = RecordingSender::default();
    let engine = full_engine(&store, &clock, Arc::new(sender.clone()));
    enqueue_notify(&store, brand_id, vec![labor_drop(0.0, -2.0, t0())]).await;

    assert_eq!(engine.run_once().await.unwrap().succeeded, 1);
    assert_eq!(sender.endpoints(), vec!["https://push.example/quiet".to_string()]);
}

#[tokio::test]
async fn test_failed_delivery_still_completes_the_job() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let brand_id = Uuid::new_v4();
    store.upsert_brand(brand_id, CategoryVector::default());
    store.upsert_follower(follower(
        brand_id,
        "https://push.example/gone",
        CategoryVector::splat(1.0),
    ));

    let engine = full_engine(&store, &clock, Arc::new(FailingSender));
    let id = enqueue_notify(&store, brand_id, vec![labor_drop(0.0, -2.0, t0())]).await;

    let summary = engine.run_once().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.retried, 0);
    assert!(store.get(id).await.unwrap().is_none());
    assert!(store.push_log().is_empty());
    assert!(store.dead_letters().is_empty());
}

#[tokio::test]
async fn test_dealbreaker_notifies_without_weight() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let brand_id = Uuid::new_v4();
    store.upsert_brand(brand_id, CategoryVector::default());

    let mut strict = follower(brand_id, "https://push.example/strict", CategoryVector::default());
    strict.min_delta = 10.0;
    strict.weights.dealbreakers.insert(Category::Labor, 3.0);
    store.upsert_follower(strict);
    store.upsert_follower(follower(
        brand_id,
        "https://push.example/indifferent",
        CategoryVector::default(),
    ));

    let sender = RecordingSender::default();
    let engine = full_engine(&store, &clock, Arc::new(sender.clone()));
    enqueue_notify(&store, brand_id, vec![labor_drop(-1.0, -3.2, t0())]).await;

    assert_eq!(engine.run_once().await.unwrap().succeeded, 1);
    assert_eq!(sender.endpoints(), vec!["https://push.example/strict".to_string()]);
}
