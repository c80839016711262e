//! Core traits for ethos abstractions.
//!
//! These traits define the interfaces that concrete stores and external
//! collaborators must satisfy. `ethos-db` provides PostgreSQL and in-memory
//! implementations of the repositories; `ethos-jobs` provides the push sender
//! and evidence adapters.
//!
//! Every time-dependent operation takes `now` explicitly. Nothing behind these
//! traits reads the wall clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;
use crate::payload::JobPayload;
use crate::schedule::RetryPolicy;
use crate::sources::CanonicalSource;

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Durable job queue with lease-based claiming.
///
/// `try_lease` is the only mutual-exclusion primitive: a single conditional
/// update that succeeds for at most one caller per row. Every operation after
/// a lease is conditional on `locked_by = worker_id`, so a worker whose stale
/// lease was reclaimed cannot overwrite the new holder's state.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Queue a new job.
    async fn enqueue(
        &self,
        payload: &JobPayload,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Uuid>;

    /// Append `events` to the notification job keyed by `coalesce_key`,
    /// creating it if absent. One atomic read-modify-write in the store;
    /// concurrent producers for the same key never lose each other's events.
    async fn enqueue_coalesced(
        &self,
        coalesce_key: &str,
        brand_id: Uuid,
        bucket_start: DateTime<Utc>,
        events: &[ScoreDelta],
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Uuid>;

    /// Unlock every job locked before `cutoff`. Returns the number released.
    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Unlocked jobs with `not_before <= now`, oldest first.
    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Claim a job if it is still unlocked and due. `None` means another
    /// worker won the row.
    async fn try_lease(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>)
        -> Result<Option<Job>>;

    /// Delete a successfully executed job. Returns `false` if the lease was lost.
    async fn complete(&self, id: Uuid, worker_id: &str) -> Result<bool>;

    /// Record a failed attempt: reschedule with backoff, or move to the
    /// dead-letter store once `policy` is exhausted.
    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome>;

    /// Move a job to the dead-letter store without further retries.
    async fn dead_letter_now(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Reschedule to `not_before` and release the lock without touching
    /// `attempts`.
    async fn defer(&self, id: Uuid, worker_id: &str, not_before: DateTime<Utc>) -> Result<bool>;

    /// Get job by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Most recent dead-letter entries first.
    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadJob>>;

    /// Get queue statistics.
    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats>;
}

// =============================================================================
// EVENT STORE
// =============================================================================

/// Persisted brand events and their source attribution.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Events for `brand_id` created at or after `since`.
    async fn count_recent(&self, brand_id: Uuid, since: DateTime<Utc>) -> Result<i64>;

    /// Insert an event keyed by its deterministic id. Returns `false` when it
    /// already existed; the stored row is left as is.
    async fn upsert_event(&self, event: &NewBrandEvent, now: DateTime<Utc>) -> Result<bool>;

    /// Attribute an event to a source. Returns `false` for a duplicate
    /// `(event_id, canonical_url)`.
    async fn add_source(
        &self,
        event_id: Uuid,
        source: &CanonicalSource,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn distinct_source_domains(&self, event_id: Uuid) -> Result<i64>;

    /// Raise the event's tier to `to` if that is higher. Returns the stored tier.
    async fn escalate_verification(&self, event_id: Uuid, to: Verification)
        -> Result<Verification>;

    async fn flag_for_review(&self, event_id: Uuid, reason: &str) -> Result<()>;

    /// All events for a brand with their sources.
    async fn events_for_brand(&self, brand_id: Uuid) -> Result<Vec<BrandEvent>>;

    async fn get_event(&self, event_id: Uuid) -> Result<Option<BrandEvent>>;
}

// =============================================================================
// SCORES AND SNAPSHOTS
// =============================================================================

/// Baselines, persisted category scores and published snapshots.
#[async_trait]
pub trait ScoreRepository: Send + Sync {
    /// Baseline vector for a brand. Zero when none is recorded.
    async fn baseline(&self, brand_id: Uuid) -> Result<CategoryVector>;

    async fn current_scores(&self, brand_id: Uuid) -> Result<Vec<CategoryScore>>;

    /// Replace the brand's category scores.
    async fn save_scores(&self, brand_id: Uuid, scores: &[CategoryScore]) -> Result<()>;

    /// Every brand known to the store.
    async fn list_brand_ids(&self) -> Result<Vec<Uuid>>;

    async fn evidence_summary(&self, brand_id: Uuid) -> Result<EvidenceSummary>;

    async fn save_snapshot(&self, snapshot: &BrandSnapshot) -> Result<()>;

    async fn get_snapshot(&self, brand_id: Uuid) -> Result<Option<BrandSnapshot>>;
}

// =============================================================================
// FOLLOWERS
// =============================================================================

/// Followers of brands and the per-user push log.
#[async_trait]
pub trait FollowerRepository: Send + Sync {
    async fn followers_for_brand(&self, brand_id: Uuid) -> Result<Vec<Follower>>;

    async fn user_weights(&self, user_id: Uuid) -> Result<Option<UserWeights>>;

    /// Pushes delivered to `user_id` at or after `since`.
    async fn pushes_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<i64>;

    async fn record_push(&self, user_id: Uuid, brand_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// Delivers a single push notification.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<()>;

    /// Human-readable name of this sender.
    fn name(&self) -> &str;
}

/// Source of normalized evidence for brands.
///
/// Adapters are black boxes to the engine: whatever they talk to, they return
/// [`EventCandidate`]s.
#[async_trait]
pub trait EvidenceAdapter: Send + Sync {
    /// Human-readable name of this adapter, recorded on ingested jobs.
    fn name(&self) -> &str;

    /// Candidates for `brand_id` that occurred at or after `since`.
    async fn fetch_since(&self, brand_id: Uuid, since: DateTime<Utc>)
        -> Result<Vec<EventCandidate>>;
}

/// The set of repositories handlers need, as trait objects.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobRepository>,
    pub events: Arc<dyn EventRepository>,
    pub scores: Arc<dyn ScoreRepository>,
    pub followers: Arc<dyn FollowerRepository>,
}
