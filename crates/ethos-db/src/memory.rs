//! In-memory store implementing every repository trait.
//!
//! Used by the job crate's tests and for local runs without PostgreSQL. All
//! state sits behind one mutex that is never held across an `.await`, so each
//! trait method is atomic in the same way a single SQL statement is: a lease
//! is a compare-and-set on `locked_by`, and a coalescing append is one
//! read-modify-write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use ethos_core::{
    BrandEvent, BrandSnapshot, CanonicalSource, CategoryScore, CategoryVector, DeadJob, Error,
    EventRepository, EventSource, EvidenceSummary, FailOutcome, Follower, FollowerRepository,
    Job, JobPayload, JobRepository, NewBrandEvent, NotifyPayload, QueueStats, Result,
    RetryPolicy, ScoreDelta, ScoreRepository, Stores, UserWeights, Verification,
};

#[derive(Default)]
struct State {
    /// Queue in insertion order.
    jobs: Vec<Job>,
    dead: Vec<DeadJob>,
    brands: Vec<Uuid>,
    baselines: HashMap<Uuid, CategoryVector>,
    evidence: HashMap<Uuid, EvidenceSummary>,
    events: Vec<BrandEvent>,
    sources: Vec<EventSource>,
    scores: HashMap<Uuid, Vec<CategoryScore>>,
    snapshots: HashMap<Uuid, BrandSnapshot>,
    weights: HashMap<Uuid, UserWeights>,
    followers: Vec<Follower>,
    push_log: Vec<PushRecord>,
}

impl State {
    fn job_mut(&mut self, id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn held_index(&self, id: Uuid, worker_id: &str) -> Option<usize> {
        self.jobs
            .iter()
            .position(|j| j.id == id && j.locked_by.as_deref() == Some(worker_id))
    }

    fn event_mut(&mut self, event_id: Uuid) -> Option<&mut BrandEvent> {
        self.events.iter_mut().find(|e| e.event_id == event_id)
    }

    fn with_sources(&self, event: &BrandEvent) -> BrandEvent {
        let mut event = event.clone();
        event.sources = self
            .sources
            .iter()
            .filter(|s| s.event_id == event.event_id)
            .cloned()
            .collect();
        event
    }
}

/// One delivered push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub user_id: Uuid,
    pub brand_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

/// Shared in-memory store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every repository trait backed by this store.
    pub fn stores(&self) -> Stores {
        Stores {
            jobs: Arc::new(self.clone()),
            events: Arc::new(self.clone()),
            scores: Arc::new(self.clone()),
            followers: Arc::new(self.clone()),
        }
    }

    pub fn upsert_brand(&self, brand_id: Uuid, baseline: CategoryVector) {
        let mut state = self.state();
        if !state.brands.contains(&brand_id) {
            state.brands.push(brand_id);
        }
        state.baselines.insert(brand_id, baseline);
    }

    /// Record evidence counts. `behavior` is always derived from stored events.
    pub fn set_evidence(&self, brand_id: Uuid, summary: EvidenceSummary) {
        self.state().evidence.insert(brand_id, summary);
    }

    pub fn set_user_weights(&self, weights: UserWeights) {
        self.state().weights.insert(weights.user_id, weights);
    }

    /// Start following a brand, replacing an existing follow.
    pub fn upsert_follower(&self, follower: Follower) {
        let mut state = self.state();
        state
            .weights
            .insert(follower.user_id, follower.weights.clone());
        state
            .followers
            .retain(|f| !(f.user_id == follower.user_id && f.brand_id == follower.brand_id));
        state.followers.push(follower);
    }

    /// Insert a job row as-is, bypassing payload encoding.
    pub fn insert_job(&self, job: Job) {
        self.state().jobs.push(job);
    }

    /// Snapshot of the queue in insertion order.
    pub fn jobs(&self) -> Vec<Job> {
        self.state().jobs.clone()
    }

    /// Snapshot of the dead-letter store in insertion order.
    pub fn dead_letters(&self) -> Vec<DeadJob> {
        self.state().dead.clone()
    }

    pub fn push_log(&self) -> Vec<PushRecord> {
        self.state().push_log.clone()
    }
}

// =============================================================================
// JOB QUEUE
// =============================================================================

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let job = Job {
            id: Uuid::now_v7(),
            stage: payload.stage(),
            payload: payload.to_json()?,
            not_before,
            locked_by: None,
            locked_at: None,
            attempts: 0,
            last_error: None,
            coalesce_key: None,
            created_at: now,
        };
        let id = job.id;
        self.state().jobs.push(job);
        Ok(id)
    }

    async fn enqueue_coalesced(
        &self,
        coalesce_key: &str,
        brand_id: Uuid,
        bucket_start: DateTime<Utc>,
        events: &[ScoreDelta],
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let mut state = self.state();

        if let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.coalesce_key.as_deref() == Some(coalesce_key))
        {
            if job.is_locked() {
                return Err(Error::Job(format!(
                    "notification job {coalesce_key} is already being delivered"
                )));
            }
            let mut merged: NotifyPayload = serde_json::from_value(job.payload.clone())?;
            merged.events.extend_from_slice(events);
            job.payload = JobPayload::SendPushForScoreChange(merged).to_json()?;
            return Ok(job.id);
        }

        let payload = JobPayload::SendPushForScoreChange(NotifyPayload {
            brand_id,
            bucket_start,
            events: events.to_vec(),
        });
        let job = Job {
            id: Uuid::now_v7(),
            stage: payload.stage(),
            payload: payload.to_json()?,
            not_before,
            locked_by: None,
            locked_at: None,
            attempts: 0,
            last_error: None,
            coalesce_key: Some(coalesce_key.to_string()),
            created_at: now,
        };
        let id = job.id;
        state.jobs.push(job);
        Ok(id)
    }

    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let mut released = 0;
        for job in state.jobs.iter_mut() {
            if matches!(job.locked_at, Some(at) if at < cutoff) {
                job.locked_by = None;
                job.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let state = self.state();
        let mut due: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();
        // Stable: ties keep insertion order.
        due.sort_by_key(|j| j.created_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn try_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut state = self.state();
        match state.job_mut(id) {
            Some(job) if job.is_due(now) => {
                job.locked_by = Some(worker_id.to_string());
                job.locked_at = Some(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        let mut state = self.state();
        match state.held_index(id, worker_id) {
            Some(idx) => {
                state.jobs.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome> {
        let mut state = self.state();
        let Some(idx) = state.held_index(id, worker_id) else {
            return Ok(FailOutcome::LeaseLost);
        };

        let job = &mut state.jobs[idx];
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        let attempts = job.attempts;

        if policy.is_exhausted(attempts) {
            let job = state.jobs.remove(idx);
            state.dead.push(DeadJob::from_job(&job, now));
            return Ok(FailOutcome::DeadLettered { attempts });
        }

        let retry_at = now + policy.backoff(attempts);
        job.not_before = retry_at;
        job.locked_by = None;
        job.locked_at = None;
        Ok(FailOutcome::Retrying { attempts, retry_at })
    }

    async fn dead_letter_now(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        let Some(idx) = state.held_index(id, worker_id) else {
            return Ok(false);
        };
        let mut job = state.jobs.remove(idx);
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        state.dead.push(DeadJob::from_job(&job, now));
        Ok(true)
    }

    async fn defer(&self, id: Uuid, worker_id: &str, not_before: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        let Some(idx) = state.held_index(id, worker_id) else {
            return Ok(false);
        };
        let job = &mut state.jobs[idx];
        job.not_before = not_before;
        job.locked_by = None;
        job.locked_at = None;
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.state().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadJob>> {
        let state = self.state();
        Ok(state
            .dead
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let state = self.state();
        let mut stats = QueueStats {
            dead: state.dead.len() as i64,
            total: state.jobs.len() as i64,
            ..Default::default()
        };
        for job in &state.jobs {
            if job.is_locked() {
                stats.locked += 1;
            } else if job.not_before <= now {
                stats.due += 1;
            } else {
                stats.scheduled += 1;
            }
        }
        Ok(stats)
    }
}

// =============================================================================
// EVENT STORE
// =============================================================================

#[async_trait]
impl EventRepository for MemoryStore {
    async fn count_recent(&self, brand_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let state = self.state();
        Ok(state
            .events
            .iter()
            .filter(|e| e.brand_id == brand_id && e.created_at >= since)
            .count() as i64)
    }

    async fn upsert_event(&self, event: &NewBrandEvent, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        if state.events.iter().any(|e| e.event_id == event.event_id) {
            return Ok(false);
        }
        state.events.push(BrandEvent {
            event_id: event.event_id,
            brand_id: event.brand_id,
            category: event.category,
            title: event.title.clone(),
            occurred_at: event.occurred_at,
            severity: event.severity,
            credibility: event.credibility,
            verification: event.verification,
            impact: event.impact,
            flagged_for_review: false,
            review_reason: None,
            created_at: now,
            sources: Vec::new(),
        });
        Ok(true)
    }

    async fn add_source(
        &self,
        event_id: Uuid,
        source: &CanonicalSource,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        if !state.events.iter().any(|e| e.event_id == event_id) {
            return Err(Error::EventNotFound(event_id));
        }
        if state
            .sources
            .iter()
            .any(|s| s.event_id == event_id && s.canonical_url == source.canonical_url)
        {
            return Ok(false);
        }
        state.sources.push(EventSource {
            event_id,
            canonical_url: source.canonical_url.clone(),
            domain: source.domain.clone(),
            added_at: now,
        });
        Ok(true)
    }

    async fn distinct_source_domains(&self, event_id: Uuid) -> Result<i64> {
        let state = self.state();
        let mut domains: Vec<&str> = state
            .sources
            .iter()
            .filter(|s| s.event_id == event_id)
            .map(|s| s.domain.as_str())
            .collect();
        domains.sort_unstable();
        domains.dedup();
        Ok(domains.len() as i64)
    }

    async fn escalate_verification(
        &self,
        event_id: Uuid,
        to: Verification,
    ) -> Result<Verification> {
        let mut state = self.state();
        let event = state
            .event_mut(event_id)
            .ok_or(Error::EventNotFound(event_id))?;
        event.verification = event.verification.escalate(to);
        Ok(event.verification)
    }

    async fn flag_for_review(&self, event_id: Uuid, reason: &str) -> Result<()> {
        let mut state = self.state();
        let event = state
            .event_mut(event_id)
            .ok_or(Error::EventNotFound(event_id))?;
        event.flagged_for_review = true;
        event.review_reason = Some(reason.to_string());
        Ok(())
    }

    async fn events_for_brand(&self, brand_id: Uuid) -> Result<Vec<BrandEvent>> {
        let state = self.state();
        let mut events: Vec<BrandEvent> = state
            .events
            .iter()
            .filter(|e| e.brand_id == brand_id)
            .map(|e| state.with_sources(e))
            .collect();
        events.sort_by_key(|e| e.occurred_at);
        Ok(events)
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<BrandEvent>> {
        let state = self.state();
        Ok(state
            .events
            .iter()
            .find(|e| e.event_id == event_id)
            .map(|e| state.with_sources(e)))
    }
}

// =============================================================================
// SCORES AND SNAPSHOTS
// =============================================================================

#[async_trait]
impl ScoreRepository for MemoryStore {
    async fn baseline(&self, brand_id: Uuid) -> Result<CategoryVector> {
        Ok(self
            .state()
            .baselines
            .get(&brand_id)
            .copied()
            .unwrap_or_default())
    }

    async fn current_scores(&self, brand_id: Uuid) -> Result<Vec<CategoryScore>> {
        Ok(self
            .state()
            .scores
            .get(&brand_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_scores(&self, brand_id: Uuid, scores: &[CategoryScore]) -> Result<()> {
        if let Some(other) = scores.iter().find(|s| s.brand_id != brand_id) {
            return Err(Error::InvalidInput(format!(
                "score for brand {} saved under brand {}",
                other.brand_id, brand_id
            )));
        }
        let mut state = self.state();
        let stored = state.scores.entry(brand_id).or_default();
        for score in scores {
            stored.retain(|s| s.category != score.category);
            stored.push(score.clone());
        }
        stored.sort_by_key(|s| s.category);
        Ok(())
    }

    async fn list_brand_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.state().brands.clone())
    }

    async fn evidence_summary(&self, brand_id: Uuid) -> Result<EvidenceSummary> {
        let state = self.state();
        let mut summary = state.evidence.get(&brand_id).copied().unwrap_or_default();
        summary.behavior = state
            .events
            .iter()
            .filter(|e| e.brand_id == brand_id)
            .count() as i64;
        Ok(summary)
    }

    async fn save_snapshot(&self, snapshot: &BrandSnapshot) -> Result<()> {
        self.state()
            .snapshots
            .insert(snapshot.brand_id, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, brand_id: Uuid) -> Result<Option<BrandSnapshot>> {
        Ok(self.state().snapshots.get(&brand_id).cloned())
    }
}

// =============================================================================
// FOLLOWERS
// =============================================================================

#[async_trait]
impl FollowerRepository for MemoryStore {
    async fn followers_for_brand(&self, brand_id: Uuid) -> Result<Vec<Follower>> {
        let state = self.state();
        Ok(state
            .followers
            .iter()
            .filter(|f| f.brand_id == brand_id)
            .map(|f| {
                let mut follower = f.clone();
                if let Some(w) = state.weights.get(&f.user_id) {
                    follower.weights = w.clone();
                }
                follower
            })
            .collect())
    }

    async fn user_weights(&self, user_id: Uuid) -> Result<Option<UserWeights>> {
        Ok(self.state().weights.get(&user_id).cloned())
    }

    async fn pushes_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .state()
            .push_log
            .iter()
            .filter(|p| p.user_id == user_id && p.sent_at >= since)
            .count() as i64)
    }

    async fn record_push(&self, user_id: Uuid, brand_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.state().push_log.push(PushRecord {
            user_id,
            brand_id,
            sent_at: at,
        });
        Ok(())
    }
}
