//! Core data models for ethos.
//!
//! These types are shared across all ethos crates and represent the core
//! domain entities: queued jobs, brand events and their sources, scores,
//! followers and the snapshots published for score consumers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::payload::JobStage;
use crate::sufficiency::SufficiencyReport;

// =============================================================================
// CATEGORIES
// =============================================================================

/// Ethics category a brand is scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Labor,
    Environment,
    Politics,
    Social,
}

impl Category {
    /// Every category, in scoring order.
    pub const ALL: [Category; 4] = [
        Category::Labor,
        Category::Environment,
        Category::Politics,
        Category::Social,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Labor => "labor",
            Category::Environment => "environment",
            Category::Politics => "politics",
            Category::Social => "social",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "labor" => Ok(Category::Labor),
            "environment" => Ok(Category::Environment),
            "politics" => Ok(Category::Politics),
            "social" => Ok(Category::Social),
            other => Err(Error::InvalidInput(format!("unknown category: {other}"))),
        }
    }
}

/// One value per category.
///
/// Used for baselines, event impact vectors, news vectors and user weights.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryVector {
    #[serde(default)]
    pub labor: f64,
    #[serde(default)]
    pub environment: f64,
    #[serde(default)]
    pub politics: f64,
    #[serde(default)]
    pub social: f64,
}

impl CategoryVector {
    /// A vector with the same value in every category.
    pub fn splat(value: f64) -> Self {
        Self {
            labor: value,
            environment: value,
            politics: value,
            social: value,
        }
    }

    /// A vector that is zero except for `category`.
    pub fn single(category: Category, value: f64) -> Self {
        let mut v = Self::default();
        v.set(category, value);
        v
    }

    pub fn get(&self, category: Category) -> f64 {
        match category {
            Category::Labor => self.labor,
            Category::Environment => self.environment,
            Category::Politics => self.politics,
            Category::Social => self.social,
        }
    }

    pub fn set(&mut self, category: Category, value: f64) {
        match category {
            Category::Labor => self.labor = value,
            Category::Environment => self.environment = value,
            Category::Politics => self.politics = value,
            Category::Social => self.social = value,
        }
    }

    /// Iterate `(category, value)` pairs in [`Category::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (Category, f64)> + '_ {
        Category::ALL.iter().map(move |c| (*c, self.get(*c)))
    }

    pub fn is_zero(&self) -> bool {
        self.iter().all(|(_, v)| v == 0.0)
    }
}

// =============================================================================
// VERIFICATION
// =============================================================================

/// Trust tier of a brand event.
///
/// Ordered from least to most trusted so escalation can compare tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Noise,
    Unverified,
    Corroborated,
    Official,
}

impl Verification {
    /// Scoring weight for the tier. This is the only place a tier becomes a
    /// number.
    pub fn factor(&self) -> f64 {
        match self {
            Verification::Official => 1.0,
            Verification::Corroborated => 0.75,
            Verification::Unverified => 0.5,
            Verification::Noise => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verification::Noise => "noise",
            Verification::Unverified => "unverified",
            Verification::Corroborated => "corroborated",
            Verification::Official => "official",
        }
    }

    /// Returns the tier to store when `proposed` is observed for an event
    /// currently at `self`. Tiers only move up.
    pub fn escalate(self, proposed: Verification) -> Verification {
        self.max(proposed)
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verification {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "noise" => Ok(Verification::Noise),
            "unverified" => Ok(Verification::Unverified),
            "corroborated" => Ok(Verification::Corroborated),
            "official" => Ok(Verification::Official),
            other => Err(Error::InvalidInput(format!("unknown verification: {other}"))),
        }
    }
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// A row in the job queue.
///
/// A job is either unlocked and waiting for `not_before`, or locked by exactly
/// one worker. Locks older than the stale threshold may be reclaimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub stage: JobStage,
    pub payload: JsonValue,
    pub not_before: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Set only for coalesced notification jobs: `"<brand_id>:<bucket unix>"`.
    pub coalesce_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_locked() && self.not_before <= now
    }
}

/// Terminal archive entry for a job that exhausted its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadJob {
    pub id: Uuid,
    pub stage: JobStage,
    pub payload: JsonValue,
    pub not_before: DateTime<Utc>,
    /// Worker that held the job when it was archived.
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub coalesce_key: Option<String>,
    pub original_created_at: DateTime<Utc>,
    pub dead_at: DateTime<Utc>,
}

impl DeadJob {
    /// Archive `job` verbatim.
    pub fn from_job(job: &Job, dead_at: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            stage: job.stage,
            payload: job.payload.clone(),
            not_before: job.not_before,
            locked_by: job.locked_by.clone(),
            locked_at: job.locked_at,
            attempts: job.attempts,
            last_error: job.last_error.clone(),
            coalesce_key: job.coalesce_key.clone(),
            original_created_at: job.created_at,
            dead_at,
        }
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; the lock is released and the job runs again at `retry_at`.
    Retrying {
        attempts: i32,
        retry_at: DateTime<Utc>,
    },
    /// Moved to the dead-letter store and removed from the queue.
    DeadLettered { attempts: i32 },
    /// The caller no longer held the lease; nothing was changed.
    LeaseLost,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub due: i64,
    pub scheduled: i64,
    pub locked: i64,
    pub dead: i64,
    pub total: i64,
}

// =============================================================================
// EVENT STORE
// =============================================================================

/// Normalized evidence produced by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub title: String,
    pub url: String,
    pub occurred_at: DateTime<Utc>,
    pub category_hint: Category,
    /// Severity in [0, 1].
    pub severity_hint: f64,
    /// Per-category impact. When absent the hinted category gets the default impact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<CategoryVector>,
    /// Source credibility in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credibility: Option<f64>,
    /// Initial trust tier. Defaults to unverified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

/// Insert request for a brand event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBrandEvent {
    pub event_id: Uuid,
    pub brand_id: Uuid,
    pub category: Category,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
    pub severity: f64,
    pub credibility: f64,
    pub verification: Verification,
    pub impact: CategoryVector,
}

/// A persisted brand event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandEvent {
    pub event_id: Uuid,
    pub brand_id: Uuid,
    pub category: Category,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
    pub severity: f64,
    pub credibility: f64,
    pub verification: Verification,
    pub impact: CategoryVector,
    pub flagged_for_review: bool,
    pub review_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sources: Vec<EventSource>,
}

/// Attribution of an event to one source URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub event_id: Uuid,
    pub canonical_url: String,
    pub domain: String,
    pub added_at: DateTime<Utc>,
}

// =============================================================================
// SCORES
// =============================================================================

/// Persisted score for one brand and category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub brand_id: Uuid,
    pub category: Category,
    pub baseline: f64,
    /// Clamped, decayed sum of event contributions.
    pub news: f64,
    /// `baseline + news`.
    pub score: f64,
    pub event_count: i64,
    pub computed_at: DateTime<Utc>,
}

/// Change in one category's score between two scoring runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreDelta {
    pub category: Category,
    pub previous: f64,
    pub current: f64,
    pub delta: f64,
    pub observed_at: DateTime<Utc>,
}

/// A user's per-category weights and optional dealbreaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserWeights {
    pub user_id: Uuid,
    /// Weight per category, each in [0, 1]. Need not sum to 1.
    pub weights: CategoryVector,
    /// A dealbreaker fires when `CategoryScore[c] < -threshold[c]`.
    #[serde(default)]
    pub dealbreakers: HashMap<Category, f64>,
}

impl UserWeights {
    /// Equal weight in every category and no dealbreakers.
    pub fn uniform(user_id: Uuid) -> Self {
        Self {
            user_id,
            weights: CategoryVector::splat(1.0),
            dealbreakers: HashMap::new(),
        }
    }
}

/// Evidence counts per domain used by the sufficiency gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSummary {
    /// Identity and ownership records.
    pub identity: i64,
    /// Behavior: stored brand events.
    pub behavior: i64,
    /// Claims and certifications.
    pub claims: i64,
    /// Third-party scrutiny (audits, ratings, investigations).
    pub scrutiny: i64,
    /// Market presence (products, barcodes, retail listings).
    pub market: i64,
}

/// Public view of a brand published for score consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandSnapshot {
    pub brand_id: Uuid,
    pub scores: Vec<CategoryScore>,
    pub baseline_only: bool,
    pub sufficiency: SufficiencyReport,
    pub published_at: DateTime<Utc>,
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Browser push subscription of a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

/// A user following a brand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follower {
    pub user_id: Uuid,
    pub brand_id: Uuid,
    pub subscription: PushSubscription,
    pub weights: UserWeights,
    pub min_delta: f64,
    pub notifications_enabled: bool,
}

/// One push sent to the delivery service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub subscription: PushSubscription,
    pub brand_id: Uuid,
    pub category: Category,
    pub delta: f64,
}
