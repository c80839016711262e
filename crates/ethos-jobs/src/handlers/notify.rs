//! `send_push_for_score_change`: fan a coalesced score change out to followers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, instrument, trace, warn};

use ethos_core::scoring::triggered_dealbreakers;
use ethos_core::{
    defaults, Category, CategoryVector, Follower, JobPayload, JobStage, NotifyPayload,
    PushMessage, PushSender, QuietHours, ScoreDelta, Stores,
};

use crate::handler::{wrong_payload, JobContext, JobHandler, JobResult};

/// Delivery limits for score-change pushes.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Pushes a user may receive in a rolling 24 hours.
    pub max_per_user_per_day: i64,
    /// Smallest change that signals a notification.
    pub min_delta: f64,
    pub quiet_hours: QuietHours,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_per_user_per_day: defaults::PUSH_MAX_PER_USER_PER_DAY,
            min_delta: defaults::PUSH_MIN_DELTA,
            quiet_hours: QuietHours::default(),
        }
    }
}

impl NotifyConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PUSH_MAX_PER_USER_PER_DAY` | `5` | Rolling 24h push cap per user |
    /// | `PUSH_MIN_DELTA` | `0.5` | Minimum score change that notifies |
    pub fn from_env() -> Self {
        let max_per_user_per_day = std::env::var("PUSH_MAX_PER_USER_PER_DAY")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::PUSH_MAX_PER_USER_PER_DAY)
            .max(0);
        let min_delta = std::env::var("PUSH_MIN_DELTA")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(defaults::PUSH_MIN_DELTA);
        Self {
            max_per_user_per_day,
            min_delta,
            quiet_hours: QuietHours::default(),
        }
    }

    pub fn with_max_per_user_per_day(mut self, max: i64) -> Self {
        self.max_per_user_per_day = max;
        self
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours) -> Self {
        self.quiet_hours = quiet_hours;
        self
    }
}

/// Net change per category across a bucket's merged deltas.
///
/// Deltas are ordered by observation time; the net change runs from the first
/// previous value to the last current value. Categories that ended where they
/// started are dropped.
pub fn net_changes(events: &[ScoreDelta]) -> Vec<ScoreDelta> {
    let mut sorted = events.to_vec();
    sorted.sort_by_key(|d| d.observed_at);

    Category::ALL
        .iter()
        .filter_map(|category| {
            let mut iter = sorted.iter().filter(|d| d.category == *category);
            let first = iter.next()?;
            let last = iter.last().unwrap_or(first);
            let delta = last.current - first.previous;
            (delta != 0.0).then_some(ScoreDelta {
                category: *category,
                previous: first.previous,
                current: last.current,
                delta,
                observed_at: last.observed_at,
            })
        })
        .collect()
}

/// The change a follower should be told about, if any.
///
/// A triggered dealbreaker on a changed category always qualifies. Otherwise
/// the largest change qualifies when the follower weighs that category and the
/// change reaches the follower's own minimum.
pub fn eligible_change(
    follower: &Follower,
    changes: &[ScoreDelta],
    scores: &CategoryVector,
) -> Option<ScoreDelta> {
    if !follower.notifications_enabled {
        return None;
    }

    let dealbreakers = triggered_dealbreakers(scores, &follower.weights);
    if let Some(change) = changes
        .iter()
        .find(|c| dealbreakers.contains(&c.category))
    {
        return Some(*change);
    }

    let dominant = changes
        .iter()
        .max_by(|a, b| a.delta.abs().total_cmp(&b.delta.abs()))?;
    let weight = follower.weights.weights.get(dominant.category);
    (weight > 0.0 && dominant.delta.abs() >= follower.min_delta).then_some(*dominant)
}

/// Handler for `send_push_for_score_change` jobs.
///
/// Delivery is best effort: a failed send is logged and the job still
/// completes, so followers already notified are never notified twice.
pub struct NotifyHandler {
    stores: Stores,
    sender: Arc<dyn PushSender>,
    config: NotifyConfig,
}

impl NotifyHandler {
    pub fn new(stores: Stores, sender: Arc<dyn PushSender>) -> Self {
        Self {
            stores,
            sender,
            config: NotifyConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NotifyConfig) -> Self {
        self.config = config;
        self
    }

    #[instrument(
        skip_all,
        fields(subsystem = "notify", component = "fan_out", job_id = %ctx.job_id(), brand_id = %payload.brand_id)
    )]
    async fn notify(&self, ctx: &JobContext, payload: &NotifyPayload) -> JobResult {
        let now = ctx.now();

        if self.config.quiet_hours.contains(now) {
            let until = self.config.quiet_hours.next_end(now);
            debug!(%until, "Quiet hours, deferring notification");
            return JobResult::Defer {
                until,
                reason: "quiet hours".into(),
            };
        }

        let changes = net_changes(&payload.events);
        if changes.is_empty() {
            debug!(merged = payload.events.len(), "No net score change to announce");
            return JobResult::Success;
        }

        let stored = match self.stores.scores.current_scores(payload.brand_id).await {
            Ok(scores) => scores,
            Err(e) => return e.into(),
        };
        let mut scores = CategoryVector::default();
        for change in &changes {
            scores.set(change.category, change.current);
        }
        for s in &stored {
            scores.set(s.category, s.score);
        }

        let followers = match self.stores.followers.followers_for_brand(payload.brand_id).await {
            Ok(f) => f,
            Err(e) => return e.into(),
        };

        let window_start = now - Duration::hours(24);
        let (mut sent, mut ineligible, mut rate_limited, mut failed) = (0usize, 0usize, 0usize, 0usize);

        for follower in &followers {
            let Some(change) = eligible_change(follower, &changes, &scores) else {
                trace!(user_id = %follower.user_id, "Follower not eligible");
                ineligible += 1;
                continue;
            };

            match self
                .stores
                .followers
                .pushes_since(follower.user_id, window_start)
                .await
            {
                Ok(count) if count >= self.config.max_per_user_per_day => {
                    debug!(user_id = %follower.user_id, count, "Push rate limit reached");
                    rate_limited += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(user_id = %follower.user_id, error = %e, "Could not read push history, skipping");
                    failed += 1;
                    continue;
                }
            }

            let message = PushMessage {
                subscription: follower.subscription.clone(),
                brand_id: payload.brand_id,
                category: change.category,
                delta: change.delta,
            };
            if let Err(e) = self.sender.send(&message).await {
                warn!(
                    user_id = %follower.user_id,
                    sender = self.sender.name(),
                    error = %e,
                    "Push delivery failed"
                );
                failed += 1;
                continue;
            }
            sent += 1;

            if let Err(e) = self
                .stores
                .followers
                .record_push(follower.user_id, payload.brand_id, now)
                .await
            {
                warn!(user_id = %follower.user_id, error = %e, "Failed to record push");
            }
        }

        info!(
            followers = followers.len(),
            sent,
            ineligible,
            rate_limited,
            failed,
            "Score change fan-out finished"
        );
        JobResult::Success
    }
}

#[async_trait]
impl JobHandler for NotifyHandler {
    fn stage(&self) -> JobStage {
        JobStage::SendPushForScoreChange
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match &ctx.payload {
            JobPayload::SendPushForScoreChange(payload) => self.notify(&ctx, payload).await,
            other => wrong_payload(JobStage::SendPushForScoreChange, other),
        }
    }
}
