//! `score_brand`: recompute and persist a brand's category scores.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace};
use uuid::Uuid;

use ethos_core::{
    defaults, CategoryScore, CategoryVector, JobPayload, JobStage, PublishSnapshotsPayload,
    ScoreBrandPayload, ScoreDelta, ScoringEngine, Stores,
};

use crate::coalescer::Coalescer;
use crate::handler::{wrong_payload, JobContext, JobHandler, JobResult};

/// Handler for `score_brand` jobs.
///
/// Events flagged for review and events dated after the job's clock are left
/// out. Score changes of at least `min_delta` are coalesced into the brand's
/// notification bucket before the new scores are saved, so a retry after a
/// crash recomputes the same change instead of seeing none.
pub struct ScoreHandler {
    stores: Stores,
    engine: ScoringEngine,
    coalescer: Coalescer,
    min_delta: f64,
}

impl ScoreHandler {
    pub fn new(stores: Stores, engine: ScoringEngine) -> Self {
        let coalescer = Coalescer::new(Arc::clone(&stores.jobs));
        Self {
            stores,
            engine,
            coalescer,
            min_delta: defaults::PUSH_MIN_DELTA,
        }
    }

    pub fn with_coalescer(mut self, coalescer: Coalescer) -> Self {
        self.coalescer = coalescer;
        self
    }

    /// Smallest absolute change that produces a notification signal.
    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    #[instrument(skip_all, fields(subsystem = "scoring", job_id = %ctx.job_id(), brand_id = %brand_id))]
    async fn score(&self, ctx: &JobContext, brand_id: Uuid) -> JobResult {
        let now = ctx.now();

        let baseline = match self.stores.scores.baseline(brand_id).await {
            Ok(b) => b,
            Err(e) => return e.into(),
        };
        let events = match self.stores.events.events_for_brand(brand_id).await {
            Ok(events) => events,
            Err(e) => return e.into(),
        };
        let total = events.len();
        let qualifying: Vec<_> = events
            .into_iter()
            .filter(|e| !e.flagged_for_review && e.occurred_at <= now)
            .collect();
        trace!(total, qualifying = qualifying.len(), "Loaded brand events");

        let report = match self.engine.score(brand_id, baseline, &qualifying, now) {
            Ok(report) => report,
            Err(e) => return e.into(),
        };

        let previous = match self.stores.scores.current_scores(brand_id).await {
            Ok(scores) => scores,
            Err(e) => return e.into(),
        };
        let deltas = score_deltas(&previous, baseline, &report.scores, self.min_delta, now);

        if !deltas.is_empty() {
            if let Err(e) = self.coalescer.signal(brand_id, &deltas, now).await {
                return e.into();
            }
        }

        if let Err(e) = self.stores.scores.save_scores(brand_id, &report.scores).await {
            return e.into();
        }

        let publish = JobPayload::PublishSnapshots(PublishSnapshotsPayload {
            brand_ids: vec![brand_id],
        });
        if let Err(e) = self.stores.jobs.enqueue(&publish, now, now).await {
            return e.into();
        }

        info!(
            baseline_only = report.baseline_only,
            events = qualifying.len(),
            signalled = deltas.len(),
            "Brand scored"
        );
        for item in report
            .explanation
            .negative
            .iter()
            .chain(report.explanation.positive.iter())
        {
            debug!(event_id = %item.event_id, "{}", item.text);
        }
        JobResult::Success
    }
}

/// Changes between the stored and the new scores with `|delta| >= min_delta`.
///
/// A category never scored before is compared against its baseline.
pub fn score_deltas(
    previous: &[CategoryScore],
    baseline: CategoryVector,
    current: &[CategoryScore],
    min_delta: f64,
    observed_at: DateTime<Utc>,
) -> Vec<ScoreDelta> {
    current
        .iter()
        .filter_map(|score| {
            let before = previous
                .iter()
                .find(|p| p.category == score.category)
                .map(|p| p.score)
                .unwrap_or_else(|| baseline.get(score.category));
            let delta = score.score - before;
            (delta.abs() >= min_delta).then_some(ScoreDelta {
                category: score.category,
                previous: before,
                current: score.score,
                delta,
                observed_at,
            })
        })
        .collect()
}

#[async_trait]
impl JobHandler for ScoreHandler {
    fn stage(&self) -> JobStage {
        JobStage::ScoreBrand
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match &ctx.payload {
            JobPayload::ScoreBrand(ScoreBrandPayload { brand_id }) => {
                let brand_id = *brand_id;
                self.score(&ctx, brand_id).await
            }
            other => wrong_payload(JobStage::ScoreBrand, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ethos_core::{
        Category, EventRepository, Job, NewBrandEvent, ScoreRepository, Verification,
    };
    use ethos_db::MemoryStore;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 2, 0).unwrap()
    }

    fn ctx(brand_id: Uuid) -> JobContext {
        let job = Job {
            id: Uuid::new_v4(),
            stage: JobStage::ScoreBrand,
            payload: json!({ "brand_id": brand_id }),
            not_before: now(),
            locked_by: Some("w".into()),
            locked_at: Some(now()),
            attempts: 0,
            last_error: None,
            coalesce_key: None,
            created_at: now(),
        };
        JobContext::new(
            job,
            JobPayload::ScoreBrand(ScoreBrandPayload { brand_id }),
            now(),
        )
    }

    fn event(brand_id: Uuid, title: &str, impact: f64) -> NewBrandEvent {
        NewBrandEvent {
            event_id: Uuid::new_v4(),
            brand_id,
            category: Category::Labor,
            title: title.into(),
            occurred_at: now() - Duration::days(45),
            severity: 0.8,
            credibility: 1.0,
            verification: Verification::Corroborated,
            impact: CategoryVector::single(Category::Labor, impact),
        }
    }

    fn score(category: Category, value: f64) -> CategoryScore {
        CategoryScore {
            brand_id: Uuid::nil(),
            category,
            baseline: 0.0,
            news: value,
            score: value,
            event_count: 0,
            computed_at: now(),
        }
    }

    #[test]
    fn test_score_deltas_threshold_and_baseline_fallback() {
        let previous = vec![score(Category::Labor, 1.0)];
        let baseline = CategoryVector::single(Category::Social, 2.0);
        let current = vec![
            score(Category::Labor, 1.4),
            score(Category::Environment, -0.5),
            score(Category::Social, 2.0),
        ];
        let deltas = score_deltas(&previous, baseline, &current, 0.5, now());
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].category, Category::Environment);
        assert_eq!(deltas[0].previous, 0.0);
        assert_eq!(deltas[0].delta, -0.5);
    }

    #[tokio::test]
    async fn test_zero_events_persists_baseline() {
        let store = MemoryStore::new();
        let brand = Uuid::new_v4();
        let baseline = CategoryVector {
            labor: 10.0,
            environment: 1.0,
            politics: 0.0,
            social: -3.0,
        };
        store.upsert_brand(brand, baseline);

        let handler = ScoreHandler::new(store.stores(), ScoringEngine::default());
        assert_eq!(handler.execute(ctx(brand)).await, JobResult::Success);

        let scores = store.current_scores(brand).await.unwrap();
        assert_eq!(scores.len(), 4);
        for s in &scores {
            assert_eq!(s.score, baseline.get(s.category));
            assert_eq!(s.news, 0.0);
        }
        let stages: Vec<JobStage> = store.jobs().iter().map(|j| j.stage).collect();
        assert_eq!(stages, vec![JobStage::PublishSnapshots]);
    }

    #[tokio::test]
    async fn test_score_change_is_coalesced_before_save() {
        let store = MemoryStore::new();
        let brand = Uuid::new_v4();
        store.upsert_brand(brand, CategoryVector::default());
        store
            .upsert_event(&event(brand, "Wage theft", -4.0), now())
            .await
            .unwrap();

        let handler = ScoreHandler::new(store.stores(), ScoringEngine::default());
        assert_eq!(handler.execute(ctx(brand)).await, JobResult::Success);

        let labor = store
            .current_scores(brand)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.category == Category::Labor)
            .unwrap();
        assert!((labor.score + 1.2).abs() < 1e-9);

        let notify = store
            .jobs()
            .into_iter()
            .find(|j| j.stage == JobStage::SendPushForScoreChange)
            .expect("notification job");
        assert_eq!(
            notify.not_before,
            Utc.with_ymd_and_hms(2026, 6, 1, 12, 5, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_flagged_events_do_not_count() {
        let store = MemoryStore::new();
        let brand = Uuid::new_v4();
        store.upsert_brand(brand, CategoryVector::default());
        let e = event(brand, "Bot storm", -4.0);
        store.upsert_event(&e, now()).await.unwrap();
        store.flag_for_review(e.event_id, "flood").await.unwrap();

        let handler = ScoreHandler::new(store.stores(), ScoringEngine::default());
        handler.execute(ctx(brand)).await;

        let scores = store.current_scores(brand).await.unwrap();
        assert!(scores.iter().all(|s| s.news == 0.0 && s.event_count == 0));
        assert!(store
            .jobs()
            .iter()
            .all(|j| j.stage != JobStage::SendPushForScoreChange));
    }

    #[tokio::test]
    async fn test_small_change_is_not_signalled() {
        let store = MemoryStore::new();
        let brand = Uuid::new_v4();
        store.upsert_brand(brand, CategoryVector::default());
        store
            .upsert_event(&event(brand, "Minor complaint", -1.0), now())
            .await
            .unwrap();

        // Contribution is -0.3, below the 0.5 notification threshold.
        let handler = ScoreHandler::new(store.stores(), ScoringEngine::default());
        handler.execute(ctx(brand)).await;
        assert!(store
            .jobs()
            .iter()
            .all(|j| j.stage != JobStage::SendPushForScoreChange));
    }
}
