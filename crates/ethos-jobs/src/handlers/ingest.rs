//! `ingest_event`: store an adapter candidate as a brand event.

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, instrument, warn};

use ethos_core::sources::url_digest;
use ethos_core::{
    canonicalize_url, defaults, event_fingerprint, CategoryVector, IngestEventPayload, JobPayload,
    JobStage, NewBrandEvent, ScoreBrandPayload, Stores, Verification, VerifyEventPayload,
};

use crate::handler::{wrong_payload, JobContext, JobHandler, JobResult};

/// Flood-control settings for ingestion.
#[derive(Debug, Clone, Copy)]
pub struct FloodControl {
    /// Events already stored in the window at which scoring is suppressed.
    pub threshold: i64,
    pub window: Duration,
}

impl Default for FloodControl {
    fn default() -> Self {
        Self {
            threshold: defaults::FLOOD_THRESHOLD,
            window: Duration::hours(defaults::FLOOD_WINDOW_HOURS),
        }
    }
}

/// Handler for `ingest_event` jobs.
///
/// Idempotent: the event id is a fingerprint of brand, category and title, and
/// sources are unique per canonical URL, so a retried job re-inserts nothing.
pub struct IngestHandler {
    stores: Stores,
    flood: FloodControl,
}

impl IngestHandler {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            flood: FloodControl::default(),
        }
    }

    pub fn with_flood_control(mut self, flood: FloodControl) -> Self {
        self.flood = flood;
        self
    }

    #[instrument(
        skip(self, ctx, payload),
        fields(subsystem = "ingest", job_id = %ctx.job_id(), brand_id = %payload.brand_id, adapter = %payload.adapter)
    )]
    async fn ingest(&self, ctx: &JobContext, payload: &IngestEventPayload) -> JobResult {
        let now = ctx.now();
        let candidate = &payload.candidate;

        if candidate.occurred_at > now {
            warn!(
                occurred_at = %candidate.occurred_at,
                "Rejecting future-dated candidate"
            );
            return JobResult::Success;
        }

        let source = match canonicalize_url(&candidate.url) {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "Skipping candidate with unusable source url");
                return JobResult::Success;
            }
        };

        let event_id = event_fingerprint(payload.brand_id, candidate.category_hint, &candidate.title);
        let event = NewBrandEvent {
            event_id,
            brand_id: payload.brand_id,
            category: candidate.category_hint,
            title: candidate.title.trim().to_string(),
            occurred_at: candidate.occurred_at,
            severity: candidate.severity_hint.clamp(0.0, 1.0),
            credibility: candidate
                .credibility
                .unwrap_or(defaults::DEFAULT_SOURCE_CREDIBILITY)
                .clamp(0.0, 1.0),
            verification: candidate.verification.unwrap_or(Verification::Unverified),
            impact: candidate.impact.unwrap_or_else(|| {
                CategoryVector::single(candidate.category_hint, defaults::DEFAULT_CATEGORY_IMPACT)
            }),
        };

        let recent = match self
            .stores
            .events
            .count_recent(payload.brand_id, now - self.flood.window)
            .await
        {
            Ok(n) => n,
            Err(e) => return e.into(),
        };
        let flooded = recent >= self.flood.threshold;

        let inserted = match self.stores.events.upsert_event(&event, now).await {
            Ok(inserted) => inserted,
            Err(e) => return e.into(),
        };
        let source_added = match self.stores.events.add_source(event_id, &source, now).await {
            Ok(added) => added,
            Err(e) => return e.into(),
        };
        debug!(
            %event_id,
            inserted,
            source_added,
            source = %url_digest(&source.canonical_url),
            domain = %source.domain,
            "Stored event candidate"
        );

        let verify = JobPayload::VerifyEvent(VerifyEventPayload { event_id });
        if let Err(e) = self.stores.jobs.enqueue(&verify, now, now).await {
            return e.into();
        }

        if flooded {
            // Only an event this job created is held back; one already stored
            // keeps its review state and its place in the score.
            if inserted {
                let reason = format!(
                    "{recent} events in the last {}h for this brand",
                    self.flood.window.num_hours()
                );
                if let Err(e) = self.stores.events.flag_for_review(event_id, &reason).await {
                    return e.into();
                }
            }
            warn!(%event_id, recent, inserted, "Flood threshold reached, scoring suppressed");
            return JobResult::Success;
        }

        let score = JobPayload::ScoreBrand(ScoreBrandPayload {
            brand_id: payload.brand_id,
        });
        if let Err(e) = self.stores.jobs.enqueue(&score, now, now).await {
            return e.into();
        }

        info!(%event_id, inserted, "Event ingested");
        JobResult::Success
    }
}

#[async_trait]
impl JobHandler for IngestHandler {
    fn stage(&self) -> JobStage {
        JobStage::IngestEvent
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match &ctx.payload {
            JobPayload::IngestEvent(payload) => self.ingest(&ctx, payload).await,
            other => wrong_payload(JobStage::IngestEvent, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use ethos_core::{Category, EventCandidate, EventRepository, Job};
    use ethos_db::MemoryStore;
    use serde_json::json;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn candidate(title: &str, url: &str) -> EventCandidate {
        EventCandidate {
            title: title.into(),
            url: url.into(),
            occurred_at: now() - Duration::days(2),
            category_hint: Category::Labor,
            severity_hint: 0.6,
            impact: None,
            credibility: None,
            verification: None,
        }
    }

    fn ctx(brand_id: Uuid, candidate: EventCandidate) -> JobContext {
        let payload = JobPayload::IngestEvent(IngestEventPayload {
            brand_id,
            adapter: "test".into(),
            candidate,
        });
        let job = Job {
            id: Uuid::new_v4(),
            stage: JobStage::IngestEvent,
            payload: json!({}),
            not_before: now(),
            locked_by: Some("w".into()),
            locked_at: Some(now()),
            attempts: 0,
            last_error: None,
            coalesce_key: None,
            created_at: now(),
        };
        JobContext::new(job, payload, now())
    }

    #[tokio::test]
    async fn test_ingest_applies_defaults_and_enqueues_follow_ups() {
        let store = MemoryStore::new();
        let handler = IngestHandler::new(store.stores());
        let brand = Uuid::new_v4();

        let result = handler
            .execute(ctx(brand, candidate("Strike at plant", "https://www.news.example/a?utm_source=x")))
            .await;
        assert_eq!(result, JobResult::Success);

        let event_id = event_fingerprint(brand, Category::Labor, "Strike at plant");
        let event = store.get_event(event_id).await.unwrap().unwrap();
        assert_eq!(event.credibility, defaults::DEFAULT_SOURCE_CREDIBILITY);
        assert_eq!(event.verification, Verification::Unverified);
        assert_eq!(event.impact.get(Category::Labor), defaults::DEFAULT_CATEGORY_IMPACT);
        assert_eq!(event.sources.len(), 1);
        assert_eq!(event.sources[0].canonical_url, "https://news.example/a");

        let mut stages: Vec<JobStage> = store.jobs().iter().map(|j| j.stage).collect();
        stages.sort_by_key(|s| s.as_str());
        assert_eq!(stages, vec![JobStage::ScoreBrand, JobStage::VerifyEvent]);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let store = MemoryStore::new();
        let handler = IngestHandler::new(store.stores());
        let brand = Uuid::new_v4();
        let c = candidate("Strike at plant", "https://news.example/a");

        handler.execute(ctx(brand, c.clone())).await;
        handler.execute(ctx(brand, c)).await;

        let events = store.events_for_brand(brand).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sources.len(), 1);
    }

    #[tokio::test]
    async fn test_future_dated_candidate_is_dropped() {
        let store = MemoryStore::new();
        let handler = IngestHandler::new(store.stores());
        let brand = Uuid::new_v4();
        let mut c = candidate("Tomorrow's news", "https://news.example/b");
        c.occurred_at = now() + Duration::hours(1);

        assert_eq!(handler.execute(ctx(brand, c)).await, JobResult::Success);
        assert!(store.events_for_brand(brand).await.unwrap().is_empty());
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_unusable_url_is_dropped() {
        let store = MemoryStore::new();
        let handler = IngestHandler::new(store.stores());
        let brand = Uuid::new_v4();

        let result = handler
            .execute(ctx(brand, candidate("Odd source", "ftp://files.example/x")))
            .await;
        assert_eq!(result, JobResult::Success);
        assert!(store.events_for_brand(brand).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_payload_is_permanent() {
        let store = MemoryStore::new();
        let handler = IngestHandler::new(store.stores());
        let mut c = ctx(Uuid::new_v4(), candidate("x", "https://a.example"));
        c.payload = JobPayload::ScoreBrand(ScoreBrandPayload {
            brand_id: Uuid::nil(),
        });
        assert!(matches!(handler.execute(c).await, JobResult::Permanent(_)));
    }
}
