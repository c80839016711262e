//! `verify_event`: escalate an event's trust tier from its sources.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use ethos_core::{
    defaults, JobPayload, JobStage, ScoreBrandPayload, Stores, Verification, VerifyEventPayload,
};

use crate::handler::{wrong_payload, JobContext, JobHandler, JobResult};

/// Handler for `verify_event` jobs.
///
/// An event reported by at least two distinct domains becomes corroborated.
/// Tiers only move up, so running this twice is harmless.
pub struct VerifyHandler {
    stores: Stores,
    min_domains: i64,
}

impl VerifyHandler {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            min_domains: defaults::CORROBORATION_MIN_DOMAINS,
        }
    }

    #[instrument(skip(self, ctx), fields(subsystem = "ingest", component = "verify", job_id = %ctx.job_id(), event_id = %payload.event_id))]
    async fn verify(&self, ctx: &JobContext, payload: &VerifyEventPayload) -> JobResult {
        let event = match self.stores.events.get_event(payload.event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Event no longer exists, nothing to verify");
                return JobResult::Success;
            }
            Err(e) => return e.into(),
        };

        let domains = match self.stores.events.distinct_source_domains(event.event_id).await {
            Ok(n) => n,
            Err(e) => return e.into(),
        };
        if domains < self.min_domains {
            debug!(domains, "Not enough independent sources to corroborate");
            return JobResult::Success;
        }

        let tier = match self
            .stores
            .events
            .escalate_verification(event.event_id, Verification::Corroborated)
            .await
        {
            Ok(tier) => tier,
            Err(e) => return e.into(),
        };
        if tier == event.verification {
            return JobResult::Success;
        }

        info!(from = %event.verification, to = %tier, domains, "Event verification escalated");

        // The tier feeds the score, so rescore unless flood control held the event back.
        if !event.flagged_for_review {
            let now = ctx.now();
            let score = JobPayload::ScoreBrand(ScoreBrandPayload {
                brand_id: event.brand_id,
            });
            if let Err(e) = self.stores.jobs.enqueue(&score, now, now).await {
                return e.into();
            }
        }
        JobResult::Success
    }
}

#[async_trait]
impl JobHandler for VerifyHandler {
    fn stage(&self) -> JobStage {
        JobStage::VerifyEvent
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match &ctx.payload {
            JobPayload::VerifyEvent(payload) => self.verify(&ctx, payload).await,
            other => wrong_payload(JobStage::VerifyEvent, other),
        }
    }
}
