//! `publish_snapshots`: publish brand views for score consumers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use ethos_core::{
    sufficiency, BrandSnapshot, JobPayload, JobStage, PublishSnapshotsPayload, Result, Stores,
};

use crate::handler::{wrong_payload, JobContext, JobHandler, JobResult};

/// Handler for `publish_snapshots` jobs.
///
/// Consumers read snapshots and never compute scores themselves. A snapshot
/// carries the persisted category scores and the sufficiency verdict that
/// decides whether they may be shown.
pub struct SnapshotHandler {
    stores: Stores,
}

impl SnapshotHandler {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Build and save the snapshot for one brand.
    pub async fn publish(&self, brand_id: Uuid, now: DateTime<Utc>) -> Result<BrandSnapshot> {
        let scores = self.stores.scores.current_scores(brand_id).await?;
        let evidence = self.stores.scores.evidence_summary(brand_id).await?;
        let report = sufficiency::evaluate(&evidence);

        let snapshot = BrandSnapshot {
            brand_id,
            baseline_only: scores.iter().all(|s| s.event_count == 0),
            scores,
            sufficiency: report,
            published_at: now,
        };
        self.stores.scores.save_snapshot(&snapshot).await?;
        debug!(
            brand_id = %brand_id,
            recommendation = snapshot.sufficiency.recommendation.as_str(),
            domains_covered = snapshot.sufficiency.domains_covered,
            "Published brand snapshot"
        );
        Ok(snapshot)
    }

    #[instrument(skip_all, fields(subsystem = "scoring", component = "snapshots", job_id = %ctx.job_id()))]
    async fn publish_all(&self, ctx: &JobContext, payload: &PublishSnapshotsPayload) -> JobResult {
        let brand_ids = if payload.brand_ids.is_empty() {
            match self.stores.scores.list_brand_ids().await {
                Ok(ids) => ids,
                Err(e) => return e.into(),
            }
        } else {
            payload.brand_ids.clone()
        };

        for brand_id in &brand_ids {
            if let Err(e) = self.publish(*brand_id, ctx.now()).await {
                return e.into();
            }
        }

        info!(row_count = brand_ids.len(), "Snapshots published");
        JobResult::Success
    }
}

#[async_trait]
impl JobHandler for SnapshotHandler {
    fn stage(&self) -> JobStage {
        JobStage::PublishSnapshots
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match &ctx.payload {
            JobPayload::PublishSnapshots(payload) => self.publish_all(&ctx, payload).await,
            other => wrong_payload(JobStage::PublishSnapshots, other),
        }
    }
}
