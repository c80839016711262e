//! Notification coalescing.
//!
//! Score changes for a brand that land in the same fixed-width time bucket are
//! merged into one `send_push_for_score_change` job keyed by
//! `"<brand_id>:<bucket unix>"`. The job becomes due when its bucket closes,
//! so followers receive one push per brand per bucket.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use ethos_core::{bucket_start, coalesce_key, defaults, JobRepository, Result, ScoreDelta};

/// Appends score deltas to the open notification job for a brand's bucket.
#[derive(Clone)]
pub struct Coalescer {
    jobs: Arc<dyn JobRepository>,
    bucket_secs: i64,
}

impl Coalescer {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs,
            bucket_secs: defaults::COALESCE_BUCKET_SECS,
        }
    }

    pub fn with_bucket_secs(mut self, secs: i64) -> Self {
        self.bucket_secs = secs.max(1);
        self
    }

    pub fn bucket_secs(&self) -> i64 {
        self.bucket_secs
    }

    /// Start of the bucket containing `now`, and the instant it closes.
    pub fn bucket_for(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = bucket_start(now, self.bucket_secs);
        (start, start + Duration::seconds(self.bucket_secs))
    }

    /// Record `deltas` for `brand_id` observed at `now`.
    ///
    /// Creates the bucket's job or appends to it atomically. Fails if the
    /// bucket's job is already leased; the caller retries and lands in the
    /// same or the next bucket.
    #[instrument(skip(self, deltas), fields(subsystem = "notify", component = "coalescer", brand_id = %brand_id))]
    pub async fn signal(
        &self,
        brand_id: Uuid,
        deltas: &[ScoreDelta],
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let (start, closes_at) = self.bucket_for(now);
        let key = coalesce_key(brand_id, start);
        let job_id = self
            .jobs
            .enqueue_coalesced(&key, brand_id, start, deltas, closes_at, now)
            .await?;
        debug!(
            %job_id,
            coalesce_key = %key,
            row_count = deltas.len(),
            "Coalesced score change"
        );
        Ok(job_id)
    }
}
