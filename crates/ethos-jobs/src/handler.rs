//! Job handlers for each stage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use ethos_core::{Error, Job, JobPayload, JobStage};

/// Context provided to job handlers.
pub struct JobContext {
    /// The leased job row.
    pub job: Job,
    /// Payload decoded for the job's stage.
    pub payload: JobPayload,
    now: DateTime<Utc>,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job, payload: JobPayload, now: DateTime<Utc>) -> Self {
        Self { job, payload, now }
    }

    /// Engine time at dispatch. Handlers read time from here, never the wall clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// Failed attempts recorded before this run.
    pub fn attempts(&self) -> i32 {
        self.job.attempts
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed; the row is deleted.
    Success,
    /// Transient failure; retried with backoff until attempts run out.
    Failed(String),
    /// The job can never succeed; dead-lettered without further retries.
    Permanent(String),
    /// Not a failure: release the lease and run again at `until`.
    Defer { until: DateTime<Utc>, reason: String },
}

impl From<Error> for JobResult {
    fn from(e: Error) -> Self {
        JobResult::Failed(e.to_string())
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The stage this handler processes.
    fn stage(&self) -> JobStage;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Check if this handler can process the given stage.
    fn can_handle(&self, stage: JobStage) -> bool {
        self.stage() == stage
    }
}

/// No-op handler for testing.
pub struct NoOpHandler {
    stage: JobStage,
}

impl NoOpHandler {
    /// Create a new no-op handler for the given stage.
    pub fn new(stage: JobStage) -> Self {
        Self { stage }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn stage(&self) -> JobStage {
        self.stage
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success
    }
}

/// Handler payload mismatch. The engine decodes by stage, so this only fires
/// when a handler is registered under the wrong stage.
pub(crate) fn wrong_payload(expected: JobStage, payload: &JobPayload) -> JobResult {
    JobResult::Permanent(format!(
        "expected {} payload, got {}",
        expected,
        payload.stage()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethos_core::ScoreBrandPayload;
    use serde_json::json;

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            stage: JobStage::ScoreBrand,
            payload: json!({"brand_id": Uuid::nil()}),
            not_before: now,
            locked_by: Some("w1".into()),
            locked_at: Some(now),
            attempts: 2,
            last_error: None,
            coalesce_key: None,
            created_at: now,
        }
    }

    #[test]
    fn test_job_context_accessors() {
        let job = job();
        let now = Utc::now();
        let payload = JobPayload::ScoreBrand(ScoreBrandPayload {
            brand_id: Uuid::nil(),
        });
        let ctx = JobContext::new(job.clone(), payload, now);
        assert_eq!(ctx.job_id(), job.id);
        assert_eq!(ctx.attempts(), 2);
        assert_eq!(ctx.now(), now);
    }

    #[test]
    fn test_error_converts_to_retryable_failure() {
        let result: JobResult = Error::Request("connection reset".into()).into();
        assert_eq!(
            result,
            JobResult::Failed("Request error: connection reset".into())
        );
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let handler = NoOpHandler::new(JobStage::ScoreBrand);
        assert_eq!(handler.stage(), JobStage::ScoreBrand);
        assert!(handler.can_handle(JobStage::ScoreBrand));
        assert!(!handler.can_handle(JobStage::IngestEvent));

        let ctx = JobContext::new(
            job(),
            JobPayload::ScoreBrand(ScoreBrandPayload {
                brand_id: Uuid::nil(),
            }),
            Utc::now(),
        );
        assert_eq!(handler.execute(ctx).await, JobResult::Success);
    }

    #[test]
    fn test_wrong_payload_is_permanent() {
        let payload = JobPayload::ScoreBrand(ScoreBrandPayload {
            brand_id: Uuid::nil(),
        });
        let result = wrong_payload(JobStage::VerifyEvent, &payload);
        assert!(matches!(result, JobResult::Permanent(msg) if msg.contains("verify_event")));
    }
}
