//! Job queue repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use ethos_core::{
    DeadJob, Error, FailOutcome, Job, JobPayload, JobRepository, JobStage, NotifyPayload,
    QueueStats, Result, RetryPolicy, ScoreDelta,
};

const JOB_COLUMNS: &str = "id, stage, payload, not_before, locked_by, locked_at, attempts, \
                           last_error, coalesce_key, created_at";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: PgRow) -> Result<Job> {
        let stage: String = row.get("stage");
        Ok(Job {
            id: row.get("id"),
            stage: stage.parse::<JobStage>()?,
            payload: row.get("payload"),
            not_before: row.get("not_before"),
            locked_by: row.get("locked_by"),
            locked_at: row.get("locked_at"),
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            coalesce_key: row.get("coalesce_key"),
            created_at: row.get("created_at"),
        })
    }

    fn parse_dead_row(row: PgRow) -> Result<DeadJob> {
        let stage: String = row.get("stage");
        Ok(DeadJob {
            id: row.get("id"),
            stage: stage.parse::<JobStage>()?,
            payload: row.get("payload"),
            not_before: row.get("not_before"),
            locked_by: row.get("locked_by"),
            locked_at: row.get("locked_at"),
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            coalesce_key: row.get("coalesce_key"),
            original_created_at: row.get("original_created_at"),
            dead_at: row.get("dead_at"),
        })
    }

    /// Copy `job` into the dead-letter store and remove it from the queue,
    /// inside the caller's transaction.
    async fn archive(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        job: &Job,
        dead_at: DateTime<Utc>,
    ) -> Result<()> {
        let dead = DeadJob::from_job(job, dead_at);
        sqlx::query(
            "INSERT INTO dead_jobs (id, stage, payload, not_before, locked_by, locked_at,
                                    attempts, last_error, coalesce_key, original_created_at, dead_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(dead.id)
        .bind(dead.stage.as_str())
        .bind(&dead.payload)
        .bind(dead.not_before)
        .bind(&dead.locked_by)
        .bind(dead.locked_at)
        .bind(dead.attempts)
        .bind(&dead.last_error)
        .bind(&dead.coalesce_key)
        .bind(dead.original_created_at)
        .bind(dead.dead_at)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    /// Fetch and row-lock a job still held by `worker_id`.
    async fn fetch_held(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
        worker_id: &str,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND locked_by = $2 FOR UPDATE"
        ))
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(
        &self,
        payload: &JobPayload,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO jobs (id, stage, payload, not_before, attempts, created_at)
             VALUES ($1, $2, $3, $4, 0, $5)",
        )
        .bind(id)
        .bind(payload.stage().as_str())
        .bind(payload.to_json()?)
        .bind(not_before)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
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
        let payload = JobPayload::SendPushForScoreChange(NotifyPayload {
            brand_id,
            bucket_start,
            events: events.to_vec(),
        })
        .to_json()?;

        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT enqueue_coalesced_notification($1, $2, $3, $4, $5)")
                .bind(Uuid::now_v7())
                .bind(coalesce_key)
                .bind(payload)
                .bind(not_before)
                .bind(now)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;

        id.ok_or_else(|| {
            Error::Job(format!(
                "notification job {coalesce_key} is already being delivered"
            ))
        })
    }

    async fn release_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET locked_by = NULL, locked_at = NULL
             WHERE locked_by IS NOT NULL AND locked_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let released = result.rows_affected();
        if released > 0 {
            warn!(
                subsystem = "database",
                component = "jobs",
                op = "release_stale",
                row_count = released,
                "Released stale job locks"
            );
        }
        Ok(released)
    }

    async fn select_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE locked_by IS NULL AND not_before <= $1
             ORDER BY created_at ASC, id ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn try_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "UPDATE jobs SET locked_by = $2, locked_at = $3
             WHERE id = $1 AND locked_by IS NULL AND not_before <= $3
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if row.is_none() {
            debug!(
                subsystem = "database",
                component = "jobs",
                op = "lease",
                job_id = %id,
                worker_id,
                "Lease lost to another worker"
            );
        }
        row.map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND locked_by = $2")
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let Some(mut job) = Self::fetch_held(&mut tx, id, worker_id).await? else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(FailOutcome::LeaseLost);
        };

        job.attempts += 1;
        job.last_error = Some(error.to_string());

        let outcome = if policy.is_exhausted(job.attempts) {
            Self::archive(&mut tx, &job, now).await?;
            FailOutcome::DeadLettered {
                attempts: job.attempts,
            }
        } else {
            let retry_at = now + policy.backoff(job.attempts);
            sqlx::query(
                "UPDATE jobs
                 SET attempts = $2, last_error = $3, not_before = $4,
                     locked_by = NULL, locked_at = NULL
                 WHERE id = $1",
            )
            .bind(id)
            .bind(job.attempts)
            .bind(error)
            .bind(retry_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            FailOutcome::Retrying {
                attempts: job.attempts,
                retry_at,
            }
        };

        tx.commit().await.map_err(Error::Database)?;
        Ok(outcome)
    }

    async fn dead_letter_now(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let Some(mut job) = Self::fetch_held(&mut tx, id, worker_id).await? else {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(false);
        };

        job.attempts += 1;
        job.last_error = Some(error.to_string());
        Self::archive(&mut tx, &job, now).await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(true)
    }

    async fn defer(&self, id: Uuid, worker_id: &str, not_before: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET not_before = $3, locked_by = NULL, locked_at = NULL
             WHERE id = $1 AND locked_by = $2",
        )
        .bind(id)
        .bind(worker_id)
        .bind(not_before)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadJob>> {
        let rows = sqlx::query(
            "SELECT id, stage, payload, not_before, locked_by, locked_at, attempts, last_error,
                    coalesce_key, original_created_at, dead_at
             FROM dead_jobs ORDER BY dead_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_dead_row).collect()
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE locked_by IS NULL AND not_before <= $1) AS due,
                COUNT(*) FILTER (WHERE locked_by IS NULL AND not_before > $1) AS scheduled,
                COUNT(*) FILTER (WHERE locked_by IS NOT NULL) AS locked,
                (SELECT COUNT(*) FROM dead_jobs) AS dead,
                COUNT(*) AS total
             FROM jobs",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            due: row.get::<i64, _>("due"),
            scheduled: row.get::<i64, _>("scheduled"),
            locked: row.get::<i64, _>("locked"),
            dead: row.get::<i64, _>("dead"),
            total: row.get::<i64, _>("total"),
        })
    }
}
