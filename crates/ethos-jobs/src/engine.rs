//! Lease-based job engine.
//!
//! One invocation ([`JobEngine::run_once`]) releases stale locks, selects a
//! batch of due jobs, leases each with a conditional update, and dispatches the
//! jobs it won to their stage handlers with bounded concurrency. Any number of
//! engines may run against the same queue; the lease guarantees a job executes
//! on at most one of them at a time.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{FutureExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use ethos_core::{
    defaults, Clock, FailOutcome, Job, JobPayload, JobRepository, JobStage, Result, RetryPolicy,
    SystemClock,
};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::DEFAULT_POLL_INTERVAL_MS;

/// Configuration for the job engine.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Sleep between invocations when the queue is idle, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// Maximum number of due jobs selected per invocation.
    pub batch_size: usize,
    /// Locks older than this are released at the start of each invocation.
    pub stale_lock_secs: i64,
    /// Attempts after which a failing job is dead-lettered.
    pub max_attempts: i32,
    /// Per-job execution timeout in seconds.
    pub job_timeout_secs: u64,
    /// Identity written to `locked_by`. Must be unique per engine.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            batch_size: defaults::JOB_BATCH_SIZE,
            stale_lock_secs: defaults::JOB_STALE_LOCK_SECS,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            worker_id: generate_worker_id(),
        }
    }
}

fn generate_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4().simple())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Idle sleep between invocations |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_BATCH_SIZE` | `25` | Due jobs selected per invocation |
    /// | `JOB_STALE_LOCK_SECS` | `120` | Age after which a lock is reclaimed |
    /// | `JOB_MAX_ATTEMPTS` | `3` | Attempts before dead-lettering |
    /// | `JOB_TIMEOUT_SECS` | `110` | Per-job execution timeout |
    /// | `WORKER_ID` | random | Lease owner identity |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let worker_id = std::env::var("WORKER_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(generate_worker_id);

        Self {
            enabled,
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS").unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            max_concurrent_jobs: env_parse::<usize>("JOB_MAX_CONCURRENT")
                .unwrap_or(defaults::JOB_MAX_CONCURRENT)
                .max(1),
            batch_size: env_parse::<usize>("JOB_BATCH_SIZE")
                .unwrap_or(defaults::JOB_BATCH_SIZE)
                .max(1),
            stale_lock_secs: env_parse("JOB_STALE_LOCK_SECS")
                .unwrap_or(defaults::JOB_STALE_LOCK_SECS),
            max_attempts: env_parse::<i32>("JOB_MAX_ATTEMPTS")
                .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
                .max(1),
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS").unwrap_or(defaults::JOB_TIMEOUT_SECS),
            worker_id,
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Set the number of due jobs selected per invocation.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_stale_lock_secs(mut self, secs: i64) -> Self {
        self.stale_lock_secs = secs;
        self
    }

    pub fn with_max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Per-job timeout actually applied: `job_timeout_secs`, capped one
    /// second below the stale lock age so a running job is never reclaimed.
    pub fn effective_job_timeout(&self) -> Duration {
        let below_stale = (self.stale_lock_secs.max(2) - 1) as u64;
        Duration::from_secs(self.job_timeout_secs.min(below_stale).max(1))
    }
}

/// Event emitted by the job engine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A leased job was handed to its handler.
    JobStarted { job_id: Uuid, stage: JobStage },
    /// A job completed successfully and was removed.
    JobCompleted { job_id: Uuid, stage: JobStage },
    /// A job failed and was rescheduled.
    JobRetrying {
        job_id: Uuid,
        stage: JobStage,
        attempts: i32,
        error: String,
    },
    /// A job was moved to the dead-letter store.
    JobDeadLettered {
        job_id: Uuid,
        stage: JobStage,
        error: String,
    },
    /// A handler asked for its job to run later.
    JobDeferred {
        job_id: Uuid,
        stage: JobStage,
        until: DateTime<Utc>,
    },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Counters for one engine invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Stale locks released before selection.
    pub released: u64,
    /// Due jobs selected.
    pub selected: usize,
    /// Jobs this engine won the lease on.
    pub leased: usize,
    /// Jobs another worker leased first, or whose lease was reclaimed mid-run.
    pub lost: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub deferred: usize,
    /// Jobs whose outcome could not be recorded; their locks go stale.
    pub errors: usize,
}

/// Terminal state of a single dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Retried,
    DeadLettered,
    Deferred,
    LeaseLost,
    StoreError,
}

impl RunSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::LeaseLost => self.lost += 1,
            Outcome::StoreError => self.errors += 1,
        }
    }
}

/// Handle for controlling a running engine.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| ethos_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job engine that leases and executes jobs from the queue.
pub struct JobEngine {
    jobs: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    policy: RetryPolicy,
    handlers: HashMap<JobStage, Arc<dyn JobHandler>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobEngine {
    /// Create a new engine reading time from the system clock.
    pub fn new(jobs: Arc<dyn JobRepository>, config: WorkerConfig) -> Self {
        Self::with_clock(jobs, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        jobs: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let policy = RetryPolicy::default().with_max_attempts(config.max_attempts);
        Self {
            jobs,
            clock,
            config,
            policy,
            handlers: HashMap::new(),
            event_tx,
        }
    }

    /// Register a handler for a stage, replacing any previous one.
    pub fn register_handler<H: JobHandler + 'static>(&mut self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    fn register_arc(&mut self, handler: Arc<dyn JobHandler>) {
        let stage = handler.stage();
        self.handlers.insert(stage, handler);
        debug!(%stage, "Registered job handler");
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Run one engine invocation.
    ///
    /// Returns after every job leased in this invocation has reached a terminal
    /// state for this attempt. Errors are returned only when the queue cannot be
    /// read at all; per-job bookkeeping failures are counted in
    /// [`RunSummary::errors`].
    #[instrument(skip(self), fields(subsystem = "jobs", component = "engine", worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let now = self.clock.now();

        let cutoff = now - ChronoDuration::seconds(self.config.stale_lock_secs);
        summary.released = self.jobs.release_stale_locks(cutoff).await?;
        if summary.released > 0 {
            warn!(
                op = "release_stale",
                row_count = summary.released,
                "Released stale job locks"
            );
        }

        let due = self
            .jobs
            .select_due(now, self.config.batch_size as i64)
            .await?;
        summary.selected = due.len();
        if due.is_empty() {
            return Ok(summary);
        }

        // Lease each job only when a slot frees up, so a lease never ages
        // while its job waits behind others in this batch.
        let dispatched: Vec<(bool, Outcome)> = futures::stream::iter(due)
            .map(|candidate| self.lease_and_execute(candidate))
            .buffer_unordered(self.config.max_concurrent_jobs.max(1))
            .collect()
            .await;
        for (leased, outcome) in dispatched {
            if leased {
                summary.leased += 1;
            }
            summary.record(outcome);
        }

        info!(
            selected = summary.selected,
            leased = summary.leased,
            lost = summary.lost,
            succeeded = summary.succeeded,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            deferred = summary.deferred,
            "Engine invocation finished"
        );
        Ok(summary)
    }

    /// Claim `candidate` and, if this engine won it, execute it. The first
    /// element reports whether the lease was won.
    async fn lease_and_execute(&self, candidate: Job) -> (bool, Outcome) {
        match self
            .jobs
            .try_lease(candidate.id, &self.config.worker_id, self.clock.now())
            .await
        {
            Ok(Some(job)) => (true, self.execute_job(job).await),
            Ok(None) => {
                debug!(op = "lease", job_id = %candidate.id, "Lease lost to another worker");
                (false, Outcome::LeaseLost)
            }
            Err(e) => {
                error!(op = "lease", job_id = %candidate.id, error = %e, "Lease attempt failed");
                (false, Outcome::StoreError)
            }
        }
    }

    /// Execute a single leased job and record its outcome.
    async fn execute_job(&self, job: Job) -> Outcome {
        let start = Instant::now();
        let job_id = job.id;
        let stage = job.stage;

        let payload = match JobPayload::decode(stage, &job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%job_id, %stage, error = %e, "Undecodable job payload");
                return self
                    .record_result(job_id, stage, JobResult::Permanent(e.to_string()), start)
                    .await;
            }
        };

        let Some(handler) = self.handlers.get(&stage).cloned() else {
            warn!(%stage, "No handler registered for stage");
            let result = JobResult::Failed(format!("No handler for stage: {stage}"));
            return self.record_result(job_id, stage, result, start).await;
        };

        debug!(%job_id, %stage, attempts = job.attempts, "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted { job_id, stage });

        let ctx = JobContext::new(job, payload, self.clock.now());
        let timeout = self.config.effective_job_timeout();
        let guarded = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();
        let result = match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(%job_id, %stage, "Job handler panicked");
                JobResult::Failed("handler panicked".into())
            }
            Err(_) => {
                warn!(
                    %job_id,
                    %stage,
                    "Job exceeded timeout of {}s", timeout.as_secs()
                );
                JobResult::Failed(format!("Job exceeded timeout of {}s", timeout.as_secs()))
            }
        };

        self.record_result(job_id, stage, result, start).await
    }

    /// Apply a handler result to the queue. Every write is conditional on this
    /// engine still holding the lease.
    async fn record_result(
        &self,
        job_id: Uuid,
        stage: JobStage,
        result: JobResult,
        start: Instant,
    ) -> Outcome {
        let worker_id = self.config.worker_id.as_str();
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            JobResult::Success => match self.jobs.complete(job_id, worker_id).await {
                Ok(true) => {
                    info!(%job_id, %stage, duration_ms, "Job completed successfully");
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::JobCompleted { job_id, stage });
                    Outcome::Succeeded
                }
                Ok(false) => lease_lost(job_id, stage),
                Err(e) => {
                    error!(error = %e, %job_id, "Failed to mark job as completed");
                    Outcome::StoreError
                }
            },
            JobResult::Failed(message) => {
                match self
                    .jobs
                    .fail(job_id, worker_id, &message, self.clock.now(), &self.policy)
                    .await
                {
                    Ok(FailOutcome::Retrying { attempts, retry_at }) => {
                        warn!(
                            %job_id,
                            %stage,
                            attempts,
                            %retry_at,
                            error = %message,
                            duration_ms,
                            "Job failed, retry scheduled"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobRetrying {
                            job_id,
                            stage,
                            attempts,
                            error: message,
                        });
                        Outcome::Retried
                    }
                    Ok(FailOutcome::DeadLettered { attempts }) => {
                        error!(
                            %job_id,
                            %stage,
                            attempts,
                            error = %message,
                            "Job exhausted its attempts and was dead-lettered"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobDeadLettered {
                            job_id,
                            stage,
                            error: message,
                        });
                        Outcome::DeadLettered
                    }
                    Ok(FailOutcome::LeaseLost) => lease_lost(job_id, stage),
                    Err(e) => {
                        error!(error = %e, %job_id, "Failed to mark job as failed");
                        Outcome::StoreError
                    }
                }
            }
            JobResult::Permanent(message) => {
                match self
                    .jobs
                    .dead_letter_now(job_id, worker_id, &message, self.clock.now())
                    .await
                {
                    Ok(true) => {
                        error!(
                            %job_id,
                            %stage,
                            error = %message,
                            "Job failed permanently and was dead-lettered"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobDeadLettered {
                            job_id,
                            stage,
                            error: message,
                        });
                        Outcome::DeadLettered
                    }
                    Ok(false) => lease_lost(job_id, stage),
                    Err(e) => {
                        error!(error = %e, %job_id, "Failed to dead-letter job");
                        Outcome::StoreError
                    }
                }
            }
            JobResult::Defer { until, reason } => {
                match self.jobs.defer(job_id, worker_id, until).await {
                    Ok(true) => {
                        debug!(%job_id, %stage, %until, %reason, "Job deferred");
                        let _ = self
                            .event_tx
                            .send(WorkerEvent::JobDeferred { job_id, stage, until });
                        Outcome::Deferred
                    }
                    Ok(false) => lease_lost(job_id, stage),
                    Err(e) => {
                        error!(error = %e, %job_id, "Failed to defer job");
                        Outcome::StoreError
                    }
                }
            }
        }
    }

    /// Start the long-lived loop and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let engine = Arc::new(self);
        tokio::spawn(async move {
            engine.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Invoke [`run_once`](Self::run_once) repeatedly. Sleeps only when an
    /// invocation leased nothing.
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            batch_size = self.config.batch_size,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let busy = match self.run_once().await {
                Ok(summary) => summary.leased > 0,
                Err(e) => {
                    error!(error = %e, "Engine invocation failed");
                    false
                }
            };

            if !busy {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }
}

fn lease_lost(job_id: Uuid, stage: JobStage) -> Outcome {
    warn!(%job_id, %stage, "Lease was reclaimed before the outcome was recorded");
    Outcome::LeaseLost
}

/// Builder for creating a job engine with handlers.
pub struct WorkerBuilder {
    jobs: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs,
            clock: Arc::new(SystemClock),
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Build and return the engine.
    pub fn build(self) -> JobEngine {
        let mut engine = JobEngine::with_clock(self.jobs, self.clock, self.config);
        for handler in self.handlers {
            engine.register_arc(handler);
        }
        engine
    }
}
