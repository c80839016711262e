//! Evidence poller.
//!
//! Asks every adapter for recent evidence on every brand and queues one
//! `ingest_event` job per candidate. Adapter failures are logged and skipped;
//! the next poll asks again. Ingestion is idempotent, so overlapping lookback
//! windows only re-queue work that collapses on insert.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use ethos_core::{
    defaults, Clock, EvidenceAdapter, IngestEventPayload, JobPayload, Result, Stores,
    SystemClock,
};

/// Configuration for the evidence poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How far back adapters are asked for evidence.
    pub lookback_days: i64,
    /// Politeness delay between brands, in milliseconds.
    pub inter_brand_delay_ms: u64,
    /// Timeout for one adapter fetch, in seconds.
    pub adapter_timeout_secs: u64,
    /// Interval between polls in the long-lived worker, in seconds.
    pub poll_interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            lookback_days: defaults::EVIDENCE_LOOKBACK_DAYS,
            inter_brand_delay_ms: defaults::INTER_BRAND_DELAY_MS,
            adapter_timeout_secs: defaults::ADAPTER_TIMEOUT_SECS,
            poll_interval_secs: defaults::EVIDENCE_POLL_INTERVAL_SECS,
        }
    }
}

impl PollerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `EVIDENCE_LOOKBACK_DAYS` | `7` | Evidence window per poll |
    /// | `INTER_BRAND_DELAY_MS` | `500` | Delay between brands |
    /// | `ADAPTER_TIMEOUT_SECS` | `15` | Per-fetch timeout |
    /// | `EVIDENCE_POLL_INTERVAL_SECS` | `3600` | Interval between polls |
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
        }
        Self {
            lookback_days: parse::<i64>("EVIDENCE_LOOKBACK_DAYS")
                .unwrap_or(defaults::EVIDENCE_LOOKBACK_DAYS)
                .max(1),
            inter_brand_delay_ms: parse("INTER_BRAND_DELAY_MS")
                .unwrap_or(defaults::INTER_BRAND_DELAY_MS),
            adapter_timeout_secs: parse::<u64>("ADAPTER_TIMEOUT_SECS")
                .unwrap_or(defaults::ADAPTER_TIMEOUT_SECS)
                .max(1),
            poll_interval_secs: parse::<u64>("EVIDENCE_POLL_INTERVAL_SECS")
                .unwrap_or(defaults::EVIDENCE_POLL_INTERVAL_SECS)
                .max(1),
        }
    }

    pub fn with_inter_brand_delay(mut self, ms: u64) -> Self {
        self.inter_brand_delay_ms = ms;
        self
    }

    pub fn with_adapter_timeout(mut self, secs: u64) -> Self {
        self.adapter_timeout_secs = secs;
        self
    }

    pub fn with_lookback_days(mut self, days: i64) -> Self {
        self.lookback_days = days;
        self
    }
}

/// Counters for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub brands: usize,
    pub candidates: usize,
    pub enqueued: usize,
    pub adapter_failures: usize,
}

/// Polls evidence adapters and queues ingestion jobs.
pub struct EvidencePoller {
    stores: Stores,
    adapters: Vec<Arc<dyn EvidenceAdapter>>,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
}

impl EvidencePoller {
    pub fn new(stores: Stores, config: PollerConfig) -> Self {
        Self {
            stores,
            adapters: Vec::new(),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn EvidenceAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn has_adapters(&self) -> bool {
        !self.adapters.is_empty()
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Poll every adapter for every brand once.
    ///
    /// Returns an error only when the brand list or the queue is unavailable.
    #[instrument(skip(self), fields(subsystem = "ingest", component = "poller"))]
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        let brand_ids = self.stores.scores.list_brand_ids().await?;
        let delay = Duration::from_millis(self.config.inter_brand_delay_ms);

        for (idx, brand_id) in brand_ids.iter().enumerate() {
            if idx > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            self.poll_brand(*brand_id, &mut summary).await?;
            summary.brands += 1;
        }

        info!(
            brands = summary.brands,
            candidates = summary.candidates,
            enqueued = summary.enqueued,
            adapter_failures = summary.adapter_failures,
            "Evidence poll finished"
        );
        Ok(summary)
    }

    async fn poll_brand(&self, brand_id: Uuid, summary: &mut PollSummary) -> Result<()> {
        let timeout = Duration::from_secs(self.config.adapter_timeout_secs);

        for adapter in &self.adapters {
            let since = self.clock.now() - ChronoDuration::days(self.config.lookback_days);
            let candidates =
                match tokio::time::timeout(timeout, adapter.fetch_since(brand_id, since)).await {
                    Ok(Ok(candidates)) => candidates,
                    Ok(Err(e)) => {
                        warn!(adapter = adapter.name(), %brand_id, error = %e, "Adapter fetch failed");
                        summary.adapter_failures += 1;
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            adapter = adapter.name(),
                            %brand_id,
                            timeout_secs = self.config.adapter_timeout_secs,
                            "Adapter fetch timed out"
                        );
                        summary.adapter_failures += 1;
                        continue;
                    }
                };

            summary.candidates += candidates.len();
            let now = self.clock.now();
            for candidate in candidates {
                let payload = JobPayload::IngestEvent(IngestEventPayload {
                    brand_id,
                    adapter: adapter.name().to_string(),
                    candidate,
                });
                self.stores.jobs.enqueue(&payload, now, now).await?;
                summary.enqueued += 1;
            }
            debug!(adapter = adapter.name(), %brand_id, "Adapter polled");
        }
        Ok(())
    }
}
