//! Evidence adapters.
//!
//! Third-party parsing lives outside this crate. [`JsonFeedAdapter`] reads a
//! feed that already serves normalized [`EventCandidate`]s, which is the
//! contract every upstream integration is expected to meet.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use ethos_core::{defaults, Error, EventCandidate, EvidenceAdapter, Result};

/// Adapter for a normalized JSON evidence feed.
///
/// Requests `GET <base_url>?brand_id=<uuid>&since=<rfc3339>` and expects a JSON
/// array of candidates.
pub struct JsonFeedAdapter {
    name: String,
    client: reqwest::Client,
    base_url: String,
}

impl JsonFeedAdapter {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into(),
        })
    }

    /// Create from `EVIDENCE_FEED_URL`; `None` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(defaults::ENV_EVIDENCE_FEED_URL) {
            Ok(url) if !url.trim().is_empty() => Self::new(
                "json_feed",
                url.trim(),
                Duration::from_secs(defaults::ADAPTER_TIMEOUT_SECS),
            )
            .map(Some),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl EvidenceAdapter for JsonFeedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_since(
        &self,
        brand_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EventCandidate>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("brand_id", brand_id.to_string()),
                ("since", since.to_rfc3339()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Adapter(format!(
                "{} returned {status} for brand {brand_id}",
                self.name
            )));
        }

        let candidates: Vec<EventCandidate> = response
            .json()
            .await
            .map_err(|e| Error::Adapter(format!("{} sent an unreadable feed: {e}", self.name)))?;
        debug!(adapter = %self.name, %brand_id, row_count = candidates.len(), "Fetched evidence");
        Ok(candidates)
    }
}
