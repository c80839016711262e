//! Job stages and their strongly-typed payloads.
//!
//! The queue stores `stage` and `payload` as separate columns. [`JobPayload`]
//! pairs them back up so a handler receives exactly one shape per stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{EventCandidate, ScoreDelta};

/// Stage of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Store an adapter candidate as a brand event with its source.
    IngestEvent,
    /// Re-evaluate an event's verification tier from its sources.
    VerifyEvent,
    /// Recompute and persist a brand's category scores.
    ScoreBrand,
    /// Fan a coalesced score change out to followers.
    SendPushForScoreChange,
    /// Publish brand snapshots for score consumers.
    PublishSnapshots,
}

impl JobStage {
    pub const ALL: [JobStage; 5] = [
        JobStage::IngestEvent,
        JobStage::VerifyEvent,
        JobStage::ScoreBrand,
        JobStage::SendPushForScoreChange,
        JobStage::PublishSnapshots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::IngestEvent => "ingest_event",
            JobStage::VerifyEvent => "verify_event",
            JobStage::ScoreBrand => "score_brand",
            JobStage::SendPushForScoreChange => "send_push_for_score_change",
            JobStage::PublishSnapshots => "publish_snapshots",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job stage: {s}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEventPayload {
    pub brand_id: Uuid,
    /// Name of the adapter that produced the candidate.
    pub adapter: String,
    pub candidate: EventCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEventPayload {
    pub event_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBrandPayload {
    pub brand_id: Uuid,
}

/// Merged payload of a coalesced notification job.
///
/// Producers append to `events` atomically; the consumer reads the merged list
/// once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub brand_id: Uuid,
    pub bucket_start: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<ScoreDelta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSnapshotsPayload {
    /// Brands to publish. Empty means every scored brand.
    #[serde(default)]
    pub brand_ids: Vec<Uuid>,
}

/// A job payload, one variant per stage.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    IngestEvent(IngestEventPayload),
    VerifyEvent(VerifyEventPayload),
    ScoreBrand(ScoreBrandPayload),
    SendPushForScoreChange(NotifyPayload),
    PublishSnapshots(PublishSnapshotsPayload),
}

impl JobPayload {
    pub fn stage(&self) -> JobStage {
        match self {
            JobPayload::IngestEvent(_) => JobStage::IngestEvent,
            JobPayload::VerifyEvent(_) => JobStage::VerifyEvent,
            JobPayload::ScoreBrand(_) => JobStage::ScoreBrand,
            JobPayload::SendPushForScoreChange(_) => JobStage::SendPushForScoreChange,
            JobPayload::PublishSnapshots(_) => JobStage::PublishSnapshots,
        }
    }

    /// Serialize the variant body for the `payload` column.
    pub fn to_json(&self) -> Result<JsonValue> {
        let value = match self {
            JobPayload::IngestEvent(p) => serde_json::to_value(p)?,
            JobPayload::VerifyEvent(p) => serde_json::to_value(p)?,
            JobPayload::ScoreBrand(p) => serde_json::to_value(p)?,
            JobPayload::SendPushForScoreChange(p) => serde_json::to_value(p)?,
            JobPayload::PublishSnapshots(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }

    /// Rebuild the typed payload from a stored `(stage, payload)` pair.
    pub fn decode(stage: JobStage, payload: &JsonValue) -> Result<Self> {
        let decoded = match stage {
            JobStage::IngestEvent => {
                JobPayload::IngestEvent(IngestEventPayload::deserialize(payload)?)
            }
            JobStage::VerifyEvent => {
                JobPayload::VerifyEvent(VerifyEventPayload::deserialize(payload)?)
            }
            JobStage::ScoreBrand => JobPayload::ScoreBrand(ScoreBrandPayload::deserialize(payload)?),
            JobStage::SendPushForScoreChange => {
                JobPayload::SendPushForScoreChange(NotifyPayload::deserialize(payload)?)
            }
            JobStage::PublishSnapshots => {
                JobPayload::PublishSnapshots(PublishSnapshotsPayload::deserialize(payload)?)
            }
        };
        Ok(decoded)
    }

    /// Brand this payload concerns, when it concerns exactly one.
    pub fn brand_id(&self) -> Option<Uuid> {
        match self {
            JobPayload::IngestEvent(p) => Some(p.brand_id),
            JobPayload::ScoreBrand(p) => Some(p.brand_id),
            JobPayload::SendPushForScoreChange(p) => Some(p.brand_id),
            JobPayload::VerifyEvent(_) | JobPayload::PublishSnapshots(_) => None,
        }
    }
}
