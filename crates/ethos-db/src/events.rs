//! Brand event store implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use ethos_core::{
    BrandEvent, CanonicalSource, CategoryVector, Error, EventRepository, EventSource,
    NewBrandEvent, Result, Verification,
};

const EVENT_COLUMNS: &str = "event_id, brand_id, category, title, occurred_at, severity, \
                             credibility, verification, impact, flagged_for_review, \
                             review_reason, created_at";

/// PostgreSQL implementation of EventRepository.
#[derive(Clone)]
pub struct PgEventRepository {
    pool: Pool<Postgres>,
}

impl PgEventRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_event_row(row: PgRow) -> Result<BrandEvent> {
        let category: String = row.get("category");
        let verification: String = row.get("verification");
        let impact: Json<CategoryVector> = row.get("impact");
        Ok(BrandEvent {
            event_id: row.get("event_id"),
            brand_id: row.get("brand_id"),
            category: category.parse()?,
            title: row.get("title"),
            occurred_at: row.get("occurred_at"),
            severity: row.get("severity"),
            credibility: row.get("credibility"),
            verification: verification.parse()?,
            impact: impact.0,
            flagged_for_review: row.get("flagged_for_review"),
            review_reason: row.get("review_reason"),
            created_at: row.get("created_at"),
            sources: Vec::new(),
        })
    }

    async fn sources_for(&self, event_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<EventSource>>> {
        let rows = sqlx::query(
            "SELECT event_id, canonical_url, domain, added_at FROM event_sources
             WHERE event_id = ANY($1)
             ORDER BY added_at ASC, canonical_url ASC",
        )
        .bind(event_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut by_event: HashMap<Uuid, Vec<EventSource>> = HashMap::new();
        for row in rows {
            let source = EventSource {
                event_id: row.get("event_id"),
                canonical_url: row.get("canonical_url"),
                domain: row.get("domain"),
                added_at: row.get("added_at"),
            };
            by_event.entry(source.event_id).or_default().push(source);
        }
        Ok(by_event)
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn count_recent(&self, brand_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM brand_events WHERE brand_id = $1 AND created_at >= $2",
        )
        .bind(brand_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn upsert_event(&self, event: &NewBrandEvent, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO brand_events
                (event_id, brand_id, category, title, occurred_at, severity, credibility,
                 verification, impact, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event.event_id)
        .bind(event.brand_id)
        .bind(event.category.as_str())
        .bind(&event.title)
        .bind(event.occurred_at)
        .bind(event.severity)
        .bind(event.credibility)
        .bind(event.verification.as_str())
        .bind(Json(event.impact))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn add_source(
        &self,
        event_id: Uuid,
        source: &CanonicalSource,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO event_sources (event_id, canonical_url, domain, added_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (event_id, canonical_url) DO NOTHING",
        )
        .bind(event_id)
        .bind(&source.canonical_url)
        .bind(&source.domain)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn distinct_source_domains(&self, event_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT domain) FROM event_sources WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn escalate_verification(
        &self,
        event_id: Uuid,
        to: Verification,
    ) -> Result<Verification> {
        let stored: Option<String> = sqlx::query_scalar(
            "UPDATE brand_events
             SET verification = CASE
                 WHEN verification_rank($2) > verification_rank(verification) THEN $2
                 ELSE verification
             END
             WHERE event_id = $1
             RETURNING verification",
        )
        .bind(event_id)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        stored
            .ok_or(Error::EventNotFound(event_id))?
            .parse::<Verification>()
    }

    async fn flag_for_review(&self, event_id: Uuid, reason: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE brand_events SET flagged_for_review = TRUE, review_reason = $2
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::EventNotFound(event_id));
        }
        Ok(())
    }

    async fn events_for_brand(&self, brand_id: Uuid) -> Result<Vec<BrandEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM brand_events
             WHERE brand_id = $1
             ORDER BY occurred_at ASC, event_id ASC"
        ))
        .bind(brand_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut events = rows
            .into_iter()
            .map(Self::parse_event_row)
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<Uuid> = events.iter().map(|e| e.event_id).collect();
        let mut sources = self.sources_for(&ids).await?;
        for event in &mut events {
            event.sources = sources.remove(&event.event_id).unwrap_or_default();
        }
        Ok(events)
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<BrandEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM brand_events WHERE event_id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut event = Self::parse_event_row(row)?;
        event.sources = self
            .sources_for(&[event_id])
            .await?
            .remove(&event_id)
            .unwrap_or_default();
        Ok(Some(event))
    }
}
