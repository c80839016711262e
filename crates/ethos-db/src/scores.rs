//! Brand baseline, category score and snapshot storage.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use ethos_core::{
    BrandSnapshot, CategoryScore, CategoryVector, Error, EvidenceSummary, Result,
    ScoreRepository,
};

/// PostgreSQL implementation of ScoreRepository.
#[derive(Clone)]
pub struct PgScoreRepository {
    pool: Pool<Postgres>,
}

impl PgScoreRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Create or rename a brand and set its baseline.
    pub async fn upsert_brand(&self, id: Uuid, name: &str, baseline: CategoryVector) -> Result<()> {
        sqlx::query(
            "INSERT INTO brands (id, name, baseline) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, baseline = EXCLUDED.baseline",
        )
        .bind(id)
        .bind(name)
        .bind(Json(baseline))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    /// Record evidence counts for the domains not derived from events.
    /// `summary.behavior` is ignored; it is always counted from stored events.
    pub async fn set_evidence(&self, brand_id: Uuid, summary: EvidenceSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO brand_evidence (brand_id, identity, claims, scrutiny, market, updated_at)
             VALUES ($1, $2, $3, $4, $5, NOW())
             ON CONFLICT (brand_id) DO UPDATE
             SET identity = EXCLUDED.identity, claims = EXCLUDED.claims,
                 scrutiny = EXCLUDED.scrutiny, market = EXCLUDED.market,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(brand_id)
        .bind(summary.identity)
        .bind(summary.claims)
        .bind(summary.scrutiny)
        .bind(summary.market)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[async_trait]
impl ScoreRepository for PgScoreRepository {
    async fn baseline(&self, brand_id: Uuid) -> Result<CategoryVector> {
        let baseline: Option<Json<CategoryVector>> =
            sqlx::query_scalar("SELECT baseline FROM brands WHERE id = $1")
                .bind(brand_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(baseline.map(|b| b.0).unwrap_or_default())
    }

    async fn current_scores(&self, brand_id: Uuid) -> Result<Vec<CategoryScore>> {
        let rows = sqlx::query(
            "SELECT brand_id, category, baseline, news, score, event_count, computed_at
             FROM category_scores WHERE brand_id = $1",
        )
        .bind(brand_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut scores = rows
            .into_iter()
            .map(|row| {
                let category: String = row.get("category");
                Ok(CategoryScore {
                    brand_id: row.get("brand_id"),
                    category: category.parse()?,
                    baseline: row.get("baseline"),
                    news: row.get("news"),
                    score: row.get("score"),
                    event_count: row.get("event_count"),
                    computed_at: row.get("computed_at"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        scores.sort_by_key(|s| s.category);
        Ok(scores)
    }

    async fn save_scores(&self, brand_id: Uuid, scores: &[CategoryScore]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        for score in scores {
            if score.brand_id != brand_id {
                return Err(Error::InvalidInput(format!(
                    "score for brand {} saved under brand {}",
                    score.brand_id, brand_id
                )));
            }
            sqlx::query(
                "INSERT INTO category_scores
                    (brand_id, category, baseline, news, score, event_count, computed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (brand_id, category) DO UPDATE
                 SET baseline = EXCLUDED.baseline, news = EXCLUDED.news,
                     score = EXCLUDED.score, event_count = EXCLUDED.event_count,
                     computed_at = EXCLUDED.computed_at",
            )
            .bind(brand_id)
            .bind(score.category.as_str())
            .bind(score.baseline)
            .bind(score.news)
            .bind(score.score)
            .bind(score.event_count)
            .bind(score.computed_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn list_brand_ids(&self) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM brands ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(ids)
    }

    async fn evidence_summary(&self, brand_id: Uuid) -> Result<EvidenceSummary> {
        let row = sqlx::query(
            "SELECT
                COALESCE(e.identity, 0) AS identity,
                (SELECT COUNT(*) FROM brand_events be WHERE be.brand_id = $1) AS behavior,
                COALESCE(e.claims, 0) AS claims,
                COALESCE(e.scrutiny, 0) AS scrutiny,
                COALESCE(e.market, 0) AS market
             FROM (SELECT $1::uuid AS brand_id) b
             LEFT JOIN brand_evidence e ON e.brand_id = b.brand_id",
        )
        .bind(brand_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(EvidenceSummary {
            identity: row.get("identity"),
            behavior: row.get("behavior"),
            claims: row.get("claims"),
            scrutiny: row.get("scrutiny"),
            market: row.get("market"),
        })
    }

    async fn save_snapshot(&self, snapshot: &BrandSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO brand_snapshots (brand_id, snapshot, published_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (brand_id) DO UPDATE
             SET snapshot = EXCLUDED.snapshot, published_at = EXCLUDED.published_at",
        )
        .bind(snapshot.brand_id)
        .bind(Json(snapshot))
        .bind(snapshot.published_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_snapshot(&self, brand_id: Uuid) -> Result<Option<BrandSnapshot>> {
        let snapshot: Option<Json<BrandSnapshot>> =
            sqlx::query_scalar("SELECT snapshot FROM brand_snapshots WHERE brand_id = $1")
                .bind(brand_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(snapshot.map(|s| s.0))
    }
}
