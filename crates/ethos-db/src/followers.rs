//! Followers, user weights and the push log.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use ethos_core::{
    Category, CategoryVector, Error, Follower, FollowerRepository, PushSubscription, Result,
    UserWeights,
};

/// PostgreSQL implementation of FollowerRepository.
#[derive(Clone)]
pub struct PgFollowerRepository {
    pool: Pool<Postgres>,
}

impl PgFollowerRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn set_user_weights(&self, weights: &UserWeights) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_weights (user_id, weights, dealbreakers, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (user_id) DO UPDATE
             SET weights = EXCLUDED.weights, dealbreakers = EXCLUDED.dealbreakers,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(weights.user_id)
        .bind(Json(weights.weights))
        .bind(Json(&weights.dealbreakers))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    /// Start following a brand, or update an existing follow.
    pub async fn upsert_follower(&self, follower: &Follower) -> Result<()> {
        self.set_user_weights(&follower.weights).await?;
        sqlx::query(
            "INSERT INTO followers
                (user_id, brand_id, endpoint, p256dh, auth, min_delta, notifications_enabled)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (user_id, brand_id) DO UPDATE
             SET endpoint = EXCLUDED.endpoint, p256dh = EXCLUDED.p256dh, auth = EXCLUDED.auth,
                 min_delta = EXCLUDED.min_delta,
                 notifications_enabled = EXCLUDED.notifications_enabled",
        )
        .bind(follower.user_id)
        .bind(follower.brand_id)
        .bind(&follower.subscription.endpoint)
        .bind(&follower.subscription.p256dh)
        .bind(&follower.subscription.auth)
        .bind(follower.min_delta)
        .bind(follower.notifications_enabled)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

#[async_trait]
impl FollowerRepository for PgFollowerRepository {
    async fn followers_for_brand(&self, brand_id: Uuid) -> Result<Vec<Follower>> {
        let rows = sqlx::query(
            "SELECT f.user_id, f.brand_id, f.endpoint, f.p256dh, f.auth, f.min_delta,
                    f.notifications_enabled, w.weights, w.dealbreakers
             FROM followers f
             LEFT JOIN user_weights w ON w.user_id = f.user_id
             WHERE f.brand_id = $1
             ORDER BY f.created_at, f.user_id",
        )
        .bind(brand_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let user_id: Uuid = row.get("user_id");
                let weights: Option<Json<CategoryVector>> = row.get("weights");
                let dealbreakers: Option<Json<HashMap<Category, f64>>> = row.get("dealbreakers");
                let weights = match weights {
                    Some(w) => UserWeights {
                        user_id,
                        weights: w.0,
                        dealbreakers: dealbreakers.map(|d| d.0).unwrap_or_default(),
                    },
                    None => UserWeights::uniform(user_id),
                };
                Follower {
                    user_id,
                    brand_id: row.get("brand_id"),
                    subscription: PushSubscription {
                        endpoint: row.get("endpoint"),
                        p256dh: row.get("p256dh"),
                        auth: row.get("auth"),
                    },
                    weights,
                    min_delta: row.get("min_delta"),
                    notifications_enabled: row.get("notifications_enabled"),
                }
            })
            .collect())
    }

    async fn user_weights(&self, user_id: Uuid) -> Result<Option<UserWeights>> {
        let row = sqlx::query("SELECT weights, dealbreakers FROM user_weights WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(|row| {
            let weights: Json<CategoryVector> = row.get("weights");
            let dealbreakers: Json<HashMap<Category, f64>> = row.get("dealbreakers");
            UserWeights {
                user_id,
                weights: weights.0,
                dealbreakers: dealbreakers.0,
            }
        }))
    }

    async fn pushes_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM push_log WHERE user_id = $1 AND sent_at >= $2",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn record_push(&self, user_id: Uuid, brand_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO push_log (user_id, brand_id, sent_at) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(brand_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}
