//! # ethos-db
//!
//! Storage layer for ethos.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL repositories for the job queue, event store, scores and followers
//! - The atomic coalescing procedure for notification jobs (see `migrations/`)
//! - An in-memory store implementing the same traits for tests and local runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use ethos_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/ethos").await?;
//!     db.migrate().await?;
//!     let stores = db.stores();
//!     let stats = stores.jobs.queue_stats(chrono::Utc::now()).await?;
//!     println!("{} jobs due", stats.due);
//!     Ok(())
//! }
//! ```
pub mod events;
pub mod followers;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod scores;

// Test fixtures for integration tests
// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use ethos_core::*;

pub use events::PgEventRepository;
pub use followers::PgFollowerRepository;
pub use jobs::PgJobRepository;
pub use memory::{MemoryStore, PushRecord};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use scores::PgScoreRepository;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job queue and dead-letter store.
    pub jobs: PgJobRepository,
    /// Brand events and their sources.
    pub events: PgEventRepository,
    /// Baselines, category scores and snapshots.
    pub scores: PgScoreRepository,
    /// Followers, user weights and push log.
    pub followers: PgFollowerRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            events: PgEventRepository::new(pool.clone()),
            scores: PgScoreRepository::new(pool.clone()),
            followers: PgFollowerRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// The repositories as trait objects, for handlers and the engine.
    pub fn stores(&self) -> Stores {
        Stores {
            jobs: Arc::new(self.jobs.clone()),
            events: Arc::new(self.events.clone()),
            scores: Arc::new(self.scores.clone()),
            followers: Arc::new(self.followers.clone()),
        }
    }
}
