//! Connection pool sizing for the job engine.
//!
//! Every in-flight job holds at most one connection while it writes its
//! result, and the engine itself needs one more for releasing stale locks,
//! selecting due jobs and leasing. The pool is sized from the worker's
//! concurrency so a full batch never waits on `acquire`.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use ethos_core::{Error, Result};

/// Floor on the pool size, whatever the worker's concurrency.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// How long a job waits for a connection before its store call fails.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Pool configuration options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Wait for a free connection before giving up.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Pool sized for a worker dispatching `max_concurrent` jobs at once:
    /// one connection per in-flight job plus one for the engine's own
    /// lease and bookkeeping queries.
    pub fn for_worker(max_concurrent: usize) -> Self {
        let wanted = u32::try_from(max_concurrent)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        Self::default().max_connections(wanted.max(DEFAULT_MAX_CONNECTIONS))
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Create a new PostgreSQL connection pool with default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Create a new PostgreSQL connection pool with custom configuration.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    info!(
        subsystem = "database",
        component = "pool",
        op = "create",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        "Creating database connection pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Log current pool health metrics.
///
/// Warns when no idle connection is left, which usually means every
/// connection is held by an in-flight job.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "database",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool health check"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = size,
            "Connection pool has no idle connections"
        );
    }
}
