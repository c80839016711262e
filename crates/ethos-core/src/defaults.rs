//! Centralized default constants for the ethos system.
//!
//! **This module is the single source of truth** for all shared default values.
//! Crates and the worker binary reference these constants instead of defining
//! their own magic numbers. Environment-driven config structs fall back to them.
//!
//! Organized by domain area.

// =============================================================================
// JOB ENGINE
// =============================================================================

/// Locks older than this are considered abandoned and released.
pub const JOB_STALE_LOCK_SECS: i64 = 120;

/// Maximum number of due jobs selected per invocation.
pub const JOB_BATCH_SIZE: usize = 25;

/// Attempts after which a failing job is moved to the dead-letter store.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Backoff schedule indexed by attempt number (1-based, last entry repeats).
pub const JOB_RETRY_BACKOFF_SECS: [i64; 3] = [1, 5, 30];

/// Default maximum concurrent jobs dispatched from one batch.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default engine tick interval in milliseconds for the long-lived loop.
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

/// Per-job execution timeout in seconds. Kept below the stale lock age so a
/// hung handler is failed by its own worker before the lease is reclaimed.
pub const JOB_TIMEOUT_SECS: u64 = 110;

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// INGESTION
// =============================================================================

/// Events per brand in the trailing flood window above which scoring is
/// suppressed and the event is flagged for review.
pub const FLOOD_THRESHOLD: i64 = 30;

/// Length of the trailing flood window in hours.
pub const FLOOD_WINDOW_HOURS: i64 = 24;

/// Credibility assumed when an adapter does not supply one.
pub const DEFAULT_SOURCE_CREDIBILITY: f64 = 0.7;

/// Impact applied to the hinted category when an adapter supplies no vector.
pub const DEFAULT_CATEGORY_IMPACT: f64 = -1.0;

/// Distinct source domains required to escalate an event to corroborated.
pub const CORROBORATION_MIN_DOMAINS: i64 = 2;

// =============================================================================
// SCORING
// =============================================================================

/// Half-life of an event's contribution, in days.
pub const DECAY_HALF_LIFE_DAYS: f64 = 45.0;

/// Per-category ceiling/floor on the aggregated news vector.
pub const NEWS_VECTOR_CLAMP: f64 = 5.0;

/// Saturation constant for personalized scores.
pub const PERSONALIZE_K: f64 = 1.0;

/// Number of contributions listed per direction in an explanation.
pub const EXPLANATION_TOP_N: usize = 3;

// =============================================================================
// EVIDENCE SUFFICIENCY
// =============================================================================

/// Evidence domains that must be covered before a score may be shown.
pub const SUFFICIENCY_QUORUM: usize = 3;

/// Total number of evidence domains.
pub const EVIDENCE_DOMAIN_COUNT: usize = 5;

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Width of a coalescing bucket in seconds (5 minutes).
pub const COALESCE_BUCKET_SECS: i64 = 300;

/// Quiet window start hour (UTC, inclusive).
pub const QUIET_HOURS_START: u32 = 22;

/// Quiet window end hour (UTC, exclusive).
pub const QUIET_HOURS_END: u32 = 7;

/// Minimum absolute category score change that produces a notification signal.
pub const PUSH_MIN_DELTA: f64 = 0.5;

/// Maximum pushes a single user receives in a rolling 24 hours.
pub const PUSH_MAX_PER_USER_PER_DAY: i64 = 5;

/// Push gateway request timeout in seconds.
pub const PUSH_TIMEOUT_SECS: u64 = 10;

/// Environment variable for the push gateway URL.
pub const ENV_PUSH_GATEWAY_URL: &str = "PUSH_GATEWAY_URL";

/// Environment variable for the push gateway signing secret.
pub const ENV_PUSH_GATEWAY_SECRET: &str = "PUSH_GATEWAY_SECRET";

// =============================================================================
// EVIDENCE POLLING
// =============================================================================

/// Timeout for a single adapter fetch in seconds.
pub const ADAPTER_TIMEOUT_SECS: u64 = 15;

/// Politeness delay between brands while polling adapters.
pub const INTER_BRAND_DELAY_MS: u64 = 500;

/// How far back adapters are asked for evidence on each poll.
pub const EVIDENCE_LOOKBACK_DAYS: i64 = 7;

/// Interval between evidence polls in the long-lived worker, in seconds.
pub const EVIDENCE_POLL_INTERVAL_SECS: u64 = 3_600;

/// Environment variable for the normalized evidence feed URL.
pub const ENV_EVIDENCE_FEED_URL: &str = "EVIDENCE_FEED_URL";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_is_increasing() {
        assert!(JOB_RETRY_BACKOFF_SECS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_job_timeout_below_stale_lock_age() {
        assert!((JOB_TIMEOUT_SECS as i64) < JOB_STALE_LOCK_SECS);
    }

    #[test]
    fn test_quorum_within_domain_count() {
        assert!(SUFFICIENCY_QUORUM <= EVIDENCE_DOMAIN_COUNT);
    }
}
