//! Time arithmetic for retries, quiet hours and coalescing buckets.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};

use crate::defaults;

/// Retry policy for failed jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which the job is dead-lettered.
    pub max_attempts: i32,
    /// Delay per attempt number (1-based). The last entry repeats.
    pub backoff_secs: Vec<i64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            backoff_secs: defaults::JOB_RETRY_BACKOFF_SECS.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before the next run after `attempts` failures.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let idx = (attempts.max(1) - 1) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::seconds(secs)
    }

    /// Whether a job with `attempts` recorded failures is exhausted.
    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Daily UTC window during which pushes are held back.
///
/// `start_hour` is inclusive, `end_hour` exclusive. A window whose start is
/// after its end wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            start_hour: defaults::QUIET_HOURS_START,
            end_hour: defaults::QUIET_HOURS_END,
        }
    }
}

impl QuietHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// The next `end_hour:00` UTC strictly after `at`.
    pub fn next_end(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let end = NaiveTime::from_hms_opt(self.end_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        let today = Utc.from_utc_datetime(&at.date_naive().and_time(end));
        if today > at {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

/// Start of the fixed-width bucket containing `at`.
pub fn bucket_start(at: DateTime<Utc>, width_secs: i64) -> DateTime<Utc> {
    let width = width_secs.max(1);
    let secs = at.timestamp().div_euclid(width) * width;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(at)
}

/// Coalescing key for a brand and bucket.
pub fn coalesce_key(brand_id: uuid::Uuid, bucket_start: DateTime<Utc>) -> String {
    format!("{}:{}", brand_id, bucket_start.timestamp())
}

/// Age of `occurred_at` at `now`, in fractional days. Negative for future dates.
pub fn age_days(occurred_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - occurred_at).num_milliseconds() as f64 / 86_400_000.0
}
