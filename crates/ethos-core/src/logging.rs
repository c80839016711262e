//! Structured logging schema and field name constants for ethos.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation can query by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, retry scheduled or input flagged |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points (lease lost, deferral, eligibility) |
//! | TRACE | Per-item iteration (contributions, recipients) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "database", "jobs", "scoring", "notify", "ingest"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "engine", "pool", "coalescer", "poller"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "lease", "release_stale", "dead_letter", "fan_out"
pub const OPERATION: &str = "op";

/// Identifier of the worker holding a lease.
pub const WORKER_ID: &str = "worker_id";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job stage name.
pub const STAGE: &str = "stage";

/// Brand UUID being operated on.
pub const BRAND_ID: &str = "brand_id";

/// Brand event UUID.
pub const EVENT_ID: &str = "event_id";

/// User UUID receiving a notification.
pub const USER_ID: &str = "user_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Attempts consumed by a job.
pub const ATTEMPTS: &str = "attempts";

/// Number of rows selected, leased, or affected.
pub const ROW_COUNT: &str = "row_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
