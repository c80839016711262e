//! # ethos-jobs
//!
//! Background job processing for ethos.
//!
//! This crate provides:
//! - A lease-based job engine with retry, backoff and dead-lettering
//! - Stage handlers for ingestion, verification, scoring, notification fan-out
//!   and snapshot publishing
//! - Notification coalescing into per-brand time buckets
//! - The evidence poller, the JSON feed adapter and the push gateway client
//!
//! ## Example
//!
//! ```ignore
//! use ethos_jobs::{handlers::*, WorkerBuilder, WorkerConfig};
//! use ethos_db::Database;
//!
//! let db = Database::connect("postgres://...").await?;
//! let stores = db.stores();
//!
//! let engine = WorkerBuilder::new(stores.jobs.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(IngestHandler::new(stores.clone()))
//!     .with_handler(VerifyHandler::new(stores.clone()))
//!     .build();
//!
//! // One invocation, or `engine.start()` for the long-lived loop.
//! let summary = engine.run_once().await?;
//! println!("{} jobs succeeded", summary.succeeded);
//! ```

pub mod adapters;
pub mod coalescer;
pub mod engine;
pub mod handler;
pub mod handlers;
pub mod poller;
pub mod push;

// Re-export core types
pub use ethos_core::*;

pub use adapters::JsonFeedAdapter;
pub use coalescer::Coalescer;
pub use engine::{JobEngine, RunSummary, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use poller::{EvidencePoller, PollSummary, PollerConfig};
pub use push::{LogOnlySender, WebPushGateway};

/// Default polling interval for the long-lived engine loop (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = ethos_core::defaults::JOB_POLL_INTERVAL_MS;
