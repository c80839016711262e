//! Stage handlers.
//!
//! One handler per [`JobStage`](ethos_core::JobStage). Every handler is
//! idempotent: a job that crashed mid-way is run again from the start once its
//! lease goes stale.

pub mod ingest;
pub mod notify;
pub mod score;
pub mod snapshots;
pub mod verify;

pub use ingest::{FloodControl, IngestHandler};
pub use notify::{NotifyConfig, NotifyHandler};
pub use score::ScoreHandler;
pub use snapshots::SnapshotHandler;
pub use verify::VerifyHandler;
