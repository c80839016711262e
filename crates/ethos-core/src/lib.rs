//! # ethos-core
//!
//! Core types, traits, and the scoring engine for ethos.
//!
//! This crate provides the domain model, typed job payloads, repository
//! traits, and the pure algorithms (scoring, evidence sufficiency, schedule
//! math) that the database and job crates build on.

pub mod clock;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod payload;
pub mod schedule;
pub mod scoring;
pub mod sources;
pub mod sufficiency;
pub mod traits;

// Re-export commonly used types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use models::*;
pub use payload::*;
pub use schedule::{age_days, bucket_start, coalesce_key, QuietHours, RetryPolicy};
pub use scoring::{
    decay, personalize, Contribution, Explanation, ExplanationItem, Magnitude,
    PersonalizedScore, ScoreReport, ScoringConfig, ScoringEngine,
};
pub use sources::{canonicalize_url, event_fingerprint, CanonicalSource};
pub use sufficiency::{EvidenceDomain, Recommendation, SufficiencyReport};
pub use traits::*;
