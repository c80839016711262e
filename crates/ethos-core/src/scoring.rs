//! Deterministic brand scoring.
//!
//! A brand's score per category is its baseline plus a news vector: the sum of
//! every qualifying event's decayed, trust-weighted impact, clamped to
//! `±NEWS_VECTOR_CLAMP`. Personalization folds category scores through a
//! user's weights into a 0-100 number with `tanh` saturation.
//!
//! ```text
//! decay        = exp(-ageDays · ln2 / halfLife)
//! contribution = impact[c] × severity × credibility × verification.factor() × decay
//! news[c]      = clamp(Σ contribution, -5, +5)
//! score[c]     = baseline[c] + news[c]
//! final        = round(50 + 50 · tanh(Σ weight[c]·score[c] / k))
//! ```

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{BrandEvent, Category, CategoryScore, CategoryVector, UserWeights};
use crate::schedule::age_days;

/// Tunable scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringConfig {
    pub half_life_days: f64,
    pub news_clamp: f64,
    pub personalize_k: f64,
    pub explanation_top_n: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            half_life_days: defaults::DECAY_HALF_LIFE_DAYS,
            news_clamp: defaults::NEWS_VECTOR_CLAMP,
            personalize_k: defaults::PERSONALIZE_K,
            explanation_top_n: defaults::EXPLANATION_TOP_N,
        }
    }
}

/// Continuous half-life decay with the default 45-day half-life.
pub fn decay(age_days: f64) -> f64 {
    decay_with_half_life(age_days, defaults::DECAY_HALF_LIFE_DAYS)
}

pub fn decay_with_half_life(age_days: f64, half_life_days: f64) -> f64 {
    (-age_days * std::f64::consts::LN_2 / half_life_days).exp()
}

/// Map a raw weighted score onto 0-100.
///
/// `0` maps to `50`; large magnitudes approach but never pass `0`/`100`.
pub fn personalize(raw_score: f64, k: f64) -> u8 {
    let scaled = 50.0 + 50.0 * (raw_score / k).tanh();
    scaled.round().clamp(0.0, 100.0) as u8
}

/// One event's effect on one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub event_id: Uuid,
    pub title: String,
    pub category: Category,
    pub value: f64,
}

/// Narrative size bucket for a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Magnitude {
    Minimal,
    Slight,
    Moderate,
    Significant,
}

impl Magnitude {
    pub fn of(value: f64) -> Self {
        let v = value.abs();
        if v < 0.25 {
            Magnitude::Minimal
        } else if v < 1.0 {
            Magnitude::Slight
        } else if v < 2.5 {
            Magnitude::Moderate
        } else {
            Magnitude::Significant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Magnitude::Minimal => "minimal",
            Magnitude::Slight => "slight",
            Magnitude::Moderate => "moderate",
            Magnitude::Significant => "significant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationItem {
    pub event_id: Uuid,
    pub category: Category,
    pub value: f64,
    pub magnitude: Magnitude,
    pub text: String,
}

impl ExplanationItem {
    fn from_contribution(c: &Contribution) -> Self {
        let magnitude = Magnitude::of(c.value);
        let direction = if c.value >= 0.0 { "positive" } else { "negative" };
        Self {
            event_id: c.event_id,
            category: c.category,
            value: c.value,
            magnitude,
            text: format!(
                "{}: {} {} impact on {}",
                c.title,
                magnitude.as_str(),
                direction,
                c.category
            ),
        }
    }
}

/// Top positive and negative drivers of a brand's score.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Explanation {
    pub baseline_only: bool,
    pub positive: Vec<ExplanationItem>,
    pub negative: Vec<ExplanationItem>,
}

/// Build an explanation from contributions, keeping the `top_n` largest by
/// absolute value in each direction.
pub fn explain(contributions: &[Contribution], top_n: usize) -> Explanation {
    let by_magnitude = |a: &&Contribution, b: &&Contribution| {
        b.value
            .abs()
            .partial_cmp(&a.value.abs())
            .unwrap_or(Ordering::Equal)
    };

    let mut positive: Vec<&Contribution> = contributions.iter().filter(|c| c.value > 0.0).collect();
    let mut negative: Vec<&Contribution> = contributions.iter().filter(|c| c.value < 0.0).collect();
    positive.sort_by(by_magnitude);
    negative.sort_by(by_magnitude);

    Explanation {
        baseline_only: contributions.is_empty(),
        positive: positive
            .into_iter()
            .take(top_n)
            .map(ExplanationItem::from_contribution)
            .collect(),
        negative: negative
            .into_iter()
            .take(top_n)
            .map(ExplanationItem::from_contribution)
            .collect(),
    }
}

/// Scores for one brand plus everything needed to explain them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub brand_id: Uuid,
    pub baseline: CategoryVector,
    pub news: CategoryVector,
    pub scores: Vec<CategoryScore>,
    /// True when no events qualified; scores equal the baseline.
    pub baseline_only: bool,
    pub contributions: Vec<Contribution>,
    pub explanation: Explanation,
}

impl ScoreReport {
    /// `baseline + news` per category.
    pub fn score_vector(&self) -> CategoryVector {
        let mut v = CategoryVector::default();
        for s in &self.scores {
            v.set(s.category, s.score);
        }
        v
    }
}

/// A user's view of a brand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalizedScore {
    pub raw: f64,
    pub final_score: u8,
    /// Categories whose dealbreaker threshold was crossed.
    pub dealbreakers: Vec<Category>,
}

impl PersonalizedScore {
    pub fn dealbreaker_triggered(&self) -> bool {
        !self.dealbreakers.is_empty()
    }
}

/// Categories where `score[c] < -threshold[c]`.
pub fn triggered_dealbreakers(scores: &CategoryVector, weights: &UserWeights) -> Vec<Category> {
    let mut hits: Vec<Category> = weights
        .dealbreakers
        .iter()
        .filter(|(category, threshold)| scores.get(**category) < -**threshold)
        .map(|(category, _)| *category)
        .collect();
    hits.sort();
    hits
}

/// Stateless scoring engine.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Contribution of `event` to `category` at `now`.
    ///
    /// Events dated after `now` are rejected: decay at a negative age is not
    /// defined.
    pub fn event_contribution(
        &self,
        event: &BrandEvent,
        category: Category,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let age = age_days(event.occurred_at, now);
        if age < 0.0 {
            return Err(Error::InvalidInput(format!(
                "event {} is dated in the future ({})",
                event.event_id, event.occurred_at
            )));
        }

        let impact = event.impact.get(category);
        let severity = event.severity.clamp(0.0, 1.0);
        let credibility = event.credibility.clamp(0.0, 1.0);
        let verification = event.verification.factor();
        let decay = decay_with_half_life(age, self.config.half_life_days);

        Ok(impact * severity * credibility * verification * decay)
    }

    /// Score a brand from its baseline and events.
    pub fn score(
        &self,
        brand_id: Uuid,
        baseline: CategoryVector,
        events: &[BrandEvent],
        now: DateTime<Utc>,
    ) -> Result<ScoreReport> {
        let mut sums = CategoryVector::default();
        let mut counts = [0i64; 4];
        let mut contributions = Vec::new();

        for event in events {
            for (idx, category) in Category::ALL.iter().enumerate() {
                if event.impact.get(*category) == 0.0 {
                    continue;
                }
                let value = self.event_contribution(event, *category, now)?;
                trace!(
                    event_id = %event.event_id,
                    category = %category,
                    value,
                    "Event contribution"
                );
                sums.set(*category, sums.get(*category) + value);
                counts[idx] += 1;
                contributions.push(Contribution {
                    event_id: event.event_id,
                    title: event.title.clone(),
                    category: *category,
                    value,
                });
            }
        }

        let clamp = self.config.news_clamp;
        let mut news = CategoryVector::default();
        let mut scores = Vec::with_capacity(Category::ALL.len());
        for (idx, category) in Category::ALL.iter().enumerate() {
            let n = sums.get(*category).clamp(-clamp, clamp);
            news.set(*category, n);
            let base = baseline.get(*category);
            scores.push(CategoryScore {
                brand_id,
                category: *category,
                baseline: base,
                news: n,
                score: base + n,
                event_count: counts[idx],
                computed_at: now,
            });
        }

        let explanation = explain(&contributions, self.config.explanation_top_n);

        Ok(ScoreReport {
            brand_id,
            baseline,
            news,
            scores,
            baseline_only: events.is_empty(),
            contributions,
            explanation,
        })
    }

    /// Fold category scores through a user's weights.
    pub fn personalize(&self, scores: &CategoryVector, weights: &UserWeights) -> PersonalizedScore {
        let raw: f64 = Category::ALL
            .iter()
            .map(|c| weights.weights.get(*c).clamp(0.0, 1.0) * scores.get(*c))
            .sum();
        PersonalizedScore {
            raw,
            final_score: personalize(raw, self.config.personalize_k),
            dealbreakers: triggered_dealbreakers(scores, weights),
        }
    }
}
