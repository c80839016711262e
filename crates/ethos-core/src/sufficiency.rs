//! Evidence sufficiency gate.
//!
//! A score is only shown when evidence exists in at least
//! [`SUFFICIENCY_QUORUM`](crate::defaults::SUFFICIENCY_QUORUM) of the five
//! evidence domains. This is a quorum, not a weighted average: a flood of
//! news in one domain does not make up for nothing elsewhere.

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::models::EvidenceSummary;

/// One of the five independent evidence domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceDomain {
    Identity,
    Behavior,
    Claims,
    Scrutiny,
    Market,
}

impl EvidenceDomain {
    pub const ALL: [EvidenceDomain; 5] = [
        EvidenceDomain::Identity,
        EvidenceDomain::Behavior,
        EvidenceDomain::Claims,
        EvidenceDomain::Scrutiny,
        EvidenceDomain::Market,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceDomain::Identity => "identity",
            EvidenceDomain::Behavior => "behavior",
            EvidenceDomain::Claims => "claims",
            EvidenceDomain::Scrutiny => "scrutiny",
            EvidenceDomain::Market => "market",
        }
    }
}

impl EvidenceSummary {
    /// Evidence count recorded for `domain`.
    pub fn count(&self, domain: EvidenceDomain) -> i64 {
        match domain {
            EvidenceDomain::Identity => self.identity,
            EvidenceDomain::Behavior => self.behavior,
            EvidenceDomain::Claims => self.claims,
            EvidenceDomain::Scrutiny => self.scrutiny,
            EvidenceDomain::Market => self.market,
        }
    }
}

/// How a consumer should present a brand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    ShowScore,
    ShowPreview,
    ShowStub,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::ShowScore => "show_score",
            Recommendation::ShowPreview => "show_preview",
            Recommendation::ShowStub => "show_stub",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SufficiencyReport {
    pub domains_covered: usize,
    /// Domains with at least one piece of evidence, in [`EvidenceDomain::ALL`] order.
    pub covered: Vec<EvidenceDomain>,
    pub sufficient: bool,
    /// `domains_covered / 5 × 100`.
    pub sufficiency_score: f64,
    pub recommendation: Recommendation,
}

/// Evaluate an evidence summary.
///
/// The recommendation depends only on the number of covered domains.
pub fn evaluate(summary: &EvidenceSummary) -> SufficiencyReport {
    let covered: Vec<EvidenceDomain> = EvidenceDomain::ALL
        .into_iter()
        .filter(|d| summary.count(*d) > 0)
        .collect();
    let domains_covered = covered.len();

    let recommendation = if domains_covered >= defaults::SUFFICIENCY_QUORUM {
        Recommendation::ShowScore
    } else if domains_covered >= 1 {
        Recommendation::ShowPreview
    } else {
        Recommendation::ShowStub
    };

    SufficiencyReport {
        domains_covered,
        covered,
        sufficient: domains_covered >= defaults::SUFFICIENCY_QUORUM,
        sufficiency_score: domains_covered as f64 * 100.0
            / defaults::EVIDENCE_DOMAIN_COUNT as f64,
        recommendation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_domains_is_preview() {
        let report = evaluate(&EvidenceSummary {
            identity: 1,
            behavior: 12,
            ..Default::default()
        });
        assert!(!report.sufficient);
        assert_eq!(report.domains_covered, 2);
        assert_eq!(report.recommendation, Recommendation::ShowPreview);
        assert_eq!(report.sufficiency_score, 40.0);
        assert_eq!(
            report.covered,
            vec![EvidenceDomain::Identity, EvidenceDomain::Behavior]
        );
    }

    #[test]
    fn test_abundance_in_one_domain_does_not_compensate() {
        let report = evaluate(&EvidenceSummary {
            behavior: 10_000,
            ..Default::default()
        });
        assert!(!report.sufficient);
        assert_eq!(report.recommendation, Recommendation::ShowPreview);
    }

    #[test]
    fn test_quorum_shows_score() {
        let report = evaluate(&EvidenceSummary {
            identity: 1,
            claims: 1,
            market: 1,
            ..Default::default()
        });
        assert!(report.sufficient);
        assert_eq!(report.recommendation, Recommendation::ShowScore);
        assert_eq!(report.sufficiency_score, 60.0);
    }

    #[test]
    fn test_no_evidence_is_stub() {
        let report = evaluate(&EvidenceSummary::default());
        assert_eq!(report.domains_covered, 0);
        assert_eq!(report.recommendation, Recommendation::ShowStub);
        assert_eq!(report.sufficiency_score, 0.0);
    }

    #[test]
    fn test_full_coverage() {
        let report = evaluate(&EvidenceSummary {
            identity: 1,
            behavior: 1,
            claims: 1,
            scrutiny: 1,
            market: 1,
        });
        assert_eq!(report.sufficiency_score, 100.0);
        assert_eq!(report.recommendation.as_str(), "show_score");
    }
}
