//! Cognitive insight store.
//!
//! Single-writer store of reliability-scored insights, keyed by a stable
//! hash of category + normalized statement. Reliability is a pure function
//! of the validation/contradiction counters, so concurrent updates from
//! different sessions commute. The snapshot is a canonically ordered JSON
//! file rewritten via temp + rename.

mod store;

pub use store::{CognitiveStore, DemotionRecord, UpsertOutcome};

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util;

/// Maximum characters kept in an insight statement.
pub const STATEMENT_MAX_CHARS: usize = 500;

/// Entries kept in the evidence and counter-example rings.
pub const EVIDENCE_RING: usize = 10;

/// Validation count at which the readiness saturation term reaches 1.0.
const READINESS_SATURATION: f64 = 20.0;

/// Category of a cognitive insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightCategory {
    /// Transferable judgment about how to work.
    Wisdom,
    /// What the agent knows about its own failure modes.
    SelfAwareness,
    /// What the agent knows about this user.
    UserUnderstanding,
    /// Reasoning strategies that worked or failed.
    Reasoning,
    /// Observations about the learning loop itself.
    MetaLearning,
    /// Anything that fits no other category.
    Other,
}

impl InsightCategory {
    /// All categories, for iteration.
    pub fn all() -> &'static [InsightCategory] {
        &[
            InsightCategory::Wisdom,
            InsightCategory::SelfAwareness,
            InsightCategory::UserUnderstanding,
            InsightCategory::Reasoning,
            InsightCategory::MetaLearning,
            InsightCategory::Other,
        ]
    }

    /// Wire name of this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::Wisdom => "wisdom",
            InsightCategory::SelfAwareness => "self_awareness",
            InsightCategory::UserUnderstanding => "user_understanding",
            InsightCategory::Reasoning => "reasoning",
            InsightCategory::MetaLearning => "meta_learning",
            InsightCategory::Other => "other",
        }
    }

    /// Weight of this category in advisory readiness.
    pub fn weight(&self) -> f64 {
        match self {
            InsightCategory::Wisdom => 1.0,
            InsightCategory::UserUnderstanding => 0.95,
            InsightCategory::SelfAwareness => 0.9,
            InsightCategory::Reasoning => 0.9,
            InsightCategory::MetaLearning => 0.85,
            InsightCategory::Other => 0.7,
        }
    }

    /// Guidance file that promoted insights of this category land in.
    pub fn promotion_target(&self) -> &'static str {
        match self {
            InsightCategory::Wisdom => "CLAUDE.md",
            InsightCategory::UserUnderstanding => "AGENTS.md",
            InsightCategory::Reasoning => "TOOLS.md",
            InsightCategory::SelfAwareness => "SOUL.md",
            InsightCategory::MetaLearning | InsightCategory::Other => "CLAUDE.md",
        }
    }
}

/// Normalize a statement for keying and similarity comparison.
///
/// Lowercases, strips punctuation, and collapses whitespace so trivial
/// rewordings map to the same key.
pub fn normalize_statement(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len());
    let mut last_was_space = true;
    for c in statement.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Stable key for an insight: hash of category + normalized statement.
pub fn insight_key(category: InsightCategory, statement: &str) -> String {
    util::short_hash(&format!(
        "{}::{}",
        category.as_str(),
        normalize_statement(statement)
    ))
}

/// Wilson score lower bound for a Bernoulli proportion.
///
/// Gives a conservative confidence estimate for reliability that small
/// sample sizes cannot inflate.
pub fn wilson_lower_bound(successes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let z = 1.96f64;
    let n = total as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let denominator = 1.0 + z2 / n;
    let centre = p + z2 / (2.0 * n);
    let margin = z * ((p * (1.0 - p) + z2 / (4.0 * n)) / n).sqrt();
    ((centre - margin) / denominator).max(0.0)
}

/// A distilled, reliability-scored statement of learned behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Insight {
    /// Stable key (hash of category + normalized statement).
    pub key: String,
    /// Category of the insight.
    pub category: InsightCategory,
    /// The statement itself, at most [`STATEMENT_MAX_CHARS`] characters.
    pub statement: String,
    /// `validations / (validations + contradictions)`, 0 when untested.
    pub reliability: f64,
    /// Monotone count of supporting observations.
    pub validations: u64,
    /// Monotone count of refuting observations.
    pub contradictions: u64,
    /// Wilson lower bound on reliability.
    pub confidence: f64,
    /// Whether the insight currently lives in a guidance file.
    pub promoted: bool,
    /// Guidance file the insight was promoted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_to: Option<String>,
    /// Last supporting event ids, newest last.
    pub evidence: VecDeque<String>,
    /// Last refuting event ids, newest last.
    pub counter_examples: VecDeque<String>,
    /// Where the insight came from (hook or component name).
    pub source: String,
    /// When the insight was created.
    pub created_at: DateTime<Utc>,
    /// When the insight was last validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Composite score in [0, 1] used by advisory retrieval.
    pub advisory_readiness: f64,
}

impl Insight {
    /// Create a new, untested insight.
    pub fn new(
        category: InsightCategory,
        statement: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let statement: String = statement.into();
        let statement: String = statement.chars().take(STATEMENT_MAX_CHARS).collect();
        Self {
            key: insight_key(category, &statement),
            category,
            statement,
            reliability: 0.0,
            validations: 0,
            contradictions: 0,
            confidence: 0.0,
            promoted: false,
            promoted_to: None,
            evidence: VecDeque::new(),
            counter_examples: VecDeque::new(),
            source: source.into(),
            created_at: Utc::now(),
            last_validated_at: None,
            advisory_readiness: 0.0,
        }
    }

    /// Record a supporting observation.
    pub fn validate(&mut self, event_id: &str, now: DateTime<Utc>, halflife_s: u64) {
        self.validations += 1;
        push_ring(&mut self.evidence, event_id);
        self.last_validated_at = Some(now);
        self.recompute(now, halflife_s);
    }

    /// Record a refuting observation.
    pub fn contradict(&mut self, event_id: &str, now: DateTime<Utc>, halflife_s: u64) {
        self.contradictions += 1;
        push_ring(&mut self.counter_examples, event_id);
        self.recompute(now, halflife_s);
    }

    /// Recompute reliability, confidence, and advisory readiness from the
    /// counters. Reliability is exactly
    /// `validations / (validations + contradictions)`.
    pub fn recompute(&mut self, now: DateTime<Utc>, halflife_s: u64) {
        let total = self.validations + self.contradictions;
        self.reliability = if total > 0 {
            self.validations as f64 / total as f64
        } else {
            0.0
        };
        self.confidence = wilson_lower_bound(self.validations, total);

        let saturation = if self.validations == 0 {
            0.0
        } else {
            ((1.0 + self.validations as f64).ln() / (1.0 + READINESS_SATURATION).ln()).min(1.0)
        };

        let anchor = self.last_validated_at.unwrap_or(self.created_at);
        let age_s = (now - anchor).num_seconds().max(0) as f64;
        let recency = if halflife_s == 0 {
            1.0
        } else {
            0.5f64.powf(age_s / halflife_s as f64)
        };

        self.advisory_readiness =
            (self.reliability * saturation * self.category.weight() * recency).clamp(0.0, 1.0);
    }

    /// Merge evidence from another observation of the same insight.
    ///
    /// Counters only ever increase; reliability is never lowered by a merge.
    pub fn merge(&mut self, other: &Insight, now: DateTime<Utc>, halflife_s: u64) {
        for id in &other.evidence {
            push_ring(&mut self.evidence, id);
        }
        for id in &other.counter_examples {
            push_ring(&mut self.counter_examples, id);
        }
        self.validations += other.validations;
        self.contradictions += other.contradictions;
        if other.last_validated_at > self.last_validated_at {
            self.last_validated_at = other.last_validated_at;
        }
        self.recompute(now, halflife_s);
    }
}

fn push_ring(ring: &mut VecDeque<String>, event_id: &str) {
    if ring.iter().any(|id| id == event_id) {
        return;
    }
    ring.push_back(event_id.to_string());
    while ring.len() > EVIDENCE_RING {
        ring.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALFLIFE: u64 = 14 * 86_400;

    #[test]
    fn test_normalize_statement() {
        assert_eq!(
            normalize_statement("  Use Glob FIRST, before Read!  "),
            "use glob first before read"
        );
        assert_eq!(normalize_statement(""), "");
        assert_eq!(normalize_statement("a--b__c"), "a b c");
    }

    #[test]
    fn test_insight_key_stability() {
        let k1 = insight_key(InsightCategory::Wisdom, "Use Glob first");
        let k2 = insight_key(InsightCategory::Wisdom, "use glob   FIRST!");
        let k3 = insight_key(InsightCategory::Reasoning, "Use Glob first");

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.len(), 16);
    }

    #[test]
    fn test_new_insight_is_untested() {
        let insight = Insight::new(InsightCategory::Wisdom, "check paths with glob", "ralph");

        assert_eq!(insight.reliability, 0.0);
        assert_eq!(insight.validations, 0);
        assert_eq!(insight.contradictions, 0);
        assert!(!insight.promoted);
        assert!(insight.evidence.is_empty());
    }

    #[test]
    fn test_statement_truncated_to_max() {
        let long = "x".repeat(STATEMENT_MAX_CHARS + 100);
        let insight = Insight::new(InsightCategory::Other, long, "ralph");
        assert_eq!(insight.statement.chars().count(), STATEMENT_MAX_CHARS);
    }

    #[test]
    fn test_reliability_invariant() {
        let mut insight = Insight::new(InsightCategory::Wisdom, "s", "ralph");
        let now = Utc::now();

        insight.validate("e1", now, HALFLIFE);
        insight.validate("e2", now, HALFLIFE);
        insight.contradict("e3", now, HALFLIFE);

        assert_eq!(insight.validations, 2);
        assert_eq!(insight.contradictions, 1);
        assert!((insight.reliability - 2.0 / 3.0).abs() < 1e-9);
        assert!(insight.reliability >= 0.0 && insight.reliability <= 1.0);
    }

    #[test]
    fn test_evidence_ring_is_bounded() {
        let mut insight = Insight::new(InsightCategory::Wisdom, "s", "ralph");
        let now = Utc::now();

        for i in 0..25 {
            insight.validate(&format!("e{}", i), now, HALFLIFE);
        }

        assert_eq!(insight.evidence.len(), EVIDENCE_RING);
        assert_eq!(insight.evidence.back().unwrap(), "e24");
        assert_eq!(insight.evidence.front().unwrap(), "e15");
        assert_eq!(insight.validations, 25);
    }

    #[test]
    fn test_duplicate_evidence_not_repeated_in_ring() {
        let mut insight = Insight::new(InsightCategory::Wisdom, "s", "ralph");
        let now = Utc::now();

        insight.validate("e1", now, HALFLIFE);
        insight.validate("e1", now, HALFLIFE);

        assert_eq!(insight.evidence.len(), 1);
        // Counters still move; the ring is only a sample
        assert_eq!(insight.validations, 2);
    }

    #[test]
    fn test_wilson_lower_bound() {
        assert_eq!(wilson_lower_bound(0, 0), 0.0);
        // Small samples are heavily discounted
        let small = wilson_lower_bound(1, 1);
        assert!(small < 0.5);
        // Large samples approach the observed rate
        let large = wilson_lower_bound(90, 100);
        assert!(large > 0.8 && large < 0.9);
        // More evidence at the same rate means more confidence
        assert!(wilson_lower_bound(90, 100) > wilson_lower_bound(9, 10));
    }

    #[test]
    fn test_readiness_grows_with_validations() {
        let now = Utc::now();
        let mut a = Insight::new(InsightCategory::Wisdom, "s", "ralph");
        let mut b = Insight::new(InsightCategory::Wisdom, "s", "ralph");

        a.validate("e1", now, HALFLIFE);
        for i in 0..10 {
            b.validate(&format!("e{}", i), now, HALFLIFE);
        }

        assert!(b.advisory_readiness > a.advisory_readiness);
        assert!(b.advisory_readiness <= 1.0);
    }

    #[test]
    fn test_readiness_decays_with_age() {
        let mut insight = Insight::new(InsightCategory::Wisdom, "s", "ralph");
        let now = Utc::now();
        insight.validate("e1", now, HALFLIFE);
        let fresh = insight.advisory_readiness;

        let much_later = now + chrono::Duration::days(28);
        insight.recompute(much_later, HALFLIFE);

        assert!(insight.advisory_readiness < fresh / 3.0);
    }

    #[test]
    fn test_merge_accumulates_counters() {
        let now = Utc::now();
        let mut a = Insight::new(InsightCategory::Wisdom, "s", "ralph");
        a.validate("e1", now, HALFLIFE);

        let mut b = Insight::new(InsightCategory::Wisdom, "s", "ralph");
        b.validate("e2", now, HALFLIFE);
        b.contradict("e3", now, HALFLIFE);

        a.merge(&b, now, HALFLIFE);

        assert_eq!(a.validations, 2);
        assert_eq!(a.contradictions, 1);
        assert_eq!(a.evidence.len(), 2);
        assert_eq!(a.counter_examples.len(), 1);
    }

    #[test]
    fn test_category_promotion_targets() {
        assert_eq!(InsightCategory::Wisdom.promotion_target(), "CLAUDE.md");
        assert_eq!(
            InsightCategory::UserUnderstanding.promotion_target(),
            "AGENTS.md"
        );
        assert_eq!(InsightCategory::Reasoning.promotion_target(), "TOOLS.md");
        assert_eq!(InsightCategory::SelfAwareness.promotion_target(), "SOUL.md");
        assert_eq!(InsightCategory::MetaLearning.promotion_target(), "CLAUDE.md");
    }

    #[test]
    fn test_category_serialization() {
        for category in InsightCategory::all() {
            let json = serde_json::to_string(category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
            let parsed: InsightCategory = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, *category);
        }
    }
}
