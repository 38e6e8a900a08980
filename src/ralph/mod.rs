//! Meta-Ralph: the multi-dimensional quality gate.
//!
//! Every candidate insight is roasted on six dimensions scored 0-2. Only
//! `quality` verdicts advance to the cognitive store; everything else is
//! recorded in a bounded roast-history file and dropped.
//!
//! Verdict bands over the 0-12 total:
//! - 0-1: primitive
//! - 2-3: needs_work
//! - 4-5: duplicate when statement similarity exceeds the dedup threshold,
//!   quality otherwise
//! - 6+: quality

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cognitive::normalize_statement;
use crate::config::RalphConfig;
use crate::error::{FailOpen, Result};
use crate::event::EventKind;
use crate::memory::PendingMemory;
use crate::util;

/// Stop words removed before similarity comparison.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with", "when", "you", "your",
];

/// Verbs that make a statement actionable.
const ACTION_VERBS: &[&str] = &[
    "use", "avoid", "prefer", "run", "check", "verify", "always", "never", "pin", "split",
    "batch", "keep", "set", "add", "remove", "wait", "retry", "confirm",
];

/// Phrases that carry explicit reasoning.
const REASONING_MARKERS: &[&str] = &[
    "because", "since", "so that", "otherwise", "which means", "leads to", "causes",
];

/// Phrases that tie a statement to an observed outcome.
const OUTCOME_MARKERS: &[&str] = &[
    "failed", "succeeded", "error", "fixed", "broke", "worked", "timed out", "crashed",
];

/// Contrast markers that signal a non-obvious insight.
const CONTRAST_MARKERS: &[&str] = &["instead of", "rather than", "not just", "even though"];

/// Generic filler that drags specificity down.
const GENERIC_PHRASES: &[&str] = &[
    "be careful",
    "pay attention",
    "do your best",
    "write good code",
    "test your code",
    "think before",
];

/// Filler prefixes stripped when producing the refined version.
const FILLER_PREFIXES: &[&str] = &[
    "i learned that ",
    "i learned ",
    "note: ",
    "remember that ",
    "remember to ",
    "it turns out that ",
    "turns out ",
];

/// The closed vocabulary of rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoastIssue {
    /// The statement tells the agent nothing to do differently.
    NoActionableGuidance,
    /// The statement restates common knowledge.
    SeemsObvious,
    /// No rationale is attached to the claim.
    NoReasoningProvided,
    /// The statement is not tied to any observed outcome.
    NotOutcomeLinked,
    /// Too vague to ever fire usefully.
    TooGeneric,
    /// A near-identical insight already exists.
    AlreadyExists,
    /// The text is a primitive pattern (code fragment, single token).
    PrimitivePattern,
}

/// Per-dimension scores, each 0-2.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoastScores {
    pub actionability: u8,
    pub novelty: u8,
    pub reasoning: u8,
    pub specificity: u8,
    pub outcome_linked: u8,
    pub ethics: u8,
}

impl RoastScores {
    /// Sum of all six dimensions, 0-12.
    pub fn total(&self) -> u8 {
        self.actionability
            + self.novelty
            + self.reasoning
            + self.specificity
            + self.outcome_linked
            + self.ethics
    }
}

/// The verdict classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    /// Too primitive to keep in any form.
    Primitive,
    /// A near-identical insight already exists.
    Duplicate,
    /// Has a kernel but needs rework; not stored.
    NeedsWork,
    /// Advances to the cognitive store.
    Quality,
}

/// A scored pass/rejection of one candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    /// Per-dimension scores.
    pub scores: RoastScores,
    /// Sum of the dimensions.
    pub total: u8,
    /// The classification.
    pub verdict: VerdictKind,
    /// Attached rejection reasons (closed vocabulary).
    pub issues: Vec<RoastIssue>,
    /// Compressed restatement, present for quality verdicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_version: Option<String>,
    /// The candidate statement as roasted.
    pub statement: String,
    /// Source event id.
    pub event_id: String,
    /// When the roast happened.
    pub ts: DateTime<Utc>,
}

impl Verdict {
    /// Whether this verdict advances to the cognitive store.
    pub fn passes(&self) -> bool {
        self.verdict == VerdictKind::Quality
    }
}

/// Tokenize a normalized statement, dropping stop words.
fn content_tokens(normalized: &str) -> HashSet<String> {
    normalized
        .split_whitespace()
        .filter(|t| !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Token-set cosine similarity between two normalized statements.
pub fn token_set_cosine(a: &str, b: &str) -> f64 {
    let ta = content_tokens(a);
    let tb = content_tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    intersection / ((ta.len() as f64).sqrt() * (tb.len() as f64).sqrt())
}

/// The quality gate itself.
#[derive(Debug)]
pub struct MetaRalph {
    cfg: RalphConfig,
    history_path: PathBuf,
}

impl MetaRalph {
    /// Create a gate writing roast history to the given path.
    pub fn new(cfg: RalphConfig, history_path: impl Into<PathBuf>) -> Self {
        Self {
            cfg,
            history_path: history_path.into(),
        }
    }

    /// Roast a candidate against the existing normalized statements.
    ///
    /// The verdict is always recorded in the roast history, pass or fail.
    pub fn roast(&self, candidate: &PendingMemory, existing: &[String]) -> Verdict {
        let verdict = self.judge(candidate, existing);
        self.record(&verdict)
            .fail_open_default("recording roast verdict");
        verdict
    }

    /// Score and classify without touching the history file.
    pub fn judge(&self, candidate: &PendingMemory, existing: &[String]) -> Verdict {
        let text = candidate.text.trim();
        let lower = text.to_lowercase();
        let normalized = normalize_statement(text);

        let scores = RoastScores {
            actionability: score_actionability(&lower),
            novelty: score_novelty(&lower, &normalized),
            reasoning: score_reasoning(&lower),
            specificity: score_specificity(&lower, &normalized, candidate),
            outcome_linked: score_outcome(&lower, candidate.kind),
            ethics: score_ethics(&lower),
        };
        let total = scores.total();

        let mut issues = Vec::new();
        if scores.actionability == 0 {
            issues.push(RoastIssue::NoActionableGuidance);
        }
        if scores.novelty == 0 {
            issues.push(if is_primitive_pattern(&normalized) {
                RoastIssue::PrimitivePattern
            } else {
                RoastIssue::SeemsObvious
            });
        }
        if scores.reasoning == 0 {
            issues.push(RoastIssue::NoReasoningProvided);
        }
        if scores.outcome_linked == 0 {
            issues.push(RoastIssue::NotOutcomeLinked);
        }
        if scores.specificity == 0 {
            issues.push(RoastIssue::TooGeneric);
        }

        let verdict = if total <= self.cfg.primitive_max {
            VerdictKind::Primitive
        } else if total <= self.cfg.needs_work_max {
            VerdictKind::NeedsWork
        } else if total <= self.cfg.dedup_band_max && self.is_duplicate(&normalized, existing) {
            issues.push(RoastIssue::AlreadyExists);
            VerdictKind::Duplicate
        } else {
            VerdictKind::Quality
        };

        let refined_version = if verdict == VerdictKind::Quality {
            Some(refine(text))
        } else {
            None
        };

        Verdict {
            scores,
            total,
            verdict,
            issues,
            refined_version,
            statement: text.to_string(),
            event_id: candidate.event_id.clone(),
            ts: Utc::now(),
        }
    }

    fn is_duplicate(&self, normalized: &str, existing: &[String]) -> bool {
        existing
            .iter()
            .any(|e| token_set_cosine(normalized, e) >= self.cfg.dedup_threshold)
    }

    /// Append a verdict to the bounded roast history.
    fn record(&self, verdict: &Verdict) -> Result<()> {
        util::append_jsonl(&self.history_path, verdict)?;
        util::trim_jsonl_to_last(&self.history_path, self.cfg.roast_history_max_lines)
    }
}

fn score_actionability(lower: &str) -> u8 {
    let hits = ACTION_VERBS
        .iter()
        .filter(|v| {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|w| w == **v)
        })
        .count();
    match hits {
        0 => 0,
        1 => 1,
        _ => 2,
    }
}

fn score_novelty(lower: &str, normalized: &str) -> u8 {
    if is_primitive_pattern(normalized) {
        return 0;
    }
    if CONTRAST_MARKERS.iter().any(|m| lower.contains(m)) {
        2
    } else {
        1
    }
}

fn score_reasoning(lower: &str) -> u8 {
    let hits = REASONING_MARKERS
        .iter()
        .filter(|m| lower.contains(*m))
        .count();
    match hits {
        0 => 0,
        1 => 1,
        _ => 2,
    }
}

fn score_specificity(lower: &str, normalized: &str, candidate: &PendingMemory) -> u8 {
    if GENERIC_PHRASES.iter().any(|p| lower.contains(p)) {
        return 0;
    }
    let tokens = normalized.split_whitespace().count();
    if tokens < 4 {
        return 0;
    }

    let mut concrete = 0;
    if candidate.tool.is_some() {
        concrete += 1;
    }
    // File paths, flags, or identifiers with internal structure
    if lower.contains('/') || lower.contains(".rs") || lower.contains(".py") || lower.contains("--")
    {
        concrete += 1;
    }
    if lower.chars().any(|c| c.is_ascii_digit()) {
        concrete += 1;
    }
    // Capitalized tool names like Read, Glob, Bash past the sentence head
    if candidate
        .text
        .split_whitespace()
        .skip(1)
        .any(|w| w.len() > 2 && w.chars().next().is_some_and(|c| c.is_uppercase()))
    {
        concrete += 1;
    }

    match concrete {
        0 => 1,
        1 => 1,
        _ => 2,
    }
}

fn score_outcome(lower: &str, kind: EventKind) -> u8 {
    let marker = OUTCOME_MARKERS.iter().any(|m| lower.contains(m));
    match (kind.is_outcome(), marker) {
        (true, true) => 2,
        (true, false) | (false, true) => 1,
        (false, false) => 0,
    }
}

fn score_ethics(lower: &str) -> u8 {
    // Advice that would have the agent carry secrets around is unsafe to
    // store regardless of its other merits.
    const CREDENTIAL_MARKERS: &[&str] = &["password", "api key", "api_key", "secret key", "token:"];
    const SAFETY_MARKERS: &[&str] = &["review", "verify", "back up", "backup", "confirm", "ask the user"];

    if CREDENTIAL_MARKERS.iter().any(|m| lower.contains(m)) {
        0
    } else if SAFETY_MARKERS.iter().any(|m| lower.contains(m)) {
        2
    } else {
        1
    }
}

/// Whether a normalized statement is a primitive pattern: a bare code
/// fragment or trivially short text.
fn is_primitive_pattern(normalized: &str) -> bool {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    if tokens.len() <= 2 {
        return true;
    }
    const CODE_HEADS: &[&str] = &["import", "use", "def", "fn", "class", "let", "const", "from"];
    CODE_HEADS.contains(&tokens[0]) && tokens.len() <= 4
}

/// Compress a statement: strip filler prefixes and collapse whitespace.
fn refine(text: &str) -> String {
    let mut out = text.trim().to_string();
    for prefix in FILLER_PREFIXES {
        let matches = out
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
        if matches {
            out = out[prefix.len()..].to_string();
            break;
        }
    }
    let mut refined = out.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(first) = refined.chars().next() {
        if first.is_ascii_lowercase() {
            refined.replace_range(0..1, &first.to_ascii_uppercase().to_string());
        }
    }
    refined
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn candidate(text: &str, kind: EventKind) -> PendingMemory {
        PendingMemory {
            text: text.to_string(),
            category: crate::memory::MemoryCategory::Wisdom,
            score: 0.9,
            session_id: "s1".to_string(),
            event_id: "evt_1".to_string(),
            kind,
            tool: None,
        }
    }

    fn ralph(dir: &TempDir) -> MetaRalph {
        MetaRalph::new(RalphConfig::default(), dir.path().join("roast_history.jsonl"))
    }

    #[test]
    fn test_trivial_code_fragment_is_primitive() {
        let dir = TempDir::new().unwrap();
        let verdict = ralph(&dir).roast(&candidate("import sys", EventKind::UserPrompt), &[]);

        assert!(matches!(
            verdict.verdict,
            VerdictKind::Primitive | VerdictKind::NeedsWork
        ));
        assert!(!verdict.passes());
        assert!(verdict.issues.contains(&RoastIssue::PrimitivePattern));
        assert!(verdict.refined_version.is_none());
    }

    #[test]
    fn test_rich_statement_is_quality() {
        let dir = TempDir::new().unwrap();
        let text = "Use Glob before Read because bare paths often failed with file-not-found \
                    errors in this repo";
        let mut cand = candidate(text, EventKind::PostToolFailure);
        cand.tool = Some("Read".to_string());

        let verdict = ralph(&dir).roast(&cand, &[]);

        assert_eq!(verdict.verdict, VerdictKind::Quality);
        assert!(verdict.total >= 6);
        assert!(verdict.passes());
        assert!(verdict.refined_version.is_some());
    }

    #[test]
    fn test_generic_advice_needs_work() {
        let dir = TempDir::new().unwrap();
        let verdict = ralph(&dir).roast(
            &candidate("be careful and test your code", EventKind::UserPrompt),
            &[],
        );

        assert!(matches!(
            verdict.verdict,
            VerdictKind::Primitive | VerdictKind::NeedsWork
        ));
        assert!(verdict.issues.contains(&RoastIssue::TooGeneric));
    }

    #[test]
    fn test_mid_band_duplicate_detection() {
        let dir = TempDir::new().unwrap();
        let gate = ralph(&dir);
        let text = "Check the lockfile before running install";
        let mut cand = candidate(text, EventKind::PostTool);
        cand.tool = Some("Bash".to_string());

        let fresh = gate.judge(&cand, &[]);
        // This candidate lands in the dedup band
        assert!(fresh.total >= 4 && fresh.total <= 5, "total = {}", fresh.total);
        assert_eq!(fresh.verdict, VerdictKind::Quality);

        let existing = vec![normalize_statement(
            "check the lockfile before running install",
        )];
        let duped = gate.judge(&cand, &existing);
        assert_eq!(duped.verdict, VerdictKind::Duplicate);
        assert!(duped.issues.contains(&RoastIssue::AlreadyExists));
    }

    #[test]
    fn test_high_band_skips_dedup() {
        let dir = TempDir::new().unwrap();
        let gate = ralph(&dir);
        let text = "Use Glob before Read because bare paths often failed with file-not-found \
                    errors in this repo";
        let mut cand = candidate(text, EventKind::PostToolFailure);
        cand.tool = Some("Read".to_string());

        let existing = vec![normalize_statement(text)];
        let verdict = gate.judge(&cand, &existing);

        assert!(verdict.total >= 6);
        assert_eq!(verdict.verdict, VerdictKind::Quality);
    }

    #[test]
    fn test_credential_advice_scores_zero_ethics() {
        let dir = TempDir::new().unwrap();
        let verdict = ralph(&dir).judge(
            &candidate(
                "always pass the api key directly on the command line because it is faster",
                EventKind::UserPrompt,
            ),
            &[],
        );
        assert_eq!(verdict.scores.ethics, 0);
    }

    #[test]
    fn test_token_set_cosine() {
        let a = normalize_statement("use glob before read");
        let b = normalize_statement("use glob before read");
        assert!((token_set_cosine(&a, &b) - 1.0).abs() < 1e-9);

        let c = normalize_statement("pin dependency versions in the manifest");
        assert!(token_set_cosine(&a, &c) < 0.3);

        assert_eq!(token_set_cosine("", &a), 0.0);
    }

    #[test]
    fn test_stop_words_ignored_in_similarity() {
        let a = normalize_statement("use glob before the read");
        let b = normalize_statement("use glob before a read");
        assert!((token_set_cosine(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_refine_strips_filler() {
        assert_eq!(
            refine("i learned that  retries need   jitter"),
            "Retries need jitter"
        );
        assert_eq!(refine("Note: batch the writes"), "Batch the writes");
        assert_eq!(refine("plain statement"), "Plain statement");
    }

    #[test]
    fn test_roast_history_is_written_and_bounded() {
        let dir = TempDir::new().unwrap();
        let cfg = RalphConfig {
            roast_history_max_lines: 3,
            ..RalphConfig::default()
        };
        let gate = MetaRalph::new(cfg, dir.path().join("roast_history.jsonl"));

        for i in 0..5 {
            gate.roast(
                &candidate(&format!("statement number {}", i), EventKind::UserPrompt),
                &[],
            );
        }

        let content =
            std::fs::read_to_string(dir.path().join("roast_history.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: Verdict = serde_json::from_str(lines[2]).unwrap();
        assert!(last.statement.contains("number 4"));
    }

    #[test]
    fn test_verdict_serialization_uses_snake_case() {
        let dir = TempDir::new().unwrap();
        let verdict = ralph(&dir).judge(&candidate("import sys", EventKind::UserPrompt), &[]);
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"verdict\":\"primitive\"") || json.contains("\"verdict\":\"needs_work\""));
        assert!(json.contains("primitive_pattern") || json.contains("no_actionable_guidance"));
    }
}
