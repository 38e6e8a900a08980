//! EIDOS: the episodic predict-evaluate store.
//!
//! Sessions map to episodes; each tool call becomes a step that records
//! what the agent decided, what it predicted, and what actually happened.
//! Closed episodes feed the aggregator, which distills recurring patterns
//! into retrievable rules.
//!
//! State machines:
//! - Step: `open -> sealed_success | sealed_failure | abandoned`
//! - Episode: `active -> consolidating -> closed{success|failure|abandoned}`

mod aggregator;
mod store;

pub use aggregator::{Aggregator, ConfidenceModel, SeverityWeighted, SupportRatio};
pub use store::{EidosEffect, EidosStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum characters of a user prompt kept as an episode goal.
pub const GOAL_MAX_CHARS: usize = 200;

/// Phase of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodePhase {
    /// Orienting: few or no sealed steps yet.
    Explore,
    /// Working: steps are being sealed.
    Execute,
    /// Closing: session ended, distillation pending.
    Consolidate,
}

impl EpisodePhase {
    /// Wire name of this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodePhase::Explore => "explore",
            EpisodePhase::Execute => "execute",
            EpisodePhase::Consolidate => "consolidate",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explore" => Some(EpisodePhase::Explore),
            "execute" => Some(EpisodePhase::Execute),
            "consolidate" => Some(EpisodePhase::Consolidate),
            _ => None,
        }
    }
}

/// Outcome of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    /// More steps passed than failed.
    Success,
    /// Failures dominated.
    Failure,
    /// Closed without meaningful steps.
    Abandoned,
    /// Still open.
    Active,
}

impl EpisodeOutcome {
    /// Wire name of this outcome.
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeOutcome::Success => "success",
            EpisodeOutcome::Failure => "failure",
            EpisodeOutcome::Abandoned => "abandoned",
            EpisodeOutcome::Active => "active",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(EpisodeOutcome::Success),
            "failure" => Some(EpisodeOutcome::Failure),
            "abandoned" => Some(EpisodeOutcome::Abandoned),
            "active" => Some(EpisodeOutcome::Active),
            _ => None,
        }
    }
}

/// A session-scoped container of ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    /// Unique episode id.
    pub episode_id: String,
    /// Session that owns the episode. Exactly one episode is active per
    /// session at any time.
    pub session_id: String,
    /// Goal derived from the session's first user prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Current phase.
    pub phase: EpisodePhase,
    /// Final (or current) outcome.
    pub outcome: EpisodeOutcome,
    /// When the episode opened, nanoseconds.
    pub started_ns: i64,
    /// When the episode closed, nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_ns: Option<i64>,
    /// Number of sealed steps linked to the episode.
    pub step_count: i64,
}

/// What kind of action a step represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A tool invocation.
    ToolCall,
    /// A textual response.
    Response,
    /// Waiting on something external.
    Wait,
}

impl ActionKind {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ToolCall => "tool_call",
            ActionKind::Response => "response",
            ActionKind::Wait => "wait",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool_call" => Some(ActionKind::ToolCall),
            "response" => Some(ActionKind::Response),
            "wait" => Some(ActionKind::Wait),
            _ => None,
        }
    }
}

/// Evaluation state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Evaluation {
    /// Awaiting the matching outcome event.
    #[serde(rename = "?")]
    Open,
    /// The prediction held.
    #[serde(rename = "passed")]
    Passed,
    /// The prediction did not hold.
    #[serde(rename = "failed")]
    Failed,
}

impl Evaluation {
    /// Wire name of this evaluation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Evaluation::Open => "?",
            Evaluation::Passed => "passed",
            Evaluation::Failed => "failed",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "?" => Some(Evaluation::Open),
            "passed" => Some(Evaluation::Passed),
            "failed" => Some(Evaluation::Failed),
            _ => None,
        }
    }

    /// Whether the step is still awaiting its outcome.
    pub fn is_open(&self) -> bool {
        matches!(self, Evaluation::Open)
    }
}

/// One predict-act-evaluate triple within an episode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Unique step id.
    pub step_id: String,
    /// Owning episode.
    pub episode_id: String,
    /// Owning session, denormalized for the active-step lookup.
    pub session_id: String,
    /// What the agent chose to do.
    pub decision: String,
    /// The action's kind.
    pub action_kind: ActionKind,
    /// The agent's success prediction.
    pub prediction: String,
    /// Tool involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// The observed outcome, filled at seal time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Evaluation state.
    pub evaluation: Evaluation,
    /// When the step opened, nanoseconds.
    pub opened_ns: i64,
    /// When the step sealed, nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_ns: Option<i64>,
}

/// Kind of distilled rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationType {
    /// A pattern that reliably works.
    Heuristic,
    /// A standing rule of behavior.
    Policy,
    /// A single decisive failure worth warning about.
    SharpEdge,
    /// A repeated failure pattern to avoid.
    AntiPattern,
}

impl DistillationType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DistillationType::Heuristic => "heuristic",
            DistillationType::Policy => "policy",
            DistillationType::SharpEdge => "sharp_edge",
            DistillationType::AntiPattern => "anti_pattern",
        }
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "heuristic" => Some(DistillationType::Heuristic),
            "policy" => Some(DistillationType::Policy),
            "sharp_edge" => Some(DistillationType::SharpEdge),
            "anti_pattern" => Some(DistillationType::AntiPattern),
            _ => None,
        }
    }
}

/// An EIDOS-derived rule over multiple steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Distillation {
    /// Unique distillation id.
    pub distillation_id: String,
    /// Kind of rule.
    pub dtype: DistillationType,
    /// The rule itself.
    pub statement: String,
    /// Confidence in [0, 1]; decays without reinforcement.
    pub confidence: f64,
    /// Supporting observations since creation.
    pub validation_count: i64,
    /// Refuting observations since creation.
    pub contradiction_count: i64,
    /// Times surfaced by retrieval.
    pub times_retrieved: i64,
    /// Times included in emitted advice.
    pub times_used: i64,
    /// Times followed by a successful outcome.
    pub times_helped: i64,
    /// Steps the rule was distilled from.
    pub source_step_ids: Vec<String>,
    /// Domain tags.
    pub domains: Vec<String>,
    /// Patterns matched by advisory retrieval.
    pub triggers: Vec<String>,
    /// When the rule was created.
    pub created_at: DateTime<Utc>,
}

/// Derive the clustering template for a step decision.
///
/// Strips argument specifics so "Read: src/a.rs quickly" and
/// "Read: src/b.rs quickly" land in the same cluster: the tool head plus up
/// to two content words, skipping path-like and numeric tokens.
pub fn decision_template(decision: &str) -> String {
    let (head, rest) = match decision.split_once(':') {
        Some((head, rest)) => (head.trim(), rest),
        None => ("", decision),
    };
    let words: Vec<&str> = rest
        .split_whitespace()
        .filter(|w| {
            !w.contains('/') && !w.contains('.') && !w.chars().any(|c| c.is_ascii_digit())
        })
        .take(2)
        .collect();
    if head.is_empty() {
        words.join(" ").to_lowercase()
    } else if words.is_empty() {
        head.to_lowercase()
    } else {
        format!("{} {}", head.to_lowercase(), words.join(" ").to_lowercase())
    }
}
