//! Memory capture: scanning events for high-signal, remember-worthy text.
//!
//! Each event's text is scanned for explicit intent markers and structural
//! cues, scored 0-1, and chunks above the threshold are queued as pending
//! memories. Pending memories are candidates only; Meta-Ralph decides what
//! actually reaches the cognitive store.

use serde::{Deserialize, Serialize};

use crate::cognitive::InsightCategory;
use crate::config::MemoryConfig;
use crate::event::{Event, EventKind};

/// Score weights for capture signals.
///
/// Combined via max: a chunk scores as high as its strongest signal.
pub mod weights {
    /// Explicit memory request ("remember", "always", "never").
    pub const EXPLICIT_MARKER: f64 = 0.95;
    /// Correction of prior behavior ("actually", "that's wrong").
    pub const CORRECTION: f64 = 0.85;
    /// Tool failure narrative in the text.
    pub const FAILURE: f64 = 0.8;
    /// The agent reporting something it learned.
    pub const LEARNED: f64 = 0.7;
    /// Completed-task summary.
    pub const TASK_SUMMARY: f64 = 0.6;
    /// Plain user prompt with no markers. Sits exactly at the default
    /// threshold: every prompt reaches the quality gate, which is where
    /// trivial ones are rejected.
    pub const BASELINE_PROMPT: f64 = 0.5;
    /// Any other event text.
    pub const BASELINE_OTHER: f64 = 0.1;
}

/// Markers that indicate a correction of prior behavior.
const CORRECTION_MARKERS: &[&str] = &[
    "actually",
    "that's wrong",
    "that is wrong",
    "no, ",
    "i meant",
    "not what i asked",
    "you misunderstood",
];

/// Markers that indicate the agent learned something.
const LEARNED_MARKERS: &[&str] = &["learned that", "i learned", "turns out", "discovered that"];

/// Markers that indicate a completed-task summary.
const TASK_MARKERS: &[&str] = &["task completed", "finished implementing", "done:"];

/// Markers that indicate a failure narrative.
const FAILURE_MARKERS: &[&str] = &["failed", "error:", "panicked", "exception", "denied"];

/// A scored candidate insight waiting for the quality gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMemory {
    /// The captured text chunk.
    pub text: String,
    /// Candidate category.
    pub category: MemoryCategory,
    /// Capture score in [0, 1].
    pub score: f64,
    /// Session the source event belongs to.
    pub session_id: String,
    /// Source event id.
    pub event_id: String,
    /// Source event kind.
    pub kind: EventKind,
    /// Tool involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// Category assigned at capture time.
///
/// A narrower set than the cognitive categories: capture cannot tell
/// reasoning insights apart from wisdom, so Meta-Ralph inherits the mapping
/// below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Transferable judgment about how to work.
    Wisdom,
    /// The agent's own failure modes.
    SelfAwareness,
    /// Facts about this user's preferences.
    UserUnderstanding,
    /// Observations about the learning loop.
    MetaLearning,
}

impl MemoryCategory {
    /// Map into the cognitive store's category space.
    pub fn to_insight_category(self) -> InsightCategory {
        match self {
            MemoryCategory::Wisdom => InsightCategory::Wisdom,
            MemoryCategory::SelfAwareness => InsightCategory::SelfAwareness,
            MemoryCategory::UserUnderstanding => InsightCategory::UserUnderstanding,
            MemoryCategory::MetaLearning => InsightCategory::MetaLearning,
        }
    }
}

/// The memory capture stage.
#[derive(Debug, Clone)]
pub struct MemoryCapture {
    cfg: MemoryConfig,
}

impl MemoryCapture {
    /// Create a capture stage with the given configuration.
    pub fn new(cfg: MemoryConfig) -> Self {
        Self { cfg }
    }

    /// Scan an event and return pending memories at or above the threshold.
    pub fn capture(&self, event: &Event) -> Vec<PendingMemory> {
        let Some(text) = &event.text else {
            return Vec::new();
        };

        let mut pending = Vec::new();
        for chunk in self.chunks(text, event.kind) {
            let score = score_chunk(&chunk, event.kind);
            if score >= self.cfg.mem_threshold {
                pending.push(PendingMemory {
                    category: categorize(&chunk),
                    text: chunk,
                    score,
                    session_id: event.session_id.clone(),
                    event_id: event.event_id.clone(),
                    kind: event.kind,
                    tool: event.tool.clone(),
                });
            }
        }
        pending
    }

    /// Split text into capture-sized chunks on paragraph boundaries.
    ///
    /// Chunks shorter than `patch_min_chars` carry too little signal and are
    /// dropped, except in user prompts: even a trivial prompt goes to the
    /// quality gate so its rejection is on record.
    fn chunks(&self, text: &str, kind: EventKind) -> Vec<String> {
        let min_chars = if kind == EventKind::UserPrompt {
            1
        } else {
            self.cfg.patch_min_chars
        };
        let mut chunks = Vec::new();
        for paragraph in text.split("\n\n") {
            let trimmed = paragraph.trim();
            if trimmed.chars().count() < min_chars {
                continue;
            }
            if trimmed.chars().count() <= self.cfg.patch_max_chars {
                chunks.push(trimmed.to_string());
            } else {
                let mut current = String::new();
                for word in trimmed.split_whitespace() {
                    if current.chars().count() + word.chars().count() + 1
                        > self.cfg.patch_max_chars
                        && !current.is_empty()
                    {
                        chunks.push(current.trim().to_string());
                        current = String::new();
                    }
                    current.push_str(word);
                    current.push(' ');
                }
                if current.trim().chars().count() >= min_chars {
                    chunks.push(current.trim().to_string());
                }
            }
        }
        chunks
    }
}

/// Score a chunk by its strongest signal.
fn score_chunk(chunk: &str, kind: EventKind) -> f64 {
    let lower = chunk.to_lowercase();
    let mut score: f64 = match kind {
        EventKind::UserPrompt => weights::BASELINE_PROMPT,
        _ => weights::BASELINE_OTHER,
    };

    if crate::event::MEMORY_MARKERS.iter().any(|m| lower.contains(m)) {
        score = score.max(weights::EXPLICIT_MARKER);
    }
    if CORRECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        score = score.max(weights::CORRECTION);
    }
    if kind == EventKind::PostToolFailure || FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        score = score.max(weights::FAILURE);
    }
    if LEARNED_MARKERS.iter().any(|m| lower.contains(m)) {
        score = score.max(weights::LEARNED);
    }
    if TASK_MARKERS.iter().any(|m| lower.contains(m)) {
        score = score.max(weights::TASK_SUMMARY);
    }

    score.clamp(0.0, 1.0)
}

/// Assign a capture category from the chunk's content.
fn categorize(chunk: &str) -> MemoryCategory {
    let lower = chunk.to_lowercase();

    if lower.contains("i prefer")
        || lower.contains("the user")
        || lower.contains("my project")
        || lower.contains("our codebase")
        || lower.contains("i want you")
    {
        return MemoryCategory::UserUnderstanding;
    }
    if lower.contains("i keep") || lower.contains("i tend to") || lower.contains("my mistake") {
        return MemoryCategory::SelfAwareness;
    }
    if lower.contains("learning") || lower.contains("feedback loop") || lower.contains("advice") {
        return MemoryCategory::MetaLearning;
    }
    MemoryCategory::Wisdom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> MemoryCapture {
        MemoryCapture::new(MemoryConfig::default())
    }

    fn prompt(text: &str) -> Event {
        Event::new("s1", EventKind::UserPrompt).with_text(text)
    }

    #[test]
    fn test_explicit_marker_is_captured() {
        let event = prompt("Remember to always run the formatter before committing changes");
        let pending = capture().capture(&event);

        assert_eq!(pending.len(), 1);
        assert!(pending[0].score >= weights::EXPLICIT_MARKER);
        assert_eq!(pending[0].session_id, "s1");
        assert_eq!(pending[0].kind, EventKind::UserPrompt);
    }

    #[test]
    fn test_plain_prompt_captured_at_baseline() {
        let event = prompt("can you explain what this function does in detail please");
        let pending = capture().capture(&event);

        // Every prompt reaches the gate; the gate does the rejecting
        assert_eq!(pending.len(), 1);
        assert!((pending[0].score - weights::BASELINE_PROMPT).abs() < f64::EPSILON);
    }

    #[test]
    fn test_plain_tool_output_scores_below_threshold() {
        let event = Event::new("s1", EventKind::PostTool)
            .with_tool("Read")
            .with_text("the file contents were printed without anything notable in them");
        assert!(capture().capture(&event).is_empty());
    }

    #[test]
    fn test_correction_marker() {
        let event = prompt("Actually that's wrong, the config lives in the workspace root");
        let pending = capture().capture(&event);

        assert_eq!(pending.len(), 1);
        assert!(pending[0].score >= weights::CORRECTION);
    }

    #[test]
    fn test_failure_event_bias() {
        let event = Event::new("s1", EventKind::PostToolFailure)
            .with_tool("Bash")
            .with_text("command failed with exit code 1 because the lockfile was missing");
        let pending = capture().capture(&event);

        assert_eq!(pending.len(), 1);
        assert!(pending[0].score >= weights::FAILURE);
        assert_eq!(pending[0].tool.as_deref(), Some("Bash"));
    }

    #[test]
    fn test_no_text_captures_nothing() {
        let event = Event::new("s1", EventKind::PostTool).with_tool("Read");
        assert!(capture().capture(&event).is_empty());
    }

    #[test]
    fn test_short_chunks_dropped_for_tool_output() {
        let event = Event::new("s1", EventKind::PostToolFailure)
            .with_tool("Bash")
            .with_text("failed");
        assert!(capture().capture(&event).is_empty());
    }

    #[test]
    fn test_short_prompt_still_reaches_gate() {
        let pending = capture().capture(&prompt("import sys"));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].text, "import sys");
    }

    #[test]
    fn test_long_text_is_chunked() {
        let sentence = "never commit directly to main without review because it breaks CI ";
        let long = sentence.repeat(60);
        let event = prompt(&long);
        let pending = capture().capture(&event);

        assert!(pending.len() > 1);
        for p in &pending {
            assert!(p.text.chars().count() <= MemoryConfig::default().patch_max_chars);
        }
    }

    #[test]
    fn test_categorization() {
        assert_eq!(
            categorize("I prefer tabs over spaces in this repository"),
            MemoryCategory::UserUnderstanding
        );
        assert_eq!(
            categorize("I keep forgetting to check the lockfile"),
            MemoryCategory::SelfAwareness
        );
        assert_eq!(
            categorize("the advice shown before tool calls was useful"),
            MemoryCategory::MetaLearning
        );
        assert_eq!(
            categorize("use glob before read when unsure about paths"),
            MemoryCategory::Wisdom
        );
    }

    #[test]
    fn test_category_mapping_to_insights() {
        assert_eq!(
            MemoryCategory::Wisdom.to_insight_category(),
            InsightCategory::Wisdom
        );
        assert_eq!(
            MemoryCategory::UserUnderstanding.to_insight_category(),
            InsightCategory::UserUnderstanding
        );
    }

    #[test]
    fn test_paragraphs_scored_independently() {
        let text = "Remember to always pin dependency versions in the manifest file.\n\n\
                    This second paragraph is plain filler without any markers at all here.";
        let pending = capture().capture(&prompt(text));

        assert_eq!(pending.len(), 2);
        assert!(pending[0].text.starts_with("Remember"));
        assert!(pending[0].score > pending[1].score);
    }
}
