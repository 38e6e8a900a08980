//! Event and queue-entry types.
//!
//! An [`Event`] is one observed hook invocation from the coding agent. It is
//! immutable once ingested: the pipeline consumes it, the stores derive from
//! it, but nothing ever rewrites it.

use serde::{Deserialize, Serialize};

use crate::error::{KaitError, Result};
use crate::util;

/// Schema version for events on the wire and in the queue.
pub const EVENT_SCHEMA_VERSION: u8 = 1;

/// Maximum accepted length for an event's free text, in characters.
pub const EVENT_TEXT_MAX_CHARS: usize = 100_000;

/// Markers in a user prompt that signal an explicit memory request.
///
/// Events carrying one of these are queued at high priority and bias the
/// importance scorer.
pub const MEMORY_MARKERS: &[&str] = &[
    "remember",
    "always",
    "never",
    "don't forget",
    "important:",
    "note for next time",
];

/// The kind of hook invocation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The agent is about to invoke a tool.
    PreTool,
    /// A tool invocation completed successfully.
    PostTool,
    /// A tool invocation failed.
    PostToolFailure,
    /// The user sent a prompt.
    UserPrompt,
}

impl EventKind {
    /// All kinds, for iteration in tests and parsers.
    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::PreTool,
            EventKind::PostTool,
            EventKind::PostToolFailure,
            EventKind::UserPrompt,
        ]
    }

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PreTool => "pre_tool",
            EventKind::PostTool => "post_tool",
            EventKind::PostToolFailure => "post_tool_failure",
            EventKind::UserPrompt => "user_prompt",
        }
    }

    /// Whether this kind reports a tool outcome (success or failure).
    pub fn is_outcome(&self) -> bool {
        matches!(self, EventKind::PostTool | EventKind::PostToolFailure)
    }
}

/// One observed hook invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotone, lexicographically sortable id assigned at ingest.
    /// Hooks may omit it; the daemon fills it in.
    #[serde(default)]
    pub event_id: String,
    /// Session the event belongs to.
    pub session_id: String,
    /// Hook kind.
    pub kind: EventKind,
    /// Tool name, for tool-related kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Opaque tool arguments; consumers validate only the fields they need.
    #[serde(default)]
    pub tool_args: serde_json::Value,
    /// Free text (prompt text, tool output summary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Wall-clock nanoseconds when the hook fired. Zero means "stamp at
    /// ingest".
    #[serde(default)]
    pub ts_ns: i64,
    /// Name of the hook that produced the event.
    #[serde(default)]
    pub source: String,
    /// Importance in [0, 1], assigned by the ingest scorer.
    #[serde(default)]
    pub importance: f64,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp.
    pub fn new(session_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_id: util::next_event_id(),
            session_id: session_id.into(),
            kind,
            tool: None,
            tool_args: serde_json::Value::Null,
            text: None,
            ts_ns: util::now_ns(),
            source: "observe".to_string(),
            importance: 0.0,
        }
    }

    /// Set the tool name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Set the tool arguments.
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.tool_args = args;
        self
    }

    /// Set the free text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set the source hook name.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Validate an event received from the wire.
    ///
    /// Checks only what every consumer relies on; the opaque `tool_args`
    /// blob is deliberately not inspected here.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(KaitError::bad_input("event missing session_id"));
        }
        if self.kind.is_outcome() && self.tool.is_none() {
            return Err(KaitError::bad_input(format!(
                "{} event missing tool",
                self.kind.as_str()
            )));
        }
        if let Some(text) = &self.text {
            if text.chars().count() > EVENT_TEXT_MAX_CHARS {
                return Err(KaitError::bad_input(format!(
                    "event text exceeds {} chars",
                    EVENT_TEXT_MAX_CHARS
                )));
            }
        }
        Ok(())
    }

    /// A short, normalized head of the tool arguments.
    ///
    /// Used for step decisions and packet-cache keys. Prefers the argument
    /// that names what the tool acts on; falls back to the first value.
    pub fn arg_head(&self) -> String {
        normalized_arg_head(&self.tool_args)
    }

    /// Whether the event text carries an explicit memory marker.
    pub fn has_memory_marker(&self) -> bool {
        let Some(text) = &self.text else {
            return false;
        };
        let lower = text.to_lowercase();
        MEMORY_MARKERS.iter().any(|m| lower.contains(m))
    }
}

/// Argument keys checked, in order, when deriving an argument head.
const ARG_HEAD_KEYS: &[&str] = &["command", "path", "file_path", "pattern", "query", "url"];

/// Maximum characters kept in an argument head.
const ARG_HEAD_MAX_CHARS: usize = 60;

/// Derive a short, normalized head from an opaque argument blob.
pub fn normalized_arg_head(args: &serde_json::Value) -> String {
    let raw = match args {
        serde_json::Value::Object(map) => ARG_HEAD_KEYS
            .iter()
            .find_map(|k| map.get(*k))
            .or_else(|| map.values().next())
            .map(value_to_compact_string)
            .unwrap_or_default(),
        serde_json::Value::Null => String::new(),
        other => value_to_compact_string(other),
    };

    raw.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(ARG_HEAD_MAX_CHARS)
        .collect()
}

fn value_to_compact_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Processing priority of a queued event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Failures and explicit memory requests: processed first.
    High,
    /// User prompts and tool outcomes.
    Medium,
    /// Pre-tool observations.
    Low,
}

/// An event paired with its derived priority, as stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    /// The event itself.
    pub event: Event,
    /// Derived processing priority.
    pub priority: Priority,
}

impl QueueEntry {
    /// Wrap an event, deriving its priority.
    ///
    /// High: tool failures, and user prompts carrying a memory marker.
    /// Medium: other user prompts and tool successes. Low: pre-tool.
    pub fn for_event(event: Event) -> Self {
        let priority = match event.kind {
            EventKind::PostToolFailure => Priority::High,
            EventKind::UserPrompt if event.has_memory_marker() => Priority::High,
            EventKind::UserPrompt | EventKind::PostTool => Priority::Medium,
            EventKind::PreTool => Priority::Low,
        };
        Self { event, priority }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_new_defaults() {
        let event = Event::new("s1", EventKind::PreTool);

        assert!(event.event_id.starts_with("evt_"));
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.kind, EventKind::PreTool);
        assert!(event.tool.is_none());
        assert_eq!(event.tool_args, serde_json::Value::Null);
        assert_eq!(event.source, "observe");
        assert_eq!(event.importance, 0.0);
    }

    #[test]
    fn test_event_builders() {
        let event = Event::new("s1", EventKind::PostTool)
            .with_tool("Read")
            .with_args(serde_json::json!({"path": "main.rs"}))
            .with_text("ok")
            .with_source("post_tool_hook");

        assert_eq!(event.tool.as_deref(), Some("Read"));
        assert_eq!(event.tool_args["path"], "main.rs");
        assert_eq!(event.text.as_deref(), Some("ok"));
        assert_eq!(event.source, "post_tool_hook");
    }

    #[test]
    fn test_kind_serialization_is_snake_case() {
        let cases = [
            (EventKind::PreTool, "\"pre_tool\""),
            (EventKind::PostTool, "\"post_tool\""),
            (EventKind::PostToolFailure, "\"post_tool_failure\""),
            (EventKind::UserPrompt, "\"user_prompt\""),
        ];
        for (kind, expected) in cases {
            assert_eq!(serde_json::to_string(&kind).unwrap(), expected);
            assert_eq!(kind.as_str(), expected.trim_matches('"'));
            let parsed: EventKind = serde_json::from_str(expected).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_validate_requires_session() {
        let mut event = Event::new("", EventKind::PreTool);
        assert!(event.validate().is_err());
        event.session_id = "s1".to_string();
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validate_outcome_requires_tool() {
        let event = Event::new("s1", EventKind::PostToolFailure);
        assert!(event.validate().is_err());

        let event = event.with_tool("Bash");
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_text() {
        let event =
            Event::new("s1", EventKind::UserPrompt).with_text("x".repeat(EVENT_TEXT_MAX_CHARS + 1));
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_memory_marker_detection() {
        let event = Event::new("s1", EventKind::UserPrompt)
            .with_text("Remember to run the formatter before committing");
        assert!(event.has_memory_marker());

        let event = Event::new("s1", EventKind::UserPrompt).with_text("what does this do?");
        assert!(!event.has_memory_marker());

        let event = Event::new("s1", EventKind::UserPrompt);
        assert!(!event.has_memory_marker());
    }

    #[test]
    fn test_priority_derivation() {
        let failure = Event::new("s1", EventKind::PostToolFailure).with_tool("Bash");
        assert_eq!(QueueEntry::for_event(failure).priority, Priority::High);

        let remember =
            Event::new("s1", EventKind::UserPrompt).with_text("always use glob before read");
        assert_eq!(QueueEntry::for_event(remember).priority, Priority::High);

        let prompt = Event::new("s1", EventKind::UserPrompt).with_text("hi");
        assert_eq!(QueueEntry::for_event(prompt).priority, Priority::Medium);

        let success = Event::new("s1", EventKind::PostTool).with_tool("Read");
        assert_eq!(QueueEntry::for_event(success).priority, Priority::Medium);

        let pre = Event::new("s1", EventKind::PreTool).with_tool("Read");
        assert_eq!(QueueEntry::for_event(pre).priority, Priority::Low);
    }

    #[test]
    fn test_priority_ordering_high_first() {
        let mut priorities = vec![Priority::Low, Priority::High, Priority::Medium];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn test_queue_entry_roundtrip() {
        let entry = QueueEntry::for_event(
            Event::new("s1", EventKind::PostTool)
                .with_tool("Bash")
                .with_text("exit 0"),
        );

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, parsed);
    }

    #[test]
    fn test_arg_head_prefers_named_keys() {
        let event = Event::new("s1", EventKind::PreTool)
            .with_tool("Bash")
            .with_args(serde_json::json!({"description": "x", "command": "Cargo  Test --all"}));
        assert_eq!(event.arg_head(), "cargo test --all");
    }

    #[test]
    fn test_arg_head_truncates_and_handles_null() {
        let event = Event::new("s1", EventKind::PreTool)
            .with_args(serde_json::json!({"path": "p".repeat(200)}));
        assert_eq!(event.arg_head().chars().count(), 60);

        let event = Event::new("s1", EventKind::PreTool);
        assert_eq!(event.arg_head(), "");
    }

    #[test]
    fn test_event_wire_schema_accepts_minimal_payload() {
        let json = r#"{
            "event_id": "evt_0000000000000001",
            "session_id": "s1",
            "kind": "pre_tool",
            "tool": "Bash",
            "ts_ns": 0
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::PreTool);
        assert_eq!(event.tool_args, serde_json::Value::Null);
        assert_eq!(event.importance, 0.0);
        assert!(event.validate().is_ok());
    }
}
