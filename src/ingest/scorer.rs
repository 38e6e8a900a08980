//! Rule-based importance scoring at ingest.
//!
//! Every accepted event gets an importance in [0, 1] before it is queued.
//! Signals combine via max: an event is as important as its strongest
//! marker, with kind-level biases as the floor.

use crate::event::{Event, EventKind, MEMORY_MARKERS};

/// Score weights for importance signals.
pub mod weights {
    /// Explicit memory request in the text.
    pub const EXPLICIT_MARKER: f64 = 0.95;
    /// Correction of prior behavior.
    pub const CORRECTION: f64 = 0.85;
    /// Tool failure bias.
    pub const FAILURE_BIAS: f64 = 0.8;
    /// User prompt bias.
    pub const USER_PROMPT_BIAS: f64 = 0.5;
    /// Tool success bias.
    pub const POST_TOOL_BIAS: f64 = 0.2;
    /// Pre-tool observation bias.
    pub const PRE_TOOL_BIAS: f64 = 0.1;
}

/// Correction markers scanned in event text.
const CORRECTION_MARKERS: &[&str] = &[
    "actually",
    "that's wrong",
    "that is wrong",
    "no, ",
    "i meant",
    "not what i asked",
];

/// Score one event.
pub fn score(event: &Event) -> f64 {
    let mut score = match event.kind {
        EventKind::PostToolFailure => weights::FAILURE_BIAS,
        EventKind::UserPrompt => weights::USER_PROMPT_BIAS,
        EventKind::PostTool => weights::POST_TOOL_BIAS,
        EventKind::PreTool => weights::PRE_TOOL_BIAS,
    };

    if let Some(text) = &event.text {
        let lower = text.to_lowercase();
        if MEMORY_MARKERS.iter().any(|m| lower.contains(m)) {
            score = score.max(weights::EXPLICIT_MARKER);
        }
        if CORRECTION_MARKERS.iter().any(|m| lower.contains(m)) {
            score = score.max(weights::CORRECTION);
        }
    }

    score.clamp(0.0, 1.0)
}
