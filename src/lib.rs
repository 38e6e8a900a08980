//! Kait - self-improving advisory engine for AI coding agents.
//!
//! Kait observes a coding agent's tool-use events, distills them into
//! reliability-scored insights, and feeds just-in-time advice back to the
//! agent before tool calls. The loop closes through implicit feedback: if
//! the next tool call succeeds after advice was shown, the advice's source
//! is validated; if it fails, contradicted. Insights that stay reliable get
//! promoted into external guidance files.

pub mod advisory;
pub mod bus;
pub mod cognitive;
pub mod config;
pub mod eidos;
pub mod error;
pub mod event;
pub mod feedback;
pub mod heartbeat;
pub mod hook;
pub mod ingest;
pub mod memory;
pub mod pipeline;
pub mod promotion;
pub mod queue;
pub mod ralph;
pub mod runtime;
pub mod util;

pub use advisory::{AdviceItem, AdviceRequest, Advisor, Route, SourceKind};
pub use bus::{BusEvent, EventBus};
pub use cognitive::{CognitiveStore, Insight, InsightCategory};
pub use config::Config;
pub use eidos::{Distillation, EidosStore, Episode, Step};
pub use error::{ErrorClass, KaitError, Result};
pub use event::{Event, EventKind, Priority, QueueEntry};
pub use feedback::FeedbackMatcher;
pub use memory::MemoryCapture;
pub use pipeline::Pipeline;
pub use promotion::PromotionLoop;
pub use queue::EventQueue;
pub use ralph::{MetaRalph, Verdict, VerdictKind};
pub use runtime::Runtime;
