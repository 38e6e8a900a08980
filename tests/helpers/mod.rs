#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use kait::cognitive::{Insight, InsightCategory};
use kait::config::Config;
use kait::event::{Event, EventKind, QueueEntry};
use kait::pipeline::Pipeline;
use kait::runtime::Runtime;

/// A fully bootstrapped runtime over a throwaway data root.
pub struct TestKait {
    pub runtime: Arc<Runtime>,
    pub dir: TempDir,
}

/// Bootstrap a runtime with default config in a temp data root.
pub fn kait() -> TestKait {
    kait_with(Config::default())
}

/// Bootstrap a runtime with a custom config in a temp data root.
pub fn kait_with(config: Config) -> TestKait {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(Runtime::bootstrap(dir.path(), config).unwrap());
    TestKait { runtime, dir }
}

impl TestKait {
    /// Seed a cognitive insight with the given validation count and rebuild
    /// the advisory indexes. Returns the insight key.
    pub fn seed_insight(&self, statement: &str, validations: usize) -> String {
        let mut insight = Insight::new(InsightCategory::Wisdom, statement, "test");
        for i in 0..validations {
            insight.validate(&format!("seed-{}", i), Utc::now(), 14 * 86_400);
        }
        let key = insight.key.clone();
        self.runtime
            .cognitive
            .write()
            .unwrap()
            .upsert(insight)
            .unwrap();
        self.runtime.advisor.refresh(&[]).unwrap();
        key
    }

    /// Enqueue an event directly, bypassing HTTP.
    pub fn enqueue(&self, event: Event) {
        self.runtime
            .queue
            .append(&QueueEntry::for_event(event))
            .unwrap();
    }

    /// Build a pipeline over this runtime's stores.
    pub fn pipeline(&self) -> Pipeline {
        self.runtime.build_pipeline()
    }

    /// Validation count of a cognitive insight.
    pub fn validations(&self, key: &str) -> u64 {
        self.runtime
            .cognitive
            .read()
            .unwrap()
            .get(key)
            .map(|i| i.validations)
            .unwrap_or(0)
    }

    /// Contradiction count of a cognitive insight.
    pub fn contradictions(&self, key: &str) -> u64 {
        self.runtime
            .cognitive
            .read()
            .unwrap()
            .get(key)
            .map(|i| i.contradictions)
            .unwrap_or(0)
    }
}

/// An event with importance pinned high enough to dodge sampling.
pub fn important(mut event: Event) -> Event {
    event.importance = 0.5;
    event
}

/// An event with its timestamp pushed into the past, in seconds.
pub fn backdated(mut event: Event, seconds_ago: i64) -> Event {
    event.ts_ns -= seconds_ago * 1_000_000_000;
    event
}

/// A pre-tool event for a tool with simple args.
pub fn pre_tool(session: &str, tool: &str) -> Event {
    important(
        Event::new(session, EventKind::PreTool)
            .with_tool(tool)
            .with_args(serde_json::json!({"path": "src/lib.rs"})),
    )
}

/// A successful post-tool event.
pub fn post_tool(session: &str, tool: &str) -> Event {
    important(Event::new(session, EventKind::PostTool).with_tool(tool))
}

/// A failed post-tool event.
pub fn post_tool_failure(session: &str, tool: &str) -> Event {
    important(Event::new(session, EventKind::PostToolFailure).with_tool(tool))
}

/// A user prompt event.
pub fn user_prompt(session: &str, text: &str) -> Event {
    important(Event::new(session, EventKind::UserPrompt).with_text(text))
}
