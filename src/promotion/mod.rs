//! Promotion of high-reliability insights into external guidance files.
//!
//! A throttled pass scans the cognitive store: insights at or above the
//! reliability and validation floors are appended to the guidance file their
//! category maps to; promoted insights whose reliability has degraded are
//! demoted and their lines removed. Every action appends to the promotion
//! log.
//!
//! Managed lines carry a key marker comment so the demotion pass removes
//! exactly its own lines and never touches hand-written content.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cognitive::CognitiveStore;
use crate::config::PromotionConfig;
use crate::error::{KaitError, Result};
use crate::util;

/// Reason recorded when a degraded insight is demoted.
pub const REASON_RELIABILITY_DEGRADED: &str = "reliability_degraded";

/// What a promotion-log row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionAction {
    /// The insight was written to a guidance file.
    Promoted,
    /// The insight was removed from a guidance file.
    Demoted,
}

/// One row of the promotion log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionRecord {
    /// Insight key.
    pub key: String,
    /// Promoted or demoted.
    pub action: PromotionAction,
    /// Guidance file involved.
    pub target_file: String,
    /// Reliability at the time of the action.
    pub reliability: f64,
    /// Validations at the time of the action.
    pub validations: u64,
    /// Demotion reason, absent for promotions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the action happened.
    pub ts: DateTime<Utc>,
}

/// The promotion loop. One instance runs at a time, on a timer.
#[derive(Debug)]
pub struct PromotionLoop {
    cfg: PromotionConfig,
    guidance_dir: PathBuf,
    log_path: PathBuf,
    last_run: Option<DateTime<Utc>>,
}

impl PromotionLoop {
    /// Create a loop writing guidance files under `guidance_dir`.
    pub fn new(
        cfg: PromotionConfig,
        guidance_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        let guidance_dir = cfg
            .guidance_dir
            .clone()
            .unwrap_or_else(|| guidance_dir.into());
        Self {
            cfg,
            guidance_dir,
            log_path: log_path.into(),
            last_run: None,
        }
    }

    /// Run one pass if the interval has elapsed.
    ///
    /// Returns the records written, empty when throttled.
    pub fn tick(
        &mut self,
        store: &mut CognitiveStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<PromotionRecord>> {
        if let Some(last) = self.last_run {
            if (now - last).num_seconds() < self.cfg.interval_s as i64 {
                return Ok(Vec::new());
            }
        }
        self.last_run = Some(now);
        self.run(store, now)
    }

    /// Run one pass unconditionally.
    pub fn run(
        &self,
        store: &mut CognitiveStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<PromotionRecord>> {
        let mut records = Vec::new();

        // Demotions first so a degraded insight cannot survive the pass
        for insight in store.promoted_below(self.cfg.demotion_threshold) {
            let Some(demotion) = store.demote(&insight.key, REASON_RELIABILITY_DEGRADED)? else {
                continue;
            };
            let target = self.guidance_dir.join(&demotion.promoted_to);
            remove_guidance_line(&target, &insight.key)?;

            let record = PromotionRecord {
                key: insight.key.clone(),
                action: PromotionAction::Demoted,
                target_file: demotion.promoted_to,
                reliability: insight.reliability,
                validations: insight.validations,
                reason: Some(REASON_RELIABILITY_DEGRADED.to_string()),
                ts: now,
            };
            util::append_jsonl(&self.log_path, &record)?;
            records.push(record);
        }

        for insight in
            store.eligible_for_promotion(self.cfg.promote_reliability, self.cfg.promote_validations)
        {
            let file_name = insight.category.promotion_target();
            let target = self.guidance_dir.join(file_name);
            append_guidance_line(&target, &insight.key, &insight.statement)?;
            store.mark_promoted(&insight.key, file_name)?;

            let record = PromotionRecord {
                key: insight.key.clone(),
                action: PromotionAction::Promoted,
                target_file: file_name.to_string(),
                reliability: insight.reliability,
                validations: insight.validations,
                reason: None,
                ts: now,
            };
            util::append_jsonl(&self.log_path, &record)?;
            records.push(record);
        }

        if !records.is_empty() {
            tracing::info!(count = records.len(), "promotion pass wrote records");
        }
        Ok(records)
    }

    /// Directory the guidance files live in.
    pub fn guidance_dir(&self) -> &Path {
        &self.guidance_dir
    }
}

/// The marker comment identifying a managed line.
fn key_marker(key: &str) -> String {
    format!("<!-- kait:{} -->", key)
}

/// Append a managed guidance line, skipping if the key is already present.
fn append_guidance_line(path: &Path, key: &str, statement: &str) -> Result<()> {
    let marker = key_marker(key);
    if path.exists() {
        let content = util::read_to_string_limited(path)?;
        if content.contains(&marker) {
            return Ok(());
        }
    }
    util::append_line(path, &format!("- {} {}", statement, marker))
}

/// Remove a managed guidance line by its key marker.
fn remove_guidance_line(path: &Path, key: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let marker = key_marker(key);
    let content = util::read_to_string_limited(path)?;
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| !line.contains(&marker))
        .collect();

    if kept.is_empty() {
        fs::remove_file(path).map_err(|e| KaitError::storage(path, e))?;
        return Ok(());
    }
    util::atomic_write_string(path, &format!("{}\n", kept.join("\n")))
}

/// Whether a guidance file currently carries a managed line for a key.
pub fn guidance_contains(path: &Path, key: &str) -> bool {
    fs::read_to_string(path)
        .map(|content| content.contains(&key_marker(key)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::{Insight, InsightCategory};
    use crate::config::CognitiveConfig;
    use tempfile::TempDir;

    fn store_with(dir: &TempDir, insights: Vec<Insight>) -> CognitiveStore {
        let mut store = CognitiveStore::open(
            dir.path().join("cognitive_insights.json"),
            &CognitiveConfig::default(),
        )
        .unwrap();
        for insight in insights {
            store.upsert(insight).unwrap();
        }
        store
    }

    fn strong_insight(category: InsightCategory, statement: &str) -> Insight {
        let mut insight = Insight::new(category, statement, "test");
        for i in 0..10 {
            insight.validate(&format!("e{}", i), Utc::now(), 14 * 86_400);
        }
        insight
    }

    fn promotion_loop(dir: &TempDir) -> PromotionLoop {
        PromotionLoop::new(
            PromotionConfig::default(),
            dir.path(),
            dir.path().join("promotion_log.jsonl"),
        )
    }

    #[test]
    fn test_eligible_insight_is_promoted() {
        let dir = TempDir::new().unwrap();
        let insight = strong_insight(InsightCategory::Wisdom, "use glob before read");
        let key = insight.key.clone();
        let mut store = store_with(&dir, vec![insight]);

        let records = promotion_loop(&dir).run(&mut store, Utc::now()).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, PromotionAction::Promoted);
        assert_eq!(records[0].target_file, "CLAUDE.md");

        let stored = store.get(&key).unwrap();
        assert!(stored.promoted);
        assert_eq!(stored.promoted_to.as_deref(), Some("CLAUDE.md"));

        let guidance = dir.path().join("CLAUDE.md");
        assert!(guidance_contains(&guidance, &key));
        let content = fs::read_to_string(&guidance).unwrap();
        assert!(content.contains("- use glob before read"));
    }

    #[test]
    fn test_category_routes_to_file() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(
            &dir,
            vec![
                strong_insight(InsightCategory::UserUnderstanding, "prefers short answers"),
                strong_insight(InsightCategory::SelfAwareness, "tends to over-edit files"),
                strong_insight(InsightCategory::Reasoning, "verify inputs before retrying"),
            ],
        );

        promotion_loop(&dir).run(&mut store, Utc::now()).unwrap();

        assert!(dir.path().join("AGENTS.md").exists());
        assert!(dir.path().join("SOUL.md").exists());
        assert!(dir.path().join("TOOLS.md").exists());
    }

    #[test]
    fn test_weak_insight_not_promoted() {
        let dir = TempDir::new().unwrap();
        let mut weak = Insight::new(InsightCategory::Wisdom, "barely tested", "test");
        weak.validate("e1", Utc::now(), 86_400);
        let mut store = store_with(&dir, vec![weak]);

        let records = promotion_loop(&dir).run(&mut store, Utc::now()).unwrap();
        assert!(records.is_empty());
        assert!(!dir.path().join("CLAUDE.md").exists());
    }

    #[test]
    fn test_promotion_is_not_repeated() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(
            &dir,
            vec![strong_insight(InsightCategory::Wisdom, "use glob before read")],
        );
        let promotion = promotion_loop(&dir);

        promotion.run(&mut store, Utc::now()).unwrap();
        let records = promotion.run(&mut store, Utc::now()).unwrap();
        assert!(records.is_empty());

        let content = fs::read_to_string(dir.path().join("CLAUDE.md")).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_degraded_insight_is_demoted_and_line_removed() {
        let dir = TempDir::new().unwrap();
        let insight = strong_insight(InsightCategory::Wisdom, "use glob before read");
        let key = insight.key.clone();
        let mut store = store_with(&dir, vec![insight]);
        let promotion = promotion_loop(&dir);

        promotion.run(&mut store, Utc::now()).unwrap();
        assert!(guidance_contains(&dir.path().join("CLAUDE.md"), &key));

        // Ten contradictions drop reliability to 0.5, below the 0.65 floor
        for i in 0..10 {
            store.contradict(&key, &format!("c{}", i)).unwrap();
        }

        let records = promotion.run(&mut store, Utc::now()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, PromotionAction::Demoted);
        assert_eq!(
            records[0].reason.as_deref(),
            Some(REASON_RELIABILITY_DEGRADED)
        );

        assert!(!guidance_contains(&dir.path().join("CLAUDE.md"), &key));
        assert!(!store.get(&key).unwrap().promoted);
    }

    #[test]
    fn test_demotion_preserves_other_lines() {
        let dir = TempDir::new().unwrap();
        let a = strong_insight(InsightCategory::Wisdom, "first statement to keep");
        let b = strong_insight(InsightCategory::Wisdom, "second statement to drop");
        let key_a = a.key.clone();
        let key_b = b.key.clone();
        let mut store = store_with(&dir, vec![a, b]);
        let promotion = promotion_loop(&dir);

        promotion.run(&mut store, Utc::now()).unwrap();
        for i in 0..10 {
            store.contradict(&key_b, &format!("c{}", i)).unwrap();
        }
        promotion.run(&mut store, Utc::now()).unwrap();

        let guidance = dir.path().join("CLAUDE.md");
        assert!(guidance_contains(&guidance, &key_a));
        assert!(!guidance_contains(&guidance, &key_b));
    }

    #[test]
    fn test_hand_written_content_untouched() {
        let dir = TempDir::new().unwrap();
        let guidance = dir.path().join("CLAUDE.md");
        fs::write(&guidance, "# My notes\n\nHand-written line.\n").unwrap();

        let insight = strong_insight(InsightCategory::Wisdom, "managed statement");
        let key = insight.key.clone();
        let mut store = store_with(&dir, vec![insight]);
        let promotion = promotion_loop(&dir);

        promotion.run(&mut store, Utc::now()).unwrap();
        for i in 0..10 {
            store.contradict(&key, &format!("c{}", i)).unwrap();
        }
        promotion.run(&mut store, Utc::now()).unwrap();

        let content = fs::read_to_string(&guidance).unwrap();
        assert!(content.contains("# My notes"));
        assert!(content.contains("Hand-written line."));
        assert!(!content.contains("managed statement"));
    }

    #[test]
    fn test_tick_is_throttled() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(
            &dir,
            vec![strong_insight(InsightCategory::Wisdom, "use glob before read")],
        );
        let mut promotion = promotion_loop(&dir);
        let now = Utc::now();

        let first = promotion.tick(&mut store, now).unwrap();
        assert_eq!(first.len(), 1);

        // Within the interval: throttled even though nothing was promoted
        let second = promotion
            .tick(&mut store, now + chrono::Duration::seconds(10))
            .unwrap();
        assert!(second.is_empty());

        // Past the interval: runs again
        let third = promotion
            .tick(&mut store, now + chrono::Duration::seconds(3700))
            .unwrap();
        assert!(third.is_empty()); // nothing new to promote, but it ran
    }

    #[test]
    fn test_promotion_log_appended() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(
            &dir,
            vec![strong_insight(InsightCategory::Wisdom, "use glob before read")],
        );
        promotion_loop(&dir).run(&mut store, Utc::now()).unwrap();

        let log = fs::read_to_string(dir.path().join("promotion_log.jsonl")).unwrap();
        let record: PromotionRecord = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(record.action, PromotionAction::Promoted);
        assert!(record.reliability >= 0.80);
        assert!(record.validations >= 5);
    }
}
