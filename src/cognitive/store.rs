//! Persistence and mutation operations for the cognitive store.
//!
//! The store owns a `BTreeMap` keyed by insight key, so serialization is
//! canonically ordered: serialize → reload → serialize is byte-identical.
//! Writes go through temp + rename; a failed write marks the store degraded
//! and it continues read-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CognitiveConfig;
use crate::error::{KaitError, Result};
use crate::util;

use super::Insight;

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The key was new; the insight was inserted.
    Inserted,
    /// The key existed; evidence and counters were merged.
    Merged,
}

/// Record emitted when a promoted insight is demoted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DemotionRecord {
    /// Key of the demoted insight.
    pub key: String,
    /// File the insight had been promoted to.
    pub promoted_to: String,
    /// Reliability at demotion time.
    pub reliability: f64,
    /// Why it was demoted.
    pub reason: String,
}

/// Single-writer store of insights keyed by stable key.
#[derive(Debug)]
pub struct CognitiveStore {
    path: PathBuf,
    insights: BTreeMap<String, Insight>,
    halflife_s: u64,
    degraded: bool,
}

impl CognitiveStore {
    /// Open the store, loading the snapshot if one exists.
    pub fn open(path: impl Into<PathBuf>, cfg: &CognitiveConfig) -> Result<Self> {
        let path = path.into();
        let insights = if path.exists() {
            let content = util::read_to_string_limited(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| KaitError::invariant(format!("corrupt cognitive snapshot: {}", e)))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            insights,
            halflife_s: cfg.reliability_halflife_s,
            degraded: false,
        })
    }

    /// Whether a failed write has put the store into read-only mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Number of insights in the store.
    pub fn len(&self) -> usize {
        self.insights.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.insights.is_empty()
    }

    /// Look up an insight by key.
    pub fn get(&self, key: &str) -> Option<&Insight> {
        self.insights.get(key)
    }

    /// Clone the full contents for lock-free reading elsewhere.
    pub fn snapshot(&self) -> Vec<Insight> {
        self.insights.values().cloned().collect()
    }

    /// Normalized statements of every insight, for dedup checks.
    pub fn normalized_statements(&self) -> Vec<String> {
        self.insights
            .values()
            .map(|i| super::normalize_statement(&i.statement))
            .collect()
    }

    /// Insert a new insight or merge evidence into an existing one.
    ///
    /// Merging only ever adds evidence; it never lowers reliability
    /// arbitrarily.
    pub fn upsert(&mut self, insight: Insight) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let outcome = match self.insights.get_mut(&insight.key) {
            Some(existing) => {
                existing.merge(&insight, now, self.halflife_s);
                UpsertOutcome::Merged
            }
            None => {
                self.insights.insert(insight.key.clone(), insight);
                UpsertOutcome::Inserted
            }
        };
        self.persist()?;
        Ok(outcome)
    }

    /// Record a supporting observation for an insight.
    pub fn validate(&mut self, key: &str, event_id: &str) -> Result<()> {
        let now = Utc::now();
        let halflife = self.halflife_s;
        let insight = self
            .insights
            .get_mut(key)
            .ok_or_else(|| KaitError::invariant(format!("validate on unknown insight {}", key)))?;
        insight.validate(event_id, now, halflife);
        self.persist()
    }

    /// Record a refuting observation for an insight.
    pub fn contradict(&mut self, key: &str, event_id: &str) -> Result<()> {
        let now = Utc::now();
        let halflife = self.halflife_s;
        let insight = self
            .insights
            .get_mut(key)
            .ok_or_else(|| KaitError::invariant(format!("contradict on unknown insight {}", key)))?;
        insight.contradict(event_id, now, halflife);
        self.persist()
    }

    /// Mark an insight as promoted to a guidance file.
    pub fn mark_promoted(&mut self, key: &str, target: &str) -> Result<()> {
        let insight = self
            .insights
            .get_mut(key)
            .ok_or_else(|| KaitError::invariant(format!("promote on unknown insight {}", key)))?;
        insight.promoted = true;
        insight.promoted_to = Some(target.to_string());
        self.persist()
    }

    /// Clear an insight's promoted flag.
    ///
    /// Returns the demotion record for the promotion log, or `None` when the
    /// insight was not promoted.
    pub fn demote(&mut self, key: &str, reason: &str) -> Result<Option<DemotionRecord>> {
        let insight = self
            .insights
            .get_mut(key)
            .ok_or_else(|| KaitError::invariant(format!("demote on unknown insight {}", key)))?;

        if !insight.promoted {
            return Ok(None);
        }

        let record = DemotionRecord {
            key: key.to_string(),
            promoted_to: insight.promoted_to.clone().unwrap_or_default(),
            reliability: insight.reliability,
            reason: reason.to_string(),
        };
        insight.promoted = false;
        insight.promoted_to = None;
        self.persist()?;
        Ok(Some(record))
    }

    /// Insights eligible for promotion under the given thresholds.
    pub fn eligible_for_promotion(
        &self,
        min_reliability: f64,
        min_validations: u64,
    ) -> Vec<Insight> {
        self.insights
            .values()
            .filter(|i| {
                !i.promoted && i.reliability >= min_reliability && i.validations >= min_validations
            })
            .cloned()
            .collect()
    }

    /// Promoted insights whose reliability has dropped below the threshold.
    pub fn promoted_below(&self, threshold: f64) -> Vec<Insight> {
        self.insights
            .values()
            .filter(|i| i.promoted && i.reliability < threshold)
            .cloned()
            .collect()
    }

    /// Refresh recency-dependent readiness across the store.
    pub fn refresh_readiness(&mut self, now: DateTime<Utc>) -> Result<()> {
        let halflife = self.halflife_s;
        for insight in self.insights.values_mut() {
            insight.recompute(now, halflife);
        }
        self.persist()
    }

    /// Rewrite the snapshot without mutating contents.
    ///
    /// Serialization is canonically ordered, so load followed by flush is
    /// byte-identical.
    pub fn flush(&mut self) -> Result<()> {
        self.persist()
    }

    /// Write the snapshot. One retry; then the store degrades to read-only.
    fn persist(&mut self) -> Result<()> {
        if self.degraded {
            return Err(KaitError::store("cognitive store is degraded (read-only)"));
        }

        let first = util::atomic_write_json(&self.path, &self.insights);
        if first.is_ok() {
            return Ok(());
        }
        tracing::warn!("cognitive snapshot write failed, retrying once");

        match util::atomic_write_json(&self.path, &self.insights) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!("cognitive store degraded: {}", err);
                self.degraded = true;
                Err(err)
            }
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::{insight_key, InsightCategory};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CognitiveStore {
        CognitiveStore::open(
            dir.path().join("cognitive_insights.json"),
            &CognitiveConfig::default(),
        )
        .unwrap()
    }

    fn wisdom(statement: &str) -> Insight {
        Insight::new(InsightCategory::Wisdom, statement, "test")
    }

    #[test]
    fn test_upsert_insert_then_merge() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);

        let outcome = store.upsert(wisdom("use glob before read")).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(store.len(), 1);

        let mut again = wisdom("Use Glob before Read!");
        again.validate("e1", Utc::now(), 86_400);
        let outcome = store.upsert(again).unwrap();
        assert_eq!(outcome, UpsertOutcome::Merged);
        assert_eq!(store.len(), 1);

        let key = insight_key(InsightCategory::Wisdom, "use glob before read");
        assert_eq!(store.get(&key).unwrap().validations, 1);
    }

    #[test]
    fn test_validate_and_contradict_update_reliability() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let insight = wisdom("s");
        let key = insight.key.clone();
        store.upsert(insight).unwrap();

        store.validate(&key, "e1").unwrap();
        store.validate(&key, "e2").unwrap();
        store.contradict(&key, "e3").unwrap();

        let stored = store.get(&key).unwrap();
        assert_eq!(stored.validations, 2);
        assert_eq!(stored.contradictions, 1);
        assert!((stored.reliability - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_unknown_key_is_invariant_error() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let err = store.validate("missing", "e1").unwrap_err();
        assert!(matches!(err, KaitError::Invariant { .. }));
    }

    #[test]
    fn test_snapshot_roundtrip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cognitive_insights.json");
        {
            let mut store =
                CognitiveStore::open(&path, &CognitiveConfig::default()).unwrap();
            for statement in ["zebra last", "alpha first", "middle one"] {
                let mut insight = wisdom(statement);
                insight.validate("e1", Utc::now(), 86_400);
                store.upsert(insight).unwrap();
            }
        }

        let first = std::fs::read_to_string(&path).unwrap();

        {
            let mut store =
                CognitiveStore::open(&path, &CognitiveConfig::default()).unwrap();
            // Rewrite without mutating contents
            store.persist().unwrap();
        }

        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_demote_clears_flag_and_reports() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let insight = wisdom("s");
        let key = insight.key.clone();
        store.upsert(insight).unwrap();
        store.mark_promoted(&key, "CLAUDE.md").unwrap();

        let record = store.demote(&key, "reliability_degraded").unwrap().unwrap();
        assert_eq!(record.promoted_to, "CLAUDE.md");
        assert_eq!(record.reason, "reliability_degraded");

        let stored = store.get(&key).unwrap();
        assert!(!stored.promoted);
        assert!(stored.promoted_to.is_none());

        // Demoting again is a no-op
        assert!(store.demote(&key, "again").unwrap().is_none());
    }

    #[test]
    fn test_eligibility_thresholds() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let now = Utc::now();

        let mut strong = wisdom("strong insight");
        for i in 0..6 {
            strong.validate(&format!("e{}", i), now, 86_400);
        }
        let strong_key = strong.key.clone();

        let mut weak = wisdom("weak insight");
        weak.validate("e1", now, 86_400);
        weak.contradict("e2", now, 86_400);

        store.upsert(strong).unwrap();
        store.upsert(weak).unwrap();

        let eligible = store.eligible_for_promotion(0.80, 5);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].key, strong_key);

        store.mark_promoted(&strong_key, "CLAUDE.md").unwrap();
        assert!(store.eligible_for_promotion(0.80, 5).is_empty());
    }

    #[test]
    fn test_promoted_below_threshold() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let now = Utc::now();

        let mut insight = wisdom("was good once");
        for i in 0..5 {
            insight.validate(&format!("e{}", i), now, 86_400);
        }
        let key = insight.key.clone();
        store.upsert(insight).unwrap();
        store.mark_promoted(&key, "CLAUDE.md").unwrap();

        assert!(store.promoted_below(0.65).is_empty());

        for i in 0..5 {
            store.contradict(&key, &format!("c{}", i)).unwrap();
        }
        let below = store.promoted_below(0.65);
        assert_eq!(below.len(), 1);
        assert_eq!(below[0].key, key);
    }

    #[test]
    fn test_store_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cognitive_insights.json");
        let key;
        {
            let mut store =
                CognitiveStore::open(&path, &CognitiveConfig::default()).unwrap();
            let insight = wisdom("persisted");
            key = insight.key.clone();
            store.upsert(insight).unwrap();
        }

        let store = CognitiveStore::open(&path, &CognitiveConfig::default()).unwrap();
        assert_eq!(store.get(&key).unwrap().statement, "persisted");
    }

    #[test]
    fn test_corrupt_snapshot_is_invariant_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cognitive_insights.json");
        std::fs::write(&path, "{ not valid").unwrap();

        let err = CognitiveStore::open(&path, &CognitiveConfig::default()).unwrap_err();
        assert!(matches!(err, KaitError::Invariant { .. }));
    }
}
