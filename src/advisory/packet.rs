//! Packet cache: pre-computed advice bundles for fast retrieval.
//!
//! Packets are keyed by `hash(tool, normalized_arg_head, session_phase)` and
//! rebuilt by the pipeline after batches that changed the cognitive store.
//! Lookup degrades gracefully: exact key first, then any packet for the same
//! tool with loosened predicates.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cognitive::Insight;
use crate::error::Result;
use crate::util;

use super::{AdviceItem, SourceKind};

/// Insights per packet.
const PACKET_CAPACITY: usize = 4;

/// A pre-computed, key-indexed bundle of advice candidates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// Cache key.
    pub key: String,
    /// Tool the packet was built for.
    pub tool: String,
    /// Session phase the packet was built for.
    pub session_phase: String,
    /// Candidate items, best first.
    pub items: Vec<AdviceItem>,
    /// When the packet was built.
    pub built_at: DateTime<Utc>,
}

/// Compute a packet cache key.
pub fn packet_key(tool: &str, arg_head: &str, session_phase: &str) -> String {
    util::short_hash(&format!("{}|{}|{}", tool, arg_head, session_phase))
}

/// How a packet lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHit {
    /// Exact key match.
    Exact,
    /// Matched after loosening predicates to tool-only.
    Relaxed,
}

/// The packet cache with JSON persistence.
#[derive(Debug, Default)]
pub struct PacketCache {
    packets: HashMap<String, Packet>,
    path: Option<PathBuf>,
}

impl PacketCache {
    /// Create an empty, in-memory cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache persisted at the given path, loading any snapshot.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let packets = if path.exists() {
            util::read_to_string_limited(&path)
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok())
                .unwrap_or_default()
        } else {
            HashMap::new()
        };
        Self {
            packets,
            path: Some(path),
        }
    }

    /// Number of cached packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Look up a packet, exact key first, then relaxed to tool-only.
    pub fn lookup(
        &self,
        tool: &str,
        arg_head: &str,
        session_phase: &str,
    ) -> Option<(PacketHit, &Packet)> {
        let key = packet_key(tool, arg_head, session_phase);
        if let Some(packet) = self.packets.get(&key) {
            return Some((PacketHit::Exact, packet));
        }
        self.packets
            .values()
            .filter(|p| p.tool == tool)
            .max_by_key(|p| p.built_at)
            .map(|p| (PacketHit::Relaxed, p))
    }

    /// Rebuild packets for the given recent tool patterns.
    ///
    /// Each pattern gets the highest-readiness insights mentioning the tool,
    /// falling back to overall readiness order.
    pub fn rebuild(&mut self, insights: &[Insight], patterns: &[(String, String, String)]) {
        for (tool, arg_head, phase) in patterns {
            let mut ranked: Vec<&Insight> = insights
                .iter()
                .filter(|i| i.advisory_readiness > 0.0)
                .collect();
            ranked.sort_by(|a, b| {
                let a_mentions = mentions_tool(a, tool);
                let b_mentions = mentions_tool(b, tool);
                b_mentions
                    .cmp(&a_mentions)
                    .then(
                        b.advisory_readiness
                            .partial_cmp(&a.advisory_readiness)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            });

            let items: Vec<AdviceItem> = ranked
                .into_iter()
                .take(PACKET_CAPACITY)
                .map(|i| {
                    AdviceItem::from_insight(i, SourceKind::Packet, i.advisory_readiness)
                })
                .collect();
            if items.is_empty() {
                continue;
            }

            let key = packet_key(tool, arg_head, phase);
            self.packets.insert(
                key.clone(),
                Packet {
                    key,
                    tool: tool.clone(),
                    session_phase: phase.clone(),
                    items,
                    built_at: Utc::now(),
                },
            );
        }
    }

    /// Persist the cache if it has a backing path.
    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            util::atomic_write_json(path, &self.packets)?;
        }
        Ok(())
    }
}

fn mentions_tool(insight: &Insight, tool: &str) -> bool {
    insight
        .statement
        .to_lowercase()
        .contains(&tool.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::InsightCategory;
    use tempfile::TempDir;

    fn ready_insight(statement: &str) -> Insight {
        let mut insight = Insight::new(InsightCategory::Wisdom, statement, "test");
        for i in 0..10 {
            insight.validate(&format!("e{}", i), Utc::now(), 14 * 86_400);
        }
        insight
    }

    #[test]
    fn test_packet_key_is_stable() {
        let a = packet_key("Read", "src/main.rs", "execute");
        let b = packet_key("Read", "src/main.rs", "execute");
        let c = packet_key("Read", "src/other.rs", "execute");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_rebuild_and_exact_lookup() {
        let mut cache = PacketCache::new();
        let insights = vec![
            ready_insight("Use Glob before Read when paths are uncertain"),
            ready_insight("Pin dependency versions in the manifest"),
        ];
        cache.rebuild(
            &insights,
            &[("Read".to_string(), "src/main.rs".to_string(), "execute".to_string())],
        );

        let (hit, packet) = cache.lookup("Read", "src/main.rs", "execute").unwrap();
        assert_eq!(hit, PacketHit::Exact);
        assert_eq!(packet.tool, "Read");
        // The Read-mentioning insight ranks first
        assert!(packet.items[0].text.contains("Read"));
        assert!(!packet.items.is_empty());
    }

    #[test]
    fn test_relaxed_lookup_falls_back_to_tool() {
        let mut cache = PacketCache::new();
        cache.rebuild(
            &[ready_insight("Use Glob before Read")],
            &[("Read".to_string(), "a.rs".to_string(), "execute".to_string())],
        );

        let (hit, _) = cache.lookup("Read", "b.rs", "explore").unwrap();
        assert_eq!(hit, PacketHit::Relaxed);
        assert!(cache.lookup("Write", "b.rs", "explore").is_none());
    }

    #[test]
    fn test_unready_insights_are_excluded() {
        let mut cache = PacketCache::new();
        let untested = Insight::new(InsightCategory::Wisdom, "never validated", "test");
        cache.rebuild(
            &[untested],
            &[("Read".to_string(), "a.rs".to_string(), "execute".to_string())],
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("packets.json");
        {
            let mut cache = PacketCache::with_path(&path);
            cache.rebuild(
                &[ready_insight("Use Glob before Read")],
                &[("Read".to_string(), "a.rs".to_string(), "execute".to_string())],
            );
            cache.save().unwrap();
        }

        let cache = PacketCache::with_path(&path);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("Read", "a.rs", "execute").is_some());
    }
}
