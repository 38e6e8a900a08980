//! Ordered suppression rules.
//!
//! Rules run in a fixed order and the first match wins:
//! 1. identical advice shown within the TTL (most specific, so it reports
//!    before the blanket cooldown)
//! 2. per-tool cooldown
//! 3. session budget exhausted
//! 4. generic advice while the same generic pattern is active
//! 5. agreement gate (items from too few distinct sources)
//!
//! State is keyed by wall-clock timestamps passed in by the caller, so the
//! same session history and time bucket always yield the same decision.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::config::AdvisoryConfig;

use super::{AdviceItem, AdviceRequest};

/// Items with fewer content words than this count as generic.
const GENERIC_WORD_FLOOR: usize = 6;

/// Why advice was suppressed. Display strings are what lands in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum SuppressionReason {
    /// The tool was advised too recently.
    Cooldown { elapsed_s: i64, cooldown_s: u64 },
    /// Identical advice was shown within the TTL.
    RecentlyShown { elapsed_s: i64, ttl_s: u64 },
    /// The session spent its per-minute emission budget.
    BudgetExhausted { used: u32, budget: u32 },
    /// The same generic pattern is already active.
    GenericActive,
    /// Too few distinct sources agreed.
    AgreementGate { sources: usize, min_sources: usize },
    /// The advisor itself faulted; the call fails open.
    AdvisorError,
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooldown {
                elapsed_s,
                cooldown_s,
            } => write!(f, "advised {}s ago (cooldown {}s)", elapsed_s, cooldown_s),
            Self::RecentlyShown { elapsed_s, ttl_s } => {
                write!(f, "shown {}s ago (TTL {}s)", elapsed_s, ttl_s)
            }
            Self::BudgetExhausted { used, budget } => {
                write!(f, "session budget exhausted ({}/{} this minute)", used, budget)
            }
            Self::GenericActive => write!(f, "generic advice already active"),
            Self::AgreementGate {
                sources,
                min_sources,
            } => write!(f, "agreement gate: {} sources < {}", sources, min_sources),
            Self::AdvisorError => write!(f, "advisor_error"),
        }
    }
}

/// Result of a suppression pass.
#[derive(Debug, Default)]
pub struct SuppressionVerdict {
    /// Items cleared for emission.
    pub selected: Vec<AdviceItem>,
    /// Items dropped, with the first rule that matched each.
    pub suppressed: Vec<(AdviceItem, SuppressionReason)>,
}

/// Mutable suppression bookkeeping, one per advisor.
#[derive(Debug, Default)]
pub struct SuppressionState {
    /// Last emission time per tool.
    last_emit_by_tool: HashMap<String, DateTime<Utc>>,
    /// Last time each advice id was shown.
    shown: HashMap<String, DateTime<Utc>>,
    /// Emission counts per (session, minute bucket).
    budget: HashMap<(String, i64), u32>,
    /// Generic patterns currently active per session.
    active_generic: HashSet<String>,
}

impl SuppressionState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the ordered rules over candidate items.
    ///
    /// Call-level rules (cooldown, budget, agreement) suppress everything;
    /// item-level rules (TTL, generic) filter individually. State is only
    /// mutated by [`record_emission`](Self::record_emission).
    pub fn evaluate(
        &self,
        req: &AdviceRequest,
        items: Vec<AdviceItem>,
        cfg: &AdvisoryConfig,
    ) -> SuppressionVerdict {
        let mut verdict = SuppressionVerdict::default();
        if items.is_empty() {
            return verdict;
        }

        // Rule 1: identical advice within the TTL, per item
        let mut after_ttl = Vec::new();
        for item in items {
            if let Some(shown_at) = self.shown.get(&item.advice_id) {
                let elapsed_s = (req.now - *shown_at).num_seconds();
                if elapsed_s < cfg.advice_ttl_s as i64 {
                    verdict.suppressed.push((
                        item,
                        SuppressionReason::RecentlyShown {
                            elapsed_s,
                            ttl_s: cfg.advice_ttl_s,
                        },
                    ));
                    continue;
                }
            }
            after_ttl.push(item);
        }

        // Rule 2: per-tool cooldown over whatever the TTL let through
        if let Some(last) = self.last_emit_by_tool.get(&req.tool) {
            let elapsed_s = (req.now - *last).num_seconds();
            if elapsed_s < cfg.tool_cooldown_s as i64 {
                let reason = SuppressionReason::Cooldown {
                    elapsed_s,
                    cooldown_s: cfg.tool_cooldown_s,
                };
                verdict
                    .suppressed
                    .extend(after_ttl.into_iter().map(|i| (i, reason.clone())));
                return verdict;
            }
        }

        // Rule 3: session budget
        let bucket = (req.session_id.clone(), req.now.timestamp() / 60);
        let used = self.budget.get(&bucket).copied().unwrap_or(0);
        if used >= cfg.budget_per_minute {
            let reason = SuppressionReason::BudgetExhausted {
                used,
                budget: cfg.budget_per_minute,
            };
            verdict
                .suppressed
                .extend(after_ttl.into_iter().map(|i| (i, reason.clone())));
            return verdict;
        }

        // Rule 4: generic advice while the same generic pattern is active
        let mut survivors = Vec::new();
        for item in after_ttl {
            if is_generic(&item) && self.active_generic.contains(&generic_pattern(&item)) {
                verdict
                    .suppressed
                    .push((item, SuppressionReason::GenericActive));
                continue;
            }
            survivors.push(item);
        }

        // Rule 5: agreement gate over what survived
        if cfg.agreement_gate && !survivors.is_empty() {
            let distinct: HashSet<&str> =
                survivors.iter().map(|i| i.source.as_str()).collect();
            if distinct.len() < cfg.min_sources {
                let reason = SuppressionReason::AgreementGate {
                    sources: distinct.len(),
                    min_sources: cfg.min_sources,
                };
                verdict
                    .suppressed
                    .extend(survivors.into_iter().map(|i| (i, reason.clone())));
                return verdict;
            }
        }

        verdict.selected = survivors;
        verdict
    }

    /// Record that items were emitted, updating cooldowns, TTLs, and budget.
    pub fn record_emission(&mut self, req: &AdviceRequest, emitted: &[AdviceItem]) {
        if emitted.is_empty() {
            return;
        }
        self.last_emit_by_tool.insert(req.tool.clone(), req.now);
        let bucket = (req.session_id.clone(), req.now.timestamp() / 60);
        *self.budget.entry(bucket).or_insert(0) += 1;

        for item in emitted {
            self.shown.insert(item.advice_id.clone(), req.now);
            if is_generic(item) {
                self.active_generic.insert(generic_pattern(item));
            }
        }
    }

    /// Drop expired bookkeeping (old budget buckets and stale TTL entries).
    pub fn prune(&mut self, now: DateTime<Utc>, cfg: &AdvisoryConfig) {
        let minute = now.timestamp() / 60;
        self.budget.retain(|(_, bucket), _| minute - *bucket <= 2);
        self.shown
            .retain(|_, shown_at| (now - *shown_at).num_seconds() < 2 * cfg.advice_ttl_s as i64);
    }
}

/// Whether an item is generic: too few content words to be specific.
fn is_generic(item: &AdviceItem) -> bool {
    item.text.split_whitespace().count() < GENERIC_WORD_FLOOR
}

/// Pattern key for the generic-advice gate.
fn generic_pattern(item: &AdviceItem) -> String {
    crate::cognitive::normalize_statement(&item.text)
}
