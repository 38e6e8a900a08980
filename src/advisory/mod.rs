//! Advisory engine: just-in-time pre-tool advice.
//!
//! `advise` fans out to four sources (cognitive, EIDOS, semantic, packet
//! cache) under a shared deadline, fuses rankings, applies the ordered
//! suppression rules, and writes a decision-ledger row for every call,
//! emitted or blocked. The caller never blocks on a fault: any advisor
//! error degrades to an empty answer.

mod fusion;
mod ledger;
mod packet;
mod retrieval;
mod semantic;
mod suppression;

pub use fusion::{fuse_rrf, rerank};
pub use ledger::{AdviceDecision, DecisionLedger, DecisionOutcome};
pub use packet::{packet_key, Packet, PacketCache, PacketHit};
pub use retrieval::{cognitive_candidates, eidos_candidates, semantic_candidates};
pub use semantic::{
    build_semantic_index, KeywordSemanticIndex, SemanticIndex, TantivySemanticIndex,
};
pub use suppression::{SuppressionReason, SuppressionState, SuppressionVerdict};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cognitive::{CognitiveStore, Insight};
use crate::config::AdvisoryConfig;
use crate::eidos::{EidosStore, EpisodePhase};
use crate::error::{KaitError, Result};
use crate::event::normalized_arg_head;
use crate::util;

/// Which retrieval source produced an advice item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Cognitive insight store.
    Cognitive,
    /// EIDOS distillations.
    Eidos,
    /// Semantic similarity over insight statements.
    Semantic,
    /// Pre-computed packet cache.
    Packet,
}

impl SourceKind {
    /// Wire name of this source.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Cognitive => "cognitive",
            SourceKind::Eidos => "eidos",
            SourceKind::Semantic => "semantic",
            SourceKind::Packet => "packet",
        }
    }
}

/// How an advisory call's retrieval was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// The full pipeline ran fresh.
    Live,
    /// Cache hit on the exact packet key.
    PacketExact,
    /// Cache hit after loosening predicates.
    PacketRelaxed,
    /// Cache served while live retrieval timed out.
    PacketRelaxedFallback,
}

impl Route {
    /// Wire name of this route.
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Live => "live",
            Route::PacketExact => "packet_exact",
            Route::PacketRelaxed => "packet_relaxed",
            Route::PacketRelaxedFallback => "packet_relaxed_fallback",
        }
    }
}

/// One piece of ranked, attributable advice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdviceItem {
    /// Stable id derived from the text; the TTL and feedback join key.
    pub advice_id: String,
    /// The advice itself.
    pub text: String,
    /// Which source produced it.
    pub source: SourceKind,
    /// Retrieval/fusion score.
    pub score: f64,
    /// Backing insight, when the advice came from the cognitive store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_key: Option<String>,
    /// Backing distillation, when the advice came from EIDOS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distillation_id: Option<String>,
}

impl AdviceItem {
    /// Create an item from raw text.
    pub fn new(text: impl Into<String>, source: SourceKind, score: f64) -> Self {
        let text: String = text.into();
        Self {
            advice_id: util::short_hash(&text),
            text,
            source,
            score,
            insight_key: None,
            distillation_id: None,
        }
    }

    /// Create an item backed by a cognitive insight.
    pub fn from_insight(insight: &Insight, source: SourceKind, score: f64) -> Self {
        let mut item = Self::new(insight.statement.clone(), source, score);
        item.insight_key = Some(insight.key.clone());
        item
    }
}

/// One advisory call's input.
#[derive(Debug, Clone)]
pub struct AdviceRequest {
    /// Calling session.
    pub session_id: String,
    /// Tool about to be invoked.
    pub tool: String,
    /// Opaque tool arguments.
    pub tool_args: serde_json::Value,
    /// Normalized argument head, derived from `tool_args`.
    pub arg_head: String,
    /// Optional free-text context (recent decision, goal).
    pub context: Option<String>,
    /// Call time; suppression decisions are a function of this.
    pub now: DateTime<Utc>,
    /// Per-call time budget override in milliseconds.
    pub budget_ms: Option<u64>,
}

impl AdviceRequest {
    /// Build a request for a tool invocation.
    pub fn new(
        session_id: impl Into<String>,
        tool: impl Into<String>,
        tool_args: serde_json::Value,
    ) -> Self {
        let arg_head = normalized_arg_head(&tool_args);
        Self {
            session_id: session_id.into(),
            tool: tool.into(),
            arg_head,
            tool_args,
            context: None,
            now: Utc::now(),
            budget_ms: None,
        }
    }

    /// Attach free-text context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// One row of the advice log, consumed by the feedback matcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdviceLogEntry {
    /// Stable advice id.
    pub advice_id: String,
    /// Tool advised.
    pub tool: String,
    /// Session advised.
    pub session_id: String,
    /// Producing source.
    pub source: SourceKind,
    /// When the advice was emitted.
    pub ts: DateTime<Utc>,
}

/// Anything that can answer an advisory request.
///
/// The daemon talks to this seam rather than to [`Advisor`] directly, so
/// the runtime can wrap emission with exposure recording and bus publishes.
pub trait AdviceProvider: Send + Sync {
    /// Produce advice. Must not error and must not block past the budget.
    fn advise_for(&self, req: &AdviceRequest) -> Vec<AdviceItem>;
}

impl AdviceProvider for Advisor {
    fn advise_for(&self, req: &AdviceRequest) -> Vec<AdviceItem> {
        self.advise(req)
    }
}

/// The advisory engine.
pub struct Advisor {
    cfg: RwLock<AdvisoryConfig>,
    cognitive: Arc<RwLock<CognitiveStore>>,
    eidos: Arc<Mutex<EidosStore>>,
    semantic: Arc<RwLock<Box<dyn SemanticIndex>>>,
    packets: Arc<RwLock<PacketCache>>,
    suppression: Mutex<SuppressionState>,
    ledger: DecisionLedger,
    advice_log_path: PathBuf,
}

impl Advisor {
    /// Assemble the engine from its store handles.
    pub fn new(
        cfg: AdvisoryConfig,
        cognitive: Arc<RwLock<CognitiveStore>>,
        eidos: Arc<Mutex<EidosStore>>,
        packets: PacketCache,
        ledger_path: impl Into<PathBuf>,
        advice_log_path: impl Into<PathBuf>,
    ) -> Self {
        let semantic = build_semantic_index(cfg.embeddings);
        Self {
            cfg: RwLock::new(cfg),
            cognitive,
            eidos,
            semantic: Arc::new(RwLock::new(semantic)),
            packets: Arc::new(RwLock::new(packets)),
            suppression: Mutex::new(SuppressionState::new()),
            ledger: DecisionLedger::new(ledger_path),
            advice_log_path: advice_log_path.into(),
        }
    }

    /// The decision ledger (status and tests).
    pub fn ledger(&self) -> &DecisionLedger {
        &self.ledger
    }

    /// Snapshot the current advisory configuration.
    fn config(&self) -> Result<AdvisoryConfig> {
        Ok(self
            .cfg
            .read()
            .map_err(|_| KaitError::store("advisory config lock poisoned"))?
            .clone())
    }

    /// Hot-reload the advisory configuration.
    ///
    /// The writer publishes the updated snapshot atomically; in-flight
    /// calls finish under the config they started with.
    pub fn update_config(&self, cfg: AdvisoryConfig) {
        if let Ok(mut current) = self.cfg.write() {
            *current = cfg;
        }
    }

    /// Rebuild the semantic index and packet cache from the current
    /// cognitive snapshot. Called by the pipeline after insight changes.
    pub fn refresh(&self, patterns: &[(String, String, String)]) -> Result<()> {
        let insights = self.cognitive_snapshot()?;

        self.semantic
            .write()
            .map_err(|_| KaitError::store("semantic index lock poisoned"))?
            .reindex(&insights)?;

        let mut packets = self
            .packets
            .write()
            .map_err(|_| KaitError::store("packet cache lock poisoned"))?;
        packets.rebuild(&insights, patterns);
        packets.save()?;
        Ok(())
    }

    /// Produce advice for an imminent tool call.
    ///
    /// Never errors and never blocks past the time budget: faults and
    /// timeouts degrade to the packet cache or an empty answer, and every
    /// call leaves exactly one decision-ledger row.
    pub fn advise(&self, req: &AdviceRequest) -> Vec<AdviceItem> {
        let started = Instant::now();
        match self.advise_inner(req, started) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!("advisory fault (fail-open): {}", err);
                let decision = AdviceDecision {
                    ts: req.now,
                    session_id: req.session_id.clone(),
                    tool: req.tool.clone(),
                    outcome: DecisionOutcome::Blocked,
                    route: Route::Live,
                    selected_count: 0,
                    suppressed_count: 0,
                    sources: Vec::new(),
                    suppression_reasons: vec![SuppressionReason::AdvisorError.to_string()],
                };
                if let Err(err) = self.ledger.record(&decision) {
                    tracing::warn!("failed to record blocked decision: {}", err);
                }
                Vec::new()
            }
        }
    }

    fn advise_inner(&self, req: &AdviceRequest, started: Instant) -> Result<Vec<AdviceItem>> {
        let cfg = self.config()?;
        let budget = Duration::from_millis(req.budget_ms.unwrap_or(cfg.budget_ms));
        let session_phase = self.session_phase(req)?;

        // Quick fallback: not enough budget left for the full pipeline.
        if budget < Duration::from_millis(cfg.quick_min_ms) {
            let (route, items) = self.packet_lookup(req, &session_phase, true)?;
            return self.finish(req, route, items, &cfg);
        }

        let insights = self.cognitive_snapshot()?;
        let (packet_route, packet_items) = self.packet_lookup(req, &session_phase, false)?;

        // Fan out the live sources on worker threads with a shared deadline.
        let (tx, rx) = mpsc::channel::<(SourceKind, Vec<AdviceItem>)>();
        let k = cfg.per_source_k;

        {
            let tx = tx.clone();
            let insights = insights.clone();
            let req = req.clone();
            thread::spawn(move || {
                let items = cognitive_candidates(&insights, &req, k);
                let _ = tx.send((SourceKind::Cognitive, items));
            });
        }
        {
            let tx = tx.clone();
            let eidos = Arc::clone(&self.eidos);
            let req = req.clone();
            thread::spawn(move || {
                let terms = retrieval::trigger_terms(&req);
                let distillations = eidos
                    .lock()
                    .ok()
                    .and_then(|store| store.find_by_triggers(&terms, k).ok())
                    .unwrap_or_default();
                let _ = tx.send((SourceKind::Eidos, eidos_candidates(&distillations, k)));
            });
        }
        {
            let tx = tx.clone();
            let semantic = Arc::clone(&self.semantic);
            let insights = insights.clone();
            let req = req.clone();
            thread::spawn(move || {
                let matches = semantic
                    .read()
                    .ok()
                    .and_then(|index| index.search(&retrieval::semantic_query(&req), k).ok())
                    .unwrap_or_default();
                let _ = tx.send((SourceKind::Semantic, semantic_candidates(&matches, &insights, k)));
            });
        }
        drop(tx);

        let mut by_source: HashMap<SourceKind, Vec<AdviceItem>> = HashMap::new();
        let mut timed_out = false;
        while by_source.len() < 3 {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((source, items)) => {
                    by_source.insert(source, items);
                }
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out && by_source.is_empty() {
            // Live retrieval produced nothing in time; serve the cache.
            return self.finish(req, Route::PacketRelaxedFallback, packet_items, &cfg);
        }

        let fused = fuse_rrf(vec![
            (
                cfg.weight_cognitive,
                by_source.remove(&SourceKind::Cognitive).unwrap_or_default(),
            ),
            (
                cfg.weight_eidos,
                by_source.remove(&SourceKind::Eidos).unwrap_or_default(),
            ),
            (
                cfg.weight_semantic,
                by_source.remove(&SourceKind::Semantic).unwrap_or_default(),
            ),
            (cfg.weight_packet, packet_items),
        ]);

        let ranked = rerank(fused, req, cfg.rerank_top_m);
        let route = if timed_out { packet_route } else { Route::Live };
        self.finish(req, route, ranked, &cfg)
    }

    /// Suppress, emit, and write the ledger row.
    fn finish(
        &self,
        req: &AdviceRequest,
        route: Route,
        candidates: Vec<AdviceItem>,
        cfg: &AdvisoryConfig,
    ) -> Result<Vec<AdviceItem>> {
        let mut suppression = self
            .suppression
            .lock()
            .map_err(|_| KaitError::store("suppression lock poisoned"))?;

        let mut verdict = suppression.evaluate(req, candidates, cfg);
        let mut emitted = verdict.selected;
        let overflow = emitted.len().saturating_sub(cfg.max_emit);
        emitted.truncate(cfg.max_emit);

        suppression.record_emission(req, &emitted);
        suppression.prune(req.now, cfg);
        drop(suppression);

        // Count what was emitted per source for the ledger.
        let mut source_counts: HashMap<&'static str, usize> = HashMap::new();
        for item in &emitted {
            *source_counts.entry(item.source.as_str()).or_insert(0) += 1;
        }
        let mut sources: Vec<String> = source_counts
            .into_iter()
            .map(|(source, count)| format!("{}:{}", source, count))
            .collect();
        sources.sort();

        let decision = AdviceDecision {
            ts: req.now,
            session_id: req.session_id.clone(),
            tool: req.tool.clone(),
            outcome: if emitted.is_empty() {
                DecisionOutcome::Blocked
            } else {
                DecisionOutcome::Emitted
            },
            route,
            selected_count: emitted.len(),
            suppressed_count: verdict.suppressed.len() + overflow,
            sources,
            suppression_reasons: verdict
                .suppressed
                .drain(..)
                .map(|(_, reason)| reason.to_string())
                .collect(),
        };
        self.ledger.record(&decision)?;

        for item in &emitted {
            util::append_jsonl(
                &self.advice_log_path,
                &AdviceLogEntry {
                    advice_id: item.advice_id.clone(),
                    tool: req.tool.clone(),
                    session_id: req.session_id.clone(),
                    source: item.source,
                    ts: req.now,
                },
            )?;
            if let Some(distillation_id) = &item.distillation_id {
                if let Ok(store) = self.eidos.lock() {
                    store.bump_used(distillation_id).ok();
                }
            }
        }

        Ok(emitted)
    }

    fn packet_lookup(
        &self,
        req: &AdviceRequest,
        session_phase: &str,
        quick: bool,
    ) -> Result<(Route, Vec<AdviceItem>)> {
        let packets = self
            .packets
            .read()
            .map_err(|_| KaitError::store("packet cache lock poisoned"))?;

        match packets.lookup(&req.tool, &req.arg_head, session_phase) {
            Some((PacketHit::Exact, packet)) => Ok((Route::PacketExact, packet.items.clone())),
            Some((PacketHit::Relaxed, packet)) => Ok((Route::PacketRelaxed, packet.items.clone())),
            None => Ok((
                if quick {
                    Route::PacketRelaxedFallback
                } else {
                    Route::PacketRelaxed
                },
                Vec::new(),
            )),
        }
    }

    fn session_phase(&self, req: &AdviceRequest) -> Result<String> {
        let store = self
            .eidos
            .lock()
            .map_err(|_| KaitError::store("eidos lock poisoned"))?;
        let phase = store
            .active_episode(&req.session_id)?
            .map(|e| e.phase)
            .unwrap_or(EpisodePhase::Explore);
        Ok(phase.as_str().to_string())
    }

    fn cognitive_snapshot(&self) -> Result<Vec<Insight>> {
        Ok(self
            .cognitive
            .read()
            .map_err(|_| KaitError::store("cognitive lock poisoned"))?
            .snapshot())
    }
}
