//! The batch pipeline scheduler.
//!
//! One cycle reads a batch from the queue, partitions it by priority,
//! fans each event out to the sinks (memory capture, Meta-Ralph, EIDOS, the
//! pluggable observer slot, and the feedback linker), then commits the queue
//! offset. A crash mid-batch re-delivers the same events; processing is
//! idempotent keyed by event id.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::advisory::Advisor;
use crate::bus::{BusEvent, EventBus};
use crate::cognitive::{CognitiveStore, Insight};
use crate::config::PipelineConfig;
use crate::eidos::{Aggregator, EidosEffect, EidosStore};
use crate::error::{ErrorClass, KaitError, Result};
use crate::event::{Event, EventKind, Priority, QueueEntry};
use crate::feedback::FeedbackMatcher;
use crate::memory::MemoryCapture;
use crate::queue::EventQueue;
use crate::ralph::MetaRalph;
use crate::util;

/// Recently processed event ids kept for replay detection.
const SEEN_RING: usize = 4096;

/// Recent pre-tool patterns kept for packet rebuilds.
const PATTERN_RING: usize = 32;

/// Pluggable per-event observer.
///
/// The proprietary chips engine hangs off this seam; the OSS build ships a
/// no-op.
pub trait EventObserver: Send {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Observe one event. Must not block.
    fn observe(&mut self, event: &Event);
}

/// No-op observer filling the chips slot.
#[derive(Debug, Default)]
pub struct ChipsObserver;

impl EventObserver for ChipsObserver {
    fn name(&self) -> &'static str {
        "chips"
    }

    fn observe(&mut self, _event: &Event) {}
}

/// Stats persisted after each cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleStats {
    /// When the cycle completed.
    pub ts: DateTime<Utc>,
    /// Events processed this cycle.
    pub events_processed: usize,
    /// Insights created this cycle.
    pub insights_created: usize,
    /// Distillations created this cycle.
    pub distillations_created: usize,
    /// Events dropped by importance sampling.
    pub sampled_out: usize,
    /// Events skipped as replays.
    pub replays_skipped: usize,
    /// Cycle duration.
    pub duration_ms: u64,
    /// Consecutive empty cycles up to and including this one.
    pub empty_cycles: u64,
}

/// Replay-detection state persisted between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PipelineState {
    recent_event_ids: VecDeque<String>,
}

/// The pipeline scheduler. Owns the queue's read side.
pub struct Pipeline {
    cfg: PipelineConfig,
    queue: Arc<EventQueue>,
    capture: MemoryCapture,
    ralph: MetaRalph,
    cognitive: Arc<RwLock<CognitiveStore>>,
    eidos: Arc<Mutex<EidosStore>>,
    aggregator: Aggregator,
    feedback: Arc<Mutex<FeedbackMatcher>>,
    advisor: Option<Arc<Advisor>>,
    bus: Arc<EventBus>,
    observers: Vec<Box<dyn EventObserver>>,
    stats_path: PathBuf,
    state_path: PathBuf,
    seen: VecDeque<String>,
    seen_set: HashSet<String>,
    recent_patterns: VecDeque<(String, String, String)>,
    empty_cycles: u64,
}

impl Pipeline {
    /// Assemble the pipeline from its sinks.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: PipelineConfig,
        queue: Arc<EventQueue>,
        capture: MemoryCapture,
        ralph: MetaRalph,
        cognitive: Arc<RwLock<CognitiveStore>>,
        eidos: Arc<Mutex<EidosStore>>,
        aggregator: Aggregator,
        feedback: Arc<Mutex<FeedbackMatcher>>,
        advisor: Option<Arc<Advisor>>,
        bus: Arc<EventBus>,
        stats_path: impl Into<PathBuf>,
        state_path: impl Into<PathBuf>,
    ) -> Self {
        let state_path = state_path.into();
        let state: PipelineState = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        let seen_set: HashSet<String> = state.recent_event_ids.iter().cloned().collect();

        Self {
            cfg,
            queue,
            capture,
            ralph,
            cognitive,
            eidos,
            aggregator,
            feedback,
            advisor,
            bus,
            observers: vec![Box::new(ChipsObserver)],
            stats_path: stats_path.into(),
            state_path,
            seen: state.recent_event_ids,
            seen_set,
            recent_patterns: VecDeque::new(),
            empty_cycles: 0,
        }
    }

    /// Replace the observer slot (tests, proprietary builds).
    pub fn set_observers(&mut self, observers: Vec<Box<dyn EventObserver>>) {
        self.observers = observers;
    }

    /// Run one cycle.
    ///
    /// The queue offset is committed only after the whole batch processed;
    /// an error before that point leaves the batch to be re-delivered.
    pub fn cycle(&mut self) -> Result<CycleStats> {
        let started = Instant::now();
        let now = Utc::now();

        let depth = self.queue.depth().unwrap_or(0);
        let mut batch_max = self.cfg.batch_max;
        if depth > self.cfg.soft_pressure {
            batch_max *= 2;
        }

        let batch = self.queue.read_batch(batch_max)?;
        let is_empty = batch.entries.is_empty();

        let mut stats = CycleStats {
            ts: now,
            events_processed: 0,
            insights_created: 0,
            distillations_created: 0,
            sampled_out: 0,
            replays_skipped: 0,
            duration_ms: 0,
            empty_cycles: 0,
        };

        if is_empty {
            self.empty_cycles += 1;
            stats.empty_cycles = self.empty_cycles;
            // A drained rotated segment still needs its commit to be deleted
            if batch.cursor.file_done {
                self.queue.commit(&batch.cursor)?;
            }
            // Idle housekeeping: fold the sidecar back in and rotate
            self.queue.merge_overflow()?;
            self.queue.maybe_rotate()?;
            self.consolidate_idle_sessions(&mut stats)?;
        } else {
            self.empty_cycles = 0;

            let mut kept: Vec<Event> = Vec::new();
            for entry in partition_by_priority(batch.entries) {
                if self.seen_set.contains(&entry.event.event_id) {
                    stats.replays_skipped += 1;
                    continue;
                }
                if self.sample_out(&entry) {
                    stats.sampled_out += 1;
                    self.mark_seen(entry.event.event_id.clone());
                    continue;
                }
                kept.push(entry.event);
            }

            for event in kept {
                match self.process_event(&event, &mut stats) {
                    Ok(()) => stats.events_processed += 1,
                    Err(err) => match err.class() {
                        ErrorClass::Fatal => return Err(err),
                        class => {
                            tracing::warn!(
                                event_id = %event.event_id,
                                ?class,
                                "sink error, skipping event: {}",
                                err
                            );
                        }
                    },
                }
                self.mark_seen(event.event_id);
            }

            self.queue.commit(&batch.cursor)?;
            self.consolidate_idle_sessions(&mut stats)?;

            if stats.insights_created > 0 || stats.distillations_created > 0 {
                self.refresh_advisor();
            }
        }

        self.persist_state()?;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        util::atomic_write_json(&self.stats_path, &stats)?;
        Ok(stats)
    }

    /// Fan one event out to the sinks, in order.
    fn process_event(&mut self, event: &Event, stats: &mut CycleStats) -> Result<()> {
        // Sink 1+2: memory capture feeding the quality gate
        let pending = self.capture.capture(event);
        if !pending.is_empty() {
            let existing = self
                .cognitive
                .read()
                .map_err(|_| KaitError::store("cognitive lock poisoned"))?
                .normalized_statements();

            for candidate in pending {
                let verdict = self.ralph.roast(&candidate, &existing);
                if !verdict.passes() {
                    continue;
                }
                let statement = verdict
                    .refined_version
                    .clone()
                    .unwrap_or_else(|| candidate.text.clone());
                let insight = Insight::new(
                    candidate.category.to_insight_category(),
                    statement,
                    event.source.clone(),
                );
                let key = insight.key.clone();
                let category = insight.category;

                let mut cognitive = self
                    .cognitive
                    .write()
                    .map_err(|_| KaitError::store("cognitive lock poisoned"))?;
                cognitive.upsert(insight)?;
                let reliability = cognitive.get(&key).map(|i| i.reliability).unwrap_or(0.0);
                drop(cognitive);

                stats.insights_created += 1;
                self.bus.publish(BusEvent::InsightUpserted {
                    key,
                    category: category.as_str().to_string(),
                    reliability,
                });
            }
        }

        // Sink 3: EIDOS step/episode tracking
        let effects = {
            let eidos = self
                .eidos
                .lock()
                .map_err(|_| KaitError::store("eidos lock poisoned"))?;
            eidos.observe(event)?
        };
        for effect in &effects {
            if let EidosEffect::StepSealed {
                step_id,
                session_id,
                evaluation,
                ..
            } = effect
            {
                self.bus.publish(BusEvent::StepSealed {
                    session_id: session_id.clone(),
                    step_id: step_id.clone(),
                    evaluation: evaluation.as_str().to_string(),
                });
            }
        }

        if event.kind == EventKind::PreTool {
            if let Some(tool) = &event.tool {
                self.note_pattern(event, tool)?;
            }
        }

        // Sink 4: the pluggable observer slot
        for observer in &mut self.observers {
            observer.observe(event);
        }

        // Sink 5: feedback linker pairing exposures with outcomes
        {
            let mut feedback = self
                .feedback
                .lock()
                .map_err(|_| KaitError::store("feedback lock poisoned"))?;
            let mut cognitive = self
                .cognitive
                .write()
                .map_err(|_| KaitError::store("cognitive lock poisoned"))?;
            let eidos = self
                .eidos
                .lock()
                .map_err(|_| KaitError::store("eidos lock poisoned"))?;
            feedback.observe(event, &mut cognitive, &eidos);
        }

        Ok(())
    }

    /// Close idle sessions and distill their episodes.
    fn consolidate_idle_sessions(&mut self, stats: &mut CycleStats) -> Result<()> {
        let effects = {
            let eidos = self
                .eidos
                .lock()
                .map_err(|_| KaitError::store("eidos lock poisoned"))?;
            eidos.close_idle_sessions(util::now_ns())?
        };

        for effect in effects {
            let EidosEffect::EpisodeClosed { episode_id, .. } = effect else {
                continue;
            };
            let distilled = {
                let eidos = self
                    .eidos
                    .lock()
                    .map_err(|_| KaitError::store("eidos lock poisoned"))?;
                let Some(episode) = eidos.episode(&episode_id)? else {
                    continue;
                };
                // Aggregator errors skip the episode, never corrupt the store
                match self.aggregator.distill(&eidos, &episode) {
                    Ok(distilled) => distilled,
                    Err(err) => {
                        tracing::warn!(episode_id = %episode_id, "distillation skipped: {}", err);
                        continue;
                    }
                }
            };
            for distillation in distilled {
                stats.distillations_created += 1;
                self.bus.publish(BusEvent::DistillationCreated {
                    distillation_id: distillation.distillation_id.clone(),
                    dtype: distillation.dtype.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether importance sampling drops this entry.
    fn sample_out(&self, entry: &QueueEntry) -> bool {
        if entry.priority == Priority::High {
            return false;
        }
        if entry.event.importance >= self.cfg.low_importance_threshold {
            return false;
        }
        !rand::thread_rng().gen_bool(self.cfg.low_keep_rate.clamp(0.0, 1.0))
    }

    fn note_pattern(&mut self, event: &Event, tool: &str) -> Result<()> {
        let phase = {
            let eidos = self
                .eidos
                .lock()
                .map_err(|_| KaitError::store("eidos lock poisoned"))?;
            eidos
                .active_episode(&event.session_id)?
                .map(|e| e.phase.as_str().to_string())
                .unwrap_or_else(|| "explore".to_string())
        };
        self.recent_patterns
            .push_back((tool.to_string(), event.arg_head(), phase));
        while self.recent_patterns.len() > PATTERN_RING {
            self.recent_patterns.pop_front();
        }
        Ok(())
    }

    fn refresh_advisor(&self) {
        if let Some(advisor) = &self.advisor {
            let patterns: Vec<(String, String, String)> =
                self.recent_patterns.iter().cloned().collect();
            if let Err(err) = advisor.refresh(&patterns) {
                tracing::warn!("advisor refresh failed: {}", err);
            }
        }
    }

    fn mark_seen(&mut self, event_id: String) {
        if self.seen_set.insert(event_id.clone()) {
            self.seen.push_back(event_id);
            while self.seen.len() > SEEN_RING {
                if let Some(old) = self.seen.pop_front() {
                    self.seen_set.remove(&old);
                }
            }
        }
    }

    fn persist_state(&self) -> Result<()> {
        util::atomic_write_json(
            &self.state_path,
            &PipelineState {
                recent_event_ids: self.seen.clone(),
            },
        )
    }
}

/// Order a batch HIGH, MEDIUM, LOW at session granularity.
///
/// Priority is taken per session (the most urgent entry wins) and entries
/// within a session keep their ingest order, so a post_tool never overtakes
/// the pre_tool that opened its step.
fn partition_by_priority(entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    let mut sessions: Vec<(String, Priority, Vec<QueueEntry>)> = Vec::new();
    for entry in entries {
        let session_id = entry.event.session_id.clone();
        match sessions.iter_mut().find(|(id, _, _)| *id == session_id) {
            Some((_, priority, bucket)) => {
                *priority = (*priority).min(entry.priority);
                bucket.push(entry);
            }
            None => sessions.push((session_id, entry.priority, vec![entry])),
        }
    }

    sessions.sort_by_key(|(_, priority, _)| *priority);
    sessions
        .into_iter()
        .flat_map(|(_, _, bucket)| bucket)
        .collect()
}
