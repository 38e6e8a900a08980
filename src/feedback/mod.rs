//! Implicit feedback: closing the loop on emitted advice.
//!
//! Every emission records an exposure. When the next outcome event for the
//! same session and tool arrives, the exposure resolves to `followed` (the
//! tool call succeeded) or `unhelpful` (it failed), and the backing insight
//! or distillation is validated or contradicted. A different tool inside the
//! timeout marks the exposure ignored; old exposures expire.
//!
//! Applying feedback is idempotent per `(event_id, advice_id)`: replays from
//! a re-processed batch never double-count.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::advisory::{AdviceItem, AdviceRequest};
use crate::cognitive::CognitiveStore;
use crate::config::FeedbackConfig;
use crate::eidos::EidosStore;
use crate::error::{FailOpen, Result};
use crate::event::{Event, EventKind};
use crate::util;

/// The implicit signal an exposure resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignal {
    /// The advised tool call happened and succeeded.
    Followed,
    /// The advised tool call happened and failed.
    Unhelpful,
    /// A different tool was called instead.
    Ignored,
}

/// Lifecycle of an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureState {
    /// Waiting for the next matching event.
    Pending,
    /// Resolved to followed.
    Followed,
    /// Resolved to unhelpful.
    Unhelpful,
    /// A different tool arrived inside the timeout.
    Ignored,
    /// Nothing arrived before expiry.
    Expired,
}

/// A record of advice shown, awaiting its implicit signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exposure {
    /// Stable advice id.
    pub advice_id: String,
    /// Session the advice was shown in.
    pub session_id: String,
    /// Tool the advice was for.
    pub tool: String,
    /// Backing insight, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight_key: Option<String>,
    /// Backing distillation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distillation_id: Option<String>,
    /// Source name, for the log's `sources_used`.
    pub source: String,
    /// When the advice was shown.
    pub created_at: DateTime<Utc>,
    /// Current state.
    pub state: ExposureState,
}

/// One row of the implicit feedback log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackEntry {
    /// Advice the signal applies to.
    pub advice_id: String,
    /// Tool advised.
    pub tool: String,
    /// Resolved signal.
    pub signal: FeedbackSignal,
    /// Whether the next tool call succeeded.
    pub success: bool,
    /// Sources behind the advice.
    pub sources_used: Vec<String>,
    /// Seconds between exposure and resolution.
    pub latency_s: f64,
    /// When the signal resolved.
    pub ts: DateTime<Utc>,
}

/// Pairs exposures with the processed-event stream.
#[derive(Debug)]
pub struct FeedbackMatcher {
    cfg: FeedbackConfig,
    exposures: HashMap<(String, String), Exposure>,
    applied: HashSet<(String, String)>,
    log_path: PathBuf,
}

impl FeedbackMatcher {
    /// Create a matcher logging to the given path.
    pub fn new(cfg: FeedbackConfig, log_path: impl Into<PathBuf>) -> Self {
        Self {
            cfg,
            exposures: HashMap::new(),
            applied: HashSet::new(),
            log_path: log_path.into(),
        }
    }

    /// Record exposures for advice just emitted.
    pub fn record_exposures(&mut self, req: &AdviceRequest, items: &[AdviceItem]) {
        for item in items {
            let key = (req.session_id.clone(), item.advice_id.clone());
            self.exposures.entry(key).or_insert(Exposure {
                advice_id: item.advice_id.clone(),
                session_id: req.session_id.clone(),
                tool: req.tool.clone(),
                insight_key: item.insight_key.clone(),
                distillation_id: item.distillation_id.clone(),
                source: item.source.as_str().to_string(),
                created_at: req.now,
                state: ExposureState::Pending,
            });
        }
    }

    /// Number of pending exposures (status and tests).
    pub fn pending_count(&self) -> usize {
        self.exposures
            .values()
            .filter(|e| e.state == ExposureState::Pending)
            .count()
    }

    /// Look up an exposure's state (tests).
    pub fn exposure_state(&self, session_id: &str, advice_id: &str) -> Option<ExposureState> {
        self.exposures
            .get(&(session_id.to_string(), advice_id.to_string()))
            .map(|e| e.state)
    }

    /// Feed one processed event through the matcher.
    ///
    /// Resolution applies validate/contradict to the backing stores and
    /// appends to the implicit feedback log. Store faults are logged and
    /// skipped; the matcher itself never fails the pipeline.
    pub fn observe(
        &mut self,
        event: &Event,
        cognitive: &mut CognitiveStore,
        eidos: &EidosStore,
    ) -> Vec<FeedbackEntry> {
        if !event.kind.is_outcome() {
            return Vec::new();
        }
        let Some(event_tool) = event.tool.clone() else {
            return Vec::new();
        };
        let now = event_time(event);
        let success = event.kind == EventKind::PostTool;

        let mut resolved = Vec::new();
        let session_id = event.session_id.clone();

        let keys: Vec<(String, String)> = self
            .exposures
            .iter()
            .filter(|((session, _), exposure)| {
                *session == session_id && exposure.state == ExposureState::Pending
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            let Some(exposure) = self.exposures.get_mut(&key) else {
                continue;
            };
            let age_s = (now - exposure.created_at).num_seconds();

            if exposure.tool != event_tool {
                // A different tool inside the timeout means the advice was
                // passed over; only the rate tracking cares.
                if age_s <= self.cfg.exposure_timeout_s as i64 {
                    exposure.state = ExposureState::Ignored;
                }
                continue;
            }

            if self
                .applied
                .contains(&(event.event_id.clone(), exposure.advice_id.clone()))
            {
                continue;
            }

            let signal = if success {
                FeedbackSignal::Followed
            } else {
                FeedbackSignal::Unhelpful
            };
            exposure.state = if success {
                ExposureState::Followed
            } else {
                ExposureState::Unhelpful
            };
            let advice_id = exposure.advice_id.clone();
            let source = exposure.source.clone();
            let insight_key = exposure.insight_key.clone();
            let distillation_id = exposure.distillation_id.clone();

            if let Some(insight_key) = &insight_key {
                let result = if success {
                    cognitive.validate(insight_key, &event.event_id)
                } else {
                    cognitive.contradict(insight_key, &event.event_id)
                };
                result.fail_open_default("applying feedback to cognitive store");
            }
            if let Some(distillation_id) = &distillation_id {
                eidos
                    .reinforce(distillation_id, success)
                    .fail_open_default("applying feedback to eidos store");
            }

            let entry = FeedbackEntry {
                advice_id: advice_id.clone(),
                tool: event_tool.clone(),
                signal,
                success,
                sources_used: vec![source],
                latency_s: age_s.max(0) as f64,
                ts: now,
            };
            self.write_entry(&entry)
                .fail_open_default("writing implicit feedback log");

            self.applied.insert((event.event_id.clone(), advice_id));
            resolved.push(entry);
        }

        self.expire(now);
        resolved
    }

    /// Expire exposures older than the configured expiry.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        let expiry = self.cfg.exposure_expiry_s as i64;
        for exposure in self.exposures.values_mut() {
            if exposure.state == ExposureState::Pending
                && (now - exposure.created_at).num_seconds() > expiry
            {
                exposure.state = ExposureState::Expired;
            }
        }
        // Terminal exposures older than twice the expiry are dropped
        self.exposures.retain(|_, e| {
            e.state == ExposureState::Pending
                || (now - e.created_at).num_seconds() <= 2 * expiry
        });
        // The applied set only needs to cover replay windows
        if self.applied.len() > 65_536 {
            self.applied.clear();
        }
    }

    fn write_entry(&self, entry: &FeedbackEntry) -> Result<()> {
        util::append_jsonl(&self.log_path, entry)
    }
}

fn event_time(event: &Event) -> DateTime<Utc> {
    Utc.timestamp_nanos(event.ts_ns)
}
