//! Distillation aggregator.
//!
//! Runs over closed episodes with enough sealed steps, clusters them by
//! (decision template, tool), and emits distillations: heuristics for
//! clusters that keep succeeding, anti-patterns for clusters that keep
//! failing, and sharp edges for single decisive failures.
//!
//! Heuristic/policy confidence and sharp-edge confidence follow different
//! formulas in practice, so each is a separate [`ConfidenceModel`] strategy.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::config::EidosConfig;
use crate::error::Result;
use crate::util;

use super::{
    decision_template, Distillation, DistillationType, EidosStore, Episode, Evaluation, Step,
};

/// Strategy for computing a distillation's initial confidence.
pub trait ConfidenceModel {
    /// Confidence in [0, 1] given supporting and contradicting step counts.
    fn confidence(&self, supporting: usize, contradicting: usize) -> f64;

    /// Name for logs.
    fn name(&self) -> &'static str;
}

/// Confidence from the support ratio, discounted for small samples.
///
/// Used for heuristics and policies.
#[derive(Debug, Default, Clone, Copy)]
pub struct SupportRatio;

impl ConfidenceModel for SupportRatio {
    fn confidence(&self, supporting: usize, contradicting: usize) -> f64 {
        let total = supporting + contradicting;
        if total == 0 {
            return 0.0;
        }
        let ratio = supporting as f64 / total as f64;
        let saturation = ((1.0 + supporting as f64).ln() / (1.0 + 10.0f64).ln()).min(1.0);
        (ratio * saturation).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "support_ratio"
    }
}

/// Confidence from failure severity rather than sample size.
///
/// A single decisive failure starts high; repeats push it higher. Used for
/// sharp edges and anti-patterns.
#[derive(Debug, Default, Clone, Copy)]
pub struct SeverityWeighted;

impl ConfidenceModel for SeverityWeighted {
    fn confidence(&self, supporting: usize, _contradicting: usize) -> f64 {
        if supporting == 0 {
            return 0.0;
        }
        (0.75 + 0.05 * (supporting.min(5) as f64)).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "severity_weighted"
    }
}

/// The aggregator itself.
#[derive(Debug, Clone)]
pub struct Aggregator {
    cfg: EidosConfig,
}

/// One cluster of sealed steps sharing a (template, tool) pattern.
struct Cluster {
    template: String,
    tool: Option<String>,
    passed: Vec<String>,
    failed: Vec<String>,
}

impl Aggregator {
    /// Create an aggregator with the given configuration.
    pub fn new(cfg: EidosConfig) -> Self {
        Self { cfg }
    }

    /// Distill a closed episode into zero or more rules.
    ///
    /// Episodes below the step minimum produce nothing. Errors on one
    /// cluster skip that cluster rather than corrupting the store.
    pub fn distill(&self, store: &EidosStore, episode: &Episode) -> Result<Vec<Distillation>> {
        let steps = store.sealed_steps(&episode.episode_id)?;
        if steps.len() < self.cfg.min_steps {
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for cluster in cluster_steps(&steps) {
            match self.distill_cluster(&cluster) {
                Some(distillation) => {
                    if let Err(err) = store.insert_distillation(&distillation) {
                        tracing::warn!(
                            template = %cluster.template,
                            "skipping cluster after store error: {}",
                            err
                        );
                        continue;
                    }
                    created.push(distillation);
                }
                None => continue,
            }
        }
        Ok(created)
    }

    fn distill_cluster(&self, cluster: &Cluster) -> Option<Distillation> {
        let tool_label = cluster.tool.as_deref().unwrap_or("this action");
        let mut triggers: Vec<String> = vec![cluster.template.clone()];
        if let Some(tool) = &cluster.tool {
            triggers.push(tool.to_lowercase());
        }
        let domains: Vec<String> = cluster
            .tool
            .iter()
            .map(|t| t.to_lowercase())
            .collect();

        if cluster.passed.len() >= self.cfg.validate_min && cluster.failed.is_empty() {
            let model = SupportRatio;
            let confidence = model.confidence(cluster.passed.len(), 0);
            return Some(Distillation {
                distillation_id: util::next_id("dst"),
                dtype: DistillationType::Heuristic,
                statement: format!(
                    "{} reliably succeeds for \"{}\" ({} recent steps)",
                    tool_label,
                    cluster.template,
                    cluster.passed.len()
                ),
                confidence,
                validation_count: cluster.passed.len() as i64,
                contradiction_count: 0,
                times_retrieved: 0,
                times_used: 0,
                times_helped: 0,
                source_step_ids: cluster.passed.clone(),
                domains,
                triggers,
                created_at: Utc::now(),
            });
        }

        if cluster.failed.len() >= self.cfg.validate_min {
            let model = SeverityWeighted;
            let confidence = model.confidence(cluster.failed.len(), cluster.passed.len());
            return Some(Distillation {
                distillation_id: util::next_id("dst"),
                dtype: DistillationType::AntiPattern,
                statement: format!(
                    "Avoid repeating \"{}\" with {}: it failed {} times",
                    cluster.template,
                    tool_label,
                    cluster.failed.len()
                ),
                confidence,
                validation_count: 0,
                contradiction_count: cluster.failed.len() as i64,
                times_retrieved: 0,
                times_used: 0,
                times_helped: 0,
                source_step_ids: cluster.failed.clone(),
                domains,
                triggers,
                created_at: Utc::now(),
            });
        }

        // A single decisive failure with no successes is worth a warning on
        // its own.
        if cluster.failed.len() == 1 && cluster.passed.is_empty() {
            let model = SeverityWeighted;
            let confidence = model.confidence(1, 0);
            return Some(Distillation {
                distillation_id: util::next_id("dst"),
                dtype: DistillationType::SharpEdge,
                statement: format!(
                    "{} failed on \"{}\"; check preconditions before retrying",
                    tool_label, cluster.template
                ),
                confidence,
                validation_count: 0,
                contradiction_count: 1,
                times_retrieved: 0,
                times_used: 0,
                times_helped: 0,
                source_step_ids: cluster.failed.clone(),
                domains,
                triggers,
                created_at: Utc::now(),
            });
        }

        None
    }
}

/// Group sealed steps by (decision template, tool), skipping abandoned ones.
fn cluster_steps(steps: &[Step]) -> Vec<Cluster> {
    let mut clusters: BTreeMap<(String, Option<String>), Cluster> = BTreeMap::new();

    for step in steps {
        let key = (decision_template(&step.decision), step.tool.clone());
        let cluster = clusters.entry(key.clone()).or_insert_with(|| Cluster {
            template: key.0,
            tool: key.1,
            passed: Vec::new(),
            failed: Vec::new(),
        });
        match step.evaluation {
            Evaluation::Passed => cluster.passed.push(step.step_id.clone()),
            Evaluation::Failed => cluster.failed.push(step.step_id.clone()),
            Evaluation::Open => {}
        }
    }

    clusters.into_values().collect()
}
