//! Candidate retrieval from the four advisory sources.
//!
//! Each function is pure over a snapshot of its store, so the orchestrator
//! can fan them out on worker threads with a shared deadline and merge
//! whatever arrives in time.

use std::collections::HashMap;

use crate::cognitive::Insight;
use crate::eidos::Distillation;

use super::{AdviceItem, AdviceRequest, SourceKind};

/// Cognitive candidates: highest advisory readiness first, with a boost for
/// insights that mention the requested tool.
pub fn cognitive_candidates(
    insights: &[Insight],
    req: &AdviceRequest,
    k: usize,
) -> Vec<AdviceItem> {
    let tool_lower = req.tool.to_lowercase();

    let mut scored: Vec<AdviceItem> = insights
        .iter()
        .filter(|i| i.validations > 0)
        .map(|i| {
            let mut score = i.advisory_readiness;
            if i.statement.to_lowercase().contains(&tool_lower) {
                score = (score + 0.2).min(1.0);
            }
            AdviceItem::from_insight(i, SourceKind::Cognitive, score)
        })
        .filter(|item| item.score > 0.0)
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

/// EIDOS candidates: distillations whose triggers matched the request.
///
/// The trigger query itself runs inside the store; this scores and converts
/// whatever it returned.
pub fn eidos_candidates(distillations: &[Distillation], k: usize) -> Vec<AdviceItem> {
    let mut items: Vec<AdviceItem> = distillations
        .iter()
        .filter(|d| d.confidence > 0.0)
        .map(|d| AdviceItem {
            advice_id: crate::util::short_hash(&d.statement),
            text: d.statement.clone(),
            source: SourceKind::Eidos,
            score: d.confidence,
            insight_key: None,
            distillation_id: Some(d.distillation_id.clone()),
        })
        .collect();

    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    items.truncate(k);
    items
}

/// Trigger terms for the EIDOS query: the tool name plus argument head words.
pub fn trigger_terms(req: &AdviceRequest) -> Vec<String> {
    let mut terms = vec![req.tool.to_lowercase()];
    terms.extend(
        req.arg_head
            .split_whitespace()
            .map(str::to_string)
            .take(4),
    );
    if let Some(context) = &req.context {
        terms.extend(
            context
                .to_lowercase()
                .split_whitespace()
                .map(str::to_string)
                .take(4),
        );
    }
    terms
}

/// Convert semantic matches (key, score) back into advice items using the
/// cognitive snapshot for statements.
pub fn semantic_candidates(
    matches: &[(String, f64)],
    insights: &[Insight],
    k: usize,
) -> Vec<AdviceItem> {
    let by_key: HashMap<&str, &Insight> =
        insights.iter().map(|i| (i.key.as_str(), i)).collect();

    let max_score = matches
        .iter()
        .map(|(_, s)| *s)
        .fold(0.0f64, f64::max)
        .max(1e-9);

    matches
        .iter()
        .filter_map(|(key, score)| {
            by_key.get(key.as_str()).map(|insight| {
                AdviceItem::from_insight(insight, SourceKind::Semantic, score / max_score)
            })
        })
        .take(k)
        .collect()
}

/// Query text handed to the semantic index.
pub fn semantic_query(req: &AdviceRequest) -> String {
    let mut parts = vec![req.tool.clone()];
    if !req.arg_head.is_empty() {
        parts.push(req.arg_head.clone());
    }
    if let Some(context) = &req.context {
        parts.push(context.clone());
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::InsightCategory;
    use chrono::Utc;

    fn ready(statement: &str, validations: usize) -> Insight {
        let mut insight = Insight::new(InsightCategory::Wisdom, statement, "test");
        for i in 0..validations {
            insight.validate(&format!("e{}", i), Utc::now(), 14 * 86_400);
        }
        insight
    }

    fn request(tool: &str) -> AdviceRequest {
        AdviceRequest::new("s1", tool, serde_json::json!({"path": "x.rs"}))
    }

    #[test]
    fn test_cognitive_candidates_rank_by_readiness() {
        let insights = vec![ready("weak statement", 1), ready("strong statement", 20)];
        let items = cognitive_candidates(&insights, &request("Read"), 5);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text, "strong statement");
        assert_eq!(items[0].source, SourceKind::Cognitive);
    }

    #[test]
    fn test_cognitive_candidates_tool_mention_boost() {
        let insights = vec![
            ready("generic but well validated advice here", 10),
            ready("when using Read check the path exists first", 10),
        ];
        let items = cognitive_candidates(&insights, &request("Read"), 5);
        assert!(items[0].text.contains("Read"));
    }

    #[test]
    fn test_cognitive_candidates_skip_untested() {
        let insights = vec![Insight::new(InsightCategory::Wisdom, "untested", "t")];
        assert!(cognitive_candidates(&insights, &request("Read"), 5).is_empty());
    }

    #[test]
    fn test_cognitive_candidates_respect_k() {
        let insights: Vec<Insight> =
            (0..10).map(|i| ready(&format!("statement {}", i), 5)).collect();
        assert_eq!(cognitive_candidates(&insights, &request("Read"), 3).len(), 3);
    }

    #[test]
    fn test_trigger_terms_include_tool_and_args() {
        let req = request("TaskUpdate");
        let terms = trigger_terms(&req);
        assert_eq!(terms[0], "taskupdate");
        assert!(terms.contains(&"x.rs".to_string()));
    }

    #[test]
    fn test_semantic_candidates_normalize_scores() {
        let insights = vec![ready("alpha statement", 5), ready("beta statement", 5)];
        let matches = vec![
            (insights[0].key.clone(), 8.0),
            (insights[1].key.clone(), 4.0),
        ];

        let items = semantic_candidates(&matches, &insights, 5);
        assert_eq!(items.len(), 2);
        assert!((items[0].score - 1.0).abs() < 1e-9);
        assert!((items[1].score - 0.5).abs() < 1e-9);
        assert_eq!(items[0].source, SourceKind::Semantic);
    }

    #[test]
    fn test_semantic_candidates_drop_unknown_keys() {
        let insights = vec![ready("alpha", 5)];
        let matches = vec![("nonexistent-key".to_string(), 1.0)];
        assert!(semantic_candidates(&matches, &insights, 5).is_empty());
    }

    #[test]
    fn test_semantic_query_includes_context() {
        let mut req = request("Read");
        req.context = Some("retry after failure".to_string());
        let query = semantic_query(&req);
        assert!(query.contains("Read"));
        assert!(query.contains("retry after failure"));
    }
}
