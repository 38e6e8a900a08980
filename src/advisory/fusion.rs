//! Rank fusion and reranking.
//!
//! Per-source rankings are combined with Reciprocal Rank Fusion weighted by
//! source coefficients, then the top fused items pass through a
//! deterministic lightweight reranker (the cross-encoder slot when no model
//! is available).

use std::collections::HashMap;

use super::{AdviceItem, AdviceRequest};

/// RRF dampening constant. The standard value; small ranks dominate.
const RRF_K: f64 = 60.0;

/// Fuse per-source rankings with weighted Reciprocal Rank Fusion.
///
/// Items appearing in several lists accumulate score; duplicates are merged
/// keeping the first-seen item and the union of its provenance.
pub fn fuse_rrf(ranked_lists: Vec<(f64, Vec<AdviceItem>)>) -> Vec<AdviceItem> {
    let mut fused: HashMap<String, (AdviceItem, f64)> = HashMap::new();

    for (weight, list) in ranked_lists {
        for (rank, item) in list.into_iter().enumerate() {
            let contribution = weight / (RRF_K + rank as f64 + 1.0);
            match fused.get_mut(&item.advice_id) {
                Some((kept, score)) => {
                    *score += contribution;
                    // Prefer provenance that can receive feedback
                    if kept.insight_key.is_none() && item.insight_key.is_some() {
                        kept.insight_key = item.insight_key;
                    }
                    if kept.distillation_id.is_none() && item.distillation_id.is_some() {
                        kept.distillation_id = item.distillation_id;
                    }
                }
                None => {
                    fused.insert(item.advice_id.clone(), (item, contribution));
                }
            }
        }
    }

    let mut items: Vec<AdviceItem> = fused
        .into_values()
        .map(|(mut item, score)| {
            item.score = score;
            item
        })
        .collect();

    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.advice_id.cmp(&b.advice_id))
    });
    items
}

/// Deterministic lightweight reranker over the top fused items.
///
/// Scores lexical overlap between the item text and the request, blended
/// with the fused score. Items past `top_m` keep their fusion order.
pub fn rerank(mut items: Vec<AdviceItem>, req: &AdviceRequest, top_m: usize) -> Vec<AdviceItem> {
    let query_tokens: Vec<String> = format!("{} {}", req.tool, req.arg_head)
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let head_len = items.len().min(top_m);
    let mut head: Vec<AdviceItem> = items.drain(..head_len).collect();

    for item in &mut head {
        let text_lower = item.text.to_lowercase();
        let overlap = if query_tokens.is_empty() {
            0.0
        } else {
            query_tokens
                .iter()
                .filter(|t| text_lower.contains(t.as_str()))
                .count() as f64
                / query_tokens.len() as f64
        };
        item.score = 0.5 * item.score + 0.5 * overlap;
    }

    head.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.advice_id.cmp(&b.advice_id))
    });

    head.extend(items);
    head
}
