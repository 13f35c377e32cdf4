//! Deterministic edge selection.
//!
//! After a node completes, the next edge is chosen by a five-step cascade:
//! condition match, preferred label, suggested next ids, best unconditional
//! edge, then best edge overall. Ties break on (higher weight, lexically
//! smaller `to`).

use orrery_types::Outcome;

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::{PipelineEdge, PipelineGraph};

/// Select the next edge out of `node_id`, or `None` when there are no
/// outgoing edges.
pub fn select_edge<'a>(
    node_id: &str,
    outcome: &Outcome,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a PipelineGraph,
) -> Option<&'a PipelineEdge> {
    let edges = graph.outgoing_edges(node_id);
    if edges.is_empty() {
        return None;
    }

    // Step 1: edges whose non-empty condition evaluates true.
    let matched: Vec<&PipelineEdge> = edges
        .iter()
        .filter(|e| {
            e.condition
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .and_then(|c| parse_condition(c).ok())
                .is_some_and(|expr| evaluate_condition(&expr, resolve))
        })
        .collect();
    if !matched.is_empty() {
        return best_by_weight_then_lexical(&matched);
    }

    // Step 2: label matching the outcome's preferred label.
    if let Some(preferred) = &outcome.preferred_label {
        let wanted = normalize_label(preferred);
        if let Some(edge) = edges
            .iter()
            .find(|e| e.label.as_deref().map(normalize_label) == Some(wanted.clone()))
        {
            return Some(edge);
        }
    }

    // Step 3: first edge whose target appears in the suggested ids, in order.
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = edges.iter().find(|e| e.to == *suggested) {
            return Some(edge);
        }
    }

    // Step 4: best unconditional edge.
    let unconditional: Vec<&PipelineEdge> = edges
        .iter()
        .filter(|e| e.condition.as_deref().map_or(true, |c| c.trim().is_empty()))
        .collect();
    if !unconditional.is_empty() {
        return best_by_weight_then_lexical(&unconditional);
    }

    // Step 5: fall back to the best edge overall.
    best_by_weight_then_lexical(&edges.iter().collect::<Vec<_>>())
}

/// Lowercase, trim, and strip an accelerator prefix (`[X] `, `X) `, `X - `).
pub fn normalize_label(label: &str) -> String {
    let lowered = label.trim().to_lowercase();
    let stripped = strip_accelerator(&lowered);
    stripped.trim().to_string()
}

fn strip_accelerator(label: &str) -> &str {
    let bytes = label.as_bytes();
    // "[x] rest"
    if bytes.len() > 3 && bytes[0] == b'[' && bytes[2] == b']' && bytes[3] == b' ' {
        return &label[4..];
    }
    // "x) rest"
    if bytes.len() > 2 && bytes[1] == b')' && bytes[2] == b' ' {
        return &label[3..];
    }
    // "x - rest"
    if bytes.len() > 3 && bytes[1] == b' ' && bytes[2] == b'-' && bytes[3] == b' ' {
        return &label[4..];
    }
    label
}

fn best_by_weight_then_lexical<'a>(edges: &[&'a PipelineEdge]) -> Option<&'a PipelineEdge> {
    edges
        .iter()
        .copied()
        .max_by(|a, b| a.weight.cmp(&b.weight).then_with(|| b.to.cmp(&a.to)))
}
