//! Node scheduling predicates
//!
//! Evaluates core `NodeSelector` terms and taints against Node objects the
//! same way the scheduler does for required node affinity, so the operator
//! can predict how many volume groups the node agents should report.

use k8s_openapi::api::core::v1::{
    Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Taint,
};
use std::collections::BTreeMap;

/// Taint effect that keeps the per-node daemons off a node
pub const NO_SCHEDULE: &str = "NoSchedule";

/// Field key supported in `matchFields`
const FIELD_METADATA_NAME: &str = "metadata.name";

/// Whether the node carries a NoSchedule taint
pub fn has_no_schedule_taint(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| taints.iter().any(is_no_schedule))
        .unwrap_or(false)
}

fn is_no_schedule(taint: &Taint) -> bool {
    taint.effect == NO_SCHEDULE
}

/// Whether the node is selected; an absent selector selects every node
pub fn selector_matches(selector: Option<&NodeSelector>, node: &Node) -> bool {
    match selector {
        None => true,
        Some(selector) => selector
            .node_selector_terms
            .iter()
            .any(|term| term_matches(term, node)),
    }
}

/// Terms are ORed by the caller; within a term every requirement must hold
///
/// A term without any requirement matches nothing.
pub fn term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();

    if expressions.is_empty() && fields.is_empty() {
        return false;
    }

    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    if !expressions
        .iter()
        .all(|req| requirement_matches(req, labels.get(&req.key).map(String::as_str)))
    {
        return false;
    }

    let name = node.metadata.name.as_deref();
    fields.iter().all(|req| {
        let value = if req.key == FIELD_METADATA_NAME {
            name
        } else {
            None
        };
        requirement_matches(req, value)
    })
}

/// Evaluate one requirement against the value found under its key
fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();

    match req.operator.as_str() {
        "In" => value.map_or(false, |v| values.iter().any(|x| x == v)),
        "NotIn" => value.map_or(true, |v| !values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        "Gt" | "Lt" => {
            let (Some(actual), [bound]) = (value, values) else {
                return false;
            };
            match (actual.parse::<i64>(), bound.parse::<i64>()) {
                (Ok(actual), Ok(bound)) if req.operator == "Gt" => actual > bound,
                (Ok(actual), Ok(bound)) => actual < bound,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Combine the selectors of several device classes into one daemon affinity
///
/// Returns `None` when any class runs on every node, since the daemon must
/// then run everywhere too.
pub fn merge_selectors<'a>(
    selectors: impl IntoIterator<Item = Option<&'a NodeSelector>>,
) -> Option<NodeSelector> {
    let mut terms = Vec::new();
    for selector in selectors {
        let selector = selector?;
        for term in &selector.node_selector_terms {
            if !terms.contains(term) {
                terms.push(term.clone());
            }
        }
    }
    if terms.is_empty() {
        return None;
    }
    Some(NodeSelector {
        node_selector_terms: terms,
    })
}
