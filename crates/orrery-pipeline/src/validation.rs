//! Structural validation of pipeline graphs.
//!
//! [`validate`] runs every rule and returns the collected diagnostics;
//! running it twice on the same graph yields the same list.
//! [`validate_or_raise`] fails on the first error-severity diagnostic.

use std::collections::{HashSet, VecDeque};

use orrery_types::FidelityMode;

use crate::condition::parse_condition;
use crate::graph::PipelineGraph;
use crate::stylesheet::parse_stylesheet;

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

impl Diagnostic {
    fn node(rule: &str, severity: Severity, node_id: &str, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message,
            node_id: Some(node_id.to_string()),
            edge: None,
        }
    }

    fn graph(rule: &str, severity: Severity, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message,
            node_id: None,
            edge: None,
        }
    }

    fn edge(rule: &str, severity: Severity, from: &str, to: &str, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message,
            node_id: None,
            edge: Some((from.to_string(), to.to_string())),
        }
    }
}

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

fn is_start(node: &crate::graph::PipelineNode) -> bool {
    node.shape == "Mdiamond"
}

fn is_terminal(node: &crate::graph::PipelineNode) -> bool {
    node.shape == "Msquare"
}

// --- Rules ---

struct SingleStartRule;
impl LintRule for SingleStartRule {
    fn name(&self) -> &str {
        "single_start"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut starts: Vec<&str> = graph
            .all_nodes()
            .filter(|n| is_start(n))
            .map(|n| n.id.as_str())
            .collect();
        starts.sort();
        match starts.len() {
            1 => vec![],
            0 => vec![Diagnostic::graph(
                self.name(),
                Severity::Error,
                "pipeline has no start node (shape=Mdiamond)".into(),
            )],
            n => vec![Diagnostic::graph(
                self.name(),
                Severity::Error,
                format!("pipeline has {n} start nodes ({}); expected exactly one", starts.join(", ")),
            )],
        }
    }
}

struct TerminalExistsRule;
impl LintRule for TerminalExistsRule {
    fn name(&self) -> &str {
        "terminal_exists"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if graph.all_nodes().any(is_terminal) {
            vec![]
        } else {
            vec![Diagnostic::graph(
                self.name(),
                Severity::Error,
                "pipeline has no terminal node (shape=Msquare)".into(),
            )]
        }
    }
}

struct StartNoIncomingRule;
impl LintRule for StartNoIncomingRule {
    fn name(&self) -> &str {
        "start_no_incoming"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_node() else {
            return vec![];
        };
        if graph.all_edges().iter().any(|e| e.to == start.id) {
            vec![Diagnostic::node(
                self.name(),
                Severity::Error,
                &start.id,
                format!("start node '{}' has incoming edges", start.id),
            )]
        } else {
            vec![]
        }
    }
}

struct TerminalNoOutgoingRule;
impl LintRule for TerminalNoOutgoingRule {
    fn name(&self) -> &str {
        "terminal_no_outgoing"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags: Vec<Diagnostic> = graph
            .all_nodes()
            .filter(|n| is_terminal(n) && !graph.outgoing_edges(&n.id).is_empty())
            .map(|n| {
                Diagnostic::node(
                    self.name(),
                    Severity::Error,
                    &n.id,
                    format!("terminal node '{}' has outgoing edges", n.id),
                )
            })
            .collect();
        diags.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        diags
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_node() else {
            return vec![];
        };
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.id.clone());
        queue.push_back(start.id.clone());
        while let Some(current) = queue.pop_front() {
            for edge in graph.outgoing_edges(&current) {
                if visited.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }

        let mut unreachable: Vec<&str> = graph
            .all_nodes()
            .filter(|n| !visited.contains(&n.id))
            .map(|n| n.id.as_str())
            .collect();
        unreachable.sort();
        unreachable
            .into_iter()
            .map(|id| {
                Diagnostic::node(
                    self.name(),
                    Severity::Error,
                    id,
                    format!("node '{id}' is not reachable from the start node"),
                )
            })
            .collect()
    }
}

struct EdgeEndpointsRule;
impl LintRule for EdgeEndpointsRule {
    fn name(&self) -> &str {
        "edge_endpoints"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .flat_map(|e| {
                let mut diags = Vec::new();
                for endpoint in [&e.from, &e.to] {
                    if graph.node(endpoint).is_none() {
                        diags.push(Diagnostic::edge(
                            self.name(),
                            Severity::Error,
                            &e.from,
                            &e.to,
                            format!(
                                "edge {} -> {} references undeclared node '{endpoint}'",
                                e.from, e.to
                            ),
                        ));
                    }
                }
                diags
            })
            .collect()
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str {
        "condition_syntax"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter_map(|e| {
                let cond = e.condition.as_deref()?;
                parse_condition(cond).err().map(|err| {
                    Diagnostic::edge(
                        self.name(),
                        Severity::Error,
                        &e.from,
                        &e.to,
                        format!("edge {} -> {}: {err}", e.from, e.to),
                    )
                })
            })
            .collect()
    }
}

struct RetryTargetRule;
impl LintRule for RetryTargetRule {
    fn name(&self) -> &str {
        "retry_target_exists"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut check = |node_id: &str, attr: &str, target: &Option<String>| {
            if let Some(target) = target {
                if graph.node(target).is_none() {
                    diags.push(Diagnostic::node(
                        "retry_target_exists",
                        Severity::Warning,
                        node_id,
                        format!("node '{node_id}' {attr} '{target}' does not resolve to a declared node"),
                    ));
                }
            }
        };
        let mut nodes: Vec<_> = graph.all_nodes().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for node in nodes {
            check(&node.id, "retry_target", &node.retry_target);
            check(&node.id, "fallback_retry_target", &node.fallback_retry_target);
        }
        diags
    }
}

struct StylesheetRule;
impl LintRule for StylesheetRule {
    fn name(&self) -> &str {
        "stylesheet"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let Some(source) = graph.model_stylesheet.as_deref() else {
            return vec![];
        };
        match parse_stylesheet(source) {
            Ok(_) => vec![],
            Err(err) => vec![Diagnostic::graph(
                self.name(),
                Severity::Error,
                err.to_string(),
            )],
        }
    }
}

struct FidelityRule;
impl LintRule for FidelityRule {
    fn name(&self) -> &str {
        "fidelity_valid"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut nodes: Vec<_> = graph.all_nodes().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        for node in nodes {
            if let Some(f) = &node.fidelity {
                if f.parse::<FidelityMode>().is_err() {
                    diags.push(Diagnostic::node(
                        self.name(),
                        Severity::Warning,
                        &node.id,
                        format!("node '{}' has invalid fidelity '{f}'", node.id),
                    ));
                }
            }
        }
        for edge in graph.all_edges() {
            if let Some(f) = &edge.fidelity {
                if f.parse::<FidelityMode>().is_err() {
                    diags.push(Diagnostic::edge(
                        self.name(),
                        Severity::Warning,
                        &edge.from,
                        &edge.to,
                        format!("edge {} -> {} has invalid fidelity '{f}'", edge.from, edge.to),
                    ));
                }
            }
        }
        diags
    }
}

struct GoalGateRetryRule;
impl LintRule for GoalGateRetryRule {
    fn name(&self) -> &str {
        "goal_gate_has_retry"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let graph_has_target =
            graph.retry_target.is_some() || graph.fallback_retry_target.is_some();
        let mut nodes: Vec<_> = graph
            .all_nodes()
            .filter(|n| {
                n.goal_gate
                    && n.retry_target.is_none()
                    && n.fallback_retry_target.is_none()
                    && !graph_has_target
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
            .into_iter()
            .map(|n| {
                Diagnostic::node(
                    self.name(),
                    Severity::Warning,
                    &n.id,
                    format!("goal gate '{}' has no retry target at any scope", n.id),
                )
            })
            .collect()
    }
}

// --- Public API ---

fn rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(SingleStartRule),
        Box::new(TerminalExistsRule),
        Box::new(StartNoIncomingRule),
        Box::new(TerminalNoOutgoingRule),
        Box::new(ReachabilityRule),
        Box::new(EdgeEndpointsRule),
        Box::new(ConditionSyntaxRule),
        Box::new(RetryTargetRule),
        Box::new(StylesheetRule),
        Box::new(FidelityRule),
        Box::new(GoalGateRetryRule),
    ]
}

/// Run every lint rule and collect diagnostics.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    rules().iter().flat_map(|r| r.apply(graph)).collect()
}

/// Run every lint rule; error if any diagnostic has error severity.
pub fn validate_or_raise(graph: &PipelineGraph) -> orrery_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<&Diagnostic> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(orrery_types::OrreryError::Validation(messages.join("; ")));
    }
    Ok(diagnostics)
}
