use std::collections::HashMap;
use std::time::Duration;

use orrery_dot::{AttrValue, DotAst};

/// The executable pipeline graph, lowered from a parsed DOT document.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    pub goal: String,
    pub label: String,
    pub model_stylesheet: Option<String>,
    pub default_max_retry: usize,
    pub default_fidelity: Option<String>,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub attrs: HashMap<String, AttrValue>,
    nodes: HashMap<String, PipelineNode>,
    /// Sorted by `from`; each node's outgoing edges form a contiguous slice.
    edges: Vec<PipelineEdge>,
    adjacency: HashMap<String, (usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub max_retries: usize,
    pub goal_gate: bool,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub fidelity: Option<String>,
    pub thread_id: Option<String>,
    pub classes: Vec<String>,
    pub timeout: Option<Duration>,
    pub llm_model: Option<String>,
    pub llm_provider: Option<String>,
    pub reasoning_effort: Option<String>,
    pub auto_status: bool,
    pub allow_partial: bool,
    /// Attributes not claimed by a typed field, preserved verbatim.
    pub attrs: HashMap<String, AttrValue>,
}

impl PipelineNode {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(AttrValue::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub weight: i64,
    pub fidelity: Option<String>,
    pub thread_id: Option<String>,
    pub loop_restart: bool,
}

// --- Attribute extraction ---

const RESERVED_NODE_ATTRS: &[&str] = &[
    "label",
    "shape",
    "type",
    "prompt",
    "max_retries",
    "goal_gate",
    "retry_target",
    "fallback_retry_target",
    "fidelity",
    "thread_id",
    "class",
    "timeout",
    "llm_model",
    "llm_provider",
    "reasoning_effort",
    "auto_status",
    "allow_partial",
];

fn str_attr(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<String> {
    attrs.get(key).and_then(AttrValue::as_str).map(String::from)
}

fn bool_attr(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(AttrValue::as_bool)
}

fn int_attr(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(AttrValue::as_int)
}

fn duration_attr(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<Duration> {
    match attrs.get(key) {
        Some(AttrValue::Duration(d)) => Some(*d),
        Some(AttrValue::String(s)) => orrery_dot::duration_serde::parse_duration(s).ok(),
        _ => None,
    }
}

fn lower_node(
    id: &str,
    attrs: &HashMap<String, AttrValue>,
    extra_classes: &[String],
) -> PipelineNode {
    let mut classes: Vec<String> = str_attr(attrs, "class")
        .map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    for class in extra_classes {
        if !classes.contains(class) {
            classes.push(class.clone());
        }
    }

    let passthrough: HashMap<String, AttrValue> = attrs
        .iter()
        .filter(|(k, _)| !RESERVED_NODE_ATTRS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    PipelineNode {
        id: id.to_string(),
        label: str_attr(attrs, "label").unwrap_or_else(|| id.to_string()),
        shape: str_attr(attrs, "shape").unwrap_or_else(|| "box".to_string()),
        node_type: str_attr(attrs, "type"),
        prompt: str_attr(attrs, "prompt"),
        max_retries: int_attr(attrs, "max_retries").map(|v| v.max(0) as usize).unwrap_or(0),
        goal_gate: bool_attr(attrs, "goal_gate").unwrap_or(false),
        retry_target: str_attr(attrs, "retry_target"),
        fallback_retry_target: str_attr(attrs, "fallback_retry_target"),
        fidelity: str_attr(attrs, "fidelity"),
        thread_id: str_attr(attrs, "thread_id"),
        classes,
        timeout: duration_attr(attrs, "timeout"),
        llm_model: str_attr(attrs, "llm_model"),
        llm_provider: str_attr(attrs, "llm_provider"),
        reasoning_effort: str_attr(attrs, "reasoning_effort"),
        auto_status: bool_attr(attrs, "auto_status").unwrap_or(true),
        allow_partial: bool_attr(attrs, "allow_partial").unwrap_or(false),
        attrs: passthrough,
    }
}

fn lower_edge(decl: &orrery_dot::EdgeDecl) -> PipelineEdge {
    PipelineEdge {
        from: decl.from.clone(),
        to: decl.to.clone(),
        label: str_attr(&decl.attrs, "label"),
        condition: str_attr(&decl.attrs, "condition"),
        weight: int_attr(&decl.attrs, "weight").unwrap_or(0),
        fidelity: str_attr(&decl.attrs, "fidelity"),
        thread_id: str_attr(&decl.attrs, "thread_id"),
        loop_restart: bool_attr(&decl.attrs, "loop_restart").unwrap_or(false),
    }
}

impl PipelineGraph {
    pub fn from_dot(ast: DotAst) -> orrery_types::Result<Self> {
        let mut nodes = HashMap::new();
        let mut edges = Vec::new();

        for (id, decl) in &ast.nodes {
            nodes.insert(id.clone(), lower_node(id, &decl.attrs, &[]));
        }
        for sg in &ast.subgraphs {
            let classes: Vec<String> = sg.cluster_class().into_iter().collect();
            for (id, decl) in &sg.nodes {
                nodes.insert(id.clone(), lower_node(id, &decl.attrs, &classes));
            }
        }

        for decl in &ast.edges {
            edges.push(lower_edge(decl));
        }
        for sg in &ast.subgraphs {
            for decl in &sg.edges {
                edges.push(lower_edge(decl));
            }
        }

        edges.sort_by(|a, b| a.from.cmp(&b.from));
        let mut adjacency = HashMap::new();
        let mut i = 0;
        while i < edges.len() {
            let start = i;
            let from = edges[i].from.clone();
            while i < edges.len() && edges[i].from == from {
                i += 1;
            }
            adjacency.insert(from, (start, i - start));
        }

        Ok(PipelineGraph {
            name: ast.name.clone(),
            goal: str_attr(&ast.attrs, "goal").unwrap_or_default(),
            label: str_attr(&ast.attrs, "label").unwrap_or_default(),
            model_stylesheet: str_attr(&ast.attrs, "model_stylesheet"),
            default_max_retry: int_attr(&ast.attrs, "default_max_retry")
                .map(|v| v.max(0) as usize)
                .unwrap_or(0),
            default_fidelity: str_attr(&ast.attrs, "default_fidelity"),
            retry_target: str_attr(&ast.attrs, "retry_target"),
            fallback_retry_target: str_attr(&ast.attrs, "fallback_retry_target"),
            attrs: ast.attrs,
            nodes,
            edges,
            adjacency,
        })
    }

    /// The start node: shape `Mdiamond`, falling back to a node with id
    /// `start`/`Start`.
    pub fn start_node(&self) -> Option<&PipelineNode> {
        self.nodes
            .values()
            .find(|n| n.shape == "Mdiamond")
            .or_else(|| self.nodes.get("start").or_else(|| self.nodes.get("Start")))
    }

    /// A terminal node: shape `Msquare`.
    pub fn exit_node(&self) -> Option<&PipelineNode> {
        self.nodes.values().find(|n| n.shape == "Msquare")
    }

    pub fn is_terminal(&self, node: &PipelineNode) -> bool {
        node.shape == "Msquare"
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[PipelineEdge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn all_nodes_mut(&mut self) -> impl Iterator<Item = &mut PipelineNode> {
        self.nodes.values_mut()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(orrery_dot::parse(dot).unwrap()).unwrap()
    }

    #[test]
    fn lowers_linear_pipeline() {
        let g = build(
            r#"digraph Demo {
                goal = "finish the job"
                start [shape="Mdiamond"]
                work [label="Do Work", prompt="do it"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        assert_eq!(g.name, "Demo");
        assert_eq!(g.goal, "finish the job");
        assert_eq!(g.start_node().unwrap().id, "start");
        assert_eq!(g.exit_node().unwrap().id, "done");
        assert_eq!(g.node("work").unwrap().label, "Do Work");
        assert_eq!(g.all_edges().len(), 2);
    }

    #[test]
    fn typed_node_attributes() {
        let g = build(
            r#"digraph G {
                step [max_retries=3, goal_gate=true, timeout=30s, allow_partial=true,
                      llm_model="m1", reasoning_effort="high", class="fast gpu"]
            }"#,
        );
        let node = g.node("step").unwrap();
        assert_eq!(node.max_retries, 3);
        assert!(node.goal_gate);
        assert_eq!(node.timeout, Some(Duration::from_secs(30)));
        assert!(node.allow_partial);
        assert!(node.auto_status);
        assert_eq!(node.llm_model.as_deref(), Some("m1"));
        assert_eq!(node.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(node.classes, vec!["fast", "gpu"]);
    }

    #[test]
    fn unknown_attributes_pass_through() {
        let g = build(r#"digraph G { t [tool_command="echo hi", custom_key=7] }"#);
        let node = g.node("t").unwrap();
        assert_eq!(node.attr_str("tool_command"), Some("echo hi"));
        assert_eq!(node.attrs.get("custom_key").and_then(AttrValue::as_int), Some(7));
        assert!(!node.attrs.contains_key("label"));
    }

    #[test]
    fn edge_attributes() {
        let g = build(
            r#"digraph G {
                a -> b [condition="outcome=success", weight=5, loop_restart=true, label="ok"]
            }"#,
        );
        let edges = g.outgoing_edges("a");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].condition.as_deref(), Some("outcome=success"));
        assert_eq!(edges[0].weight, 5);
        assert!(edges[0].loop_restart);
    }

    #[test]
    fn outgoing_edges_contiguous_per_node() {
        let g = build(
            r#"digraph G {
                a -> b
                c -> d
                a -> c
            }"#,
        );
        assert_eq!(g.outgoing_edges("a").len(), 2);
        assert_eq!(g.outgoing_edges("c").len(), 1);
        assert!(g.outgoing_edges("b").is_empty());
    }

    #[test]
    fn cluster_subgraph_contributes_class() {
        let g = build(
            r#"digraph G {
                subgraph cluster_Review {
                    r1 [prompt="review"]
                }
                start [shape="Mdiamond"]
                start -> r1
            }"#,
        );
        assert_eq!(g.node("r1").unwrap().classes, vec!["review"]);
    }

    #[test]
    fn start_falls_back_to_id() {
        let g = build(r#"digraph G { start -> work }"#);
        assert_eq!(g.start_node().unwrap().id, "start");
    }

    #[test]
    fn graph_level_retry_settings() {
        let g = build(
            r#"digraph G {
                default_max_retry = 2
                retry_target = "fixer"
                fallback_retry_target = "start"
                a -> b
            }"#,
        );
        assert_eq!(g.default_max_retry, 2);
        assert_eq!(g.retry_target.as_deref(), Some("fixer"));
        assert_eq!(g.fallback_retry_target.as_deref(), Some("start"));
    }
}
