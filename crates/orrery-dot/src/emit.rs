//! Re-serialize a [`DotAst`] to pipeline source text.
//!
//! `parse(emit(ast))` yields a graph equivalent to `ast` modulo attribute
//! ordering: defaults are written before the statements they apply to, and
//! node attribute maps already carry their merged defaults.

use std::collections::HashMap;
use std::fmt::Write;

use crate::ast::{AttrValue, DotAst, EdgeDecl, NodeDecl, SubgraphDecl};
use crate::duration_serde::format_duration;

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn value_text(value: &AttrValue) -> String {
    match value {
        AttrValue::String(s) => quote(s),
        AttrValue::Integer(i) => i.to_string(),
        AttrValue::Float(f) => format!("{f:?}"),
        AttrValue::Boolean(b) => b.to_string(),
        AttrValue::Duration(d) => format_duration(*d),
    }
}

fn attr_list(attrs: &HashMap<String, AttrValue>) -> String {
    let mut keys: Vec<_> = attrs.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{}={}", k, value_text(&attrs[k.as_str()])))
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_node(out: &mut String, indent: &str, node: &NodeDecl) {
    if node.attrs.is_empty() {
        let _ = writeln!(out, "{indent}{}", node.id);
    } else {
        let _ = writeln!(out, "{indent}{} [{}]", node.id, attr_list(&node.attrs));
    }
}

fn write_edge(out: &mut String, indent: &str, edge: &EdgeDecl) {
    if edge.attrs.is_empty() {
        let _ = writeln!(out, "{indent}{} -> {}", edge.from, edge.to);
    } else {
        let _ = writeln!(
            out,
            "{indent}{} -> {} [{}]",
            edge.from, edge.to,
            attr_list(&edge.attrs)
        );
    }
}

fn write_body(
    out: &mut String,
    indent: &str,
    attrs: &HashMap<String, AttrValue>,
    node_defaults: &HashMap<String, AttrValue>,
    edge_defaults: &HashMap<String, AttrValue>,
    nodes: &HashMap<String, NodeDecl>,
    edges: &[EdgeDecl],
    subgraphs: &[SubgraphDecl],
) {
    let mut attr_keys: Vec<_> = attrs.keys().collect();
    attr_keys.sort();
    for key in attr_keys {
        let _ = writeln!(out, "{indent}{} = {}", key, value_text(&attrs[key.as_str()]));
    }
    if !node_defaults.is_empty() {
        let _ = writeln!(out, "{indent}node [{}]", attr_list(node_defaults));
    }
    if !edge_defaults.is_empty() {
        let _ = writeln!(out, "{indent}edge [{}]", attr_list(edge_defaults));
    }

    let mut node_ids: Vec<_> = nodes.keys().collect();
    node_ids.sort();
    for id in node_ids {
        write_node(out, indent, &nodes[id.as_str()]);
    }
    for edge in edges {
        write_edge(out, indent, edge);
    }
    for sg in subgraphs {
        match &sg.name {
            Some(name) => {
                let _ = writeln!(out, "{indent}subgraph {name} {{");
            }
            None => {
                let _ = writeln!(out, "{indent}subgraph {{");
            }
        }
        let inner = format!("{indent}    ");
        write_body(
            out,
            &inner,
            &sg.attrs,
            &sg.node_defaults,
            &sg.edge_defaults,
            &sg.nodes,
            &sg.edges,
            &[],
        );
        let _ = writeln!(out, "{indent}}}");
    }
}

/// Serialize an AST back to DOT source.
pub fn emit(ast: &DotAst) -> String {
    let mut out = String::new();
    if ast.name.is_empty() {
        out.push_str("digraph {\n");
    } else {
        let _ = writeln!(out, "digraph {} {{", ast.name);
    }
    // Subgraph member nodes reappear inside their subgraph blocks; the
    // top-level list must not duplicate them.
    let subgraph_members: std::collections::HashSet<&str> = ast
        .subgraphs
        .iter()
        .flat_map(|sg| sg.nodes.keys().map(String::as_str))
        .collect();
    let top_nodes: HashMap<String, NodeDecl> = ast
        .nodes
        .iter()
        .filter(|(id, _)| !subgraph_members.contains(id.as_str()))
        .map(|(id, n)| (id.clone(), n.clone()))
        .collect();

    write_body(
        &mut out,
        "    ",
        &ast.attrs,
        &ast.node_defaults,
        &ast.edge_defaults,
        &top_nodes,
        &ast.edges,
        &ast.subgraphs,
    );
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn assert_equivalent(source: &str) {
        let first = parse(source).unwrap();
        let emitted = emit(&first);
        let second = parse(&emitted).unwrap_or_else(|e| panic!("re-parse failed: {e}\n{emitted}"));

        assert_eq!(first.name, second.name, "graph name");
        assert_eq!(first.attrs, second.attrs, "graph attrs");

        let mut first_nodes: Vec<_> = first.nodes.keys().collect();
        let mut second_nodes: Vec<_> = second.nodes.keys().collect();
        first_nodes.sort();
        second_nodes.sort();
        assert_eq!(first_nodes, second_nodes, "node set");
        for (id, node) in &first.nodes {
            assert_eq!(node.attrs, second.nodes[id].attrs, "attrs of node {id}");
        }

        let key = |e: &crate::EdgeDecl| (e.from.clone(), e.to.clone());
        let mut first_edges: Vec<_> = first.edges.iter().map(key).collect();
        let mut second_edges: Vec<_> = second.edges.iter().map(key).collect();
        first_edges.sort();
        second_edges.sort();
        assert_eq!(first_edges, second_edges, "edge set");
    }

    #[test]
    fn round_trip_linear_pipeline() {
        assert_equivalent(
            r#"digraph Build {
                goal = "compile and test"
                start [shape="Mdiamond"]
                compile [shape="box", prompt="Compile the project", max_retries=2]
                test [shape="box", prompt="Run the tests", timeout=900s]
                done [shape="Msquare"]
                start -> compile -> test -> done
            }"#,
        );
    }

    #[test]
    fn round_trip_conditions_and_weights() {
        assert_equivalent(
            r#"digraph G {
                a -> b [condition="outcome=success", weight=5]
                a -> c [label="[R] Retry", loop_restart=true]
            }"#,
        );
    }

    #[test]
    fn round_trip_subgraph_and_defaults() {
        assert_equivalent(
            r#"digraph G {
                node [shape="box"]
                subgraph cluster_review {
                    r1 [prompt="Review part 1"]
                    r2 [prompt="Review part 2"]
                    r1 -> r2
                }
                start [shape="Mdiamond"]
                start -> r1
            }"#,
        );
    }

    #[test]
    fn round_trip_anonymous_graph() {
        assert_equivalent("digraph { a -> b }");
    }

    #[test]
    fn emitted_strings_are_escaped() {
        let ast = parse(r#"digraph G { a [label="two\nlines"] }"#).unwrap();
        let emitted = emit(&ast);
        assert!(emitted.contains(r#"label="two\nlines""#));
    }
}
