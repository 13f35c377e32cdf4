use std::collections::HashMap;
use std::time::Duration;

use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;

fn expected(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

// ---------------------------------------------------------------------------
// Lexical helpers
// ---------------------------------------------------------------------------

/// Remove `//` and `/* */` comments, preserving newlines so error positions
/// stay aligned with the original source. String literals pass through
/// untouched.
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut i = 0;

    while i < len {
        if i + 1 < len && bytes[i] == b'/' && bytes[i + 1] == b'/' {
            i += 2;
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
        } else if i + 1 < len && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                if bytes[i] == b'\n' {
                    out.push(b'\n');
                }
                i += 1;
            }
            if i + 1 < len {
                i += 2;
            }
        } else if bytes[i] == b'"' {
            out.push(b'"');
            i += 1;
            while i < len {
                if bytes[i] == b'\\' && i + 1 < len {
                    out.push(bytes[i]);
                    out.push(bytes[i + 1]);
                    i += 2;
                } else if bytes[i] == b'"' {
                    out.push(b'"');
                    i += 1;
                    break;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    // Only whole ASCII-delimited spans were removed, so the bytes remain
    // valid UTF-8.
    String::from_utf8_lossy(&out).into_owned()
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn ident<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Identifier, optionally dotted: `manager.poll_interval`.
fn dotted_ident(input: &mut &str) -> ModalResult<String> {
    let first = ident.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', ident)).parse_next(input)?;
    let mut key = first.to_string();
    for part in rest {
        key.push('.');
        key.push_str(part);
    }
    Ok(key)
}

/// Double-quoted string with `\\ \" \n \t` escapes.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any.parse_next(input)?;
        match c {
            '"' => break,
            '\\' => {
                let esc = winnow::token::any.parse_next(input)?;
                match esc {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    '\\' => s.push('\\'),
                    '"' => s.push('"'),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
            }
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Bare duration token: digits + one of `ms s m h d`.
fn duration_value(input: &mut &str) -> ModalResult<Duration> {
    let digits: &str = digit1.parse_next(input)?;
    let value: u64 = digits
        .parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))?;
    let suffix = alt(("ms", "s", "m", "h", "d")).parse_next(input)?;
    Ok(match suffix {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        "d" => Duration::from_secs(value * 86_400),
        _ => unreachable!(),
    })
}

fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    alt((literal("true").value(true), literal("false").value(false))).parse_next(input)
}

fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = (opt(alt(('-', '+'))), digit1).take().parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn attr_value(input: &mut &str) -> ModalResult<AttrValue> {
    alt((
        quoted_string.map(AttrValue::String),
        boolean_value.map(AttrValue::Boolean),
        duration_value.map(AttrValue::Duration),
        float_value.map(AttrValue::Float),
        integer_value.map(AttrValue::Integer),
        // Bare identifiers (e.g. shape=Mdiamond) are string values.
        dotted_ident.map(AttrValue::String),
    ))
    .parse_next(input)
}

fn attr_pair(input: &mut &str) -> ModalResult<(String, AttrValue)> {
    let key = dotted_ident.parse_next(input)?;
    let _ = (ws, '=', ws).parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)?;
    Ok((key, value))
}

/// `[ k=v, k=v ... ]` with `,`/`;` separators optional.
fn attr_block(input: &mut &str) -> ModalResult<HashMap<String, AttrValue>> {
    let _ = ('[', ws).parse_next(input)?;
    let mut attrs = HashMap::new();
    if let Some((k, v)) = opt(attr_pair).parse_next(input)? {
        attrs.insert(k, v);
        loop {
            let _ = (ws, opt(alt((',', ';'))), ws).parse_next(input)?;
            match opt(attr_pair).parse_next(input)? {
                Some((k, v)) => {
                    attrs.insert(k, v);
                }
                None => break,
            }
        }
    }
    let _ = (ws, ']').parse_next(input)?;
    Ok(attrs)
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

enum Stmt {
    GraphAttrs(HashMap<String, AttrValue>),
    GraphAttr(String, AttrValue),
    NodeDefaults(HashMap<String, AttrValue>),
    EdgeDefaults(HashMap<String, AttrValue>),
    Node(String, HashMap<String, AttrValue>),
    EdgeChain(Vec<String>, HashMap<String, AttrValue>),
    Subgraph(Option<String>, Vec<Stmt>),
}

fn defaults_stmt(input: &mut &str) -> ModalResult<Stmt> {
    let keyword = alt((literal("graph"), literal("node"), literal("edge"))).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = (ws, opt(';')).parse_next(input)?;
    Ok(match keyword {
        "graph" => Stmt::GraphAttrs(attrs),
        "node" => Stmt::NodeDefaults(attrs),
        _ => Stmt::EdgeDefaults(attrs),
    })
}

fn subgraph_stmt(input: &mut &str) -> ModalResult<Stmt> {
    let _ = literal("subgraph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(ident).parse_next(input)?;
    let _ = (ws, '{', ws).parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = (ws, '}', ws, opt(';')).parse_next(input)?;
    Ok(Stmt::Subgraph(name.map(String::from), stmts))
}

fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Stmt> {
    let first = ident.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(literal("->")).parse_next(input)?.is_some() {
        let mut chain = vec![first.to_string()];
        loop {
            let _ = ws.parse_next(input)?;
            let next = ident
                .context(StrContext::Expected(StrContextValue::Description(
                    "edge target identifier",
                )))
                .parse_next(input)?;
            chain.push(next.to_string());
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_none() {
                break;
            }
        }
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = (ws, opt(';')).parse_next(input)?;
        return Ok(Stmt::EdgeChain(chain, attrs));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(expected(
            "directed edge (->); undirected edges (--) are not supported",
        ));
    }

    if let Some(attrs) = opt(attr_block).parse_next(input)? {
        let _ = (ws, opt(';')).parse_next(input)?;
        return Ok(Stmt::Node(first.to_string(), attrs));
    }

    // `key = value` at the top level assigns a graph attribute.
    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let value = attr_value.parse_next(input)?;
        let _ = (ws, opt(';')).parse_next(input)?;
        return Ok(Stmt::GraphAttr(first.to_string(), value));
    }

    let _ = opt(';').parse_next(input)?;
    Ok(Stmt::Node(first.to_string(), HashMap::new()))
}

fn statement(input: &mut &str) -> ModalResult<Stmt> {
    let _ = ws.parse_next(input)?;
    alt((defaults_stmt, subgraph_stmt, node_or_edge_stmt)).parse_next(input)
}

fn statements(input: &mut &str) -> ModalResult<Vec<Stmt>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        stmts.push(statement.parse_next(input)?);
    }
    Ok(stmts)
}

// ---------------------------------------------------------------------------
// Statement merging
// ---------------------------------------------------------------------------

struct Merged {
    attrs: HashMap<String, AttrValue>,
    nodes: HashMap<String, NodeDecl>,
    edges: Vec<EdgeDecl>,
    subgraphs: Vec<SubgraphDecl>,
    node_defaults: HashMap<String, AttrValue>,
    edge_defaults: HashMap<String, AttrValue>,
}

fn merge(
    stmts: Vec<Stmt>,
    parent_node_defaults: &HashMap<String, AttrValue>,
    parent_edge_defaults: &HashMap<String, AttrValue>,
) -> Merged {
    let mut out = Merged {
        attrs: HashMap::new(),
        nodes: HashMap::new(),
        edges: Vec::new(),
        subgraphs: Vec::new(),
        node_defaults: parent_node_defaults.clone(),
        edge_defaults: parent_edge_defaults.clone(),
    };

    for stmt in stmts {
        match stmt {
            Stmt::GraphAttrs(attrs) => out.attrs.extend(attrs),
            Stmt::GraphAttr(key, value) => {
                out.attrs.insert(key, value);
            }
            Stmt::NodeDefaults(attrs) => out.node_defaults.extend(attrs),
            Stmt::EdgeDefaults(attrs) => out.edge_defaults.extend(attrs),
            Stmt::Node(id, mut attrs) => {
                for (k, v) in &out.node_defaults {
                    attrs.entry(k.clone()).or_insert_with(|| v.clone());
                }
                // A repeated declaration layers attrs onto the earlier one.
                match out.nodes.get_mut(&id) {
                    Some(existing) => existing.attrs.extend(attrs),
                    None => {
                        out.nodes.insert(id.clone(), NodeDecl { id, attrs });
                    }
                }
            }
            Stmt::EdgeChain(chain, attrs) => {
                for pair in chain.windows(2) {
                    let mut merged = out.edge_defaults.clone();
                    merged.extend(attrs.clone());
                    out.edges.push(EdgeDecl {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs: merged,
                    });
                }
                // Endpoints referenced only by edges become implicit nodes.
                for id in &chain {
                    if !out.nodes.contains_key(id) {
                        out.nodes.insert(
                            id.clone(),
                            NodeDecl {
                                id: id.clone(),
                                attrs: out.node_defaults.clone(),
                            },
                        );
                    }
                }
            }
            Stmt::Subgraph(name, inner) => {
                let inner = merge(inner, &out.node_defaults, &out.edge_defaults);
                out.subgraphs.push(SubgraphDecl {
                    name,
                    attrs: inner.attrs,
                    nodes: inner.nodes,
                    edges: inner.edges,
                    node_defaults: inner.node_defaults,
                    edge_defaults: inner.edge_defaults,
                });
                out.subgraphs.extend(inner.subgraphs);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn parse_document(input: &mut &str) -> ModalResult<DotAst> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(expected("'digraph' ('strict' graphs are not supported)"));
    }
    if let Some(rest) = input.strip_prefix("graph") {
        let trimmed = rest.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(expected("'digraph' (undirected graphs are not supported)"));
        }
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(ident).parse_next(input)?;
    let _ = (ws, '{', ws).parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = (ws, '}', ws).parse_next(input)?;

    let empty = HashMap::new();
    let merged = merge(stmts, &empty, &empty);
    Ok(DotAst {
        name: name.unwrap_or_default().to_string(),
        attrs: merged.attrs,
        nodes: merged.nodes,
        edges: merged.edges,
        subgraphs: merged.subgraphs,
        node_defaults: merged.node_defaults,
        edge_defaults: merged.edge_defaults,
    })
}

fn line_col(text: &str, consumed: usize) -> (usize, usize) {
    let prefix = &text[..consumed.min(text.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

/// Parse pipeline source text into a [`DotAst`].
pub fn parse(input: &str) -> orrery_types::Result<DotAst> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();
    let total = stripped.len();

    parse_document.parse_next(&mut remaining).map_err(|e| {
        let consumed = total - remaining.len();
        let (line, col) = line_col(&stripped, consumed);
        let snippet: String = remaining.chars().take(40).collect();
        orrery_types::OrreryError::Parse {
            line,
            col,
            message: e.to_string(),
            snippet: (!snippet.is_empty()).then_some(snippet),
        }
    })
}
