use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A parsed `digraph` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DotAst {
    pub name: String,
    pub attrs: HashMap<String, AttrValue>,
    pub nodes: HashMap<String, NodeDecl>,
    pub edges: Vec<EdgeDecl>,
    pub subgraphs: Vec<SubgraphDecl>,
    pub node_defaults: HashMap<String, AttrValue>,
    pub edge_defaults: HashMap<String, AttrValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    pub id: String,
    pub attrs: HashMap<String, AttrValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDecl {
    pub from: String,
    pub to: String,
    pub attrs: HashMap<String, AttrValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubgraphDecl {
    pub name: Option<String>,
    pub attrs: HashMap<String, AttrValue>,
    pub nodes: HashMap<String, NodeDecl>,
    pub edges: Vec<EdgeDecl>,
    pub node_defaults: HashMap<String, AttrValue>,
    pub edge_defaults: HashMap<String, AttrValue>,
}

impl SubgraphDecl {
    /// The lowercase class a `cluster_`-prefixed subgraph contributes to its
    /// member nodes.
    pub fn cluster_class(&self) -> Option<String> {
        self.name
            .as_deref()
            .and_then(|n| n.strip_prefix("cluster_"))
            .filter(|rest| !rest.is_empty())
            .map(|rest| rest.to_lowercase())
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    #[serde(with = "crate::duration_serde")]
    Duration(Duration),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Boolean(b) => Some(*b),
            AttrValue::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            AttrValue::Duration(d) => Some(*d),
            _ => None,
        }
    }

    /// String rendition used for passthrough attribute maps.
    pub fn display_string(&self) -> String {
        match self {
            AttrValue::String(s) => s.clone(),
            AttrValue::Integer(i) => i.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Boolean(b) => b.to_string(),
            AttrValue::Duration(d) => crate::duration_serde::format_duration(*d),
        }
    }
}
