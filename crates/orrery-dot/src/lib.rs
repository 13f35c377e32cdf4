//! Parser for the strict DOT subset used by Orrery pipelines.
//!
//! Parses `digraph Name? { ... }` with nodes, chained edges, subgraphs,
//! defaults, and typed attribute values (strings, integers, floats,
//! booleans, durations), and can re-emit a parsed document.
//!
//! # Example
//! ```
//! let ast = orrery_dot::parse("digraph Demo { start -> work -> done }").unwrap();
//! assert_eq!(ast.name, "Demo");
//! assert_eq!(ast.edges.len(), 2);
//! ```

mod ast;
pub mod duration_serde;
mod emit;
mod parser;

pub use ast::{AttrValue, DotAst, EdgeDecl, NodeDecl, SubgraphDecl};
pub use emit::emit;
pub use parser::parse;
