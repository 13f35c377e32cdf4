//! Tool execution environment for Orrery agents.
//!
//! The [`ToolEnvironment`] contract is name→handler dispatch: given a tool
//! name and JSON arguments, return text output or a typed error. The
//! [`LocalEnvironment`] implementation runs the builtin tool set against
//! the local filesystem and shell, scrubbing credential-bearing environment
//! variables from subprocesses.

mod builtin;
mod environment;
mod scrub;

pub use environment::{LocalEnvironment, ToolEnvironment};
pub use scrub::{is_sensitive, scrubbed_env};
