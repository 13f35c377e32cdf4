//! The Orrery pipeline engine.
//!
//! Interprets a directed graph of work units parsed from the DOT subset:
//! resolves a handler per node, executes with bounded retry, threads a
//! shared context, selects outgoing edges deterministically, enforces goal
//! gates, emits structured events, and persists checkpoints.

pub mod artifact;
pub mod condition;
pub mod edge_selection;
pub mod engine;
pub mod graph;
pub mod handlers;
pub mod interviewer;
pub mod retry;
pub mod stylesheet;
pub mod transforms;
pub mod validation;

pub use artifact::{ArtifactInfo, ArtifactStore, SPILL_THRESHOLD};
pub use condition::{evaluate_condition, parse_condition, standard_resolver, Clause, ConditionExpr};
pub use edge_selection::{normalize_label, select_edge};
pub use engine::{Engine, RunResult};
pub use graph::{PipelineEdge, PipelineGraph, PipelineNode};
pub use handlers::{
    default_registry, BackendResponse, CodergenBackend, CodergenHandler, ConditionalHandler,
    ExitHandler, FanInHandler, HandlerRegistry, LlmCodergenBackend, ManagerLoopHandler,
    NodeHandler, ParallelHandler, StartHandler, ToolCommandHandler, WaitHumanHandler,
};
pub use interviewer::{
    accelerator_key, Answer, AutoApproveInterviewer, CallbackInterviewer, ConsoleInterviewer,
    Interviewer, Question, QuestionKind, QuestionOption, QueueInterviewer, RecordingInterviewer,
};
pub use retry::RetryPolicy;
pub use stylesheet::{
    apply_stylesheet, parse_stylesheet, serialize_stylesheet, Declaration, Property, Rule,
    Selector, Stylesheet,
};
pub use transforms::{
    apply_transforms, default_transforms, GraphTransform, StylesheetApplication,
    VariableExpansion,
};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};

/// Parse source text and lower it to an executable graph.
pub fn load_pipeline(source: &str) -> orrery_types::Result<PipelineGraph> {
    let ast = orrery_dot::parse(source)?;
    PipelineGraph::from_dot(ast)
}
