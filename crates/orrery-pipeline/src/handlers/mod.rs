//! Node handlers and the handler registry.

pub mod codergen;
pub mod manager;
pub mod parallel;
pub mod tool_cmd;
pub mod wait_human;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use orrery_types::events::EventBus;
use orrery_types::{Context, Outcome, Result};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::interviewer::Interviewer;

pub use codergen::{BackendResponse, CodergenBackend, CodergenHandler, LlmCodergenBackend};
pub use manager::ManagerLoopHandler;
pub use parallel::{FanInHandler, ParallelHandler};
pub use tool_cmd::ToolCommandHandler;
pub use wait_human::WaitHumanHandler;

// ---------------------------------------------------------------------------
// NodeHandler
// ---------------------------------------------------------------------------

/// The execution body for a node. Every invocation produces an [`Outcome`];
/// an `Err` return is retried by the engine up to the node's budget.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The type tag this handler registers under (e.g. `"codergen"`).
    fn handler_type(&self) -> &str;

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: Option<&Path>,
    ) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Maps handler type tags to implementations. Registrations are idempotent
/// upserts; custom handlers may claim new tags or replace builtins.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn NodeHandler>>>,
    shape_to_type: HashMap<&'static str, &'static str>,
}

const DEFAULT_TYPE: &str = "codergen";

impl HandlerRegistry {
    pub fn new() -> Self {
        let shape_to_type = HashMap::from([
            ("Mdiamond", "start"),
            ("Msquare", "exit"),
            ("box", "codergen"),
            ("hexagon", "wait.human"),
            ("diamond", "conditional"),
            ("component", "parallel"),
            ("tripleoctagon", "parallel.fan_in"),
            ("parallelogram", "tool"),
            ("house", "stack.manager_loop"),
        ]);
        Self {
            handlers: RwLock::new(HashMap::new()),
            shape_to_type,
        }
    }

    pub fn register(&self, handler: impl NodeHandler + 'static) {
        let tag = handler.handler_type().to_string();
        self.handlers
            .write()
            .expect("registry lock poisoned")
            .insert(tag, Arc::new(handler));
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .contains_key(handler_type)
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .get(handler_type)
            .cloned()
    }

    /// The handler type for a node: its explicit `type` attribute, then the
    /// shape table, then the default.
    pub fn resolve_type(&self, node: &PipelineNode) -> String {
        if let Some(t) = &node.node_type {
            return t.clone();
        }
        self.shape_to_type
            .get(node.shape.as_str())
            .copied()
            .unwrap_or(DEFAULT_TYPE)
            .to_string()
    }

    /// Resolve a node to its handler, falling back to the default handler
    /// when the resolved type has no registration.
    pub fn resolve(&self, node: &PipelineNode) -> Option<Arc<dyn NodeHandler>> {
        let tag = self.resolve_type(node);
        self.get(&tag).or_else(|| self.get(DEFAULT_TYPE))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Trivial handlers
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _context: &Context,
        _graph: &PipelineGraph,
        _logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        Ok(Outcome::success("pipeline started"))
    }
}

pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _context: &Context,
        _graph: &PipelineGraph,
        _logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        Ok(Outcome::success("pipeline completed"))
    }
}

/// Pass-through; the engine evaluates edge conditions after it returns.
pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _context: &Context,
        _graph: &PipelineGraph,
        _logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        Ok(Outcome::success("conditional pass-through"))
    }
}

// ---------------------------------------------------------------------------
// Default registry
// ---------------------------------------------------------------------------

/// Build a registry with every builtin handler registered.
pub fn default_registry(
    bus: EventBus,
    interviewer: Arc<dyn Interviewer>,
    backend: Option<Arc<dyn CodergenBackend>>,
) -> Arc<HandlerRegistry> {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(StartHandler);
    registry.register(ExitHandler);
    registry.register(ConditionalHandler);
    registry.register(CodergenHandler::new(backend));
    registry.register(WaitHumanHandler::new(interviewer, bus.clone()));
    registry.register(ParallelHandler::new(Arc::downgrade(&registry), bus));
    registry.register(FanInHandler);
    registry.register(ToolCommandHandler);
    registry.register(ManagerLoopHandler);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interviewer::AutoApproveInterviewer;

    fn node_with(shape: &str, node_type: Option<&str>) -> PipelineNode {
        let graph = PipelineGraph::from_dot(
            orrery_dot::parse(&format!(
                "digraph G {{ n [shape=\"{shape}\"{}] }}",
                node_type
                    .map(|t| format!(", type=\"{t}\""))
                    .unwrap_or_default()
            ))
            .unwrap(),
        )
        .unwrap();
        graph.node("n").unwrap().clone()
    }

    #[test]
    fn shape_table_resolution() {
        let reg = HandlerRegistry::new();
        assert_eq!(reg.resolve_type(&node_with("Mdiamond", None)), "start");
        assert_eq!(reg.resolve_type(&node_with("Msquare", None)), "exit");
        assert_eq!(reg.resolve_type(&node_with("box", None)), "codergen");
        assert_eq!(reg.resolve_type(&node_with("hexagon", None)), "wait.human");
        assert_eq!(reg.resolve_type(&node_with("diamond", None)), "conditional");
        assert_eq!(reg.resolve_type(&node_with("component", None)), "parallel");
        assert_eq!(
            reg.resolve_type(&node_with("tripleoctagon", None)),
            "parallel.fan_in"
        );
        assert_eq!(reg.resolve_type(&node_with("parallelogram", None)), "tool");
        assert_eq!(
            reg.resolve_type(&node_with("house", None)),
            "stack.manager_loop"
        );
    }

    #[test]
    fn explicit_type_wins_over_shape() {
        let reg = HandlerRegistry::new();
        assert_eq!(
            reg.resolve_type(&node_with("box", Some("custom.worker"))),
            "custom.worker"
        );
    }

    #[test]
    fn unknown_shape_defaults_to_codergen() {
        let reg = HandlerRegistry::new();
        assert_eq!(reg.resolve_type(&node_with("octagon", None)), "codergen");
    }

    #[test]
    fn registration_is_an_upsert() {
        let reg = HandlerRegistry::new();
        reg.register(StartHandler);
        assert!(reg.has("start"));
        reg.register(StartHandler);
        assert!(reg.has("start"));
    }

    #[test]
    fn resolve_falls_back_to_default_handler() {
        let reg = HandlerRegistry::new();
        reg.register(CodergenHandler::new(None));
        let handler = reg.resolve(&node_with("box", Some("unregistered.type"))).unwrap();
        assert_eq!(handler.handler_type(), "codergen");
    }

    #[test]
    fn default_registry_has_all_builtins() {
        let reg = default_registry(EventBus::new(), Arc::new(AutoApproveInterviewer), None);
        for tag in [
            "start",
            "exit",
            "conditional",
            "codergen",
            "wait.human",
            "parallel",
            "parallel.fan_in",
            "tool",
            "stack.manager_loop",
        ] {
            assert!(reg.has(tag), "missing handler for {tag}");
        }
    }

    #[tokio::test]
    async fn trivial_handlers_return_success() {
        let graph =
            PipelineGraph::from_dot(orrery_dot::parse("digraph G { a -> b }").unwrap()).unwrap();
        let ctx = Context::new();
        for handler in [&StartHandler as &dyn NodeHandler, &ExitHandler, &ConditionalHandler] {
            let outcome = handler
                .execute(graph.node("a").unwrap(), &ctx, &graph, None)
                .await
                .unwrap();
            assert_eq!(outcome.status, orrery_types::StageStatus::Success);
        }
    }
}
