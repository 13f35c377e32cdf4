//! The pipeline engine: graph traversal, retry, goal gates, checkpoints.
//!
//! Execution is an iteration over (current node, completed list, per-node
//! attempt counters); cycles come from retry edges and goal-gate jumps, not
//! recursion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use orrery_types::events::{Event, EventBus, EventKind};
use orrery_types::{Checkpoint, Context, Outcome, OrreryError, Result, StageStatus};

use crate::condition::standard_resolver;
use crate::edge_selection::select_edge;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handlers::{HandlerRegistry, NodeHandler};
use crate::retry::RetryPolicy;
use crate::validation::{validate_or_raise, Severity};

/// Backstop against unbounded cycles; goal-gate divergence is otherwise
/// bounded only by operator control.
const DEFAULT_MAX_STEPS: u64 = 10_000;

pub struct Engine {
    registry: Arc<HandlerRegistry>,
    bus: EventBus,
    logs_root: Option<PathBuf>,
}

/// Final result of a run.
#[derive(Debug)]
pub struct RunResult {
    pub status: StageStatus,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: HashMap<String, Outcome>,
    pub final_context: HashMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct Manifest<'a> {
    name: &'a str,
    goal: &'a str,
    start_time: chrono::DateTime<chrono::Utc>,
}

impl Engine {
    pub fn new(registry: Arc<HandlerRegistry>, bus: EventBus) -> Self {
        Self {
            registry,
            bus,
            logs_root: None,
        }
    }

    pub fn with_logs_root(mut self, logs_root: impl Into<PathBuf>) -> Self {
        self.logs_root = Some(logs_root.into());
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn run(
        &self,
        graph: &PipelineGraph,
        token: &CancellationToken,
    ) -> Result<RunResult> {
        self.run_with_context(graph, Context::new(), token).await
    }

    /// Execute the graph with a pre-seeded context (workdir, flags, ...).
    pub async fn run_with_context(
        &self,
        graph: &PipelineGraph,
        context: Context,
        token: &CancellationToken,
    ) -> Result<RunResult> {
        let diagnostics = validate_or_raise(graph)?;
        for diag in diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
        {
            self.bus.emit(
                Event::new(EventKind::ValidationWarning)
                    .with("rule", serde_json::json!(diag.rule))
                    .with("message", serde_json::json!(diag.message)),
            );
        }

        context
            .set("graph.goal", serde_json::Value::String(graph.goal.clone()))
            .await;
        if !graph.label.is_empty() {
            context
                .set("graph.label", serde_json::Value::String(graph.label.clone()))
                .await;
        }

        if let Some(root) = &self.logs_root {
            std::fs::create_dir_all(root)?;
            let manifest = Manifest {
                name: &graph.name,
                goal: &graph.goal,
                start_time: chrono::Utc::now(),
            };
            std::fs::write(
                root.join("manifest.json"),
                serde_json::to_string_pretty(&manifest)?,
            )?;
        }

        self.bus.emit(
            Event::new(EventKind::PipelineStarted)
                .with("name", serde_json::json!(graph.name))
                .with("node_count", serde_json::json!(graph.node_count())),
        );

        let result = self.drive(graph, &context, token).await;
        match &result {
            Ok(run) if run.status.is_passing() => {
                self.bus.emit(
                    Event::new(EventKind::PipelineCompleted)
                        .with("name", serde_json::json!(graph.name))
                        .with("completed", serde_json::json!(run.completed_nodes.len())),
                );
            }
            Ok(run) => {
                self.bus.emit(
                    Event::new(EventKind::PipelineFailed)
                        .with("name", serde_json::json!(graph.name))
                        .with(
                            "error",
                            serde_json::json!(final_failure_reason(run)),
                        ),
                );
            }
            Err(err) => {
                self.bus.emit(
                    Event::new(EventKind::PipelineFailed)
                        .with("name", serde_json::json!(graph.name))
                        .with("error", serde_json::json!(err.to_string())),
                );
            }
        }
        result
    }

    async fn drive(
        &self,
        graph: &PipelineGraph,
        context: &Context,
        token: &CancellationToken,
    ) -> Result<RunResult> {
        let start = graph
            .start_node()
            .ok_or_else(|| OrreryError::Validation("no start node found".into()))?;

        let mut current: &PipelineNode = start;
        let mut completed_nodes: Vec<String> = Vec::new();
        let mut node_outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut node_retries: HashMap<String, usize> = HashMap::new();
        let mut stage_index: u64 = 0;
        let mut steps: u64 = 0;

        loop {
            if token.is_cancelled() {
                return Err(OrreryError::Cancelled);
            }
            steps += 1;
            if steps > DEFAULT_MAX_STEPS {
                return Err(OrreryError::Other(format!(
                    "pipeline exceeded {DEFAULT_MAX_STEPS} steps; aborting runaway cycle"
                )));
            }

            // Terminal: check goal gates before allowing the run to finish.
            if graph.is_terminal(current) {
                if let Some(gate) = failed_goal_gate(graph, &node_outcomes) {
                    match resolve_retry_target(gate, graph) {
                        Some(target) if graph.node(&target).is_some() => {
                            tracing::info!(
                                gate = %gate.id,
                                target = %target,
                                "goal gate unsatisfied; jumping to retry target"
                            );
                            current = graph.node(&target).expect("checked above");
                            continue;
                        }
                        _ => {
                            return Ok(RunResult {
                                status: StageStatus::Fail,
                                completed_nodes,
                                node_outcomes,
                                final_context: context.snapshot().await,
                            });
                        }
                    }
                }
                break;
            }

            let handler_type = self.registry.resolve_type(current);
            self.bus.emit(
                Event::new(EventKind::StageStarted)
                    .with("node_id", serde_json::json!(current.id))
                    .with("handler", serde_json::json!(handler_type))
                    .with("index", serde_json::json!(stage_index)),
            );

            let Some(handler) = self.registry.resolve(current) else {
                return Err(OrreryError::Handler {
                    handler: handler_type,
                    node: current.id.clone(),
                    message: "no handler registered".into(),
                });
            };

            let policy = RetryPolicy::for_node(current, graph);
            let (outcome, attempts) = self
                .execute_with_retry(handler.as_ref(), current, context, graph, &policy, token)
                .await?;

            if outcome.status.is_passing() {
                self.bus.emit(
                    Event::new(EventKind::StageCompleted)
                        .with("node_id", serde_json::json!(current.id))
                        .with("status", serde_json::json!(outcome.status.as_str())),
                );
            } else {
                self.bus.emit(
                    Event::new(EventKind::StageFailed)
                        .with("node_id", serde_json::json!(current.id))
                        .with(
                            "error",
                            serde_json::json!(outcome
                                .failure_reason
                                .clone()
                                .unwrap_or_default()),
                        ),
                );
            }

            completed_nodes.push(current.id.clone());
            node_outcomes.insert(current.id.clone(), outcome.clone());
            if attempts > 1 {
                node_retries.insert(current.id.clone(), attempts - 1);
            }

            context.apply_updates(outcome.context_updates.clone()).await;
            context
                .set(
                    "outcome",
                    serde_json::Value::String(outcome.status.as_str().to_string()),
                )
                .await;
            if let Some(label) = &outcome.preferred_label {
                context
                    .set("preferred_label", serde_json::Value::String(label.clone()))
                    .await;
            }

            self.synthesize_status(current, &outcome)?;
            self.save_checkpoint(current, &completed_nodes, &node_retries, context)
                .await?;

            // Edge selection.
            let snapshot = context.snapshot().await;
            let resolve = standard_resolver(Some(&outcome), &snapshot);
            let next = select_edge(&current.id, &outcome, &resolve, graph);

            match next {
                Some(edge) => {
                    if edge.loop_restart {
                        // A loop restart only signals the backward jump; no
                        // state is reset.
                        tracing::info!(from = %edge.from, to = %edge.to, "loop restart edge taken");
                    }
                    let Some(next_node) = graph.node(&edge.to) else {
                        return Err(OrreryError::Other(format!(
                            "edge target '{}' not found",
                            edge.to
                        )));
                    };
                    current = next_node;
                    stage_index += 1;
                }
                None => {
                    if outcome.status == StageStatus::Fail {
                        return Ok(RunResult {
                            status: StageStatus::Fail,
                            completed_nodes,
                            node_outcomes,
                            final_context: context.snapshot().await,
                        });
                    }
                    break;
                }
            }
        }

        Ok(RunResult {
            status: StageStatus::Success,
            completed_nodes,
            node_outcomes,
            final_context: context.snapshot().await,
        })
    }

    /// Invoke a handler under the node's retry budget.
    ///
    /// Returns the accepted outcome and the number of attempts used.
    /// Classification: success/partial accepted; explicit fail accepted
    /// without retry; retry status and handler errors consume the budget,
    /// synthesizing partial success (when allowed) or failure on exhaustion.
    async fn execute_with_retry(
        &self,
        handler: &dyn NodeHandler,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        policy: &RetryPolicy,
        token: &CancellationToken,
    ) -> Result<(Outcome, usize)> {
        let max_attempts = policy.max_attempts.max(1);
        let logs_root = self.logs_root.as_deref();

        for attempt in 1..=max_attempts {
            if token.is_cancelled() {
                return Err(OrreryError::Cancelled);
            }

            let result = handler.execute(node, context, graph, logs_root).await;
            let retry_reason = match result {
                Ok(outcome) => match outcome.status {
                    StageStatus::Retry => outcome
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "handler requested retry".into()),
                    _ => return Ok((outcome, attempt)),
                },
                Err(OrreryError::Cancelled) => return Err(OrreryError::Cancelled),
                Err(err) => err.to_string(),
            };

            if attempt < max_attempts {
                let delay = policy.delay_for_attempt(attempt);
                self.bus.emit(
                    Event::new(EventKind::StageRetrying)
                        .with("node_id", serde_json::json!(node.id))
                        .with("attempt", serde_json::json!(attempt))
                        .with("delay_ms", serde_json::json!(delay.as_millis() as u64)),
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(OrreryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            // Budget exhausted.
            let outcome = if node.allow_partial {
                let mut o = Outcome::with_status(StageStatus::PartialSuccess);
                o.notes = "retries exhausted; partial success accepted".into();
                o
            } else {
                Outcome::fail(format!(
                    "retries exhausted after {max_attempts} attempts: {retry_reason}"
                ))
            };
            return Ok((outcome, max_attempts));
        }
        unreachable!("retry loop always returns")
    }

    fn synthesize_status(&self, node: &PipelineNode, outcome: &Outcome) -> Result<()> {
        let Some(root) = &self.logs_root else {
            return Ok(());
        };
        if !node.auto_status {
            return Ok(());
        }
        let status_path = root.join(&node.id).join("status.json");
        if status_path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(root.join(&node.id))?;
        std::fs::write(&status_path, serde_json::to_string_pretty(outcome)?)?;
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        node: &PipelineNode,
        completed_nodes: &[String],
        node_retries: &HashMap<String, usize>,
        context: &Context,
    ) -> Result<()> {
        let Some(root) = &self.logs_root else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: node.id.clone(),
            completed_nodes: completed_nodes.to_vec(),
            node_retries: node_retries.clone(),
            context_values: context.snapshot().await,
            logs: context.logs().await,
        };
        checkpoint.save(&root.join("checkpoint.json"))?;
        self.bus.emit(
            Event::new(EventKind::CheckpointSaved)
                .with("node_id", serde_json::json!(node.id)),
        );
        Ok(())
    }
}

/// The first visited goal-gate node whose latest outcome is not passing.
fn failed_goal_gate<'a>(
    graph: &'a PipelineGraph,
    node_outcomes: &HashMap<String, Outcome>,
) -> Option<&'a PipelineNode> {
    let mut gates: Vec<(&String, &Outcome)> = node_outcomes
        .iter()
        .filter(|(id, outcome)| {
            graph
                .node(id)
                .is_some_and(|n| n.goal_gate && !outcome.status.is_passing())
        })
        .collect();
    gates.sort_by(|a, b| a.0.cmp(b.0));
    gates.first().and_then(|(id, _)| graph.node(id))
}

/// Retry-target lookup: node-local, node fallback, graph-level, graph
/// fallback.
fn resolve_retry_target(node: &PipelineNode, graph: &PipelineGraph) -> Option<String> {
    node.retry_target
        .clone()
        .or_else(|| node.fallback_retry_target.clone())
        .or_else(|| graph.retry_target.clone())
        .or_else(|| graph.fallback_retry_target.clone())
}

fn final_failure_reason(run: &RunResult) -> String {
    run.node_outcomes
        .values()
        .filter_map(|o| o.failure_reason.clone())
        .next()
        .unwrap_or_else(|| "pipeline failed".to_string())
}
