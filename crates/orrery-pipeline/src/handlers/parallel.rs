//! Parallel fan-out and fan-in handlers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use orrery_types::events::{Event, EventBus, EventKind};
use orrery_types::{Context, Outcome, Result, StageStatus};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handlers::{HandlerRegistry, NodeHandler};

const DEFAULT_MAX_PARALLEL: usize = 4;

/// Result of one branch, serialized into `context.parallel.results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    pub node_id: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Fans out to each outgoing edge's target as a concurrent branch. Each
/// branch executes against an isolated context clone; branch-local mutations
/// are discarded on join and only the results snapshot survives.
pub struct ParallelHandler {
    registry: Weak<HandlerRegistry>,
    bus: EventBus,
}

impl ParallelHandler {
    pub fn new(registry: Weak<HandlerRegistry>, bus: EventBus) -> Self {
        Self { registry, bus }
    }
}

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        let edges = graph.outgoing_edges(&node.id);
        if edges.is_empty() {
            return Ok(Outcome::fail(format!(
                "parallel node '{}' has no branches",
                node.id
            )));
        }
        let Some(registry) = self.registry.upgrade() else {
            return Ok(Outcome::fail("handler registry no longer available"));
        };

        let max_parallel = node
            .attrs
            .get("max_parallel")
            .and_then(orrery_dot::AttrValue::as_int)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_PARALLEL);

        self.bus.emit(
            Event::new(EventKind::ParallelStarted)
                .with("node_id", serde_json::json!(node.id))
                .with("branches", serde_json::json!(edges.len()))
                .with("max_parallel", serde_json::json!(max_parallel)),
        );

        let shared_graph = Arc::new(graph.clone());
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let logs_root: Option<PathBuf> = logs_root.map(Path::to_path_buf);

        let mut tasks: JoinSet<(usize, BranchResult)> = JoinSet::new();
        for (index, edge) in edges.iter().enumerate() {
            let target_id = edge.to.clone();
            let Some(target) = graph.node(&target_id).cloned() else {
                tasks.spawn(async move {
                    (
                        index,
                        BranchResult {
                            node_id: target_id.clone(),
                            status: StageStatus::Fail,
                            notes: String::new(),
                            failure_reason: Some(format!("branch target '{target_id}' not found")),
                        },
                    )
                });
                continue;
            };

            let branch_ctx = context.clone_isolated().await;
            let registry = registry.clone();
            let shared_graph = shared_graph.clone();
            let semaphore = semaphore.clone();
            let logs_root = logs_root.clone();
            let bus = self.bus.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                bus.emit(
                    Event::new(EventKind::ParallelBranchStarted)
                        .with("node_id", serde_json::json!(target.id)),
                );

                let result = match registry.resolve(&target) {
                    Some(handler) => {
                        match handler
                            .execute(&target, &branch_ctx, &shared_graph, logs_root.as_deref())
                            .await
                        {
                            Ok(outcome) => BranchResult {
                                node_id: target.id.clone(),
                                status: outcome.status,
                                notes: outcome.notes,
                                failure_reason: outcome.failure_reason,
                            },
                            Err(err) => BranchResult {
                                node_id: target.id.clone(),
                                status: StageStatus::Fail,
                                notes: String::new(),
                                failure_reason: Some(err.to_string()),
                            },
                        }
                    }
                    None => BranchResult {
                        node_id: target.id.clone(),
                        status: StageStatus::Fail,
                        notes: String::new(),
                        failure_reason: Some("no handler for branch target".into()),
                    },
                };

                bus.emit(
                    Event::new(EventKind::ParallelBranchCompleted)
                        .with("node_id", serde_json::json!(result.node_id))
                        .with("status", serde_json::json!(result.status.as_str())),
                );
                (index, result)
            });
        }

        let mut results: Vec<(usize, BranchResult)> = Vec::with_capacity(edges.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(err) => {
                    return Err(orrery_types::OrreryError::Handler {
                        handler: "parallel".into(),
                        node: node.id.clone(),
                        message: format!("branch task panicked: {err}"),
                    })
                }
            }
        }
        results.sort_by_key(|(index, _)| *index);
        let results: Vec<BranchResult> = results.into_iter().map(|(_, r)| r).collect();

        let success_count = results.iter().filter(|r| r.status.is_passing()).count();
        let fail_count = results
            .iter()
            .filter(|r| r.status == StageStatus::Fail)
            .count();

        context
            .set("parallel.results", serde_json::to_value(&results)?)
            .await;

        self.bus.emit(
            Event::new(EventKind::ParallelCompleted)
                .with("node_id", serde_json::json!(node.id))
                .with("succeeded", serde_json::json!(success_count))
                .with("failed", serde_json::json!(fail_count)),
        );

        let join_policy = node.attr_str("join_policy").unwrap_or("wait_all");
        let status = match join_policy {
            "first_success" => {
                if success_count > 0 {
                    StageStatus::Success
                } else {
                    StageStatus::Fail
                }
            }
            _ => {
                if fail_count == 0 {
                    StageStatus::Success
                } else {
                    StageStatus::PartialSuccess
                }
            }
        };

        let mut outcome = Outcome::with_status(status);
        outcome.notes = format!(
            "{} branches: {} succeeded, {} failed",
            results.len(),
            success_count,
            fail_count
        );
        if status == StageStatus::Fail {
            outcome.failure_reason = Some("no branch succeeded".into());
        }
        Ok(outcome)
    }
}

/// Reads the fan-out results left by a parallel node; fails when absent.
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    fn handler_type(&self) -> &str {
        "parallel.fan_in"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        _logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        let Some(results) = context.get("parallel.results").await else {
            return Ok(Outcome::fail("no parallel results to consolidate"));
        };
        let count = results.as_array().map(Vec::len).unwrap_or(0);

        let mut outcome = Outcome::success(format!("fan-in consolidated {count} branch results"));
        outcome.context_updates.insert(
            format!("{}.complete", node.id),
            serde_json::Value::Bool(true),
        );
        Ok(outcome)
    }
}
