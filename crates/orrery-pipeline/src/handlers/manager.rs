//! The manager loop handler: supervises a child pipeline by polling status
//! keys written into the context by the child's driver.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use orrery_types::{Context, Outcome, Result};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handlers::NodeHandler;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(45);
const DEFAULT_MAX_CYCLES: usize = 1000;

const STATUS_KEY: &str = "stack.child.status";
const OUTCOME_KEY: &str = "stack.child.outcome";

pub struct ManagerLoopHandler;

async fn read_key(context: &Context, key: &str) -> String {
    let value = context.get_string(key).await;
    if !value.is_empty() {
        return value;
    }
    context.get_string(&format!("context.{key}")).await
}

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    fn handler_type(&self) -> &str {
        "stack.manager_loop"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        _logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        let poll_interval = node
            .attrs
            .get("manager.poll_interval")
            .and_then(orrery_dot::AttrValue::as_duration)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let max_cycles = node
            .attrs
            .get("manager.max_cycles")
            .and_then(orrery_dot::AttrValue::as_int)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_CYCLES);

        for cycle in 0..max_cycles {
            let status = read_key(context, STATUS_KEY).await;
            match status.as_str() {
                "completed" => {
                    let child_outcome = read_key(context, OUTCOME_KEY).await;
                    if child_outcome == "success" {
                        return Ok(Outcome::success(format!(
                            "child completed after {} cycles",
                            cycle + 1
                        )));
                    }
                }
                "failed" => {
                    return Ok(Outcome::fail("child pipeline failed"));
                }
                _ => {}
            }
            tracing::debug!(
                node = %node.id,
                cycle,
                status = %status,
                "manager loop polling"
            );
            tokio::time::sleep(poll_interval).await;
        }

        Ok(Outcome::fail(format!(
            "manager loop exhausted {max_cycles} cycles"
        )))
    }
}
