//! The tool handler: runs a shell command declared on the node.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use orrery_types::{Context, Outcome, OrreryError, Result, StageStatus};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handlers::NodeHandler;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ToolCommandHandler;

#[async_trait]
impl NodeHandler for ToolCommandHandler {
    fn handler_type(&self) -> &str {
        "tool"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        _logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        let Some(command) = node.attr_str("tool_command").map(String::from) else {
            return Ok(Outcome::fail(format!(
                "tool node '{}' has no tool_command attribute",
                node.id
            )));
        };

        tracing::info!(node = %node.id, command = %command, "running tool command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", &command])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let workdir = context.get_string("workdir").await;
        if !workdir.is_empty() {
            cmd.current_dir(&workdir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Ok(Outcome::fail(format!("failed to spawn command: {err}"))),
        };

        let timeout = node.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Ok(Outcome::fail(format!("command failed: {err}"))),
            Err(_) => {
                return Err(OrreryError::CommandTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Ok(Outcome::fail(format!(
                "command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let mut updates = HashMap::new();
        updates.insert(
            "tool.output".to_string(),
            serde_json::Value::String(stdout),
        );
        updates.insert(
            format!("{}.exit_code", node.id),
            serde_json::json!(output.status.code().unwrap_or(0)),
        );

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: updates,
            notes: format!("tool completed: {command}"),
            failure_reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(orrery_dot::parse(dot).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn stdout_lands_in_context() {
        let graph = build(r#"digraph G { t [shape="parallelogram", tool_command="echo hi"] }"#);
        let outcome = ToolCommandHandler
            .execute(graph.node("t").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome
                .context_updates
                .get("tool.output")
                .and_then(|v| v.as_str()),
            Some("hi\n")
        );
    }

    #[tokio::test]
    async fn missing_command_fails() {
        let graph = build(r#"digraph G { t [shape="parallelogram"] }"#);
        let outcome = ToolCommandHandler
            .execute(graph.node("t").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_reason() {
        let graph = build(
            r#"digraph G { t [shape="parallelogram", tool_command="echo oops >&2; exit 7"] }"#,
        );
        let outcome = ToolCommandHandler
            .execute(graph.node("t").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        let reason = outcome.failure_reason.unwrap();
        assert!(reason.contains('7'));
        assert!(reason.contains("oops"));
    }

    #[tokio::test]
    async fn timeout_is_a_retryable_error() {
        let graph = build(
            r#"digraph G { t [shape="parallelogram", tool_command="sleep 5", timeout=50ms] }"#,
        );
        let err = ToolCommandHandler
            .execute(graph.node("t").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn honors_workdir_from_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flag.txt"), "present").unwrap();
        let graph = build(r#"digraph G { t [shape="parallelogram", tool_command="cat flag.txt"] }"#);
        let ctx = Context::new();
        ctx.set(
            "workdir",
            serde_json::Value::String(dir.path().display().to_string()),
        )
        .await;
        let outcome = ToolCommandHandler
            .execute(graph.node("t").unwrap(), &ctx, &graph, None)
            .await
            .unwrap();
        assert!(outcome
            .context_updates
            .get("tool.output")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("present"));
    }
}
