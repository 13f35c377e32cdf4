//! The codergen handler: renders a prompt, invokes the configured LLM
//! backend, and records prompt/response/status artifacts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use orrery_types::{Context, Outcome, Result, StageStatus};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handlers::NodeHandler;

/// What a backend run produced: plain text, or a complete outcome when the
/// backend wants to drive edge selection itself.
pub enum BackendResponse {
    Text(String),
    Outcome(Outcome),
}

/// The LLM execution seam for codergen nodes. Distinct from the raw client:
/// it sees the node and the run context, and may return a full [`Outcome`].
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run(
        &self,
        node: &PipelineNode,
        prompt: &str,
        context: &Context,
    ) -> Result<BackendResponse>;
}

const SNIPPET_LEN: usize = 200;

fn snippet(text: &str) -> String {
    if text.len() <= SNIPPET_LEN {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= SNIPPET_LEN - 3)
        .last()
        .unwrap_or(0);
    format!("{}...", &text[..cut])
}

pub struct CodergenHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl CodergenHandler {
    pub fn new(backend: Option<Arc<dyn CodergenBackend>>) -> Self {
        Self { backend }
    }
}

fn write_artifact(logs_root: Option<&Path>, node_id: &str, file: &str, content: &str) {
    let Some(root) = logs_root else { return };
    let dir = root.join(node_id);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        tracing::warn!(node = node_id, error = %err, "could not create stage dir");
        return;
    }
    if let Err(err) = std::fs::write(dir.join(file), content) {
        tracing::warn!(node = node_id, file, error = %err, "could not write artifact");
    }
}

pub(crate) fn write_status(logs_root: Option<&Path>, node_id: &str, outcome: &Outcome) {
    if let Ok(json) = serde_json::to_string_pretty(outcome) {
        write_artifact(logs_root, node_id, "status.json", &json);
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        let raw_prompt = node
            .prompt
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| node.label.clone());
        let prompt = raw_prompt.replace("$goal", &graph.goal);

        write_artifact(logs_root, &node.id, "prompt.md", &prompt);

        let response_text = match &self.backend {
            Some(backend) => match backend.run(node, &prompt, context).await {
                Ok(BackendResponse::Outcome(outcome)) => {
                    write_status(logs_root, &node.id, &outcome);
                    return Ok(outcome);
                }
                Ok(BackendResponse::Text(text)) => text,
                Err(err) => {
                    let outcome = Outcome::fail(err.to_string());
                    write_status(logs_root, &node.id, &outcome);
                    return Ok(outcome);
                }
            },
            None => format!("[simulated] response for stage: {}", node.id),
        };

        write_artifact(logs_root, &node.id, "response.md", &response_text);

        let mut updates = HashMap::new();
        updates.insert(
            "last_stage".to_string(),
            serde_json::Value::String(node.id.clone()),
        );
        updates.insert(
            "last_response".to_string(),
            serde_json::Value::String(snippet(&response_text)),
        );
        updates.insert(
            format!("{}.response", node.id),
            serde_json::Value::String(snippet(&response_text)),
        );

        let outcome = Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: updates,
            notes: format!("stage completed: {}", node.id),
            failure_reason: None,
        };
        write_status(logs_root, &node.id, &outcome);
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// LlmCodergenBackend — drives the unified client
// ---------------------------------------------------------------------------

/// Backend that sends the rendered prompt to the unified LLM client, honoring
/// the node's model / provider / reasoning-effort resolution.
pub struct LlmCodergenBackend {
    client: Arc<orrery_llm::Client>,
    default_model: String,
}

impl LlmCodergenBackend {
    pub fn new(client: Arc<orrery_llm::Client>, default_model: impl Into<String>) -> Self {
        Self {
            client,
            default_model: default_model.into(),
        }
    }
}

#[async_trait]
impl CodergenBackend for LlmCodergenBackend {
    async fn run(
        &self,
        node: &PipelineNode,
        prompt: &str,
        context: &Context,
    ) -> Result<BackendResponse> {
        let model = node
            .llm_model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let mut request = orrery_llm::Request::new(model);
        request.provider = node.llm_provider.clone();
        request.reasoning_effort = node
            .reasoning_effort
            .as_deref()
            .and_then(|e| match e {
                "low" => Some(orrery_llm::ReasoningEffort::Low),
                "medium" => Some(orrery_llm::ReasoningEffort::Medium),
                "high" => Some(orrery_llm::ReasoningEffort::High),
                _ => None,
            });

        let goal = context.get_string("graph.goal").await;
        if !goal.is_empty() {
            request.system_prompt = format!("You are executing one stage of a pipeline whose overall goal is: {goal}");
        }
        request.messages.push(orrery_llm::Message::user(prompt));

        let token = CancellationToken::new();
        let response = self.client.complete(&token, request).await?;
        Ok(BackendResponse::Text(response.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(orrery_dot::parse(dot).unwrap()).unwrap()
    }

    struct EchoBackend;

    #[async_trait]
    impl CodergenBackend for EchoBackend {
        async fn run(
            &self,
            _node: &PipelineNode,
            prompt: &str,
            _context: &Context,
        ) -> Result<BackendResponse> {
            Ok(BackendResponse::Text(format!("echo: {prompt}")))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl CodergenBackend for FailingBackend {
        async fn run(
            &self,
            _node: &PipelineNode,
            _prompt: &str,
            _context: &Context,
        ) -> Result<BackendResponse> {
            Err(orrery_types::OrreryError::Other("backend exploded".into()))
        }
    }

    struct OutcomeBackend;

    #[async_trait]
    impl CodergenBackend for OutcomeBackend {
        async fn run(
            &self,
            _node: &PipelineNode,
            _prompt: &str,
            _context: &Context,
        ) -> Result<BackendResponse> {
            let mut outcome = Outcome::success("drove selection");
            outcome.preferred_label = Some("approve".into());
            Ok(BackendResponse::Outcome(outcome))
        }
    }

    #[tokio::test]
    async fn expands_goal_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(
            r#"digraph G {
                goal = "fix the bug"
                work [prompt="Advance: $goal"]
            }"#,
        );
        let handler = CodergenHandler::new(Some(Arc::new(EchoBackend)));
        let outcome = handler
            .execute(
                graph.node("work").unwrap(),
                &Context::new(),
                &graph,
                Some(dir.path()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Success);
        let prompt = std::fs::read_to_string(dir.path().join("work/prompt.md")).unwrap();
        assert_eq!(prompt, "Advance: fix the bug");
        let response = std::fs::read_to_string(dir.path().join("work/response.md")).unwrap();
        assert_eq!(response, "echo: Advance: fix the bug");
        assert!(dir.path().join("work/status.json").exists());
        assert_eq!(
            outcome.context_updates.get("last_stage"),
            Some(&serde_json::Value::String("work".into()))
        );
    }

    #[tokio::test]
    async fn label_is_prompt_fallback() {
        let graph = build(r#"digraph G { step [label="Summarize findings"] }"#);
        let handler = CodergenHandler::new(Some(Arc::new(EchoBackend)));
        let outcome = handler
            .execute(graph.node("step").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert!(outcome
            .context_updates
            .get("last_response")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("Summarize findings"));
    }

    #[tokio::test]
    async fn backend_error_becomes_fail_outcome() {
        let graph = build(r#"digraph G { step [prompt="x"] }"#);
        let handler = CodergenHandler::new(Some(Arc::new(FailingBackend)));
        let outcome = handler
            .execute(graph.node("step").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.failure_reason.unwrap().contains("backend exploded"));
    }

    #[tokio::test]
    async fn backend_outcome_passes_through() {
        let graph = build(r#"digraph G { step [prompt="x"] }"#);
        let handler = CodergenHandler::new(Some(Arc::new(OutcomeBackend)));
        let outcome = handler
            .execute(graph.node("step").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.preferred_label.as_deref(), Some("approve"));
    }

    #[tokio::test]
    async fn no_backend_simulates() {
        let graph = build(r#"digraph G { step [prompt="x"] }"#);
        let handler = CodergenHandler::new(None);
        let outcome = handler
            .execute(graph.node("step").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome
            .context_updates
            .get("last_response")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("[simulated]"));
    }

    #[test]
    fn snippet_truncates_long_text() {
        let long = "a".repeat(500);
        let s = snippet(&long);
        assert!(s.len() <= SNIPPET_LEN);
        assert!(s.ends_with("..."));
        assert_eq!(snippet("short"), "short");
    }
}
