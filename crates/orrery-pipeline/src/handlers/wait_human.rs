//! The wait.human handler: pauses the run for operator input.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use orrery_types::events::{Event, EventBus, EventKind};
use orrery_types::{Context, Outcome, Result, StageStatus};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handlers::NodeHandler;
use crate::interviewer::{accelerator_key, Answer, Interviewer, Question, QuestionKind};

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
    bus: EventBus,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>, bus: EventBus) -> Self {
        Self { interviewer, bus }
    }
}

struct Choice {
    key: String,
    label: String,
    to: String,
}

fn selected_outcome(choice: &Choice) -> Outcome {
    let mut updates = HashMap::new();
    updates.insert(
        "human.gate.selected".to_string(),
        serde_json::Value::String(choice.key.clone()),
    );
    updates.insert(
        "human.gate.label".to_string(),
        serde_json::Value::String(choice.label.clone()),
    );
    Outcome {
        status: StageStatus::Success,
        preferred_label: None,
        suggested_next_ids: vec![choice.to.clone()],
        context_updates: updates,
        notes: format!("selected '{}'", choice.label),
        failure_reason: None,
    }
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        _context: &Context,
        graph: &PipelineGraph,
        _logs_root: Option<&Path>,
    ) -> Result<Outcome> {
        let edges = graph.outgoing_edges(&node.id);
        if edges.is_empty() {
            return Ok(Outcome::fail(format!(
                "human gate '{}' has no outgoing edges",
                node.id
            )));
        }

        let choices: Vec<Choice> = edges
            .iter()
            .map(|e| {
                let label = e.label.clone().unwrap_or_else(|| e.to.clone());
                Choice {
                    key: accelerator_key(&label),
                    label,
                    to: e.to.clone(),
                }
            })
            .collect();

        let question = Question {
            text: if node.label.is_empty() {
                "Select an option:".to_string()
            } else {
                node.label.clone()
            },
            kind: QuestionKind::MultipleChoice,
            options: choices
                .iter()
                .map(|c| crate::interviewer::QuestionOption {
                    key: c.key.clone(),
                    label: c.label.clone(),
                })
                .collect(),
            default: node.attr_str("human.default_choice").map(String::from),
            timeout: node.timeout,
            stage: node.id.clone(),
        };

        self.bus.emit(
            Event::new(EventKind::InterviewStarted)
                .with("stage", serde_json::json!(node.id))
                .with("question", serde_json::json!(question.text)),
        );

        let answer = match node.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.interviewer.ask(&question)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        self.bus.emit(
                            Event::new(EventKind::InterviewTimeout)
                                .with("stage", serde_json::json!(node.id)),
                        );
                        Answer::Timeout
                    }
                }
            }
            None => self.interviewer.ask(&question).await?,
        };

        self.bus.emit(
            Event::new(EventKind::InterviewCompleted)
                .with("stage", serde_json::json!(node.id)),
        );

        match answer {
            Answer::Timeout => {
                let default = node.attr_str("human.default_choice").unwrap_or("");
                if let Some(choice) = choices
                    .iter()
                    .find(|c| c.to == default || c.key.eq_ignore_ascii_case(default))
                {
                    return Ok(selected_outcome(choice));
                }
                Ok(Outcome::retry("human gate timed out with no default choice"))
            }
            Answer::Skipped => Ok(Outcome::fail("human skipped the interaction")),
            other => {
                let text = other.as_text();
                let choice = choices
                    .iter()
                    .find(|c| {
                        c.key.eq_ignore_ascii_case(text) || c.label.eq_ignore_ascii_case(text)
                    })
                    .unwrap_or(&choices[0]);
                Ok(selected_outcome(choice))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interviewer::{CallbackInterviewer, QueueInterviewer};

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(orrery_dot::parse(dot).unwrap()).unwrap()
    }

    const GATE: &str = r#"digraph G {
        gate [shape="hexagon", label="Ship it?"]
        yes_path [shape="box"]
        no_path [shape="box"]
        gate -> yes_path [label="[A] Approve"]
        gate -> no_path [label="[R] Reject"]
    }"#;

    fn handler(answers: Vec<Answer>) -> WaitHumanHandler {
        WaitHumanHandler::new(Arc::new(QueueInterviewer::new(answers)), EventBus::new())
    }

    #[tokio::test]
    async fn answer_key_maps_to_edge_target() {
        let graph = build(GATE);
        let h = handler(vec![Answer::Choice("A".into())]);
        let outcome = h
            .execute(graph.node("gate").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["yes_path"]);
        assert_eq!(
            outcome.context_updates.get("human.gate.selected"),
            Some(&serde_json::Value::String("A".into()))
        );
    }

    #[tokio::test]
    async fn answer_label_matches_case_insensitively() {
        let graph = build(GATE);
        let h = handler(vec![Answer::Choice("[r] reject".into())]);
        let outcome = h
            .execute(graph.node("gate").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.suggested_next_ids, vec!["no_path"]);
    }

    #[tokio::test]
    async fn skip_fails_the_gate() {
        let graph = build(GATE);
        let h = handler(vec![Answer::Skipped]);
        let outcome = h
            .execute(graph.node("gate").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn no_edges_fails() {
        let graph = build(r#"digraph G { gate [shape="hexagon"] other }"#);
        let h = handler(vec![]);
        let outcome = h
            .execute(graph.node("gate").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.failure_reason.unwrap().contains("no outgoing edges"));
    }

    #[tokio::test]
    async fn timeout_takes_default_choice() {
        let graph = build(
            r#"digraph G {
                gate [shape="hexagon", timeout=50ms]
                gate [human.default_choice="no_path"]
                yes_path
                no_path
                gate -> yes_path [label="[A] Approve"]
                gate -> no_path [label="[R] Reject"]
            }"#,
        );
        // An interviewer that never answers inside the timeout.
        let slow = CallbackInterviewer::new(|_| Answer::Yes);
        let never = WaitHumanHandler::new(
            Arc::new(SlowInterviewer(Arc::new(slow))),
            EventBus::new(),
        );
        let outcome = never
            .execute(graph.node("gate").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.suggested_next_ids, vec!["no_path"]);
    }

    #[tokio::test]
    async fn timeout_without_default_retries() {
        let graph = build(
            r#"digraph G {
                gate [shape="hexagon", timeout=50ms]
                yes_path
                gate -> yes_path [label="[A] Approve"]
            }"#,
        );
        let slow = CallbackInterviewer::new(|_| Answer::Yes);
        let h = WaitHumanHandler::new(
            Arc::new(SlowInterviewer(Arc::new(slow))),
            EventBus::new(),
        );
        let outcome = h
            .execute(graph.node("gate").unwrap(), &Context::new(), &graph, None)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Retry);
    }

    /// Delays long enough that the node timeout always fires first.
    struct SlowInterviewer(Arc<dyn Interviewer>);

    #[async_trait]
    impl Interviewer for SlowInterviewer {
        async fn ask(&self, question: &Question) -> Result<Answer> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            self.0.ask(question).await
        }
    }
}
