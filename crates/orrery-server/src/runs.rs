//! Run tracking and the HTTP-backed interviewer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use orrery_pipeline::{
    default_registry, Answer, Engine, Interviewer, LlmCodergenBackend, PipelineGraph, Question,
};
use orrery_types::events::{Event, EventBus};
use orrery_types::{Outcome, OrreryError, StageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Serialize, Clone)]
pub struct RunSummary {
    pub status: StageStatus,
    pub completed_nodes: Vec<String>,
}

#[derive(Serialize, Clone)]
pub struct PendingQuestion {
    pub id: String,
    pub stage: String,
    pub text: String,
    pub options: Vec<QuestionOptionView>,
}

#[derive(Serialize, Clone)]
pub struct QuestionOptionView {
    pub key: String,
    pub label: String,
}

struct ParkedQuestion {
    view: PendingQuestion,
    tx: tokio::sync::oneshot::Sender<Answer>,
}

/// One pipeline run: its lifecycle status, captured events, outcomes, and
/// parked human-gate questions.
pub struct RunHandle {
    pub id: String,
    pub logs_root: PathBuf,
    pub token: CancellationToken,
    status: RwLock<RunStatus>,
    result: RwLock<Option<RunSummary>>,
    error: RwLock<Option<String>>,
    events: Mutex<Vec<Event>>,
    outcomes: RwLock<HashMap<String, Outcome>>,
    questions: Mutex<Vec<ParkedQuestion>>,
}

impl RunHandle {
    fn new(id: String, logs_root: PathBuf) -> Self {
        Self {
            id,
            logs_root,
            token: CancellationToken::new(),
            status: RwLock::new(RunStatus::Running),
            result: RwLock::new(None),
            error: RwLock::new(None),
            events: Mutex::new(Vec::new()),
            outcomes: RwLock::new(HashMap::new()),
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> RunStatus {
        *self.status.read().expect("status lock poisoned")
    }

    pub fn result(&self) -> Option<RunSummary> {
        self.result.read().expect("result lock poisoned").clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().expect("error lock poisoned").clone()
    }

    pub fn events_snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("events lock poisoned").clone()
    }

    pub fn outcomes_snapshot(&self) -> HashMap<String, Outcome> {
        self.outcomes.read().expect("outcomes lock poisoned").clone()
    }

    pub fn pending_questions(&self) -> Vec<PendingQuestion> {
        self.questions
            .lock()
            .expect("questions lock poisoned")
            .iter()
            .map(|q| q.view.clone())
            .collect()
    }

    /// Deliver an answer to a parked question. Returns false for unknown ids.
    pub fn answer_question(&self, question_id: &str, answer: Answer) -> bool {
        let mut questions = self.questions.lock().expect("questions lock poisoned");
        let Some(index) = questions.iter().position(|q| q.view.id == question_id) else {
            return false;
        };
        let parked = questions.remove(index);
        parked.tx.send(answer).is_ok()
    }

    pub fn cancel(&self) {
        self.token.cancel();
        let mut status = self.status.write().expect("status lock poisoned");
        if *status == RunStatus::Running {
            *status = RunStatus::Cancelled;
        }
    }
}

/// Interviewer that parks questions on the run handle until an HTTP client
/// answers them.
pub struct HttpInterviewer {
    run: Arc<RunHandle>,
}

impl HttpInterviewer {
    pub fn new(run: Arc<RunHandle>) -> Self {
        Self { run }
    }
}

#[async_trait]
impl Interviewer for HttpInterviewer {
    async fn ask(&self, question: &Question) -> orrery_types::Result<Answer> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let view = PendingQuestion {
            id: uuid::Uuid::new_v4().to_string(),
            stage: question.stage.clone(),
            text: question.text.clone(),
            options: question
                .options
                .iter()
                .map(|o| QuestionOptionView {
                    key: o.key.clone(),
                    label: o.label.clone(),
                })
                .collect(),
        };
        self.run
            .questions
            .lock()
            .expect("questions lock poisoned")
            .push(ParkedQuestion { view, tx });

        tokio::select! {
            _ = self.run.token.cancelled() => Err(OrreryError::Cancelled),
            answer = rx => answer.map_err(|_| OrreryError::Other("question dropped".into())),
        }
    }
}

/// Shared server state: the set of known runs and the codergen backend new
/// runs execute with. Without a backend, codergen stages simulate.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<String, Arc<RunHandle>>>>,
    backend: Option<Arc<dyn orrery_pipeline::CodergenBackend>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: Arc<dyn orrery_pipeline::CodergenBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Wire a codergen backend from the process-wide LLM client when one can
    /// be built from the environment.
    pub fn with_backend_from_env(self) -> Self {
        match orrery_llm::global() {
            Ok(client) => self.with_backend(Arc::new(LlmCodergenBackend::new(
                client,
                default_model(),
            ))),
            Err(err) => {
                tracing::warn!(error = %err, "no LLM provider configured; codergen will simulate");
                self
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<RunHandle>> {
        self.runs.read().expect("runs lock poisoned").get(id).cloned()
    }

    /// Create a run handle and start executing the graph on a background
    /// task. Returns the run id immediately.
    pub fn spawn(&self, graph: PipelineGraph) -> Arc<RunHandle> {
        let id = format!("run-{}", uuid::Uuid::new_v4());
        let logs_root = std::env::temp_dir().join("orrery-runs").join(&id);
        let run = Arc::new(RunHandle::new(id.clone(), logs_root.clone()));
        self.runs
            .write()
            .expect("runs lock poisoned")
            .insert(id, run.clone());

        let bus = EventBus::new();
        let event_sink = run.clone();
        bus.on(move |event| {
            event_sink
                .events
                .lock()
                .expect("events lock poisoned")
                .push(event.clone());
        });

        let backend = self.backend.clone();
        let interviewer = Arc::new(HttpInterviewer::new(run.clone()));
        let registry = default_registry(bus.clone(), interviewer, backend);
        let engine = Engine::new(registry, bus).with_logs_root(logs_root);

        let handle = run.clone();
        tokio::spawn(async move {
            let token = handle.token.clone();
            let outcome = engine.run(&graph, &token).await;
            match outcome {
                Ok(result) => {
                    *handle.outcomes.write().expect("outcomes lock poisoned") =
                        result.node_outcomes.clone();
                    *handle.result.write().expect("result lock poisoned") = Some(RunSummary {
                        status: result.status,
                        completed_nodes: result.completed_nodes,
                    });
                    let mut status = handle.status.write().expect("status lock poisoned");
                    if *status == RunStatus::Running {
                        *status = if result.status.is_passing() {
                            RunStatus::Completed
                        } else {
                            RunStatus::Failed
                        };
                    }
                }
                Err(err) => {
                    *handle.error.write().expect("error lock poisoned") =
                        Some(err.to_string());
                    let mut status = handle.status.write().expect("status lock poisoned");
                    if *status == RunStatus::Running {
                        *status = match err {
                            OrreryError::Cancelled => RunStatus::Cancelled,
                            _ => RunStatus::Failed,
                        };
                    }
                }
            }
        });

        run
    }
}

fn default_model() -> String {
    std::env::var("ORRERY_DEFAULT_MODEL").unwrap_or_else(|_| "claude-sonnet-4-5".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orrery_pipeline::load_pipeline;

    fn simple_graph() -> PipelineGraph {
        load_pipeline(
            r#"digraph G {
                start [shape="Mdiamond"]
                work [shape="box", prompt="do"]
                exit [shape="Msquare"]
                start -> work -> exit
            }"#,
        )
        .unwrap()
    }

    async fn wait_for_terminal(run: &RunHandle) -> RunStatus {
        for _ in 0..200 {
            let status = run.status();
            if status != RunStatus::Running {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        run.status()
    }

    #[tokio::test]
    async fn run_completes_and_records_outcomes() {
        let registry = RunRegistry::new();
        let run = registry.spawn(simple_graph());

        let status = wait_for_terminal(&run).await;
        assert_eq!(status, RunStatus::Completed);

        let summary = run.result().unwrap();
        assert_eq!(summary.completed_nodes, vec!["start", "work"]);
        assert!(run.outcomes_snapshot().contains_key("work"));
        assert!(!run.events_snapshot().is_empty());
    }

    #[tokio::test]
    async fn cancel_flips_status() {
        let registry = RunRegistry::new();
        let graph = load_pipeline(
            r#"digraph G {
                start [shape="Mdiamond"]
                gate [shape="hexagon", label="Wait forever"]
                exit [shape="Msquare"]
                start -> gate
                gate -> exit [label="[C] Continue"]
            }"#,
        )
        .unwrap();
        let run = registry.spawn(graph);

        // Give the run a moment to park on the question, then cancel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        run.cancel();
        let status = wait_for_terminal(&run).await;
        assert_eq!(status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn question_answer_unblocks_the_gate() {
        let registry = RunRegistry::new();
        let graph = load_pipeline(
            r#"digraph G {
                start [shape="Mdiamond"]
                gate [shape="hexagon", label="Proceed?"]
                approved [shape="box"]
                exit [shape="Msquare"]
                start -> gate
                gate -> approved [label="[A] Approve"]
                approved -> exit
            }"#,
        )
        .unwrap();
        let run = registry.spawn(graph);

        // Wait for the question to appear.
        let mut pending = Vec::new();
        for _ in 0..100 {
            pending = run.pending_questions();
            if !pending.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].stage, "gate");

        assert!(run.answer_question(&pending[0].id, Answer::Choice("A".into())));
        let status = wait_for_terminal(&run).await;
        assert_eq!(status, RunStatus::Completed);
        assert!(run
            .result()
            .unwrap()
            .completed_nodes
            .contains(&"approved".to_string()));
    }

    #[test]
    fn unknown_question_id_is_rejected() {
        let run = RunHandle::new("run-x".into(), std::env::temp_dir());
        assert!(!run.answer_question("nope", Answer::Yes));
    }
}
