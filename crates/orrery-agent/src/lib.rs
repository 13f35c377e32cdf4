//! The agent session: a cooperative state machine that drives an LLM through
//! alternating think/act steps.
//!
//! A session owns its conversation history, routes tool calls to a
//! [`ToolEnvironment`], bounds recorded tool output with the two-stage
//! truncation pipeline, detects runaway call loops, and supports operator
//! intervention: steering messages injected between tool rounds and
//! follow-up prompts queued behind the current submit.

pub mod loop_detection;
pub mod profile;
pub mod truncation;

pub use loop_detection::{LoopDetector, SteeringMessages};
pub use profile::{
    apply_patch_tool, build_system_prompt, default_anthropic_profile, default_gemini_profile,
    default_openai_profile, default_tool_set, profile_for_provider, ProviderProfile,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use orrery_llm::{Client, Message, ReasoningEffort, Request, Response, ToolCall, Usage};
use orrery_tools::ToolEnvironment;
use orrery_types::events::{Event, EventBus, EventKind};
use orrery_types::{OrreryError, Result};

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

const TOOL_ROUND_SAFETY_CAP: usize = 200;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum assistant turns across the session (0 = unlimited).
    pub max_turns: usize,
    /// Maximum tool rounds per submit (0 = the safety cap of 200).
    pub max_tool_rounds_per_input: usize,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Per-tool character cap overrides for recorded tool output.
    pub tool_output_limits: HashMap<String, usize>,
    pub enable_loop_detection: bool,
    pub loop_detection_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 0,
            max_tool_rounds_per_input: 0,
            reasoning_effort: None,
            tool_output_limits: HashMap::new(),
            enable_loop_detection: true,
            loop_detection_window: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Processing,
    AwaitingInput,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Processing => write!(f, "processing"),
            SessionState::AwaitingInput => write!(f, "awaiting_input"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ToolResultEntry {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub enum Turn {
    User {
        content: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Steering {
        content: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Assistant {
        content: String,
        tool_calls: Vec<ToolCall>,
        reasoning: Option<String>,
        usage: Usage,
        response_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ToolResults {
        results: Vec<ToolResultEntry>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

// ---------------------------------------------------------------------------
// AgentSession
// ---------------------------------------------------------------------------

pub struct AgentSession {
    id: String,
    client: Arc<Client>,
    profile: ProviderProfile,
    env: Arc<dyn ToolEnvironment>,
    bus: EventBus,
    config: SessionConfig,
    state: Mutex<SessionState>,
    history: Mutex<Vec<Turn>>,
    steering_queue: Mutex<VecDeque<String>>,
    followup_queue: Mutex<VecDeque<String>>,
    assistant_turns: AtomicUsize,
    loop_detector: Mutex<LoopDetector>,
}

impl AgentSession {
    pub fn new(
        client: Arc<Client>,
        profile: ProviderProfile,
        env: Arc<dyn ToolEnvironment>,
        config: SessionConfig,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::info!(session_id = %id, model = %profile.model, "agent session created");
        let window = config.loop_detection_window;
        Self {
            id,
            client,
            profile,
            env,
            bus: EventBus::new(),
            config,
            state: Mutex::new(SessionState::Idle),
            history: Mutex::new(Vec::new()),
            steering_queue: Mutex::new(VecDeque::new()),
            followup_queue: Mutex::new(VecDeque::new()),
            assistant_turns: AtomicUsize::new(0),
            loop_detector: Mutex::new(LoopDetector::new(window)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn history(&self) -> Vec<Turn> {
        self.history.lock().expect("history lock poisoned").clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Queue a message to inject at the next tool-round boundary. Never
    /// preempts an in-flight LLM call or tool execution.
    pub fn steer(&self, message: impl Into<String>) {
        self.steering_queue
            .lock()
            .expect("steering lock poisoned")
            .push_back(message.into());
    }

    /// Queue a prompt to submit after the current submit returns.
    pub fn follow_up(&self, message: impl Into<String>) {
        self.followup_queue
            .lock()
            .expect("followup lock poisoned")
            .push_back(message.into());
    }

    /// Idempotent, terminal. Emits `session_closed` on the first call.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == SessionState::Closed {
            return;
        }
        *state = SessionState::Closed;
        drop(state);
        self.bus.emit(
            Event::new(EventKind::SessionClosed).with("session_id", serde_json::json!(self.id)),
        );
    }

    /// Submit a prompt and run the loop to completion, then drain queued
    /// follow-ups in order.
    pub async fn submit(&self, token: &CancellationToken, input: &str) -> Result<String> {
        let mut current = input.to_string();
        loop {
            let result = self.submit_single(token, &current).await?;
            let next = self
                .followup_queue
                .lock()
                .expect("followup lock poisoned")
                .pop_front();
            match next {
                Some(followup) => current = followup,
                None => return Ok(result),
            }
        }
    }

    async fn submit_single(&self, token: &CancellationToken, input: &str) -> Result<String> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                SessionState::Idle | SessionState::AwaitingInput => {
                    *state = SessionState::Processing;
                }
                other => {
                    return Err(OrreryError::SessionBusy {
                        state: other.to_string(),
                    })
                }
            }
        }

        self.bus.emit(
            Event::new(EventKind::SessionStarted)
                .with("session_id", serde_json::json!(self.id))
                .with("input", serde_json::json!(input)),
        );
        self.push_turn(Turn::User {
            content: input.to_string(),
            timestamp: chrono::Utc::now(),
        });

        match self.run_loop(token).await {
            Ok(text) => {
                self.set_state_if_processing(SessionState::AwaitingInput);
                Ok(text)
            }
            Err(err) => {
                self.set_state_if_processing(SessionState::Idle);
                Err(err)
            }
        }
    }

    fn set_state_if_processing(&self, next: SessionState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == SessionState::Processing {
            *state = next;
        }
    }

    fn push_turn(&self, turn: Turn) {
        self.history.lock().expect("history lock poisoned").push(turn);
    }

    /// One submit's think/act loop.
    async fn run_loop(&self, token: &CancellationToken) -> Result<String> {
        let max_rounds = match self.config.max_tool_rounds_per_input {
            0 => TOOL_ROUND_SAFETY_CAP,
            n => n.min(TOOL_ROUND_SAFETY_CAP),
        };
        let mut last_text = String::new();

        for round in 0..max_rounds {
            if token.is_cancelled() {
                return Err(OrreryError::Cancelled);
            }

            // Inject at most one steering message per round boundary.
            let steering = self
                .steering_queue
                .lock()
                .expect("steering lock poisoned")
                .pop_front();
            if let Some(message) = steering {
                self.push_turn(Turn::Steering {
                    content: message.clone(),
                    timestamp: chrono::Utc::now(),
                });
                self.bus.emit(
                    Event::new(EventKind::SteeringApplied)
                        .with("message", serde_json::json!(message)),
                );
            }

            let request = self.build_request();
            self.bus.emit(
                Event::new(EventKind::TurnStarted).with("tool_round", serde_json::json!(round)),
            );

            let response: Response = match self.client.complete(token, request).await {
                Ok(resp) => resp,
                Err(err) => {
                    self.bus.emit(
                        Event::new(EventKind::Error)
                            .with("error", serde_json::json!(err.to_string())),
                    );
                    return Err(err.into());
                }
            };

            tracing::debug!(
                round,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                tool_calls = response.tool_calls.len(),
                "llm response received"
            );

            last_text = response.content.clone();
            self.push_turn(Turn::Assistant {
                content: response.content.clone(),
                tool_calls: response.tool_calls.clone(),
                reasoning: response.reasoning.clone(),
                usage: response.usage,
                response_id: response.id.clone(),
                timestamp: chrono::Utc::now(),
            });

            let turns = self.assistant_turns.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.max_turns > 0 && turns >= self.config.max_turns {
                tracing::info!(turns, "turn limit reached");
                break;
            }

            if response.tool_calls.is_empty() {
                self.bus.emit(
                    Event::new(EventKind::TurnCompleted)
                        .with("content", serde_json::json!(response.content))
                        .with("tool_round", serde_json::json!(round)),
                );
                break;
            }

            let results = self.execute_tool_calls(&response.tool_calls).await;
            self.push_turn(Turn::ToolResults {
                results,
                timestamp: chrono::Utc::now(),
            });

            if self.config.enable_loop_detection {
                self.detect_loops(&response.tool_calls);
            }
        }

        Ok(last_text)
    }

    fn detect_loops(&self, tool_calls: &[ToolCall]) {
        let mut detector = self.loop_detector.lock().expect("detector lock poisoned");
        for tc in tool_calls {
            if detector.record_and_check(&tc.name, &tc.arguments.to_string()) {
                self.bus.emit(
                    Event::new(EventKind::LoopDetected)
                        .with("tool", serde_json::json!(tc.name))
                        .with(
                            "window",
                            serde_json::json!(self.config.loop_detection_window),
                        ),
                );
                self.steer(SteeringMessages::loop_detected(&tc.name));
                detector.reset();
            }
        }
    }

    /// Project history into a provider request using the active profile.
    fn build_request(&self) -> Request {
        let mut request = Request::new(self.profile.model.clone());
        request.provider = Some(self.profile.provider.clone());
        request.system_prompt = self.profile.system_prompt.clone();
        request.tools = self.profile.tools.clone();
        request.reasoning_effort = self.config.reasoning_effort;

        let history = self.history.lock().expect("history lock poisoned");
        for turn in history.iter() {
            match turn {
                Turn::User { content, .. } | Turn::Steering { content, .. } => {
                    request.messages.push(Message::user(content));
                }
                Turn::Assistant {
                    content,
                    tool_calls,
                    ..
                } => {
                    request.messages.push(Message::assistant_with_tool_calls(
                        content.clone(),
                        tool_calls.clone(),
                    ));
                }
                Turn::ToolResults { results, .. } => {
                    for result in results {
                        let mut msg = Message::tool_result(&result.tool_call_id, &result.content);
                        msg.name = Some(result.tool_name.clone());
                        request.messages.push(msg);
                    }
                }
            }
        }
        request
    }

    /// Execute tool calls in order. The recorded content passes through the
    /// truncation pipeline; the completion event carries the full output.
    async fn execute_tool_calls(&self, tool_calls: &[ToolCall]) -> Vec<ToolResultEntry> {
        let mut results = Vec::with_capacity(tool_calls.len());
        for tc in tool_calls {
            self.bus.emit(
                Event::new(EventKind::ToolCallStarted)
                    .with("tool_name", serde_json::json!(tc.name))
                    .with("tool_id", serde_json::json!(tc.id)),
            );

            let (full_output, is_error) =
                match self.env.execute(&tc.name, tc.arguments.clone()).await {
                    Ok(output) => (output, false),
                    Err(err) => (format!("Error: {err}"), true),
                };

            let recorded = if is_error {
                full_output.clone()
            } else {
                truncation::apply(&tc.name, &full_output, &self.config.tool_output_limits)
            };

            self.bus.emit(
                Event::new(EventKind::ToolCallCompleted)
                    .with("tool_name", serde_json::json!(tc.name))
                    .with("tool_id", serde_json::json!(tc.id))
                    .with("is_error", serde_json::json!(is_error))
                    .with("output", serde_json::json!(full_output)),
            );

            results.push(ToolResultEntry {
                tool_call_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                content: recorded,
                is_error,
            });
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orrery_llm::{
        EventStream, FinishReason, ProviderAdapter, Response, StreamEvent, ToolCall,
    };
    use orrery_types::LlmError;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    // -- Mock provider that replays a scripted response sequence --

    struct SequenceProvider {
        responses: StdMutex<VecDeque<Response>>,
    }

    impl SequenceProvider {
        fn new(responses: Vec<Response>) -> Self {
            Self {
                responses: StdMutex::new(responses.into()),
            }
        }
    }

    fn text_response(id: &str, text: &str) -> Response {
        let mut resp = Response::text(id, "mock-model", text);
        resp.usage = Usage {
            input_tokens: 5,
            output_tokens: 7,
            total_tokens: 12,
            ..Default::default()
        };
        resp
    }

    fn tool_call_response(id: &str, calls: Vec<ToolCall>) -> Response {
        let mut resp = Response::text(id, "mock-model", "");
        resp.tool_calls = calls;
        resp.finish_reason = FinishReason::ToolCalls;
        resp
    }

    #[async_trait]
    impl ProviderAdapter for SequenceProvider {
        fn name(&self) -> &str {
            "anthropic"
        }
        async fn complete(
            &self,
            _token: &CancellationToken,
            _request: &Request,
        ) -> std::result::Result<Response, LlmError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| {
                    LlmError::new(
                        orrery_types::LlmErrorKind::Unknown,
                        "mock",
                        "response script exhausted",
                    )
                })
        }
        fn stream(&self, _token: &CancellationToken, _request: &Request) -> EventStream {
            Box::pin(tokio_stream::empty::<StreamEvent>())
        }
    }

    // -- Mock tool environment --

    struct MockEnv {
        outputs: HashMap<String, String>,
    }

    impl MockEnv {
        fn with(pairs: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                outputs: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl ToolEnvironment for MockEnv {
        async fn execute(&self, name: &str, _args: serde_json::Value) -> Result<String> {
            self.outputs
                .get(name)
                .cloned()
                .ok_or_else(|| OrreryError::Tool {
                    tool: name.to_string(),
                    message: format!("unknown tool: {name}"),
                })
        }
        fn working_directory(&self) -> &Path {
            Path::new("/tmp")
        }
    }

    fn session_with(
        responses: Vec<Response>,
        env: Arc<dyn ToolEnvironment>,
        config: SessionConfig,
    ) -> AgentSession {
        let client = Client::new();
        client.register_provider(SequenceProvider::new(responses));
        AgentSession::new(
            Arc::new(client),
            default_anthropic_profile("mock-model"),
            env,
            config,
        )
    }

    fn collect_events(session: &AgentSession) -> Arc<StdMutex<Vec<Event>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        session.bus().on(move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[tokio::test]
    async fn plain_text_response_completes_in_one_round() {
        let session = session_with(
            vec![text_response("r1", "Hello!")],
            MockEnv::with(&[]),
            SessionConfig::default(),
        );
        let result = session
            .submit(&CancellationToken::new(), "hi")
            .await
            .unwrap();
        assert_eq!(result, "Hello!");
        assert_eq!(session.state(), SessionState::AwaitingInput);

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert!(matches!(&history[0], Turn::User { content, .. } if content == "hi"));
        assert!(matches!(&history[1], Turn::Assistant { content, .. } if content == "Hello!"));
    }

    #[tokio::test]
    async fn tool_loop_round_trip_matches_contract() {
        // Round 1: one read_file call. Round 2: final text.
        let session = session_with(
            vec![
                tool_call_response(
                    "r1",
                    vec![ToolCall {
                        id: "tc_1".into(),
                        name: "read_file".into(),
                        arguments: serde_json::json!({"path": "hello.txt"}),
                    }],
                ),
                text_response("r2", "The file says hello"),
            ],
            MockEnv::with(&[("read_file", "hello")]),
            SessionConfig::default(),
        );
        let events = collect_events(&session);

        let result = session
            .submit(&CancellationToken::new(), "what does hello.txt say?")
            .await
            .unwrap();
        assert_eq!(result, "The file says hello");

        // History: User, Assistant(tool_calls), ToolResults, Assistant(text).
        let history = session.history();
        assert_eq!(history.len(), 4);
        assert!(matches!(&history[0], Turn::User { .. }));
        match &history[1] {
            Turn::Assistant { tool_calls, .. } => assert_eq!(tool_calls[0].id, "tc_1"),
            other => panic!("expected assistant turn, got {other:?}"),
        }
        match &history[2] {
            Turn::ToolResults { results, .. } => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].tool_call_id, "tc_1");
                assert_eq!(results[0].content, "hello");
                assert!(!results[0].is_error);
            }
            other => panic!("expected tool results turn, got {other:?}"),
        }
        assert!(matches!(&history[3], Turn::Assistant { content, .. } if content == "The file says hello"));

        let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::SessionStarted));
        assert!(kinds.contains(&EventKind::ToolCallStarted));
        assert!(kinds.contains(&EventKind::ToolCallCompleted));
        assert!(kinds.contains(&EventKind::TurnCompleted));
    }

    #[tokio::test]
    async fn tool_errors_become_in_band_results() {
        let session = session_with(
            vec![
                tool_call_response(
                    "r1",
                    vec![ToolCall {
                        id: "tc_1".into(),
                        name: "nonexistent".into(),
                        arguments: serde_json::json!({}),
                    }],
                ),
                text_response("r2", "recovered"),
            ],
            MockEnv::with(&[]),
            SessionConfig::default(),
        );
        let result = session
            .submit(&CancellationToken::new(), "go")
            .await
            .unwrap();
        assert_eq!(result, "recovered");

        let history = session.history();
        match &history[2] {
            Turn::ToolResults { results, .. } => {
                assert!(results[0].is_error);
                assert!(results[0].content.contains("unknown tool"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn llm_error_aborts_submit_and_emits_error() {
        let session = session_with(vec![], MockEnv::with(&[]), SessionConfig::default());
        let events = collect_events(&session);

        let err = session
            .submit(&CancellationToken::new(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, OrreryError::Llm(_)));
        assert_eq!(session.state(), SessionState::Idle);
        let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Error));
    }

    #[tokio::test]
    async fn steering_is_injected_between_rounds() {
        let session = session_with(
            vec![
                tool_call_response(
                    "r1",
                    vec![ToolCall {
                        id: "tc_1".into(),
                        name: "read_file".into(),
                        arguments: serde_json::json!({"path": "a"}),
                    }],
                ),
                text_response("r2", "done"),
            ],
            MockEnv::with(&[("read_file", "content")]),
            SessionConfig::default(),
        );
        let events = collect_events(&session);
        session.steer("Focus on tests.");

        session.submit(&CancellationToken::new(), "go").await.unwrap();

        let history = session.history();
        // Steering drained at the first round boundary, right after the
        // user turn.
        assert!(matches!(&history[1], Turn::Steering { content, .. } if content == "Focus on tests."));
        let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::SteeringApplied));
    }

    #[tokio::test]
    async fn follow_up_runs_after_current_submit() {
        let session = session_with(
            vec![text_response("r1", "first answer"), text_response("r2", "second answer")],
            MockEnv::with(&[]),
            SessionConfig::default(),
        );
        session.follow_up("and another thing");

        let result = session
            .submit(&CancellationToken::new(), "first")
            .await
            .unwrap();
        // The follow-up's answer is the final result.
        assert_eq!(result, "second answer");

        let user_turns: Vec<String> = session
            .history()
            .iter()
            .filter_map(|t| match t {
                Turn::User { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(user_turns, vec!["first", "and another thing"]);
    }

    #[tokio::test]
    async fn closed_session_rejects_submit() {
        let session = session_with(
            vec![text_response("r1", "x")],
            MockEnv::with(&[]),
            SessionConfig::default(),
        );
        session.close();
        session.close(); // idempotent
        assert_eq!(session.state(), SessionState::Closed);

        let err = session
            .submit(&CancellationToken::new(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, OrreryError::SessionBusy { .. }));
    }

    #[tokio::test]
    async fn turn_limit_stops_the_loop() {
        let always_tools: Vec<Response> = (0..5)
            .map(|i| {
                tool_call_response(
                    &format!("r{i}"),
                    vec![ToolCall {
                        id: format!("tc_{i}"),
                        name: "read_file".into(),
                        arguments: serde_json::json!({"path": "x"}),
                    }],
                )
            })
            .collect();
        let session = session_with(
            always_tools,
            MockEnv::with(&[("read_file", "data")]),
            SessionConfig {
                max_turns: 2,
                ..Default::default()
            },
        );
        session.submit(&CancellationToken::new(), "go").await.unwrap();

        let assistant_turns = session
            .history()
            .iter()
            .filter(|t| matches!(t, Turn::Assistant { .. }))
            .count();
        assert_eq!(assistant_turns, 2);
    }

    #[tokio::test]
    async fn recorded_tool_output_is_truncated_but_event_is_full() {
        let big = "z".repeat(40_000);
        let session = session_with(
            vec![
                tool_call_response(
                    "r1",
                    vec![ToolCall {
                        id: "tc_1".into(),
                        name: "bash".into(),
                        arguments: serde_json::json!({"command": "generate"}),
                    }],
                ),
                text_response("r2", "done"),
            ],
            MockEnv::with(&[("bash", &big)]),
            SessionConfig::default(),
        );
        let events = collect_events(&session);

        session.submit(&CancellationToken::new(), "go").await.unwrap();

        // History copy is truncated (bash cap is 30000).
        match &session.history()[2] {
            Turn::ToolResults { results, .. } => {
                assert!(results[0].content.len() < big.len());
                assert!(results[0].content.contains("[WARNING:"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
        // Event carries the full untruncated output.
        let full = events
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.kind == EventKind::ToolCallCompleted)
            .and_then(|e| e.data.get("output").cloned())
            .unwrap();
        assert_eq!(full.as_str().unwrap().len(), big.len());
    }

    #[tokio::test]
    async fn loop_detection_fires_and_injects_steering() {
        let repeated: Vec<Response> = (0..4)
            .map(|i| {
                tool_call_response(
                    &format!("r{i}"),
                    vec![ToolCall {
                        id: format!("tc_{i}"),
                        name: "read_file".into(),
                        arguments: serde_json::json!({"path": "same.rs"}),
                    }],
                )
            })
            .chain(std::iter::once(text_response("r_end", "broke out")))
            .collect();
        let session = session_with(
            repeated,
            MockEnv::with(&[("read_file", "same content")]),
            SessionConfig {
                loop_detection_window: 3,
                ..Default::default()
            },
        );
        let events = collect_events(&session);

        session.submit(&CancellationToken::new(), "go").await.unwrap();

        let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::LoopDetected));
        assert!(kinds.contains(&EventKind::SteeringApplied));
        assert!(session
            .history()
            .iter()
            .any(|t| matches!(t, Turn::Steering { content, .. } if content.contains("read_file"))));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_round() {
        let token = CancellationToken::new();
        token.cancel();
        let session = session_with(
            vec![text_response("r1", "never")],
            MockEnv::with(&[]),
            SessionConfig::default(),
        );
        let err = session.submit(&token, "hi").await.unwrap_err();
        assert!(matches!(err, OrreryError::Cancelled));
    }

    #[test]
    fn request_projection_includes_profile_and_history() {
        let session = session_with(vec![], MockEnv::with(&[]), SessionConfig::default());
        session.push_turn(Turn::User {
            content: "question".into(),
            timestamp: chrono::Utc::now(),
        });
        session.push_turn(Turn::Steering {
            content: "guidance".into(),
            timestamp: chrono::Utc::now(),
        });
        session.push_turn(Turn::Assistant {
            content: "checking".into(),
            tool_calls: vec![ToolCall {
                id: "tc".into(),
                name: "grep".into(),
                arguments: serde_json::json!({"pattern": "x"}),
            }],
            reasoning: None,
            usage: Usage::default(),
            response_id: "r".into(),
            timestamp: chrono::Utc::now(),
        });
        session.push_turn(Turn::ToolResults {
            results: vec![ToolResultEntry {
                tool_call_id: "tc".into(),
                tool_name: "grep".into(),
                content: "matches".into(),
                is_error: false,
            }],
            timestamp: chrono::Utc::now(),
        });

        let request = session.build_request();
        assert_eq!(request.model, "mock-model");
        assert!(!request.system_prompt.is_empty());
        assert!(!request.tools.is_empty());
        // user, steering-as-user, assistant, tool.
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[0].role, orrery_llm::Role::User);
        assert_eq!(request.messages[1].role, orrery_llm::Role::User);
        assert_eq!(request.messages[2].role, orrery_llm::Role::Assistant);
        assert_eq!(request.messages[3].role, orrery_llm::Role::Tool);
        assert_eq!(request.messages[3].tool_call_id.as_deref(), Some("tc"));
    }
}
