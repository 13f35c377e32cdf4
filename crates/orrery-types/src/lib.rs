//! Shared types for the Orrery workflow engine.
//!
//! This crate is the bottom of the workspace: every other crate depends on
//! it. It provides:
//! - [`OrreryError`] — the unified error taxonomy
//! - [`LlmError`] — structured, retry-classified provider errors
//! - [`Context`] — thread-safe key-value store threaded through a run
//! - [`Outcome`] — the record a node handler returns
//! - [`Checkpoint`] — serializable snapshot for crash recovery
//! - [`events`] — the typed event bus shared by the engine and the agent

pub mod events;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LlmError — provider error taxonomy
// ---------------------------------------------------------------------------

/// Categorizes LLM provider errors for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    Auth,
    RateLimit,
    Server,
    Network,
    BadRequest,
    Timeout,
    Unknown,
}

impl LlmErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorKind::Auth => "auth",
            LlmErrorKind::RateLimit => "rate_limit",
            LlmErrorKind::Server => "server",
            LlmErrorKind::Network => "network",
            LlmErrorKind::BadRequest => "bad_request",
            LlmErrorKind::Timeout => "timeout",
            LlmErrorKind::Unknown => "unknown",
        }
    }
}

/// Structured error from an LLM provider boundary.
#[derive(Debug)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub provider: String,
    pub retry_after: Option<Duration>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            provider: provider.into(),
            retry_after: None,
            source: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Map an HTTP status code to an error kind: 401/403 auth, 429 rate
    /// limit, 400/422 bad request, 5xx server, anything else unknown.
    pub fn from_status(status: u16, body: impl Into<String>, provider: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => LlmErrorKind::Auth,
            429 => LlmErrorKind::RateLimit,
            400 | 422 => LlmErrorKind::BadRequest,
            s if s >= 500 => LlmErrorKind::Server,
            _ => LlmErrorKind::Unknown,
        };
        Self::new(kind, provider, body).with_status(status)
    }

    /// Transient errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimit
                | LlmErrorKind::Server
                | LlmErrorKind::Network
                | LlmErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "[{}] {} (HTTP {}): {}",
                self.provider,
                self.kind.as_str(),
                status,
                self.message
            ),
            None => write!(
                f,
                "[{}] {}: {}",
                self.provider,
                self.kind.as_str(),
                self.message
            ),
        }
    }
}

impl std::error::Error for LlmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// OrreryError — unified error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrreryError {
    #[error("parse error at line {line}, col {col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
        snippet: Option<String>,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("handler '{handler}' failed on node '{node}': {message}")]
    Handler {
        handler: String,
        node: String,
        message: String,
    },

    #[error("goal gate '{node}' unsatisfied and no retry target")]
    GoalGateUnsatisfied { node: String },

    #[error("tool '{tool}' error: {message}")]
    Tool { tool: String, message: String },

    #[error("command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    #[error("turn limit reached: {turns} turns")]
    TurnLimitReached { turns: usize },

    #[error("session is not accepting input (state: {state})")]
    SessionBusy { state: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl OrreryError {
    /// Transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrreryError::Llm(e) => e.is_retryable(),
            OrreryError::CommandTimeout { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrreryError>;

// ---------------------------------------------------------------------------
// StageStatus
// ---------------------------------------------------------------------------

/// Outcome status of a pipeline node or handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Skipped,
}

impl StageStatus {
    /// Lowercase form used by condition expressions and the context.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::PartialSuccess => "partial_success",
            StageStatus::Retry => "retry",
            StageStatus::Fail => "fail",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Whether this status satisfies a goal gate.
    pub fn is_passing(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::PartialSuccess)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The record a handler returns to drive edge selection and context updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_next_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context_updates: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Outcome {
    pub fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: HashMap::new(),
            notes: String::new(),
            failure_reason: None,
        }
    }

    pub fn success(notes: impl Into<String>) -> Self {
        Self {
            notes: notes.into(),
            ..Self::with_status(StageStatus::Success)
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Fail)
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::with_status(StageStatus::Retry)
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContextInner {
    values: HashMap<String, serde_json::Value>,
    logs: Vec<String>,
}

/// Thread-safe key-value store plus an append-only log, shared across a run.
///
/// `clone()` yields another handle to the **same** state. Use
/// [`clone_isolated`](Context::clone_isolated) for parallel branch isolation.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// String accessor; empty string when the key is absent or not a string.
    pub async fn get_string(&self, key: &str) -> String {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default()
    }

    pub async fn append_log(&self, entry: impl Into<String>) {
        self.inner.write().await.logs.push(entry.into());
    }

    pub async fn logs(&self) -> Vec<String> {
        self.inner.read().await.logs.clone()
    }

    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.values.clone()
    }

    /// Deep copy, fully independent of the original. Child mutations are
    /// invisible to the parent; used for parallel branch isolation.
    pub async fn clone_isolated(&self) -> Context {
        let guard = self.inner.read().await;
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }

    /// Merge `updates` into the context; keys not present are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        if updates.is_empty() {
            return;
        }
        self.inner.write().await.values.extend(updates);
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Serializable snapshot of execution state, overwritten after each node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub current_node: String,
    pub completed_nodes: Vec<String>,
    pub node_retries: HashMap<String, usize>,
    #[serde(rename = "context")]
    pub context_values: HashMap<String, serde_json::Value>,
    pub logs: Vec<String>,
}

impl Checkpoint {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

// ---------------------------------------------------------------------------
// FidelityMode
// ---------------------------------------------------------------------------

/// How much history to carry into an LLM request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FidelityMode {
    Full,
    Truncate,
    Compact,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
}

impl std::str::FromStr for FidelityMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "full" => Ok(FidelityMode::Full),
            "truncate" => Ok(FidelityMode::Truncate),
            "compact" => Ok(FidelityMode::Compact),
            "summary" | "summary:medium" | "summary:med" => Ok(FidelityMode::SummaryMedium),
            "summary:low" => Ok(FidelityMode::SummaryLow),
            "summary:high" => Ok(FidelityMode::SummaryHigh),
            other => Err(format!("unknown fidelity mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // --- LlmError ---

    #[test]
    fn classifier_maps_status_codes() {
        assert_eq!(LlmError::from_status(401, "", "x").kind, LlmErrorKind::Auth);
        assert_eq!(LlmError::from_status(403, "", "x").kind, LlmErrorKind::Auth);
        assert_eq!(
            LlmError::from_status(429, "", "x").kind,
            LlmErrorKind::RateLimit
        );
        assert_eq!(
            LlmError::from_status(400, "", "x").kind,
            LlmErrorKind::BadRequest
        );
        assert_eq!(
            LlmError::from_status(422, "", "x").kind,
            LlmErrorKind::BadRequest
        );
        assert_eq!(
            LlmError::from_status(500, "", "x").kind,
            LlmErrorKind::Server
        );
        assert_eq!(
            LlmError::from_status(503, "", "x").kind,
            LlmErrorKind::Server
        );
        assert_eq!(
            LlmError::from_status(418, "", "x").kind,
            LlmErrorKind::Unknown
        );
    }

    #[test]
    fn retryable_kinds() {
        for kind in [
            LlmErrorKind::RateLimit,
            LlmErrorKind::Server,
            LlmErrorKind::Network,
            LlmErrorKind::Timeout,
        ] {
            assert!(LlmError::new(kind, "p", "m").is_retryable(), "{kind:?}");
        }
        for kind in [
            LlmErrorKind::Auth,
            LlmErrorKind::BadRequest,
            LlmErrorKind::Unknown,
        ] {
            assert!(!LlmError::new(kind, "p", "m").is_retryable(), "{kind:?}");
        }
    }

    #[test]
    fn llm_error_display_with_status() {
        let err = LlmError::from_status(429, "slow down", "anthropic");
        assert_eq!(
            err.to_string(),
            "[anthropic] rate_limit (HTTP 429): slow down"
        );
    }

    #[test]
    fn llm_error_display_without_status() {
        let err = LlmError::new(LlmErrorKind::Network, "openai", "connection reset");
        assert_eq!(err.to_string(), "[openai] network: connection reset");
    }

    #[test]
    fn orrery_error_wraps_llm_error() {
        let err: OrreryError = LlmError::new(LlmErrorKind::Server, "p", "boom").into();
        assert!(err.is_retryable());
        assert!(matches!(err, OrreryError::Llm(_)));
    }

    #[test]
    fn command_timeout_is_retryable() {
        assert!(OrreryError::CommandTimeout { timeout_ms: 500 }.is_retryable());
        assert!(!OrreryError::Validation("bad".into()).is_retryable());
    }

    // --- StageStatus ---

    #[test]
    fn stage_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&StageStatus::PartialSuccess).unwrap(),
            "\"partial_success\""
        );
        let back: StageStatus = serde_json::from_str("\"retry\"").unwrap();
        assert_eq!(back, StageStatus::Retry);
    }

    #[test]
    fn stage_status_passing() {
        assert!(StageStatus::Success.is_passing());
        assert!(StageStatus::PartialSuccess.is_passing());
        assert!(!StageStatus::Retry.is_passing());
        assert!(!StageStatus::Fail.is_passing());
        assert!(!StageStatus::Skipped.is_passing());
    }

    // --- Outcome ---

    #[test]
    fn outcome_constructors() {
        let ok = Outcome::success("done");
        assert_eq!(ok.status, StageStatus::Success);
        assert_eq!(ok.notes, "done");
        assert!(ok.failure_reason.is_none());

        let bad = Outcome::fail("broken");
        assert_eq!(bad.status, StageStatus::Fail);
        assert_eq!(bad.failure_reason.as_deref(), Some("broken"));

        let again = Outcome::retry("not yet");
        assert_eq!(again.status, StageStatus::Retry);
    }

    // --- Context ---

    #[tokio::test]
    async fn context_set_get_round_trip() {
        let ctx = Context::new();
        ctx.set("key", serde_json::json!("value")).await;
        assert_eq!(ctx.get("key").await, Some(serde_json::json!("value")));
        assert_eq!(ctx.get_string("key").await, "value");
        assert_eq!(ctx.get_string("missing").await, "");
    }

    #[tokio::test]
    async fn context_clone_shares_state() {
        let ctx = Context::new();
        let alias = ctx.clone();
        alias.set("a", serde_json::json!(1)).await;
        assert_eq!(ctx.get("a").await, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn context_clone_isolated_is_independent() {
        let ctx = Context::new();
        ctx.set("a", serde_json::json!(1)).await;

        let branch = ctx.clone_isolated().await;
        branch.set("a", serde_json::json!(2)).await;
        branch.set("b", serde_json::json!(3)).await;

        assert_eq!(ctx.get("a").await, Some(serde_json::json!(1)));
        assert_eq!(ctx.get("b").await, None);
    }

    #[tokio::test]
    async fn context_apply_updates_merges() {
        let ctx = Context::new();
        ctx.set("keep", serde_json::json!("old")).await;

        let mut updates = HashMap::new();
        updates.insert("added".to_string(), serde_json::json!("new"));
        ctx.apply_updates(updates).await;

        assert_eq!(ctx.get("keep").await, Some(serde_json::json!("old")));
        assert_eq!(ctx.get("added").await, Some(serde_json::json!("new")));
    }

    #[tokio::test]
    async fn context_logs_append_in_order() {
        let ctx = Context::new();
        ctx.append_log("first").await;
        ctx.append_log("second").await;
        assert_eq!(ctx.logs().await, vec!["first", "second"]);
    }

    // --- Checkpoint ---

    #[test]
    fn checkpoint_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let cp = Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: "b".into(),
            completed_nodes: vec!["start".into(), "a".into()],
            node_retries: HashMap::from([("a".to_string(), 2)]),
            context_values: HashMap::from([("k".to_string(), serde_json::json!("v"))]),
            logs: vec!["began".into()],
        };
        cp.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.current_node, cp.current_node);
        assert_eq!(loaded.completed_nodes, cp.completed_nodes);
        assert_eq!(loaded.node_retries, cp.node_retries);
        assert_eq!(loaded.context_values, cp.context_values);
        assert_eq!(loaded.logs, cp.logs);
        assert_eq!(loaded.timestamp, cp.timestamp);
    }

    // --- FidelityMode ---

    #[test]
    fn fidelity_parses_summary_levels() {
        assert_eq!("full".parse::<FidelityMode>().unwrap(), FidelityMode::Full);
        assert_eq!(
            "summary:low".parse::<FidelityMode>().unwrap(),
            FidelityMode::SummaryLow
        );
        assert_eq!(
            "summary".parse::<FidelityMode>().unwrap(),
            FidelityMode::SummaryMedium
        );
        assert!("bogus".parse::<FidelityMode>().is_err());
    }
}
