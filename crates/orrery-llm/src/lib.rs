//! Unified LLM client: a provider-agnostic request/response/stream contract
//! with middleware and retry-aware error classification.
//!
//! The client routes [`Request`]s to registered [`ProviderAdapter`]s
//! (Anthropic, OpenAI, Gemini) through an ordered middleware chain. Errors
//! cross the boundary as [`orrery_types::LlmError`] so callers can make
//! retry decisions without knowing which vendor produced them.

mod anthropic;
mod client;
mod gemini;
mod openai;
mod provider;
mod retry;
mod types;

pub use anthropic::AnthropicAdapter;
pub use client::{
    global, reset_global, set_global, Client, LoggingMiddleware, Middleware, Next,
    RetryMiddleware, StreamMiddleware, StreamNext,
};
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use provider::{replay_as_stream, stream_via_complete, DynProvider, EventStream, ProviderAdapter};
pub use retry::{retry, RetryPolicy};
pub use types::{
    ContentPart, FinishReason, Message, RateLimitInfo, ReasoningEffort, Request, Response,
    ResponseFormat, Role, StreamAccumulator, StreamEvent, ToolCall, ToolChoice, ToolDefinition,
    ToolResult, Usage, Warning,
};

/// Ambient transport timeout. Callers that need tighter deadlines wrap their
/// calls; the transport never extends a caller-provided deadline.
pub(crate) const DEFAULT_HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub(crate) fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
