//! OpenAI Chat Completions adapter.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use orrery_types::{LlmError, LlmErrorKind};

use crate::provider::{stream_via_complete, EventStream, ProviderAdapter};
use crate::{
    FinishReason, Request, Response, ResponseFormat, Role, ToolCall, ToolChoice, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Clone)]
pub struct OpenAiAdapter {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    org_id: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: crate::default_http_client(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            org_id: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn from_env() -> Result<Self, LlmError> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            LlmError::new(LlmErrorKind::Auth, "openai", "OPENAI_API_KEY not set")
        })?;
        let mut adapter = Self::new(key);
        if let Ok(base) = std::env::var("OPENAI_BASE_URL") {
            adapter.base_url = base;
        }
        adapter.org_id = std::env::var("OPENAI_ORG_ID").ok();
        Ok(adapter)
    }

    async fn complete_inner(
        &self,
        token: &CancellationToken,
        request: &Request,
    ) -> Result<Response, LlmError> {
        let body = build_body(request);
        let mut builder = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        if let Some(org) = &self.org_id {
            builder = builder.header("OpenAI-Organization", org);
        }

        let http_resp = tokio::select! {
            _ = token.cancelled() => {
                return Err(LlmError::new(
                    LlmErrorKind::Unknown,
                    "openai",
                    "operation cancelled",
                ))
            }
            resp = builder.send() => resp.map_err(classify_transport)?,
        };

        let status = http_resp.status().as_u16();
        let retry_after = http_resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        let text = http_resp.text().await.map_err(classify_transport)?;

        if !(200..300).contains(&status) {
            let mut err = LlmError::from_status(status, text, "openai");
            err.retry_after = retry_after;
            return Err(err);
        }

        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            LlmError::new(
                LlmErrorKind::Unknown,
                "openai",
                format!("malformed response body: {e}"),
            )
        })?;
        parse_body(&value)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        token: &CancellationToken,
        request: &Request,
    ) -> Result<Response, LlmError> {
        self.complete_inner(token, request).await
    }

    fn stream(&self, token: &CancellationToken, request: &Request) -> EventStream {
        let this = self.clone();
        let token = token.clone();
        let request = request.clone();
        stream_via_complete(async move { this.complete_inner(&token, &request).await })
    }
}

fn classify_transport(err: reqwest::Error) -> LlmError {
    let kind = if err.is_timeout() {
        LlmErrorKind::Timeout
    } else {
        LlmErrorKind::Network
    };
    LlmError::new(kind, "openai", err.to_string()).with_source(err)
}

// ---------------------------------------------------------------------------
// Request translation
// ---------------------------------------------------------------------------

fn build_body(request: &Request) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();
    if !request.system_prompt.is_empty() {
        messages.push(json!({"role": "system", "content": request.system_prompt}));
    }
    for msg in &request.messages {
        match msg.role {
            Role::System => {
                messages.push(json!({"role": "system", "content": msg.content}));
            }
            Role::Developer => {
                messages.push(json!({"role": "developer", "content": msg.content}));
            }
            Role::User => {
                messages.push(json!({"role": "user", "content": msg.content}));
            }
            Role::Assistant => {
                let mut m = json!({"role": "assistant"});
                if !msg.content.is_empty() {
                    m["content"] = json!(msg.content);
                }
                if !msg.tool_calls.is_empty() {
                    m["tool_calls"] = json!(msg
                        .tool_calls
                        .iter()
                        .map(|tc| json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        }))
                        .collect::<Vec<_>>());
                }
                messages.push(m);
            }
            Role::Tool => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                }));
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = json!(request
            .tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            }))
            .collect::<Vec<_>>());
    }
    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Function { name } => {
                json!({"type": "function", "function": {"name": name}})
            }
        };
    }
    if let Some(max) = request.max_tokens {
        body["max_completion_tokens"] = json!(max);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop"] = json!(request.stop_sequences);
    }
    if let Some(effort) = request.reasoning_effort {
        body["reasoning_effort"] = json!(effort.as_str());
    }
    match &request.response_format {
        Some(ResponseFormat::JsonObject) => {
            body["response_format"] = json!({"type": "json_object"});
        }
        Some(ResponseFormat::JsonSchema { schema }) => {
            body["response_format"] = json!({"type": "json_schema", "json_schema": schema});
        }
        Some(ResponseFormat::Text) | None => {}
    }
    for (key, value) in &request.provider_options {
        body[key] = value.clone();
    }
    body
}

// ---------------------------------------------------------------------------
// Response translation
// ---------------------------------------------------------------------------

fn parse_body(value: &serde_json::Value) -> Result<Response, LlmError> {
    let choice = &value["choices"][0];
    let message = &choice["message"];

    let tool_calls = message["tool_calls"]
        .as_array()
        .into_iter()
        .flatten()
        .map(|tc| {
            let raw_args = tc["function"]["arguments"].as_str().unwrap_or("{}");
            ToolCall {
                id: tc["id"].as_str().unwrap_or_default().to_string(),
                name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: serde_json::from_str(raw_args)
                    .unwrap_or(serde_json::Value::String(raw_args.to_string())),
            }
        })
        .collect::<Vec<_>>();

    let finish_reason = match choice["finish_reason"].as_str() {
        Some("length") => FinishReason::Length,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::Error,
        _ => FinishReason::Stop,
    };

    let usage_val = &value["usage"];
    let usage = Usage {
        input_tokens: usage_val["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage_val["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage_val["total_tokens"].as_u64().unwrap_or(0),
        reasoning_tokens: usage_val["completion_tokens_details"]["reasoning_tokens"].as_u64(),
        cache_read_tokens: usage_val["prompt_tokens_details"]["cached_tokens"].as_u64(),
        cache_write_tokens: None,
    };

    Ok(Response {
        id: value["id"].as_str().unwrap_or_default().to_string(),
        model: value["model"].as_str().unwrap_or_default().to_string(),
        content: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        finish_reason,
        usage,
        reasoning: None,
        warnings: Vec::new(),
        rate_limit: None,
    })
}
