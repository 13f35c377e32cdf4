//! Anthropic Messages API adapter.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use orrery_types::{LlmError, LlmErrorKind};

use crate::provider::{stream_via_complete, EventStream, ProviderAdapter};
use crate::{
    ContentPart, FinishReason, Message, RateLimitInfo, Request, Response, Role, ToolCall,
    ToolChoice, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone)]
pub struct AnthropicAdapter {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: crate::default_http_client(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn from_env() -> Result<Self, LlmError> {
        let key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            LlmError::new(LlmErrorKind::Auth, "anthropic", "ANTHROPIC_API_KEY not set")
        })?;
        let mut adapter = Self::new(key);
        if let Ok(base) = std::env::var("ANTHROPIC_BASE_URL") {
            adapter.base_url = base;
        }
        Ok(adapter)
    }

    async fn complete_inner(
        &self,
        token: &CancellationToken,
        request: &Request,
    ) -> Result<Response, LlmError> {
        let body = build_body(request);
        let send = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send();

        let http_resp = tokio::select! {
            _ = token.cancelled() => {
                return Err(LlmError::new(
                    LlmErrorKind::Unknown,
                    "anthropic",
                    "operation cancelled",
                ))
            }
            resp = send => resp.map_err(classify_transport)?,
        };

        let status = http_resp.status().as_u16();
        let rate_limit = read_rate_limit(http_resp.headers());
        let retry_after = read_retry_after(http_resp.headers());
        let text = http_resp.text().await.map_err(classify_transport)?;

        if !(200..300).contains(&status) {
            let mut err = LlmError::from_status(status, text, "anthropic");
            err.retry_after = retry_after;
            return Err(err);
        }

        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            LlmError::new(
                LlmErrorKind::Unknown,
                "anthropic",
                format!("malformed response body: {e}"),
            )
        })?;
        let mut resp = parse_body(&value)?;
        resp.rate_limit = rate_limit;
        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
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
    LlmError::new(kind, "anthropic", err.to_string()).with_source(err)
}

fn read_retry_after(headers: &reqwest::header::HeaderMap) -> Option<std::time::Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(std::time::Duration::from_secs)
}

fn read_rate_limit(headers: &reqwest::header::HeaderMap) -> Option<RateLimitInfo> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
    };
    let info = RateLimitInfo {
        requests_remaining: get("anthropic-ratelimit-requests-remaining"),
        requests_limit: get("anthropic-ratelimit-requests-limit"),
        tokens_remaining: get("anthropic-ratelimit-tokens-remaining"),
        tokens_limit: get("anthropic-ratelimit-tokens-limit"),
    };
    if info.requests_remaining.is_none() && info.tokens_remaining.is_none() {
        None
    } else {
        Some(info)
    }
}

// ---------------------------------------------------------------------------
// Request translation
// ---------------------------------------------------------------------------

fn build_body(request: &Request) -> serde_json::Value {
    let mut system = request.system_prompt.clone();
    for msg in request.messages.iter().filter(|m| m.role == Role::System) {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&message_text(msg));
    }

    let mut messages: Vec<serde_json::Value> = Vec::new();
    for msg in &request.messages {
        match msg.role {
            Role::System => {}
            Role::User | Role::Developer => {
                messages.push(json!({ "role": "user", "content": content_blocks(msg) }));
            }
            Role::Assistant => {
                let mut blocks = content_blocks(msg);
                for tc in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                });
                // Fold consecutive tool results into one user message.
                if let Some(last) = messages.last_mut() {
                    if last["role"] == "user" {
                        if let Some(arr) = last["content"].as_array_mut() {
                            arr.push(block);
                            continue;
                        }
                    }
                }
                messages.push(json!({ "role": "user", "content": [block] }));
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = json!(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = json!(request
            .tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            }))
            .collect::<Vec<_>>());
    }
    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::None => json!({"type": "none"}),
            ToolChoice::Required => json!({"type": "any"}),
            ToolChoice::Function { name } => json!({"type": "tool", "name": name}),
        };
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(request.stop_sequences);
    }
    for (key, value) in &request.provider_options {
        body[key] = value.clone();
    }
    body
}

fn message_text(msg: &Message) -> String {
    if !msg.content.is_empty() {
        return msg.content.clone();
    }
    msg.parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn content_blocks(msg: &Message) -> Vec<serde_json::Value> {
    let mut blocks = Vec::new();
    if !msg.content.is_empty() {
        blocks.push(json!({"type": "text", "text": msg.content}));
    }
    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => blocks.push(json!({"type": "text", "text": text})),
            ContentPart::Image {
                url, data, media_type,
            } => {
                if let Some(url) = url {
                    blocks.push(json!({
                        "type": "image",
                        "source": {"type": "url", "url": url},
                    }));
                } else if let Some(data) = data {
                    use base64::Engine as _;
                    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                    let mut block = json!({
                        "type": "image",
                        "source": {"type": "base64", "data": encoded},
                    });
                    if let Some(mt) = media_type {
                        block["source"]["media_type"] = json!(mt);
                    }
                    blocks.push(block);
                }
            }
        }
    }
    blocks
}

// ---------------------------------------------------------------------------
// Response translation
// ---------------------------------------------------------------------------

fn parse_body(value: &serde_json::Value) -> Result<Response, LlmError> {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in value["content"].as_array().into_iter().flatten() {
        match block["type"].as_str() {
            Some("text") => content.push_str(block["text"].as_str().unwrap_or_default()),
            Some("thinking") => {
                reasoning.push_str(block["thinking"].as_str().unwrap_or_default())
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    let finish_reason = match value["stop_reason"].as_str() {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    let usage_val = &value["usage"];
    let input_tokens = usage_val["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage_val["output_tokens"].as_u64().unwrap_or(0);
    let usage = Usage {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
        reasoning_tokens: None,
        cache_read_tokens: usage_val["cache_read_input_tokens"].as_u64(),
        cache_write_tokens: usage_val["cache_creation_input_tokens"].as_u64(),
    };

    Ok(Response {
        id: value["id"].as_str().unwrap_or_default().to_string(),
        model: value["model"].as_str().unwrap_or_default().to_string(),
        content,
        tool_calls,
        finish_reason,
        usage,
        reasoning: if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        },
        warnings: Vec::new(),
        rate_limit: None,
    })
}
