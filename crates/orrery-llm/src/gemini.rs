//! Google Gemini generateContent adapter.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use orrery_types::{LlmError, LlmErrorKind};

use crate::provider::{stream_via_complete, EventStream, ProviderAdapter};
use crate::{FinishReason, Request, Response, Role, ToolCall, ToolChoice, Usage};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Clone)]
pub struct GeminiAdapter {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiAdapter {
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

    /// Reads `GEMINI_API_KEY`, falling back to `GOOGLE_API_KEY`.
    pub fn from_env() -> Result<Self, LlmError> {
        let key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| {
                LlmError::new(
                    LlmErrorKind::Auth,
                    "gemini",
                    "GEMINI_API_KEY / GOOGLE_API_KEY not set",
                )
            })?;
        let mut adapter = Self::new(key);
        if let Ok(base) = std::env::var("GEMINI_BASE_URL") {
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
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let send = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send();

        let http_resp = tokio::select! {
            _ = token.cancelled() => {
                return Err(LlmError::new(
                    LlmErrorKind::Unknown,
                    "gemini",
                    "operation cancelled",
                ))
            }
            resp = send => resp.map_err(classify_transport)?,
        };

        let status = http_resp.status().as_u16();
        let text = http_resp.text().await.map_err(classify_transport)?;

        if !(200..300).contains(&status) {
            return Err(LlmError::from_status(status, text, "gemini"));
        }

        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            LlmError::new(
                LlmErrorKind::Unknown,
                "gemini",
                format!("malformed response body: {e}"),
            )
        })?;
        parse_body(&value, &request.model)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
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
    LlmError::new(kind, "gemini", err.to_string()).with_source(err)
}

// ---------------------------------------------------------------------------
// Request translation
// ---------------------------------------------------------------------------

fn build_body(request: &Request) -> serde_json::Value {
    let mut system = request.system_prompt.clone();
    let mut contents: Vec<serde_json::Value> = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&msg.content);
            }
            Role::User | Role::Developer => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{"text": msg.content}],
                }));
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(json!({"text": msg.content}));
                }
                for tc in &msg.tool_calls {
                    parts.push(json!({
                        "functionCall": {"name": tc.name, "args": tc.arguments}
                    }));
                }
                contents.push(json!({"role": "model", "parts": parts}));
            }
            Role::Tool => {
                // Gemini matches tool results by function name, not call id.
                let name = msg.name.clone().unwrap_or_default();
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": {"content": msg.content},
                        }
                    }],
                }));
            }
        }
    }

    let mut body = json!({"contents": contents});
    if !system.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    if !request.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": request
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }))
                .collect::<Vec<_>>()
        }]);
    }
    if let Some(choice) = &request.tool_choice {
        let mode = match choice {
            ToolChoice::Auto => json!({"mode": "AUTO"}),
            ToolChoice::None => json!({"mode": "NONE"}),
            ToolChoice::Required => json!({"mode": "ANY"}),
            ToolChoice::Function { name } => {
                json!({"mode": "ANY", "allowedFunctionNames": [name]})
            }
        };
        body["toolConfig"] = json!({"functionCallingConfig": mode});
    }

    let mut generation = serde_json::Map::new();
    if let Some(max) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(temp) = request.temperature {
        generation.insert("temperature".into(), json!(temp));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".into(), json!(top_p));
    }
    if !request.stop_sequences.is_empty() {
        generation.insert("stopSequences".into(), json!(request.stop_sequences));
    }
    if !generation.is_empty() {
        body["generationConfig"] = serde_json::Value::Object(generation);
    }
    for (key, value) in &request.provider_options {
        body[key] = value.clone();
    }
    body
}

// ---------------------------------------------------------------------------
// Response translation
// ---------------------------------------------------------------------------

fn parse_body(value: &serde_json::Value, model: &str) -> Result<Response, LlmError> {
    let candidate = &value["candidates"][0];
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    for (i, part) in candidate["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
        .enumerate()
    {
        if let Some(text) = part["text"].as_str() {
            content.push_str(text);
        } else if part["functionCall"].is_object() {
            let name = part["functionCall"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            tool_calls.push(ToolCall {
                // Gemini does not assign call ids; synthesize stable ones.
                id: format!("{name}-{i}"),
                name,
                arguments: part["functionCall"]["args"].clone(),
            });
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else {
        match candidate["finishReason"].as_str() {
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") | Some("RECITATION") => FinishReason::Error,
            _ => FinishReason::Stop,
        }
    };

    let meta = &value["usageMetadata"];
    let input_tokens = meta["promptTokenCount"].as_u64().unwrap_or(0);
    let output_tokens = meta["candidatesTokenCount"].as_u64().unwrap_or(0);
    let usage = Usage {
        input_tokens,
        output_tokens,
        total_tokens: meta["totalTokenCount"]
            .as_u64()
            .unwrap_or(input_tokens + output_tokens),
        reasoning_tokens: meta["thoughtsTokenCount"].as_u64(),
        cache_read_tokens: meta["cachedContentTokenCount"].as_u64(),
        cache_write_tokens: None,
    };

    Ok(Response {
        id: value["responseId"].as_str().unwrap_or_default().to_string(),
        model: model.to_string(),
        content,
        tool_calls,
        finish_reason,
        usage,
        reasoning: None,
        warnings: Vec::new(),
        rate_limit: None,
    })
}
