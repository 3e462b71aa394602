//! Invokes a configurable ordered list of model providers with fallback and
//! cost accounting.
//!
//! The wire format is OpenAI-compatible chat-completions (the lowest common
//! denominator across local and hosted providers); provider selection is by
//! a model-id string and credentials come from a named environment
//! variable per provider entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ── Chat message types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub model_id: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Per-call overrides layered on top of a provider entry's defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOverrides {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
}

/// `{model, tokens_in, tokens_out, cost, duration}` delivered to registered
/// cost callbacks after a successful call, when the provider exposes usage.
#[derive(Debug, Clone)]
pub struct CostEvent {
    pub model_id: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub duration: Duration,
}

/// One entry in the provider fallback list. Order is the fallback sequence.
#[derive(Debug, Clone)]
pub struct LlmProviderEntry {
    pub model_id: String,
    pub base_url: String,
    pub credentials_env: Option<String>,
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
    pub temperature_default: Option<f32>,
    /// Approximate USD cost per 1k (input, output) tokens, for cost callbacks.
    pub cost_per_1k: Option<(f64, f64)>,
}

impl LlmProviderEntry {
    pub fn new(model_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            base_url: base_url.into(),
            credentials_env: None,
            timeout: Duration::from_secs(60),
            max_tokens: None,
            temperature_default: None,
            cost_per_1k: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error calling {model_id}: {source}")]
    Network { model_id: String, source: reqwest::Error },
    #[error("{model_id} timed out")]
    Timeout { model_id: String },
    #[error("{model_id} returned an authentication or client error: {detail}")]
    AuthOrClient { model_id: String, detail: String },
    #[error("{model_id} reported context length exceeded")]
    ContextLengthExceeded { model_id: String },
    #[error("{model_id} is rate-limited")]
    RateLimited { model_id: String },
    #[error("malformed response from {model_id}: {detail}")]
    MalformedResponse { model_id: String, detail: String },
    #[error("all providers in the fallback chain failed; last cause: {last_cause}")]
    AllCandidatesExhausted { last_cause: String, attempted: usize },
}

/// How a single provider failure should be treated by the router.
enum FailureAction {
    TryNext,
    BriefBackoffThenNext,
}

impl LlmError {
    fn action(&self) -> FailureAction {
        match self {
            LlmError::RateLimited { .. } => FailureAction::BriefBackoffThenNext,
            _ => FailureAction::TryNext,
        }
    }
}

/// A uniform adapter over an OpenAI-compatible chat-completions endpoint.
/// One concrete implementation suffices because every candidate in the
/// fallback list speaks the same wire shape; what varies per call is the
/// entry (base URL, model id, credentials).
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(
        &self,
        entry: &LlmProviderEntry,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        overrides: &CallOverrides,
    ) -> Result<ChatResponse, LlmError>;

    async fn chat_stream(
        &self,
        entry: &LlmProviderEntry,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        overrides: &CallOverrides,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError>;
}

/// Invokes a configured ordered list of [`LlmProviderEntry`] with fallback.
pub struct LlmRouter {
    provider: Arc<dyn ChatProvider>,
    providers: Vec<LlmProviderEntry>,
    cost_callbacks: Vec<Arc<dyn Fn(CostEvent) + Send + Sync>>,
}

impl LlmRouter {
    pub fn new(provider: Arc<dyn ChatProvider>, providers: Vec<LlmProviderEntry>) -> Self {
        Self { provider, providers, cost_callbacks: Vec::new() }
    }

    pub fn on_cost(&mut self, callback: Arc<dyn Fn(CostEvent) + Send + Sync>) {
        self.cost_callbacks.push(callback);
    }

    fn candidates(&self, model_override: Option<&str>) -> Vec<LlmProviderEntry> {
        match model_override {
            Some(model_id) => self
                .providers
                .iter()
                .filter(|entry| entry.model_id == model_id)
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
                .chain(self.providers.iter().filter(|e| e.model_id != model_id).cloned())
                .collect(),
            None => self.providers.clone(),
        }
    }

    fn fire_cost_callbacks(&self, entry: &LlmProviderEntry, usage: Usage, duration: Duration) {
        let cost = entry
            .cost_per_1k
            .map(|(in_rate, out_rate)| {
                (usage.tokens_in as f64 / 1000.0) * in_rate + (usage.tokens_out as f64 / 1000.0) * out_rate
            })
            .unwrap_or(0.0);
        let event = CostEvent {
            model_id: entry.model_id.clone(),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost,
            duration,
        };
        for cb in &self.cost_callbacks {
            cb(event.clone_for_callback());
        }
    }

    /// Non-streaming chat with ordered fallback.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        model_override: Option<&str>,
        overrides: CallOverrides,
    ) -> Result<ChatResponse, LlmError> {
        let candidates = self.candidates(model_override);
        let mut last_cause = String::from("no providers configured");
        let mut attempted = 0;

        for entry in &candidates {
            attempted += 1;
            let started = std::time::Instant::now();
            match self.provider.chat(entry, messages, tools, &overrides).await {
                Ok(response) => {
                    if let Some(usage) = response.usage {
                        self.fire_cost_callbacks(entry, usage, started.elapsed());
                    }
                    return Ok(response);
                }
                Err(err) => {
                    debug!(model_id = %entry.model_id, error = %err, "provider attempt failed");
                    if matches!(err.action(), FailureAction::BriefBackoffThenNext) {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    last_cause = err.to_string();
                }
            }
        }

        Err(LlmError::AllCandidatesExhausted { last_cause, attempted })
    }

    /// Streaming chat with ordered fallback. Tokens from a failed candidate
    /// are never forwarded to `tx`; only the candidate that ultimately
    /// succeeds streams.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        model_override: Option<&str>,
        overrides: CallOverrides,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError> {
        let candidates = self.candidates(model_override);
        let mut last_cause = String::from("no providers configured");
        let mut attempted = 0;

        for entry in &candidates {
            attempted += 1;
            let started = std::time::Instant::now();
            match self
                .provider
                .chat_stream(entry, messages, tools, &overrides, tx.clone())
                .await
            {
                Ok(response) => {
                    if let Some(usage) = response.usage {
                        self.fire_cost_callbacks(entry, usage, started.elapsed());
                    }
                    return Ok(response);
                }
                Err(err) => {
                    warn!(model_id = %entry.model_id, error = %err, "streaming provider attempt failed");
                    if matches!(err.action(), FailureAction::BriefBackoffThenNext) {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    last_cause = err.to_string();
                }
            }
        }

        Err(LlmError::AllCandidatesExhausted { last_cause, attempted })
    }
}

impl CostEvent {
    fn clone_for_callback(&self) -> CostEvent {
        CostEvent {
            model_id: self.model_id.clone(),
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            cost: self.cost,
            duration: self.duration,
        }
    }
}

/// The one concrete [`ChatProvider`]: any OpenAI-compatible
/// `/chat/completions` endpoint (local runtimes like llama.cpp/Ollama's
/// OpenAI-shim, or hosted routers).
#[derive(Debug, Clone, Default)]
pub struct HttpChatProvider {
    client: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    fn bearer(entry: &LlmProviderEntry) -> Option<String> {
        entry
            .credentials_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|s| !s.trim().is_empty())
    }

    fn build_payload(
        entry: &LlmProviderEntry,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        overrides: &CallOverrides,
        stream: bool,
    ) -> serde_json::Value {
        let mut payload = json!({
            "model": entry.model_id,
            "messages": messages_to_openai(messages),
            "stream": stream,
        });
        if let Some(temp) = overrides.temperature.or(entry.temperature_default) {
            payload["temperature"] = json!(temp);
        }
        if let Some(max_tokens) = overrides.max_tokens.or(entry.max_tokens) {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(tools_val) = tools {
            payload["tools"] = tools_val.clone();
        }
        payload
    }

    fn classify_status(entry: &LlmProviderEntry, status: reqwest::StatusCode, body: &serde_json::Value) -> LlmError {
        if status.as_u16() == 429 {
            return LlmError::RateLimited { model_id: entry.model_id.clone() };
        }
        if status.is_client_error() {
            let detail = body.to_string();
            if detail.to_lowercase().contains("context") && detail.to_lowercase().contains("length") {
                return LlmError::ContextLengthExceeded { model_id: entry.model_id.clone() };
            }
            return LlmError::AuthOrClient { model_id: entry.model_id.clone(), detail };
        }
        LlmError::MalformedResponse { model_id: entry.model_id.clone(), detail: format!("status {status}: {body}") }
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(
        &self,
        entry: &LlmProviderEntry,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        overrides: &CallOverrides,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", entry.base_url.trim_end_matches('/'));
        let payload = Self::build_payload(entry, messages, tools, overrides, false);
        let timeout = overrides.timeout.unwrap_or(entry.timeout);

        let mut request = self.client.post(&url).timeout(timeout).json(&payload);
        if let Some(token) = Self::bearer(entry) {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|source| {
            if source.is_timeout() {
                LlmError::Timeout { model_id: entry.model_id.clone() }
            } else {
                LlmError::Network { model_id: entry.model_id.clone(), source }
            }
        })?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|source| LlmError::Network { model_id: entry.model_id.clone(), source })?;
        if !status.is_success() {
            return Err(Self::classify_status(entry, status, &body));
        }

        parse_openai_chat_response(entry, &body)
    }

    async fn chat_stream(
        &self,
        entry: &LlmProviderEntry,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
        overrides: &CallOverrides,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", entry.base_url.trim_end_matches('/'));
        let payload = Self::build_payload(entry, messages, tools, overrides, true);
        let timeout = overrides.timeout.unwrap_or(entry.timeout);

        let mut request = self.client.post(&url).timeout(timeout).json(&payload);
        if let Some(token) = Self::bearer(entry) {
            request = request.bearer_auth(token);
        }

        let mut response = request.send().await.map_err(|source| {
            if source.is_timeout() {
                LlmError::Timeout { model_id: entry.model_id.clone() }
            } else {
                LlmError::Network { model_id: entry.model_id.clone(), source }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response
                .json()
                .await
                .unwrap_or(serde_json::Value::Null);
            return Err(Self::classify_status(entry, status, &body));
        }

        let mut full_response = String::new();
        let mut tool_call_map: HashMap<usize, (String, String, String)> = HashMap::new();
        let mut finish_reason = "stop".to_string();

        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|source| LlmError::Network { model_id: entry.model_id.clone(), source })?;
            let Some(chunk) = chunk else { break };
            let chunk_str = String::from_utf8_lossy(&chunk);
            for line in chunk_str.lines() {
                let line = line.trim();
                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                let Some(choice) = json.get("choices").and_then(|c| c.get(0)) else { continue };

                if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                    finish_reason = fr.to_string();
                }
                let Some(delta) = choice.get("delta") else { continue };

                if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                    if !content.is_empty() {
                        full_response.push_str(content);
                        let _ = tx.send(content.to_string()).await;
                    }
                }

                if let Some(tcs) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for tc in tcs {
                        let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                        let entry_slot = tool_call_map.entry(idx).or_insert_with(|| (String::new(), String::new(), String::new()));
                        if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                            entry_slot.0 = id.to_string();
                        }
                        if let Some(func) = tc.get("function") {
                            if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                                entry_slot.1 = name.to_string();
                            }
                            if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                                entry_slot.2.push_str(args);
                            }
                        }
                    }
                }
            }
        }

        let mut tool_calls = Vec::new();
        if !tool_call_map.is_empty() {
            let mut indices: Vec<usize> = tool_call_map.keys().copied().collect();
            indices.sort();
            for idx in indices {
                let (id, name, args_str) = &tool_call_map[&idx];
                let arguments = serde_json::from_str(args_str).unwrap_or(json!({}));
                tool_calls.push(ToolCall {
                    id: if id.is_empty() { format!("call_{idx}") } else { id.clone() },
                    r#type: "function".to_string(),
                    function: ToolCallFunction { name: name.clone(), arguments },
                });
            }
            if finish_reason == "stop" {
                finish_reason = "tool_calls".to_string();
            }
        }

        Ok(ChatResponse {
            model_id: entry.model_id.clone(),
            content: full_response,
            tool_calls,
            finish_reason,
            usage: None,
        })
    }
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut msg = json!({ "role": role });
            msg["content"] = m.content.as_ref().map(|c| json!(c)).unwrap_or(json!(null));
            if !m.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.function.name,
                                "arguments": if tc.function.arguments.is_string() {
                                    tc.function.arguments.clone()
                                } else {
                                    json!(tc.function.arguments.to_string())
                                }
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn parse_openai_chat_response(entry: &LlmProviderEntry, body: &serde_json::Value) -> Result<ChatResponse, LlmError> {
    let choice = body.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));

    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let id = tc.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .map(|v| {
                            if let Some(s) = v.as_str() {
                                serde_json::from_str(s).unwrap_or(json!({}))
                            } else {
                                v.clone()
                            }
                        })
                        .unwrap_or(json!({}));
                    Some(ToolCall {
                        id: if id.is_empty() { format!("call_{i}") } else { id },
                        r#type: "function".to_string(),
                        function: ToolCallFunction { name, arguments },
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let usage = body.get("usage").map(|u| Usage {
        tokens_in: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        tokens_out: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    });

    Ok(ChatResponse {
        model_id: entry.model_id.clone(),
        content,
        tool_calls,
        finish_reason,
        usage,
    })
}

// ── Structured output extraction ────────────────────────────────────────────

/// Structured fields a forge-design prompt asks the model to embed in a
/// fenced `json` code block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StructuredOutput {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub reply: Option<String>,
}

/// Extracts the first valid JSON fenced code block from an LLM response,
/// falling back to a bare `{...}` scan. Fenced blocks take precedence.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}
