use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use forge_types::{
    ContentPart, ModelCallOutput, ModelCallRequest, ModelInfo, ProviderInfo, Role, TokenUsage,
    ToolCall, ToolSchema,
};

pub mod gateway;
pub mod retry;
pub mod tokens;

pub use gateway::{CallGateway, DeltaSink, ModelInvoker, NoopStatus, RecordingStatus, StatusSink};
pub use retry::{classify_error_message, execute_with_retry, is_retryable, RetryConfig};
pub use tokens::{estimate_request_tokens, estimate_text_tokens, with_estimate};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn complete(&self, request: &ModelCallRequest) -> anyhow::Result<ModelCallOutput>;

    async fn stream(
        &self,
        request: &ModelCallRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let output = self.complete(request).await?;
        let mut chunks = vec![Ok(StreamChunk::TextDelta(output.text))];
        for call in output.tool_calls.unwrap_or_default() {
            chunks.push(Ok(StreamChunk::ToolCallStart {
                id: call.id.clone(),
                name: call.name,
            }));
            chunks.push(Ok(StreamChunk::ToolCallDelta {
                id: call.id.clone(),
                args_delta: call.arguments.to_string(),
            }));
            chunks.push(Ok(StreamChunk::ToolCallEnd { id: call.id }));
        }
        chunks.push(Ok(StreamChunk::Done {
            finish_reason: "stop".to_string(),
            usage: (output.usage.total_tokens > 0).then_some(output.usage),
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    /// Registry over an explicit provider list; used by tests and embedders.
    pub fn from_providers(providers: Vec<Arc<dyn Provider>>, default_provider: Option<String>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn reload(&self, config: AppConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(
        config,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "mistral",
        "Mistral",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "gemini",
        "Gemini (OpenAI-compatible)",
        "https://generativelanguage.googleapis.com/v1beta/openai",
        "gemini-1.5-flash",
        true,
    );

    if let Some(anthropic) = config.providers.get("anthropic") {
        providers.push(Arc::new(AnthropicProvider {
            api_key: anthropic
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider("anthropic")),
            base_url: normalize_base(
                anthropic
                    .url
                    .as_deref()
                    .unwrap_or("https://api.anthropic.com/v1"),
            ),
            default_model: anthropic
                .default_model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            client: Client::new(),
        }));
    }

    if providers.is_empty() || config.providers.contains_key("local") {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn add_openai_provider(
    config: &AppConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    let base_url = if id == "gemini" {
        normalize_plain_base(entry.url.as_deref().unwrap_or(default_url))
    } else {
        normalize_base(entry.url.as_deref().unwrap_or(default_url))
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url,
        api_key: if use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        },
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

/// Environment variable that carries the API key for a provider id.
pub fn provider_api_key_env(id: &str) -> Option<&'static str> {
    match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        _ => None,
    }
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = provider_api_key_env(id)?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn resolve_model<'a>(request: &'a ModelCallRequest, default_model: &'a str) -> &'a str {
    let model = request.model.model_id.trim();
    if model.is_empty() {
        default_model
    } else {
        model
    }
}

struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
                context_window: 8192,
            }],
        }
    }

    async fn complete(&self, request: &ModelCallRequest) -> anyhow::Result<ModelCallOutput> {
        let prompt = request
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.text_content())
            .unwrap_or_default();
        Ok(ModelCallOutput::text(
            format!("Echo: {prompt}"),
            TokenUsage::default(),
        ))
    }
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    fn request_builder(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if self.id == "openrouter" {
            req = req.header("X-Title", "Forge");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn complete(&self, request: &ModelCallRequest) -> anyhow::Result<ModelCallOutput> {
        let model = resolve_model(request, &self.default_model);
        let body = openai_body(request, model, false);
        let response = self.request_builder(&body).send().await?;
        let status = response.status();
        let value: Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!("{detail} (status {status})");
        }

        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }

        let tool_calls = extract_openai_tool_calls(&value);
        let text = extract_openai_text(&value).unwrap_or_default();
        if text.is_empty() && tool_calls.is_none() {
            let body_preview = truncate_for_error(&value.to_string(), 500);
            anyhow::bail!(
                "provider returned no completion content for model `{}` (response: {})",
                model,
                body_preview
            );
        }

        Ok(ModelCallOutput {
            text,
            tool_calls,
            usage: extract_usage(&value).unwrap_or_default(),
        })
    }

    async fn stream(
        &self,
        request: &ModelCallRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = resolve_model(request, &self.default_model);
        let body = openai_body(request, model, true);

        let resp = self.request_builder(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            // later tool-call deltas carry only the index
            let mut call_ids: HashMap<u64, String> = HashMap::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }

                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                for payload in drain_sse_payloads(&mut buffer) {
                    if payload == "[DONE]" {
                        yield StreamChunk::Done {
                            finish_reason: "stop".to_string(),
                            usage: None,
                        };
                        continue;
                    }

                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };

                    if let Some(detail) = extract_openai_error(&value) {
                        Err(anyhow::anyhow!(detail))?;
                    }

                    for chunk in openai_delta_chunks(&value, &mut call_ids) {
                        yield chunk;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    client: Client,
}

impl AnthropicProvider {
    fn request_builder(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("anthropic-version", "2023-06-01")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        req
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: "anthropic".to_string(),
                display_name: self.default_model.clone(),
                context_window: 200_000,
            }],
        }
    }

    async fn complete(&self, request: &ModelCallRequest) -> anyhow::Result<ModelCallOutput> {
        let model = resolve_model(request, &self.default_model);
        let body = anthropic_body(request, model, false);
        let response = self.request_builder(&body).send().await?;
        let status = response.status();
        let value: Value = response.json().await?;
        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!("{detail} (status {status})");
        }

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in value["content"].as_array().cloned().unwrap_or_default() {
            match block.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                "text" => text.push_str(block["text"].as_str().unwrap_or_default()),
                "tool_use" => tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block.get("input").cloned().unwrap_or(Value::Null),
                }),
                _ => {}
            }
        }
        if text.is_empty() && tool_calls.is_empty() {
            anyhow::bail!(
                "provider returned no completion content for model `{}` (response: {})",
                model,
                truncate_for_error(&value.to_string(), 500)
            );
        }

        let usage = TokenUsage::new(
            value["usage"]["input_tokens"].as_u64().unwrap_or(0),
            value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        );
        Ok(ModelCallOutput {
            text,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            usage,
        })
    }

    async fn stream(
        &self,
        request: &ModelCallRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = resolve_model(request, &self.default_model);
        let body = anthropic_body(request, model, true);

        let resp = self.request_builder(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut prompt_tokens = 0u64;
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }
                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                for payload in drain_sse_payloads(&mut buffer) {
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        continue;
                    };
                    match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                        "message_start" => {
                            prompt_tokens = value["message"]["usage"]["input_tokens"]
                                .as_u64()
                                .unwrap_or(0);
                        }
                        "content_block_delta" => {
                            if let Some(delta) = value.get("delta").and_then(|v| v.get("text")).and_then(|v| v.as_str()) {
                                yield StreamChunk::TextDelta(delta.to_string());
                            }
                            if let Some(reasoning) = value.get("delta").and_then(|v| v.get("thinking")).and_then(|v| v.as_str()) {
                                yield StreamChunk::ReasoningDelta(reasoning.to_string());
                            }
                        }
                        "message_delta" => {
                            if let Some(output_tokens) = value["usage"]["output_tokens"].as_u64() {
                                yield StreamChunk::Done {
                                    finish_reason: value["delta"]["stop_reason"]
                                        .as_str()
                                        .unwrap_or("stop")
                                        .to_string(),
                                    usage: Some(TokenUsage::new(prompt_tokens, output_tokens)),
                                };
                            }
                        }
                        "error" => {
                            let detail = value["error"]["message"]
                                .as_str()
                                .unwrap_or("provider stream error")
                                .to_string();
                            Err(anyhow::anyhow!(detail))?;
                        }
                        _ => {}
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Removes every complete SSE frame from `buffer` and returns the `data:` payloads.
pub fn drain_sse_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let frame = buffer[..pos].to_string();
        buffer.drain(..pos + 2);
        for line in frame.lines() {
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if !payload.is_empty() {
                    payloads.push(payload.to_string());
                }
            }
        }
    }
    payloads
}

fn openai_delta_chunks(value: &Value, call_ids: &mut HashMap<u64, String>) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    let choices = value
        .get("choices")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if choices.is_empty() {
        // trailing usage-only frame
        if let Some(usage) = extract_usage(value) {
            out.push(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: Some(usage),
            });
        }
        return out;
    }
    for choice in choices {
        let delta = choice.get("delta").cloned().unwrap_or_default();

        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                out.push(StreamChunk::TextDelta(text.to_string()));
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in tool_calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let id = match call.get("id").and_then(|v| v.as_str()) {
                    Some(id) if !id.is_empty() => {
                        call_ids.insert(index, id.to_string());
                        id.to_string()
                    }
                    _ => call_ids.get(&index).cloned().unwrap_or_default(),
                };
                if id.is_empty() {
                    continue;
                }
                let function = call.get("function").cloned().unwrap_or_default();
                if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                    if !name.is_empty() {
                        out.push(StreamChunk::ToolCallStart {
                            id: id.clone(),
                            name: name.to_string(),
                        });
                    }
                }
                if let Some(args_delta) = function.get("arguments").and_then(|v| v.as_str()) {
                    if !args_delta.is_empty() {
                        out.push(StreamChunk::ToolCallDelta {
                            id: id.clone(),
                            args_delta: args_delta.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if !reason.is_empty() {
                for id in call_ids.values() {
                    out.push(StreamChunk::ToolCallEnd { id: id.clone() });
                }
                out.push(StreamChunk::Done {
                    finish_reason: reason.to_string(),
                    usage: extract_usage(value),
                });
            }
        }
    }
    out
}

fn openai_content(parts: &[ContentPart]) -> Value {
    if let [ContentPart::Text { text }] = parts {
        return json!(text);
    }
    Value::Array(
        parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image {
                    mime_type, data, ..
                } => json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{mime_type};base64,{data}")},
                }),
            })
            .collect(),
    )
}

fn openai_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

fn openai_body(request: &ModelCallRequest, model: &str, stream: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = request.system_instruction.as_deref() {
        messages.push(json!({"role": "system", "content": system}));
    }
    for turn in &request.turns {
        messages.push(json!({
            "role": turn.role.as_str(),
            "content": openai_content(&turn.parts),
        }));
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    });
    if stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    let wire_tools = request
        .tools
        .as_deref()
        .map(openai_tools)
        .unwrap_or_default();
    if !wire_tools.is_empty() {
        body["tools"] = Value::Array(wire_tools);
        body["tool_choice"] = json!("auto");
    }
    body
}

fn anthropic_body(request: &ModelCallRequest, model: &str, stream: bool) -> Value {
    let messages = request
        .turns
        .iter()
        .filter(|turn| turn.role != Role::System)
        .map(|turn| {
            let role = match turn.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            let content = turn
                .parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::Image {
                        mime_type, data, ..
                    } => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": mime_type, "data": data},
                    }),
                })
                .collect::<Vec<_>>();
            json!({"role": role, "content": content})
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": model,
        "max_tokens": 8192,
        "stream": stream,
        "messages": messages,
    });
    if let Some(system) = request.system_instruction.as_deref() {
        body["system"] = json!(system);
    }
    if let Some(tools) = request.tools.as_deref().filter(|t| !t.is_empty()) {
        body["tools"] = Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect(),
        );
    }
    body
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn normalize_plain_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    Some(TokenUsage::new(prompt_tokens, completion_tokens))
}

fn collect_text_fragments(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(arr) => {
            for item in arr {
                collect_text_fragments(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
            if let Some(message) = map.get("message") {
                collect_text_fragments(message, out);
            }
        }
        _ => {}
    }
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let mut out = String::new();

    if let Some(choice) = value.get("choices").and_then(|v| v.get(0)) {
        collect_text_fragments(choice, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }

    if let Some(content) = value.get("content") {
        collect_text_fragments(content, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }

    None
}

fn extract_openai_tool_calls(value: &Value) -> Option<Vec<ToolCall>> {
    let calls = value
        .pointer("/choices/0/message/tool_calls")?
        .as_array()?
        .iter()
        .map(|call| {
            let arguments = call["function"]["arguments"]
                .as_str()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            ToolCall {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                arguments,
            }
        })
        .collect::<Vec<_>>();
    (!calls.is_empty()).then_some(calls)
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
