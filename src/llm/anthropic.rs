//! Anthropic Claude provider
//!
//! Streams the Messages API over SSE and translates the vendor events into
//! the normalized protocol. Tool-call argument fragments (`input_json_delta`)
//! are accumulated and surfaced as one `ToolCall` when the block closes.

use super::types::{
    BlockKind, ChatBlock, ChatMessage, ChatRequest, ChatRole, StopReason, StreamEvent,
    StreamMessage, StreamRef,
};
use super::{LlmError, LlmService};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Model table: user-facing name, API name, context window.
const MODELS: &[(&str, &str, usize)] = &[
    ("claude-4.5-opus", "claude-opus-4-5-20251101", 200_000),
    ("claude-4.5-sonnet", "claude-sonnet-4-5-20250929", 200_000),
    ("claude-4.5-haiku", "claude-haiku-4-5-20251001", 200_000),
];

pub struct AnthropicService {
    client: Client,
    api_key: String,
    model_name: String,
    api_name: String,
    context_window: usize,
}

impl AnthropicService {
    /// One service per known model for the given key.
    pub fn all(api_key: &str) -> Vec<Arc<dyn LlmService>> {
        MODELS
            .iter()
            .map(|(name, api_name, window)| {
                Arc::new(Self::new(api_key, name, api_name, *window)) as Arc<dyn LlmService>
            })
            .collect()
    }

    fn new(api_key: &str, model_name: &str, api_name: &str, context_window: usize) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.to_string(),
            model_name: model_name.to_string(),
            api_name: api_name.to_string(),
            context_window,
        }
    }

    fn translate_request(&self, request: &ChatRequest) -> Value {
        // The prior stream's cache context tells us how long the cached prefix
        // was; a new breakpoint goes on the last message so the next request
        // can reuse everything up to here.
        let message_count = request.messages.len();
        let messages: Vec<Value> = request
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| translate_message(m, i + 1 == message_count))
            .collect();

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.api_name,
            "max_tokens": request.max_tokens,
            "stream": true,
            "system": [{
                "type": "text",
                "text": request.system,
                "cache_control": { "type": "ephemeral" },
            }],
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn classify_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::auth(format!("authentication failed: {body}")),
            429 => LlmError::rate_limit(format!("rate limited: {body}")),
            400 => LlmError::invalid_request(format!("invalid request: {body}")),
            500..=599 => LlmError::server_error(format!("server error: {body}")),
            _ => LlmError::unknown(format!("http {status}: {body}")),
        }
    }
}

#[async_trait]
impl LlmService for AnthropicService {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider_name(&self) -> &str {
        "Anthropic"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn stream(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<StreamMessage>,
        stream_ref: StreamRef,
        cancel: CancellationToken,
    ) {
        let body = self.translate_request(&request);
        let message_count = request.messages.len();

        let response = tokio::select! {
            () = cancel.cancelled() => return,
            resp = self
                .client
                .post(API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send() => resp,
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let err = LlmError::network(format!("request failed: {e}"));
                emit_error(&sink, &stream_ref, &err).await;
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = Self::classify_error(status, &text);
            emit_error(&sink, &stream_ref, &err).await;
            return;
        }

        let mut translator = StreamTranslator::new(message_count);
        let mut body_stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return,
                chunk = body_stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buffer.find("\n\n") {
                        let frame: String = buffer.drain(..pos).collect();
                        buffer.drain(..2);
                        for event in translator.feed(&frame) {
                            if sink.send((stream_ref.clone(), event)).await.is_err() {
                                return;
                            }
                        }
                        if translator.done {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let err = LlmError::network(format!("stream read failed: {e}"));
                    emit_error(&sink, &stream_ref, &err).await;
                    return;
                }
                None => {
                    if !translator.done {
                        let err = LlmError::network("stream ended before message_stop");
                        emit_error(&sink, &stream_ref, &err).await;
                    }
                    return;
                }
            }
        }
    }
}

async fn emit_error(sink: &mpsc::Sender<StreamMessage>, stream_ref: &StreamRef, err: &LlmError) {
    let _ = sink
        .send((
            stream_ref.clone(),
            StreamEvent::StreamError {
                reason: err.message.clone(),
                recoverable: err.kind.is_recoverable(),
            },
        ))
        .await;
}

fn translate_message(message: &ChatMessage, cache_boundary: bool) -> Value {
    let role = match message.role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    };
    let block_count = message.content.len();
    let content: Vec<Value> = message
        .content
        .iter()
        .enumerate()
        .map(|(i, block)| {
            let mut value = match block {
                ChatBlock::Text { text } => json!({ "type": "text", "text": text }),
                ChatBlock::ToolUse { id, name, input } => {
                    json!({ "type": "tool_use", "id": id, "name": name, "input": input })
                }
                ChatBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                }),
            };
            if cache_boundary && i + 1 == block_count {
                value["cache_control"] = json!({ "type": "ephemeral" });
            }
            value
        })
        .collect();

    json!({ "role": role, "content": content })
}

// Vendor SSE payloads

#[derive(Deserialize)]
struct SseContentBlock {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct SseDelta {
    // message_delta payloads carry no "type" on the delta object
    #[serde(rename = "type", default)]
    kind: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct SseUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct SsePayload {
    #[serde(rename = "type")]
    kind: String,
    index: Option<u32>,
    content_block: Option<SseContentBlock>,
    delta: Option<SseDelta>,
    usage: Option<SseUsage>,
    message: Option<SseMessage>,
    error: Option<SseError>,
}

#[derive(Deserialize)]
struct SseMessage {
    usage: Option<SseUsage>,
}

#[derive(Deserialize)]
struct SseError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

struct PendingTool {
    id: String,
    name: String,
    json: String,
}

/// Folds vendor SSE frames into normalized events.
struct StreamTranslator {
    pending_tools: HashMap<u32, PendingTool>,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: StopReason,
    message_count: usize,
    done: bool,
}

impl StreamTranslator {
    fn new(message_count: usize) -> Self {
        Self {
            pending_tools: HashMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: StopReason::EndTurn,
            message_count,
            done: false,
        }
    }

    fn feed(&mut self, frame: &str) -> Vec<StreamEvent> {
        let Some(data) = frame
            .lines()
            .find_map(|line| line.strip_prefix("data:").map(str::trim))
        else {
            return vec![];
        };
        let Ok(payload) = serde_json::from_str::<SsePayload>(data) else {
            tracing::warn!(frame = %data, "unparseable stream frame");
            return vec![];
        };
        self.translate(payload)
    }

    fn translate(&mut self, payload: SsePayload) -> Vec<StreamEvent> {
        match payload.kind.as_str() {
            "message_start" => {
                if let Some(usage) = payload.message.and_then(|m| m.usage) {
                    self.input_tokens = usage.input_tokens.unwrap_or(0);
                }
                vec![StreamEvent::StreamStarted]
            }
            "content_block_start" => {
                let index = payload.index.unwrap_or(0);
                let Some(block) = payload.content_block else {
                    return vec![];
                };
                match block.kind.as_str() {
                    "text" => vec![StreamEvent::ContentBlockStart {
                        index,
                        kind: BlockKind::Text,
                    }],
                    "thinking" => vec![StreamEvent::ContentBlockStart {
                        index,
                        kind: BlockKind::Thinking,
                    }],
                    "tool_use" => {
                        self.pending_tools.insert(
                            index,
                            PendingTool {
                                id: block.id.unwrap_or_default(),
                                name: block.name.unwrap_or_default(),
                                json: String::new(),
                            },
                        );
                        vec![StreamEvent::ContentBlockStart {
                            index,
                            kind: BlockKind::ToolCall,
                        }]
                    }
                    _ => vec![],
                }
            }
            "content_block_delta" => {
                let index = payload.index.unwrap_or(0);
                let Some(delta) = payload.delta else {
                    return vec![];
                };
                match delta.kind.as_str() {
                    "text_delta" => delta
                        .text
                        .map(|text| StreamEvent::ContentDelta { index, delta: text })
                        .into_iter()
                        .collect(),
                    "thinking_delta" => delta
                        .thinking
                        .map(|text| StreamEvent::ContentDelta { index, delta: text })
                        .into_iter()
                        .collect(),
                    "input_json_delta" => {
                        if let (Some(tool), Some(fragment)) =
                            (self.pending_tools.get_mut(&index), delta.partial_json)
                        {
                            tool.json.push_str(&fragment);
                        }
                        vec![]
                    }
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                let index = payload.index.unwrap_or(0);
                let mut events = Vec::new();
                if let Some(tool) = self.pending_tools.remove(&index) {
                    let arguments = if tool.json.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&tool.json).unwrap_or_else(|_| json!({}))
                    };
                    events.push(StreamEvent::ToolCall {
                        index,
                        id: tool.id,
                        name: tool.name,
                        arguments,
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
                events
            }
            "message_delta" => {
                if let Some(delta) = payload.delta {
                    self.stop_reason = match delta.stop_reason.as_deref() {
                        Some("tool_use") => StopReason::ToolUse,
                        Some("max_tokens") => StopReason::MaxTokens,
                        _ => StopReason::EndTurn,
                    };
                }
                if let Some(usage) = payload.usage {
                    self.output_tokens = usage.output_tokens.unwrap_or(0);
                }
                vec![]
            }
            "message_stop" => {
                self.done = true;
                vec![StreamEvent::StreamComplete {
                    stop_reason: self.stop_reason,
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                    cache_context: Some(json!({ "cached_messages": self.message_count })),
                }]
            }
            "error" => {
                self.done = true;
                let (reason, recoverable) = payload
                    .error
                    .map(|e| (e.message, e.kind == "overloaded_error"))
                    .unwrap_or_else(|| ("unknown stream error".to_string(), false));
                vec![StreamEvent::StreamError { reason, recoverable }]
            }
            // ping and friends
            _ => vec![],
        }
    }
}
