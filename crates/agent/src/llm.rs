use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use banter_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use banter_core::config::LlmConfig;
use banter_core::domain::conversation::{ConversationId, Message, MessageRole, ToolCallRequest};
use banter_core::domain::model::ModelConfig;
use banter_core::retry::FailureClass;

use crate::tools::ToolDescriptor;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Everything one model call needs: the prompt, the history so far, and the
/// tools the model may request.
#[derive(Clone, Debug)]
pub struct InvocationRequest {
    pub conversation_id: ConversationId,
    pub correlation_id: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssistantReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl AssistantReply {
    pub fn into_message(self) -> Message {
        if self.tool_calls.is_empty() {
            Message::assistant(self.content)
        } else {
            Message::assistant_tool_calls(self.content, self.tool_calls)
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invocation failed ({}): {message}", .class.as_str())]
pub struct InvocationFailure {
    pub class: FailureClass,
    pub message: String,
}

impl InvocationFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Fatal, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }
}

/// Events produced by a streaming invocation, in arrival order: zero or more
/// tokens, then exactly one `Completed` or `Failed`.
#[derive(Debug)]
pub enum StreamEvent {
    Token(String),
    Completed(AssistantReply),
    Failed(InvocationFailure),
}

/// One network call per `invoke`. Retry and fallback live above this trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(
        &self,
        model: &ModelConfig,
        request: &InvocationRequest,
    ) -> Result<AssistantReply, InvocationFailure>;

    /// Opens a streaming invocation. An `Err` means the stream never opened
    /// and the attempt may be retried; once a receiver is handed back, any
    /// failure arrives in-band as `StreamEvent::Failed` and is terminal.
    async fn invoke_stream(
        &self,
        model: &ModelConfig,
        request: &InvocationRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, InvocationFailure>;
}

/// Client for OpenAI-compatible chat-completion endpoints (OpenAI, Ollama,
/// vLLM, most gateways).
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    sink: Arc<dyn AuditSink>,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig, sink: Arc<dyn AuditSink>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            sink,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        model: &ModelConfig,
        request: &InvocationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, InvocationFailure> {
        let payload = build_payload(model, request, stream);

        let mut http_request = self.http.post(self.completions_url()).json(&payload);
        if let Some(api_key) = &self.api_key {
            http_request = http_request.bearer_auth(api_key.expose_secret());
        }

        let response = http_request.send().await.map_err(classify_request_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    fn record_invocation(
        &self,
        model: &ModelConfig,
        request: &InvocationRequest,
        duration: Duration,
        failure: Option<&InvocationFailure>,
    ) {
        let (event_type, outcome) = match failure {
            None => ("agent.invocation.completed", AuditOutcome::Success),
            Some(_) => ("agent.invocation.failed", AuditOutcome::Failed),
        };

        let mut event = AuditEvent::new(
            Some(request.conversation_id.clone()),
            request.correlation_id.clone(),
            event_type,
            AuditCategory::Invocation,
            "llm-client",
            outcome,
        )
        .with_metadata("model", model.name.0.clone())
        .with_metadata("duration_ms", duration.as_millis().to_string());

        if let Some(failure) = failure {
            event = event
                .with_metadata("failure_class", failure.class.as_str())
                .with_metadata("failure_message", failure.message.clone());
        }

        self.sink.emit(event);
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn invoke(
        &self,
        model: &ModelConfig,
        request: &InvocationRequest,
    ) -> Result<AssistantReply, InvocationFailure> {
        let started = Instant::now();

        let result = match self.send(model, request, false).await {
            Ok(response) => match response.json::<Value>().await {
                Ok(body) => parse_reply(&body),
                Err(err) => Err(InvocationFailure::transient(format!(
                    "could not read completion body: {err}"
                ))),
            },
            Err(failure) => Err(failure),
        };

        self.record_invocation(model, request, started.elapsed(), result.as_ref().err());
        result
    }

    async fn invoke_stream(
        &self,
        model: &ModelConfig,
        request: &InvocationRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, InvocationFailure> {
        let started = Instant::now();

        if !model.supports_streaming {
            let failure = InvocationFailure::fatal(format!(
                "model `{}` does not support streaming",
                model.name.0
            ));
            self.record_invocation(model, request, started.elapsed(), Some(&failure));
            return Err(failure);
        }

        let mut response = match self.send(model, request, true).await {
            Ok(response) => response,
            Err(failure) => {
                self.record_invocation(model, request, started.elapsed(), Some(&failure));
                return Err(failure);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let sink = Arc::clone(&self.sink);
        let model = model.clone();
        let request = request.clone();

        tokio::spawn(async move {
            let result = pump_stream(&mut response, &events_tx, &model).await;
            let duration = started.elapsed();

            match result {
                Ok(reply) => {
                    record_stream_result(&sink, &model, &request, duration, None);
                    let _ = events_tx.send(StreamEvent::Completed(reply)).await;
                }
                Err(failure) => {
                    record_stream_result(&sink, &model, &request, duration, Some(&failure));
                    let _ = events_tx.send(StreamEvent::Failed(failure)).await;
                }
            }
        });

        Ok(events_rx)
    }
}

/// Reads the SSE body, forwarding token deltas as they arrive. Returns the
/// assembled reply once the stream terminates, or the failure that cut it
/// short. A dropped receiver means the turn was cancelled; reading stops and
/// whatever assembled so far is returned to a caller that is no longer there.
async fn pump_stream(
    response: &mut reqwest::Response,
    events_tx: &mpsc::Sender<StreamEvent>,
    model: &ModelConfig,
) -> Result<AssistantReply, InvocationFailure> {
    let mut assembler = StreamAssembler::default();
    let mut pending = String::new();
    let mut saw_done = false;

    'read: loop {
        let chunk = match response.chunk().await.map_err(classify_request_error)? {
            Some(chunk) => chunk,
            None => break,
        };

        pending.push_str(&String::from_utf8_lossy(&chunk));

        for data in drain_sse_data(&mut pending) {
            if data == "[DONE]" {
                saw_done = true;
                break 'read;
            }

            let parsed: Value = serde_json::from_str(&data).map_err(|err| {
                InvocationFailure::transient(format!("malformed stream chunk: {err}"))
            })?;

            if let Some(token) = assembler.apply_chunk(&parsed) {
                if events_tx.send(StreamEvent::Token(token)).await.is_err() {
                    break 'read;
                }
            }
        }
    }

    if !saw_done {
        debug!(
            event_name = "agent.invocation.stream_truncated",
            model = %model.name.0,
            "stream closed without a terminal marker"
        );
    }

    assembler.finish()
}

fn record_stream_result(
    sink: &Arc<dyn AuditSink>,
    model: &ModelConfig,
    request: &InvocationRequest,
    duration: Duration,
    failure: Option<&InvocationFailure>,
) {
    let (event_type, outcome) = match failure {
        None => ("agent.invocation.completed", AuditOutcome::Success),
        Some(_) => ("agent.invocation.failed", AuditOutcome::Failed),
    };

    let mut event = AuditEvent::new(
        Some(request.conversation_id.clone()),
        request.correlation_id.clone(),
        event_type,
        AuditCategory::Invocation,
        "llm-client",
        outcome,
    )
    .with_metadata("model", model.name.0.clone())
    .with_metadata("duration_ms", duration.as_millis().to_string())
    .with_metadata("streamed", "true".to_string());

    if let Some(failure) = failure {
        event = event
            .with_metadata("failure_class", failure.class.as_str())
            .with_metadata("failure_message", failure.message.clone());
    }

    sink.emit(event);
}

fn build_payload(model: &ModelConfig, request: &InvocationRequest, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    messages.push(json!({
        "role": "system",
        "content": request.system_prompt,
    }));

    for message in &request.messages {
        messages.push(wire_message(message));
    }

    let mut payload = json!({
        "model": model.name.0,
        "messages": messages,
        "temperature": model.temperature,
        "max_tokens": model.max_output_tokens,
        "stream": stream,
    });

    if let Some(effort) = model.reasoning_effort {
        payload["reasoning_effort"] = json!(effort.as_str());
    }

    if model.supports_tools && !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        payload["tools"] = Value::Array(tools);
    }

    payload
}

fn wire_message(message: &Message) -> Value {
    match message.role {
        MessageRole::User => json!({
            "role": "user",
            "content": message.content,
        }),
        MessageRole::Assistant => {
            let mut wire = json!({
                "role": "assistant",
                "content": message.content,
            });
            if !message.tool_calls.is_empty() {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                wire["tool_calls"] = Value::Array(calls);
            }
            wire
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "content": message.content,
            "tool_call_id": message.tool_call_id,
            "name": message.tool_name,
        }),
    }
}

fn classify_request_error(error: reqwest::Error) -> InvocationFailure {
    if error.is_timeout() {
        return InvocationFailure::new(FailureClass::Timeout, format!("request timed out: {error}"));
    }
    if error.is_connect() {
        return InvocationFailure::transient(format!("connection failed: {error}"));
    }
    if error.is_builder() {
        return InvocationFailure::fatal(format!("malformed request: {error}"));
    }
    InvocationFailure::transient(format!("request failed: {error}"))
}

fn classify_status(status: StatusCode, body: &str) -> InvocationFailure {
    let detail = body_snippet(body);

    if status == StatusCode::TOO_MANY_REQUESTS {
        return InvocationFailure::new(
            FailureClass::RateLimited,
            format!("provider rate limit (429): {detail}"),
        );
    }
    if status == StatusCode::REQUEST_TIMEOUT {
        return InvocationFailure::new(
            FailureClass::Timeout,
            format!("provider timed out (408): {detail}"),
        );
    }
    if status.is_server_error() {
        return InvocationFailure::transient(format!("provider error ({status}): {detail}"));
    }

    InvocationFailure::fatal(format!("provider rejected request ({status}): {detail}"))
}

fn body_snippet(body: &str) -> String {
    const MAX_SNIPPET: usize = 200;
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    trimmed.chars().take(MAX_SNIPPET).collect()
}

fn parse_reply(body: &Value) -> Result<AssistantReply, InvocationFailure> {
    let message = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| {
            InvocationFailure::transient("completion response is missing choices[0].message")
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = match message.get("tool_calls").and_then(Value::as_array) {
        Some(calls) => calls.iter().map(parse_tool_call).collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(AssistantReply { content, tool_calls })
}

fn parse_tool_call(call: &Value) -> Result<ToolCallRequest, InvocationFailure> {
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| InvocationFailure::transient("tool call is missing an id"))?;

    let function = call
        .get("function")
        .ok_or_else(|| InvocationFailure::transient("tool call is missing its function block"))?;

    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| InvocationFailure::transient("tool call is missing a function name"))?;

    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) if !raw.trim().is_empty() => serde_json::from_str(raw)
            .map_err(|err| {
                InvocationFailure::transient(format!("tool call arguments are not valid JSON: {err}"))
            })?,
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };

    Ok(ToolCallRequest { id: id.to_string(), name: name.to_string(), arguments })
}

/// Splits complete `data:` SSE payloads off the front of `pending`, leaving
/// any incomplete trailing line in place.
fn drain_sse_data(pending: &mut String) -> Vec<String> {
    let mut data = Vec::new();

    while let Some(newline) = pending.find('\n') {
        let line: String = pending.drain(..=newline).collect();
        let line = line.trim_end_matches(['\n', '\r']);

        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim();
            if !payload.is_empty() {
                data.push(payload.to_string());
            }
        }
    }

    data
}

/// Accumulates streaming deltas into a complete assistant reply. Tool-call
/// fragments are keyed by their delta index; argument strings concatenate
/// across chunks and are parsed once at the end.
#[derive(Default)]
struct StreamAssembler {
    content: String,
    tool_calls: Vec<PartialToolCall>,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAssembler {
    fn apply_chunk(&mut self, chunk: &Value) -> Option<String> {
        let delta = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))?;

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(PartialToolCall::default());
                }
                let partial = &mut self.tool_calls[index];

                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                if let Some(name) =
                    call.get("function").and_then(|f| f.get("name")).and_then(Value::as_str)
                {
                    partial.name = name.to_string();
                }
                if let Some(arguments) =
                    call.get("function").and_then(|f| f.get("arguments")).and_then(Value::as_str)
                {
                    partial.arguments.push_str(arguments);
                }
            }
        }

        let token = delta.get("content").and_then(Value::as_str)?;
        if token.is_empty() {
            return None;
        }

        self.content.push_str(token);
        Some(token.to_string())
    }

    fn finish(self) -> Result<AssistantReply, InvocationFailure> {
        let mut tool_calls = Vec::with_capacity(self.tool_calls.len());

        for partial in self.tool_calls {
            if partial.id.is_empty() || partial.name.is_empty() {
                return Err(InvocationFailure::transient(
                    "stream ended with an incomplete tool call",
                ));
            }

            let arguments = if partial.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&partial.arguments).map_err(|err| {
                    InvocationFailure::transient(format!(
                        "streamed tool call arguments are not valid JSON: {err}"
                    ))
                })?
            };

            tool_calls.push(ToolCallRequest { id: partial.id, name: partial.name, arguments });
        }

        Ok(AssistantReply { content: self.content, tool_calls })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use banter_core::domain::conversation::{ConversationId, Message};
    use banter_core::domain::model::{ModelConfig, ModelName, ReasoningEffort};
    use banter_core::retry::FailureClass;

    use crate::tools::ToolDescriptor;

    use super::{
        build_payload, classify_status, drain_sse_data, parse_reply, InvocationRequest,
        StreamAssembler,
    };

    fn model() -> ModelConfig {
        ModelConfig {
            name: ModelName("test-model".to_string()),
            position: 0,
            temperature: 0.3,
            max_output_tokens: 512,
            reasoning_effort: Some(ReasoningEffort::High),
            supports_tools: true,
            supports_streaming: true,
        }
    }

    fn request() -> InvocationRequest {
        InvocationRequest {
            conversation_id: ConversationId("conv-1".to_string()),
            correlation_id: "corr-1".to_string(),
            system_prompt: "You are helpful.".to_string(),
            messages: vec![Message::user("hello")],
            tools: vec![ToolDescriptor {
                name: "search".to_string(),
                description: "Search the web.".to_string(),
                parameters: json!({"type": "object"}),
            }],
        }
    }

    #[test]
    fn payload_carries_prompt_history_tools_and_generation_params() {
        let payload = build_payload(&model(), &request(), false);

        assert_eq!(payload["model"], json!("test-model"));
        assert_eq!(payload["messages"][0]["role"], json!("system"));
        assert_eq!(payload["messages"][1]["role"], json!("user"));
        assert_eq!(payload["temperature"], json!(0.3));
        assert_eq!(payload["max_tokens"], json!(512));
        assert_eq!(payload["reasoning_effort"], json!("high"));
        assert_eq!(payload["stream"], json!(false));
        assert_eq!(payload["tools"][0]["function"]["name"], json!("search"));
    }

    #[test]
    fn payload_omits_tools_for_models_without_tool_support() {
        let mut model = model();
        model.supports_tools = false;

        let payload = build_payload(&model, &request(), true);

        assert!(payload.get("tools").is_none());
        assert_eq!(payload["stream"], json!(true));
    }

    #[test]
    fn status_classification_matches_retry_semantics() {
        let cases = [
            (429, FailureClass::RateLimited),
            (408, FailureClass::Timeout),
            (500, FailureClass::Transient),
            (503, FailureClass::Transient),
            (400, FailureClass::Fatal),
            (401, FailureClass::Fatal),
            (404, FailureClass::Fatal),
        ];

        for (code, expected) in cases {
            let status = reqwest::StatusCode::from_u16(code).expect("valid status code");
            let failure = classify_status(status, "boom");
            assert_eq!(failure.class, expected, "status {code}");
        }
    }

    #[test]
    fn parse_reply_reads_content_and_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-1",
                        "type": "function",
                        "function": {
                            "name": "search",
                            "arguments": "{\"query\":\"weather in Paris\"}"
                        }
                    }]
                }
            }]
        });

        let reply = parse_reply(&body).expect("parse reply");

        assert_eq!(reply.content, "");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "search");
        assert_eq!(reply.tool_calls[0].arguments["query"], json!("weather in Paris"));
    }

    #[test]
    fn parse_reply_flags_malformed_bodies_as_transient() {
        let failure = parse_reply(&json!({"unexpected": true})).expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Transient);
    }

    #[test]
    fn sse_buffer_keeps_incomplete_lines() {
        let mut pending = String::from("data: {\"a\":1}\ndata: {\"b\":");

        let drained = drain_sse_data(&mut pending);

        assert_eq!(drained, vec!["{\"a\":1}".to_string()]);
        assert_eq!(pending, "data: {\"b\":");
    }

    #[test]
    fn assembler_accumulates_tokens_and_split_tool_arguments() {
        let mut assembler = StreamAssembler::default();

        let token = assembler.apply_chunk(&json!({
            "choices": [{"delta": {"content": "Par"}}]
        }));
        assert_eq!(token.as_deref(), Some("Par"));

        let token = assembler.apply_chunk(&json!({
            "choices": [{"delta": {"content": "is"}}]
        }));
        assert_eq!(token.as_deref(), Some("is"));

        assembler.apply_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "id": "call-1",
                "function": {"name": "search", "arguments": "{\"query\":"}
            }]}}]
        }));
        assembler.apply_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "function": {"arguments": "\"tides\"}"}
            }]}}]
        }));

        let reply = assembler.finish().expect("assemble reply");

        assert_eq!(reply.content, "Paris");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].arguments["query"], json!("tides"));
    }

    #[test]
    fn assembler_rejects_incomplete_tool_calls() {
        let mut assembler = StreamAssembler::default();
        assembler.apply_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "function": {"arguments": "{}"}
            }]}}]
        }));

        let failure = assembler.finish().expect_err("should fail");
        assert_eq!(failure.class, FailureClass::Transient);
    }
}
