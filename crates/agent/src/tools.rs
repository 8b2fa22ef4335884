use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use banter_core::domain::conversation::{Message, ToolCallRequest};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("tool `{tool}` failed: {reason}")]
    Execution { tool: String, reason: String },
}

/// A callable capability advertised to the model. `parameters` is a JSON
/// schema object; incoming arguments are validated against it before
/// `execute` runs.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> Value;
    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError>;
}

/// Wire-facing description of a tool, embedded in provider payloads.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of dispatching one tool call. Failures are carried as data: the
/// payload always holds something the model can read back, and `error` is
/// kept alongside for logging.
#[derive(Clone, Debug)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub payload: Value,
    pub error: Option<ToolError>,
}

impl ToolCallOutcome {
    pub fn success(call_id: impl Into<String>, tool_name: impl Into<String>, payload: Value) -> Self {
        Self { call_id: call_id.into(), tool_name: tool_name.into(), payload, error: None }
    }

    pub fn failure(call_id: impl Into<String>, tool_name: impl Into<String>, error: ToolError) -> Self {
        let tool_name = tool_name.into();
        Self {
            call_id: call_id.into(),
            payload: json!({
                "error": {
                    "tool": tool_name,
                    "message": error.to_string(),
                }
            }),
            tool_name,
            error: Some(error),
        }
    }

    pub fn into_message(self) -> Message {
        let content = match &self.payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Message::tool(content, self.call_id, self.tool_name)
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Dispatches a single requested call. A missing tool, bad arguments, or
    /// an execution failure all come back as a structured error payload
    /// rather than an `Err`; the turn keeps going either way.
    pub async fn execute_call(&self, call: &ToolCallRequest) -> ToolCallOutcome {
        match self.try_execute(call).await {
            Ok(payload) => ToolCallOutcome::success(&call.id, &call.name, payload),
            Err(error) => {
                debug!(
                    event_name = "agent.tool.call_failed",
                    tool = %call.name,
                    error = %error,
                    "tool call produced an error payload"
                );
                ToolCallOutcome::failure(&call.id, &call.name, error)
            }
        }
    }

    async fn try_execute(&self, call: &ToolCallRequest) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        validate_arguments(&tool.parameters(), &call.arguments).map_err(|reason| {
            ToolError::InvalidArguments { tool: call.name.clone(), reason }
        })?;

        tool.execute(&call.arguments).await
    }
}

/// Validates arguments against the subset of JSON schema the tools here
/// actually use: a top-level object with typed properties and a `required`
/// list.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }

    let Some(arguments) = arguments.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !arguments.contains_key(key) {
                return Err(format!("missing required argument `{key}`"));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, value) in arguments {
        let Some(expected) = properties.get(key).and_then(|prop| prop.get("type")) else {
            continue;
        };
        let Some(expected) = expected.as_str() else {
            continue;
        };

        let matches = match expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };

        if !matches {
            return Err(format!("argument `{key}` must be of type {expected}"));
        }
    }

    Ok(())
}

/// Web search over the DuckDuckGo instant-answer API.
pub struct SearchTool {
    http: reqwest::Client,
    endpoint: String,
}

impl SearchTool {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoint(http, "https://api.duckduckgo.com")
    }

    pub fn with_endpoint(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self { http, endpoint: endpoint.into() }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        "search"
    }

    fn description(&self) -> &'static str {
        "Search the web for current information and return a short text summary."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .filter(|query| !query.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: "search".to_string(),
                reason: "query must be a non-empty string".to_string(),
            })?;

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(|err| ToolError::Execution {
                tool: "search".to_string(),
                reason: format!("search request failed: {err}"),
            })?;

        let body = response.json::<Value>().await.map_err(|err| ToolError::Execution {
            tool: "search".to_string(),
            reason: format!("search response was not valid JSON: {err}"),
        })?;

        let summary = summarize_search_response(&body)
            .unwrap_or_else(|| format!("No results found for \"{query}\"."));

        Ok(Value::String(summary))
    }
}

fn summarize_search_response(body: &Value) -> Option<String> {
    let non_empty = |value: &Value| {
        value.as_str().map(str::trim).filter(|text| !text.is_empty()).map(str::to_string)
    };

    if let Some(text) = body.get("AbstractText").and_then(|value| non_empty(value)) {
        return Some(text);
    }
    if let Some(text) = body.get("Answer").and_then(|value| non_empty(value)) {
        return Some(text);
    }

    body.get("RelatedTopics")
        .and_then(Value::as_array)
        .and_then(|topics| topics.first())
        .and_then(|topic| topic.get("Text"))
        .and_then(|value| non_empty(value))
}
