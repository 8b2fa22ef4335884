use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Which node runs next when the conversation is picked up again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnCursor {
    Chat,
    ToolCall,
}

impl TurnCursor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::ToolCall => "tool_call",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chat" => Some(Self::Chat),
            "tool_call" => Some(Self::ToolCall),
            _ => None,
        }
    }
}

/// A tool invocation requested by the model within an assistant message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: None,
            tool_name: None,
            created_at: Utc::now(),
        }
    }

    pub fn tool(
        content: impl Into<String>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            created_at: Utc::now(),
        }
    }

    pub fn requests_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Durable conversation snapshot. History is append-only; `version` is
/// bumped once per checkpoint and checked optimistically on save.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: ConversationId,
    pub user_id: UserId,
    pub messages: Vec<Message>,
    pub cursor: TurnCursor,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(id: ConversationId, user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            messages: Vec::new(),
            cursor: TurnCursor::Chat,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Tool calls still owed results: the requests of the last assistant
    /// message, present only while the cursor points at `tool_call`.
    pub fn pending_tool_calls(&self) -> &[ToolCallRequest] {
        if self.cursor != TurnCursor::ToolCall {
            return &[];
        }
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
            .map(|message| message.tool_calls.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ConversationId, ConversationState, Message, MessageRole, ToolCallRequest, TurnCursor,
        UserId,
    };

    fn state() -> ConversationState {
        ConversationState::new(ConversationId("c1".to_string()), UserId("u1".to_string()))
    }

    #[test]
    fn message_role_round_trips_from_storage_encoding() {
        let cases = [MessageRole::User, MessageRole::Assistant, MessageRole::Tool];

        for role in cases {
            let decoded = MessageRole::parse(role.as_str());
            assert_eq!(decoded, Some(role));
        }
    }

    #[test]
    fn turn_cursor_round_trips_from_storage_encoding() {
        let cases = [TurnCursor::Chat, TurnCursor::ToolCall];

        for cursor in cases {
            let decoded = TurnCursor::parse(cursor.as_str());
            assert_eq!(decoded, Some(cursor));
        }
    }

    #[test]
    fn append_grows_history_without_rewriting_earlier_messages() {
        let mut state = state();
        state.append(Message::user("hello"));
        let first = state.messages[0].clone();

        state.append(Message::assistant("hi there"));

        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0], first);
    }

    #[test]
    fn pending_tool_calls_belong_to_last_assistant_message() {
        let mut state = state();
        state.append(Message::user("what's the weather?"));
        state.append(Message::assistant_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".to_string(),
                name: "search".to_string(),
                arguments: json!({"query": "weather Paris"}),
            }],
        ));
        state.cursor = TurnCursor::ToolCall;

        let pending = state.pending_tool_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "search");
    }

    #[test]
    fn pending_tool_calls_are_empty_outside_the_tool_call_cursor() {
        let mut state = state();
        state.append(Message::assistant_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call_1".to_string(),
                name: "search".to_string(),
                arguments: json!({"query": "weather Paris"}),
            }],
        ));

        assert!(state.pending_tool_calls().is_empty());
    }
}
