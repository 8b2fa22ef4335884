pub mod conversation;
pub mod model;

pub use conversation::{
    ConversationId, ConversationState, Message, MessageRole, ToolCallRequest, TurnCursor, UserId,
};
pub use model::{ModelConfig, ModelName, ReasoningEffort};
