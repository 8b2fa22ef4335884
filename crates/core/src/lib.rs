pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod registry;
pub mod retry;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, MemoryMode};
pub use domain::conversation::{
    ConversationId, ConversationState, Message, MessageRole, ToolCallRequest, TurnCursor, UserId,
};
pub use domain::model::{ModelConfig, ModelName, ReasoningEffort};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use registry::ModelRegistry;
pub use retry::{FailureClass, RetryPolicy};
