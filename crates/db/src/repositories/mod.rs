use async_trait::async_trait;
use thiserror::Error;

use banter_core::domain::conversation::{ConversationId, ConversationState};

pub mod checkpoint;
pub mod memory;

pub use checkpoint::SqlCheckpointRepository;
pub use memory::InMemoryCheckpointRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conversation `{conversation_id}` was updated concurrently")]
    VersionConflict { conversation_id: String },
}

/// Durable checkpoint storage for conversation state.
///
/// `save` must behave as an exclusive write per conversation id: a stale
/// state (version already persisted by someone else) is rejected with
/// `VersionConflict` instead of silently overwriting history.
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn load(&self, id: &ConversationId) -> Result<Option<ConversationState>, RepositoryError>;

    async fn save(&self, state: &ConversationState) -> Result<(), RepositoryError>;

    async fn clear(&self, id: &ConversationId) -> Result<(), RepositoryError>;
}
