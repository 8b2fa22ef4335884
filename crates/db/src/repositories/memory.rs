use std::collections::HashMap;

use tokio::sync::RwLock;

use banter_core::domain::conversation::{ConversationId, ConversationState};

use super::{CheckpointRepository, RepositoryError};

/// In-memory checkpoint store with the same version contract as the SQL
/// implementation. Used by tests and by deployments that do not need
/// durable history.
#[derive(Default)]
pub struct InMemoryCheckpointRepository {
    states: RwLock<HashMap<String, ConversationState>>,
}

#[async_trait::async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let states = self.states.read().await;
        Ok(states.get(&id.0).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<(), RepositoryError> {
        let mut states = self.states.write().await;

        if let Some(existing) = states.get(&state.id.0) {
            if existing.version + 1 != state.version {
                return Err(RepositoryError::VersionConflict {
                    conversation_id: state.id.0.clone(),
                });
            }
        }

        states.insert(state.id.0.clone(), state.clone());
        Ok(())
    }

    async fn clear(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        let mut states = self.states.write().await;
        states.remove(&id.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use banter_core::domain::conversation::{ConversationId, ConversationState, Message, UserId};

    use crate::repositories::{
        CheckpointRepository, InMemoryCheckpointRepository, RepositoryError,
    };

    fn saved_state(id: &str, version: u32) -> ConversationState {
        let mut state =
            ConversationState::new(ConversationId(id.to_string()), UserId("user-1".to_string()));
        state.append(Message::user("hello"));
        state.version = version;
        state
    }

    #[tokio::test]
    async fn in_memory_checkpoint_round_trip() {
        let repo = InMemoryCheckpointRepository::default();
        let state = saved_state("conv-1", 1);

        repo.save(&state).await.expect("save state");
        let found = repo.load(&state.id).await.expect("load state");

        assert_eq!(found.map(|loaded| loaded.messages.len()), Some(1));
    }

    #[tokio::test]
    async fn in_memory_checkpoint_rejects_stale_version() {
        let repo = InMemoryCheckpointRepository::default();
        let state = saved_state("conv-2", 1);

        repo.save(&state).await.expect("save state");
        let error = repo.save(&state).await.expect_err("stale save should fail");

        assert!(matches!(error, RepositoryError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn in_memory_checkpoint_clear_is_idempotent() {
        let repo = InMemoryCheckpointRepository::default();
        let state = saved_state("conv-3", 1);

        repo.save(&state).await.expect("save state");
        repo.clear(&state.id).await.expect("first clear");
        repo.clear(&state.id).await.expect("second clear");

        let found = repo.load(&state.id).await.expect("load state");
        assert!(found.is_none());
    }
}
