use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use banter_core::domain::conversation::{
    ConversationId, ConversationState, Message, MessageRole, ToolCallRequest, TurnCursor, UserId,
};

use crate::connection::DbPool;
use crate::repositories::{CheckpointRepository, RepositoryError};

/// SQLite-backed checkpoint store.
///
/// The conversation row carries a version counter; writes only land when the
/// caller saw the latest persisted version, so two racing turns cannot
/// interleave their checkpoints. Messages are append-only and keyed by
/// position, which makes re-saving an already persisted prefix a no-op.
pub struct SqlCheckpointRepository {
    pool: DbPool,
}

impl SqlCheckpointRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointRepository for SqlCheckpointRepository {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, cursor, version, created_at, updated_at
             FROM conversation
             WHERE id = ?1",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut state = conversation_from_row(&row)?;

        let message_rows = sqlx::query(
            "SELECT role, content, tool_calls, tool_call_id, tool_name, created_at
             FROM conversation_message
             WHERE conversation_id = ?1
             ORDER BY position",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        state.messages =
            message_rows.iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(state))
    }

    async fn save(&self, state: &ConversationState) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "INSERT INTO conversation (id, user_id, cursor, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                 cursor = excluded.cursor,
                 version = excluded.version,
                 updated_at = excluded.updated_at
             WHERE conversation.version = excluded.version - 1",
        )
        .bind(&state.id.0)
        .bind(&state.user_id.0)
        .bind(state.cursor.as_str())
        .bind(i64::from(state.version))
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                conversation_id: state.id.0.clone(),
            });
        }

        for (position, message) in state.messages.iter().enumerate() {
            let tool_calls = encode_tool_calls(&message.tool_calls)?;

            sqlx::query(
                "INSERT INTO conversation_message
                     (conversation_id, position, role, content, tool_calls, tool_call_id,
                      tool_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (conversation_id, position) DO NOTHING",
            )
            .bind(&state.id.0)
            .bind(position as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(tool_calls)
            .bind(message.tool_call_id.as_deref())
            .bind(message.tool_name.as_deref())
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self, id: &ConversationId) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM conversation WHERE id = ?1")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<ConversationState, RepositoryError> {
    let cursor_raw = row.try_get::<String, _>("cursor")?;
    let cursor = TurnCursor::parse(&cursor_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown turn cursor: {cursor_raw}")))?;

    Ok(ConversationState {
        id: ConversationId(row.try_get::<String, _>("id")?),
        user_id: UserId(row.try_get::<String, _>("user_id")?),
        messages: Vec::new(),
        cursor,
        version: parse_u32(row.try_get::<i64, _>("version")?, "version")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?, "created_at")?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?, "updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = MessageRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role: {role_raw}")))?;

    let tool_calls = match row.try_get::<Option<String>, _>("tool_calls")? {
        Some(raw) => serde_json::from_str::<Vec<ToolCallRequest>>(&raw)
            .map_err(|err| RepositoryError::Decode(format!("invalid tool_calls json: {err}")))?,
        None => Vec::new(),
    };

    Ok(Message {
        role,
        content: row.try_get::<String, _>("content")?,
        tool_calls,
        tool_call_id: row.try_get::<Option<String>, _>("tool_call_id")?,
        tool_name: row.try_get::<Option<String>, _>("tool_name")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?, "created_at")?,
    })
}

fn encode_tool_calls(calls: &[ToolCallRequest]) -> Result<Option<String>, RepositoryError> {
    if calls.is_empty() {
        return Ok(None);
    }

    serde_json::to_string(calls)
        .map(Some)
        .map_err(|err| RepositoryError::Decode(format!("could not encode tool_calls: {err}")))
}

fn parse_u32(value: i64, field: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("{field} is out of range: {value}")))
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| RepositoryError::Decode(format!("invalid {field} timestamp: {err}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use banter_core::domain::conversation::{
        ConversationId, ConversationState, Message, ToolCallRequest, TurnCursor, UserId,
    };

    use crate::connection::connect_with_settings;
    use crate::migrations::run_pending;
    use crate::repositories::{CheckpointRepository, RepositoryError, SqlCheckpointRepository};

    async fn setup_pool() -> crate::connection::DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn checkpointed_state(id: &str) -> ConversationState {
        let mut state =
            ConversationState::new(ConversationId(id.to_string()), UserId("user-1".to_string()));
        state.append(Message::user("what is the weather in Paris?"));
        state.append(Message::assistant_tool_calls(
            "",
            vec![ToolCallRequest {
                id: "call-1".to_string(),
                name: "search".to_string(),
                arguments: json!({"query": "weather in Paris"}),
            }],
        ));
        state.version = 1;
        state
    }

    #[tokio::test]
    async fn save_then_load_round_trips_conversation_state() {
        let pool = setup_pool().await;
        let repository = SqlCheckpointRepository::new(pool.clone());

        let state = checkpointed_state("conv-round-trip");
        repository.save(&state).await.expect("save state");

        let loaded = repository
            .load(&state.id)
            .await
            .expect("load state")
            .expect("state should exist");

        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.user_id, state.user_id);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.cursor, TurnCursor::Chat);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].content, "what is the weather in Paris?");
        assert_eq!(loaded.messages[1].tool_calls.len(), 1);
        assert_eq!(loaded.messages[1].tool_calls[0].name, "search");

        pool.close().await;
    }

    #[tokio::test]
    async fn load_missing_conversation_returns_none() {
        let pool = setup_pool().await;
        let repository = SqlCheckpointRepository::new(pool.clone());

        let loaded = repository
            .load(&ConversationId("conv-missing".to_string()))
            .await
            .expect("load state");

        assert!(loaded.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn save_appends_new_messages_and_skips_persisted_prefix() {
        let pool = setup_pool().await;
        let repository = SqlCheckpointRepository::new(pool.clone());

        let mut state = checkpointed_state("conv-append");
        repository.save(&state).await.expect("save first checkpoint");

        state.append(Message::tool("overcast, 18 degrees", "call-1", "search"));
        state.append(Message::assistant("It is overcast and 18 degrees in Paris."));
        state.version = 2;
        repository.save(&state).await.expect("save second checkpoint");

        let loaded = repository
            .load(&state.id)
            .await
            .expect("load state")
            .expect("state should exist");

        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.messages.len(), 4);
        assert_eq!(loaded.messages[2].tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(loaded.messages[3].content, "It is overcast and 18 degrees in Paris.");

        pool.close().await;
    }

    #[tokio::test]
    async fn save_rejects_stale_version() {
        let pool = setup_pool().await;
        let repository = SqlCheckpointRepository::new(pool.clone());

        let state = checkpointed_state("conv-stale");
        repository.save(&state).await.expect("save first checkpoint");

        let error = repository.save(&state).await.expect_err("stale save should fail");
        assert!(matches!(error, RepositoryError::VersionConflict { .. }));

        pool.close().await;
    }

    #[tokio::test]
    async fn clear_removes_state_and_is_idempotent() {
        let pool = setup_pool().await;
        let repository = SqlCheckpointRepository::new(pool.clone());

        let state = checkpointed_state("conv-clear");
        repository.save(&state).await.expect("save state");

        repository.clear(&state.id).await.expect("first clear");
        repository.clear(&state.id).await.expect("second clear");

        let loaded = repository.load(&state.id).await.expect("load state");
        assert!(loaded.is_none());

        pool.close().await;
    }
}
