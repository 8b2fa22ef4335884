use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use banter_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use banter_core::config::{AppConfig, MemoryMode};
use banter_core::domain::conversation::{
    ConversationId, ConversationState, Message, MessageRole, ToolCallRequest, TurnCursor, UserId,
};
use banter_core::domain::model::ModelName;
use banter_core::errors::{ApplicationError, DomainError};
use banter_core::registry::ModelRegistry;
use banter_core::retry::RetryPolicy;
use banter_db::{CheckpointRepository, DbPool, RepositoryError, SqlCheckpointRepository};

use crate::invoker::{InvokeError, RegistryExhaustion, ResilientInvoker};
use crate::llm::{
    HttpLlmClient, InvocationFailure, InvocationRequest, StreamEvent,
};
use crate::memory::{format_memory_block, InMemoryMemoryStore, MemoryStore, NoopMemoryStore};
use crate::tools::{SearchTool, ToolCallOutcome, ToolError, ToolRegistry};

/// History marker appended when every model fails a full retry cycle.
pub const EXHAUSTION_MARKER: &str = "failed to get llm response after trying all models";

/// History marker appended when a provider dies after tokens started flowing.
const STREAM_FAILURE_MARKER: &str = "response was interrupted before it completed";

const TURN_EVENT_CAPACITY: usize = 64;

/// Why a turn could not produce a final assistant message.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("conversation `{conversation_id}` already has a turn in flight")]
    TurnInProgress { conversation_id: String },
    #[error(transparent)]
    Exhausted(RegistryExhaustion),
    #[error("fatal provider failure from `{model}`: {failure}")]
    Fatal { model: ModelName, failure: InvocationFailure },
    #[error("tool-call loop limit reached after {rounds} rounds")]
    LoopLimitExceeded { rounds: u32 },
    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] RepositoryError),
}

impl From<InvokeError> for TurnError {
    fn from(value: InvokeError) -> Self {
        match value {
            InvokeError::Fatal { model, failure } => Self::Fatal { model, failure },
            InvokeError::Exhausted(exhaustion) => Self::Exhausted(exhaustion),
        }
    }
}

impl From<TurnError> for ApplicationError {
    fn from(value: TurnError) -> Self {
        match value {
            TurnError::TurnInProgress { conversation_id } => {
                DomainError::TurnInProgress { conversation_id }.into()
            }
            TurnError::LoopLimitExceeded { rounds } => {
                DomainError::LoopLimitExceeded { rounds }.into()
            }
            TurnError::Exhausted(exhaustion) => ApplicationError::Provider(exhaustion.to_string()),
            TurnError::Fatal { ref model, ref failure } => {
                ApplicationError::Provider(format!("fatal failure from `{model}`: {failure}"))
            }
            TurnError::Checkpoint(error) => ApplicationError::Persistence(error.to_string()),
        }
    }
}

/// Events delivered to a streaming caller: zero or more tokens, then exactly
/// one `Completed` or `Failed`.
#[derive(Debug)]
pub enum TurnEvent {
    Token(String),
    Completed(Message),
    Failed { message: String },
}

/// Drives one conversation turn at a time: load the checkpoint, alternate
/// between asking the model and executing requested tools, persist after
/// every transition, return the final assistant message.
///
/// A turn owns its `ConversationState` exclusively; the per-conversation
/// permit set rejects a second inbound message while one is in flight.
pub struct AgentRuntime {
    invoker: ResilientInvoker,
    tools: Arc<ToolRegistry>,
    checkpoints: Arc<dyn CheckpointRepository>,
    memory: Arc<dyn MemoryStore>,
    sink: Arc<dyn AuditSink>,
    system_prompt: String,
    max_tool_rounds: u32,
    active_turns: Arc<Mutex<HashSet<String>>>,
}

impl AgentRuntime {
    pub fn new(
        invoker: ResilientInvoker,
        tools: ToolRegistry,
        checkpoints: Arc<dyn CheckpointRepository>,
        memory: Arc<dyn MemoryStore>,
        sink: Arc<dyn AuditSink>,
        system_prompt: impl Into<String>,
        max_tool_rounds: u32,
    ) -> Self {
        Self {
            invoker,
            tools: Arc::new(tools),
            checkpoints,
            memory,
            sink,
            system_prompt: system_prompt.into(),
            max_tool_rounds,
            active_turns: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Production wiring: SQL checkpoints, HTTP model client, the bundled
    /// `search` tool, and the memory mode selected in configuration.
    pub fn from_config(config: &AppConfig, pool: DbPool) -> Result<Self, ApplicationError> {
        let sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

        let registry = Arc::new(ModelRegistry::new(config.llm.models.clone())?);
        let client = HttpLlmClient::from_config(&config.llm, Arc::clone(&sink))
            .map_err(|error| ApplicationError::Configuration(format!("llm client: {error}")))?;
        let invoker = ResilientInvoker::new(
            Arc::new(client),
            registry,
            RetryPolicy {
                max_attempts: config.agent.max_attempts_per_model,
                base_delay_ms: config.agent.retry_base_delay_ms,
            },
        );

        let mut tools = ToolRegistry::default();
        tools.register(SearchTool::new(reqwest::Client::new()));

        let memory: Arc<dyn MemoryStore> = match config.memory.mode {
            MemoryMode::Disabled => Arc::new(NoopMemoryStore),
            MemoryMode::InProcess => Arc::new(InMemoryMemoryStore::default()),
        };

        Ok(Self::new(
            invoker,
            tools,
            Arc::new(SqlCheckpointRepository::new(pool)),
            memory,
            sink,
            config.agent.system_prompt.clone(),
            config.agent.max_tool_rounds,
        ))
    }

    pub fn registry(&self) -> &ModelRegistry {
        self.invoker.registry()
    }

    /// Runs one full turn and returns the final assistant message.
    pub async fn handle_message(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        text: &str,
    ) -> Result<Message, TurnError> {
        let correlation_id = Uuid::new_v4().to_string();
        let _permit = self.acquire_turn(conversation_id)?;

        let mut state = self.load_or_create(conversation_id, user_id).await?;
        self.settle_pending_tool_round(&mut state, &correlation_id).await?;

        state.append(Message::user(text));
        state.cursor = TurnCursor::Chat;
        self.checkpoint(&mut state, &correlation_id, "user_message_appended").await?;

        match self.run_chat_loop(&mut state, &correlation_id).await {
            Ok(message) => {
                self.store_memory_in_background(user_id, text);
                self.note_turn_finished(&state, &correlation_id, None);
                Ok(message)
            }
            Err(error) => {
                self.note_turn_finished(&state, &correlation_id, Some(&error));
                Err(error)
            }
        }
    }

    /// Streaming variant of `handle_message`. The receiver yields tokens as
    /// they arrive and is always terminated by `Completed` or `Failed`; a new
    /// call starts a fresh turn. Dropping the receiver cancels forwarding: a
    /// reply that was not yet finalized is discarded, one that was is still
    /// checkpointed.
    pub async fn handle_message_stream(
        self: Arc<Self>,
        conversation_id: &ConversationId,
        user_id: &UserId,
        text: &str,
    ) -> Result<mpsc::Receiver<TurnEvent>, TurnError> {
        let correlation_id = Uuid::new_v4().to_string();
        let permit = self.acquire_turn(conversation_id)?;

        let mut state = self.load_or_create(conversation_id, user_id).await?;
        self.settle_pending_tool_round(&mut state, &correlation_id).await?;

        state.append(Message::user(text));
        state.cursor = TurnCursor::Chat;
        self.checkpoint(&mut state, &correlation_id, "user_message_appended").await?;

        let (events_tx, events_rx) = mpsc::channel(TURN_EVENT_CAPACITY);
        let user_id = user_id.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            let _permit = permit;
            self.drive_stream_turn(state, correlation_id, user_id, text, events_tx).await;
        });

        Ok(events_rx)
    }

    pub async fn get_history(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, TurnError> {
        Ok(self
            .checkpoints
            .load(conversation_id)
            .await?
            .map(|state| state.messages)
            .unwrap_or_default())
    }

    /// Resets the stored history. Clearing an unknown or already-cleared
    /// conversation succeeds.
    pub async fn clear_history(&self, conversation_id: &ConversationId) -> Result<(), TurnError> {
        let _permit = self.acquire_turn(conversation_id)?;
        self.checkpoints.clear(conversation_id).await?;

        self.sink.emit(AuditEvent::new(
            Some(conversation_id.clone()),
            Uuid::new_v4().to_string(),
            "agent.turn.history_cleared",
            AuditCategory::Persistence,
            "agent-runtime",
            AuditOutcome::Success,
        ));
        Ok(())
    }

    async fn run_chat_loop(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
    ) -> Result<Message, TurnError> {
        let mut rounds = 0_u32;

        loop {
            let request = self.build_invocation_request(state, correlation_id).await;

            let success = match self.invoker.invoke(&request, None).await {
                Ok(success) => success,
                Err(error) => return Err(self.fail_turn(state, correlation_id, error).await),
            };

            let reply = success.reply;
            if reply.tool_calls.is_empty() {
                let message = reply.into_message();
                state.append(message.clone());
                state.cursor = TurnCursor::Chat;
                self.checkpoint(state, correlation_id, "assistant_reply_appended").await?;
                return Ok(message);
            }

            // The over-cap request is dropped rather than appended so the
            // history holds exactly `max_tool_rounds` request/result rounds.
            if rounds >= self.max_tool_rounds {
                warn!(
                    event_name = "agent.turn.loop_limit_reached",
                    conversation_id = %state.id.0,
                    rounds,
                    "model kept requesting tools past the round cap"
                );
                return Err(TurnError::LoopLimitExceeded { rounds });
            }
            rounds += 1;

            state.append(reply.into_message());
            state.cursor = TurnCursor::ToolCall;
            self.checkpoint(state, correlation_id, "tool_calls_requested").await?;

            self.run_tool_round(state, correlation_id).await?;
        }
    }

    async fn drive_stream_turn(
        &self,
        mut state: ConversationState,
        correlation_id: String,
        user_id: UserId,
        text: String,
        events_tx: mpsc::Sender<TurnEvent>,
    ) {
        let mut rounds = 0_u32;

        loop {
            let request = self.build_invocation_request(&state, &correlation_id).await;

            let mut stream = match self.invoker.invoke_stream(&request, None).await {
                Ok(stream) => stream,
                Err(error) => {
                    let error = TurnError::from(error);
                    self.append_failure_marker(&mut state, &correlation_id, &error).await;
                    self.note_turn_finished(&state, &correlation_id, Some(&error));
                    let _ = events_tx
                        .send(TurnEvent::Failed { message: user_facing(error, &correlation_id) })
                        .await;
                    return;
                }
            };

            let reply = loop {
                match stream.events.recv().await {
                    Some(StreamEvent::Token(token)) => {
                        if events_tx.send(TurnEvent::Token(token)).await.is_err() {
                            // Receiver gone before the reply finalized: drop
                            // the partial reply, keep the last checkpoint.
                            debug!(
                                event_name = "agent.turn.stream_cancelled",
                                conversation_id = %state.id.0,
                                "caller went away mid-stream, discarding unfinalized reply"
                            );
                            return;
                        }
                    }
                    Some(StreamEvent::Completed(reply)) => break reply,
                    Some(StreamEvent::Failed(failure)) => {
                        self.finish_failed_stream(&mut state, &correlation_id, failure, &events_tx)
                            .await;
                        return;
                    }
                    None => {
                        let failure =
                            InvocationFailure::transient("stream closed without completing");
                        self.finish_failed_stream(&mut state, &correlation_id, failure, &events_tx)
                            .await;
                        return;
                    }
                }
            };

            // Reply finalized: it is checkpointed whether or not the caller
            // is still listening.
            if reply.tool_calls.is_empty() {
                let message = reply.into_message();
                state.append(message.clone());
                state.cursor = TurnCursor::Chat;
                if let Err(error) =
                    self.checkpoint(&mut state, &correlation_id, "assistant_reply_appended").await
                {
                    self.note_turn_finished(&state, &correlation_id, Some(&error));
                    let _ = events_tx
                        .send(TurnEvent::Failed { message: user_facing(error, &correlation_id) })
                        .await;
                    return;
                }

                self.store_memory_in_background(&user_id, &text);
                self.note_turn_finished(&state, &correlation_id, None);
                let _ = events_tx.send(TurnEvent::Completed(message)).await;
                return;
            }

            if rounds >= self.max_tool_rounds {
                let error = TurnError::LoopLimitExceeded { rounds };
                warn!(
                    event_name = "agent.turn.loop_limit_reached",
                    conversation_id = %state.id.0,
                    rounds,
                    "model kept requesting tools past the round cap"
                );
                self.note_turn_finished(&state, &correlation_id, Some(&error));
                let _ = events_tx
                    .send(TurnEvent::Failed { message: user_facing(error, &correlation_id) })
                    .await;
                return;
            }
            rounds += 1;

            state.append(reply.into_message());
            state.cursor = TurnCursor::ToolCall;
            let checkpointed =
                self.checkpoint(&mut state, &correlation_id, "tool_calls_requested").await;
            let settled = match checkpointed {
                Ok(()) => self.run_tool_round(&mut state, &correlation_id).await,
                Err(error) => Err(error),
            };

            if let Err(error) = settled {
                self.note_turn_finished(&state, &correlation_id, Some(&error));
                let _ = events_tx
                    .send(TurnEvent::Failed { message: user_facing(error, &correlation_id) })
                    .await;
                return;
            }
        }
    }

    /// Executes the pending tool calls, appends their results in request
    /// order, and hands the cursor back to `chat`.
    async fn run_tool_round(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
    ) -> Result<(), TurnError> {
        let calls = state.pending_tool_calls().to_vec();
        let outcomes = execute_in_request_order(&self.tools, calls).await;

        for outcome in outcomes {
            state.append(outcome.into_message());
        }
        state.cursor = TurnCursor::Chat;
        self.checkpoint(state, correlation_id, "tool_results_appended").await
    }

    /// A checkpoint with cursor `tool_call` means the process died between
    /// requesting tools and recording their results. Settle that round first
    /// so the model sees a well-formed history.
    async fn settle_pending_tool_round(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
    ) -> Result<(), TurnError> {
        if state.cursor != TurnCursor::ToolCall {
            return Ok(());
        }

        info!(
            event_name = "agent.turn.tool_round_resumed",
            conversation_id = %state.id.0,
            "resuming interrupted tool round from checkpoint"
        );
        self.run_tool_round(state, correlation_id).await
    }

    async fn build_invocation_request(
        &self,
        state: &ConversationState,
        correlation_id: &str,
    ) -> InvocationRequest {
        let query = last_user_text(state);
        let memory_block = match self.memory.retrieve(&state.user_id, query).await {
            Ok(snippets) => format_memory_block(&snippets),
            Err(error) => {
                debug!(
                    event_name = "agent.memory.retrieve_failed",
                    error = %error,
                    "memory retrieval failed, continuing without it"
                );
                format_memory_block(&[])
            }
        };

        InvocationRequest {
            conversation_id: state.id.clone(),
            correlation_id: correlation_id.to_string(),
            system_prompt: format!(
                "{}\n\nRelevant long-term memory:\n{}",
                self.system_prompt, memory_block
            ),
            messages: state.messages.clone(),
            tools: self.tools.descriptors(),
        }
    }

    async fn fail_turn(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
        error: InvokeError,
    ) -> TurnError {
        let error = TurnError::from(error);
        self.append_failure_marker(state, correlation_id, &error).await;
        error
    }

    /// Exhaustion leaves a marker in history so the failed attempt is
    /// visible on resume; a fatal failure leaves the history as last
    /// checkpointed.
    async fn append_failure_marker(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
        error: &TurnError,
    ) {
        if !matches!(error, TurnError::Exhausted(_)) {
            return;
        }

        state.append(Message::assistant(EXHAUSTION_MARKER));
        state.cursor = TurnCursor::Chat;
        if let Err(save_error) =
            self.checkpoint(state, correlation_id, "exhaustion_marker_appended").await
        {
            warn!(
                event_name = "agent.turn.checkpoint_failed",
                conversation_id = %state.id.0,
                error = %save_error,
                "could not checkpoint the exhaustion marker"
            );
        }
    }

    async fn finish_failed_stream(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
        failure: InvocationFailure,
        events_tx: &mpsc::Sender<TurnEvent>,
    ) {
        warn!(
            event_name = "agent.turn.stream_failed",
            conversation_id = %state.id.0,
            class = failure.class.as_str(),
            error = %failure,
            "provider failed after the stream opened"
        );

        state.append(Message::assistant(STREAM_FAILURE_MARKER));
        state.cursor = TurnCursor::Chat;
        if let Err(save_error) =
            self.checkpoint(state, correlation_id, "stream_failure_marker_appended").await
        {
            warn!(
                event_name = "agent.turn.checkpoint_failed",
                conversation_id = %state.id.0,
                error = %save_error,
                "could not checkpoint the stream failure marker"
            );
        }

        let message = ApplicationError::Provider(failure.to_string())
            .into_interface(correlation_id)
            .user_message()
            .to_string();
        self.sink.emit(
            AuditEvent::new(
                Some(state.id.clone()),
                correlation_id,
                "agent.turn.failed",
                AuditCategory::Turn,
                "agent-runtime",
                AuditOutcome::Failed,
            )
            .with_metadata("error", failure.to_string()),
        );
        let _ = events_tx.send(TurnEvent::Failed { message }).await;
    }

    async fn load_or_create(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<ConversationState, TurnError> {
        match self.checkpoints.load(conversation_id).await? {
            Some(state) => Ok(state),
            None => Ok(ConversationState::new(conversation_id.clone(), user_id.clone())),
        }
    }

    /// Bumps the version and persists. Every state-machine transition funnels
    /// through here before control returns to the caller of that transition.
    async fn checkpoint(
        &self,
        state: &mut ConversationState,
        correlation_id: &str,
        transition: &str,
    ) -> Result<(), TurnError> {
        state.version += 1;
        self.checkpoints.save(state).await?;

        self.sink.emit(
            AuditEvent::new(
                Some(state.id.clone()),
                correlation_id,
                "agent.turn.transition_applied",
                AuditCategory::Turn,
                "agent-runtime",
                AuditOutcome::Success,
            )
            .with_metadata("transition", transition)
            .with_metadata("cursor", state.cursor.as_str())
            .with_metadata("version", state.version.to_string()),
        );
        Ok(())
    }

    fn store_memory_in_background(&self, user_id: &UserId, text: &str) {
        let memory = Arc::clone(&self.memory);
        let user_id = user_id.clone();
        let text = text.to_string();

        tokio::spawn(async move {
            if let Err(error) = memory.store(&user_id, &text).await {
                debug!(
                    event_name = "agent.memory.store_failed",
                    error = %error,
                    "background memory write failed"
                );
            }
        });
    }

    fn note_turn_finished(
        &self,
        state: &ConversationState,
        correlation_id: &str,
        error: Option<&TurnError>,
    ) {
        let (event_type, outcome) = match error {
            None => ("agent.turn.completed", AuditOutcome::Success),
            Some(_) => ("agent.turn.failed", AuditOutcome::Failed),
        };

        let mut event = AuditEvent::new(
            Some(state.id.clone()),
            correlation_id,
            event_type,
            AuditCategory::Turn,
            "agent-runtime",
            outcome,
        )
        .with_metadata("history_len", state.messages.len().to_string());

        if let Some(error) = error {
            event = event.with_metadata("error", error.to_string());
        }

        self.sink.emit(event);
    }

    fn acquire_turn(&self, conversation_id: &ConversationId) -> Result<TurnPermit, TurnError> {
        let mut active = lock_unpoisoned(&self.active_turns);
        if !active.insert(conversation_id.0.clone()) {
            return Err(TurnError::TurnInProgress { conversation_id: conversation_id.0.clone() });
        }

        Ok(TurnPermit {
            conversation_id: conversation_id.0.clone(),
            active_turns: Arc::clone(&self.active_turns),
        })
    }
}

/// Membership in the set marks a conversation's turn as in flight; dropping
/// the permit releases it, including on early return.
struct TurnPermit {
    conversation_id: String,
    active_turns: Arc<Mutex<HashSet<String>>>,
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        lock_unpoisoned(&self.active_turns).remove(&self.conversation_id);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs requested calls concurrently but appends outcomes by request index,
/// not completion order.
async fn execute_in_request_order(
    tools: &Arc<ToolRegistry>,
    calls: Vec<ToolCallRequest>,
) -> Vec<ToolCallOutcome> {
    let mut handles = Vec::with_capacity(calls.len());
    for call in calls {
        let tools = Arc::clone(tools);
        let call_id = call.id.clone();
        let tool_name = call.name.clone();
        let handle = tokio::spawn(async move { tools.execute_call(&call).await });
        handles.push((call_id, tool_name, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (call_id, tool_name, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                warn!(
                    event_name = "agent.tool.task_aborted",
                    tool = %tool_name,
                    error = %join_error,
                    "tool task aborted before producing an outcome"
                );
                ToolCallOutcome::failure(
                    call_id,
                    tool_name.clone(),
                    ToolError::Execution {
                        tool: tool_name,
                        reason: "tool task aborted".to_string(),
                    },
                )
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

fn user_facing(error: TurnError, correlation_id: &str) -> String {
    ApplicationError::from(error).into_interface(correlation_id).user_message().to_string()
}

fn last_user_text(state: &ConversationState) -> &str {
    state
        .messages
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::User)
        .map(|message| message.content.as_str())
        .unwrap_or("")
}
