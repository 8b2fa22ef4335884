use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use banter_core::domain::model::{ModelConfig, ModelName};
use banter_core::registry::ModelRegistry;
use banter_core::retry::{FailureClass, RetryPolicy};

use crate::llm::{AssistantReply, InvocationFailure, InvocationRequest, LlmClient, StreamEvent};

/// Final record for one model's slice of a failed cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    pub model: ModelName,
    pub attempts: u32,
    pub last_class: FailureClass,
    pub last_message: String,
}

/// Every model in the registry burned its full attempt budget.
#[derive(Clone, Debug)]
pub struct RegistryExhaustion {
    pub attempts: Vec<AttemptRecord>,
}

impl fmt::Display for RegistryExhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self
            .attempts
            .iter()
            .map(|record| format!("{} ({})", record.model, record.last_class.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "every model failed a full retry cycle: {summary}")
    }
}

impl std::error::Error for RegistryExhaustion {}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("fatal failure from `{model}`: {failure}")]
    Fatal { model: ModelName, failure: InvocationFailure },
    #[error(transparent)]
    Exhausted(#[from] RegistryExhaustion),
}

/// A successful invocation and the model that produced it.
#[derive(Clone, Debug)]
pub struct InvocationSuccess {
    pub model: ModelName,
    pub reply: AssistantReply,
}

/// An opened stream and the model serving it.
pub struct StreamSuccess {
    pub model: ModelName,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Wraps a single-call client with per-model retry and registry-order
/// fallback.
///
/// Traversal starts at the preferred model (registry order position), gives
/// each model its own attempt budget with exponential backoff between
/// retryable failures, and wraps modulo the registry until every model has
/// been tried. A fatal classification aborts the whole cycle immediately:
/// a bad request will not get better by waiting or switching models.
pub struct ResilientInvoker {
    client: Arc<dyn LlmClient>,
    registry: Arc<ModelRegistry>,
    policy: RetryPolicy,
}

impl ResilientInvoker {
    pub fn new(client: Arc<dyn LlmClient>, registry: Arc<ModelRegistry>, policy: RetryPolicy) -> Self {
        Self { client, registry, policy }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub async fn invoke(
        &self,
        request: &InvocationRequest,
        preferred_model: Option<&ModelName>,
    ) -> Result<InvocationSuccess, InvokeError> {
        let mut records = Vec::with_capacity(self.registry.len());

        for model in self.traversal(preferred_model) {
            match self.attempt_model(model, request).await {
                ModelOutcome::Success(reply) => {
                    return Ok(InvocationSuccess { model: model.name.clone(), reply });
                }
                ModelOutcome::Fatal(failure) => {
                    return Err(InvokeError::Fatal { model: model.name.clone(), failure });
                }
                ModelOutcome::BudgetSpent(record) => {
                    info!(
                        event_name = "agent.invoker.model_advanced",
                        model = %record.model,
                        attempts = record.attempts,
                        last_class = record.last_class.as_str(),
                        "model exhausted its attempt budget, advancing"
                    );
                    records.push(record);
                }
            }
        }

        Err(RegistryExhaustion { attempts: records }.into())
    }

    /// Streaming variant: the retry budget covers opening the stream. Once a
    /// receiver comes back, mid-stream failures are terminal for the turn and
    /// are delivered in-band.
    pub async fn invoke_stream(
        &self,
        request: &InvocationRequest,
        preferred_model: Option<&ModelName>,
    ) -> Result<StreamSuccess, InvokeError> {
        let mut records = Vec::with_capacity(self.registry.len());

        for model in self.traversal(preferred_model) {
            let mut last_failure: Option<InvocationFailure> = None;

            for attempt in 1..=self.policy.max_attempts {
                match self.client.invoke_stream(model, request).await {
                    Ok(events) => {
                        return Ok(StreamSuccess { model: model.name.clone(), events });
                    }
                    Err(failure) if failure.class == FailureClass::Fatal => {
                        return Err(InvokeError::Fatal { model: model.name.clone(), failure });
                    }
                    Err(failure) => {
                        self.note_failed_attempt(model, attempt, &failure).await;
                        last_failure = Some(failure);
                    }
                }
            }

            records.push(budget_record(model, self.policy.max_attempts, last_failure));
        }

        Err(RegistryExhaustion { attempts: records }.into())
    }

    fn traversal(&self, preferred_model: Option<&ModelName>) -> impl Iterator<Item = &ModelConfig> {
        let models = self.registry.list_models();
        let start = preferred_model
            .and_then(|name| self.registry.position_of(name))
            .unwrap_or(0);

        (0..models.len()).map(move |offset| &models[(start + offset) % models.len()])
    }

    async fn attempt_model(
        &self,
        model: &ModelConfig,
        request: &InvocationRequest,
    ) -> ModelOutcome {
        let mut last_failure: Option<InvocationFailure> = None;

        for attempt in 1..=self.policy.max_attempts {
            match self.client.invoke(model, request).await {
                Ok(reply) => return ModelOutcome::Success(reply),
                Err(failure) if failure.class == FailureClass::Fatal => {
                    return ModelOutcome::Fatal(failure);
                }
                Err(failure) => {
                    self.note_failed_attempt(model, attempt, &failure).await;
                    last_failure = Some(failure);
                }
            }
        }

        ModelOutcome::BudgetSpent(budget_record(model, self.policy.max_attempts, last_failure))
    }

    async fn note_failed_attempt(
        &self,
        model: &ModelConfig,
        attempt: u32,
        failure: &InvocationFailure,
    ) {
        warn!(
            event_name = "agent.invoker.attempt_failed",
            model = %model.name,
            attempt,
            class = failure.class.as_str(),
            error = %failure,
            "invocation attempt failed"
        );

        tokio::time::sleep(self.policy.backoff(attempt)).await;
    }
}

enum ModelOutcome {
    Success(AssistantReply),
    Fatal(InvocationFailure),
    BudgetSpent(AttemptRecord),
}

fn budget_record(
    model: &ModelConfig,
    attempts: u32,
    last_failure: Option<InvocationFailure>,
) -> AttemptRecord {
    let (last_class, last_message) = match last_failure {
        Some(failure) => (failure.class, failure.message),
        None => (FailureClass::Transient, "no attempt recorded".to_string()),
    };

    AttemptRecord { model: model.name.clone(), attempts, last_class, last_message }
}
