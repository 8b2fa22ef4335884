//! Agent Runtime - resilient LLM invocation and conversation orchestration
//!
//! This crate is the "brain" of the banter service - the runtime that:
//! - Invokes chat-completion models with retry and cross-model fallback
//! - Alternates between asking the model and executing requested tools
//! - Checkpoints conversation state after every state-machine transition
//! - Streams partial tokens while keeping durable history consistent
//!
//! # Architecture
//!
//! A turn runs a constrained loop:
//! 1. **Model Invocation** (`llm`, `invoker`) - One HTTP call per attempt,
//!    classified failures, backoff and registry-order fallback on top
//! 2. **Tool Execution** (`tools`) - Schema-validated calls whose failures
//!    come back as structured payloads the model can read
//! 3. **State Machine** (`runtime`) - chat ↔ tool_call transitions, each
//!    one checkpointed before control returns
//! 4. **Memory** (`memory`) - Recalled snippets injected into the system
//!    prompt; new facts stored off the critical path
//!
//! # Key Types
//!
//! - `AgentRuntime` - Turn orchestrator (see `runtime` module)
//! - `LlmClient` - Pluggable trait for OpenAI-compatible providers
//! - `ResilientInvoker` - Retry/fallback policy around any `LlmClient`
//!
//! # Resilience Principle
//!
//! Failures are classified once, at the provider boundary. Retryable ones
//! are retried and escalated across the registry; fatal ones surface
//! immediately. The conversation is left checkpointable either way.

pub mod invoker;
pub mod llm;
pub mod memory;
pub mod runtime;
pub mod tools;
