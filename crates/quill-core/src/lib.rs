// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The quill agent execution core.
//!
//! Given a user query, a system prompt, a tool registry, and a model
//! provider, the core issues model requests, folds the streamed response
//! into coherent messages and tool invocations while screening for
//! pathological output, dispatches tool calls, and applies a layered
//! retry / compensation / compaction policy until a terminal text response
//! is produced or a failure budget is exhausted.

mod agent;
mod compact;
mod dispatch;
mod error;
mod events;
mod input;
mod session;
mod stream;
#[cfg(test)]
mod tests;
mod validator;

pub use agent::{
    AbortHandle, Agent, ExecutionOutcome, RecordingSleeper, Sleeper, TokioSleeper,
};
pub use dispatch::{redact_sensitive, DispatchedResult, ToolDispatcher};
pub use error::{
    AgentError, Failure, CODE_MAX_LOOPS, CODE_MAX_RETRIES, CODE_RESPONSE_INVALID,
    CODE_UNEXPECTED, SANITIZED_UNEXPECTED,
};
pub use events::{AgentEvent, AgentStatus};
pub use input::{parts_from_json, validate_input, InputError, UserInput, MAX_QUERY_LENGTH};
pub use session::{interrupted_tool_result_content, Session, SessionError};
pub use stream::{SnapshotSink, StreamProcessor, DEFAULT_MAX_BUFFER_SIZE};
pub use validator::{
    sanitize_content, Recovery, RecoveryStrategy, ResponseValidator, TurnView, ValidationResult,
    ViolationAction, ViolationType,
};
