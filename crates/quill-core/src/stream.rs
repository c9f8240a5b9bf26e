// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Chunk-stream assembly.
//!
//! [`StreamProcessor`] folds an incremental chunk sequence into one
//! assembled assistant turn.  It is a straight-line state machine driven by
//! an external producer; suspension happens only at the producer boundary,
//! never inside a state mutation.  Ordering is enforced structurally:
//! reasoning completes before text starts, and both complete before the
//! first tool-call delta is recorded.

use std::collections::BTreeMap;
use std::sync::Arc;

use quill_config::ValidatorConfig;
use quill_memory::MemoryManager;
use quill_model::{Chunk, FinishReason, FunctionCall, Message, MessageContent, MessageType, Role,
    ToolCall, ToolCallDelta, Usage};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::AgentError,
    events::AgentEvent,
    validator::{sanitize_content, Recovery, RecoveryStrategy, ResponseValidator, TurnView},
};

/// Default cap on each of the reasoning and content buffers.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1 << 20;

pub const ABORT_BUFFER_OVERFLOW: &str = "buffer_overflow";
pub const ABORT_VALIDATION: &str = "validation_violation";

/// Persists partial assistant snapshots while a turn streams.
///
/// Failures are logged and swallowed; streaming must never stall on the
/// persistence backend.
pub struct SnapshotSink {
    memory: Arc<dyn MemoryManager>,
    session_id: String,
}

impl SnapshotSink {
    pub fn new(memory: Arc<dyn MemoryManager>, session_id: impl Into<String>) -> Self {
        Self {
            memory,
            session_id: session_id.into(),
        }
    }

    async fn persist(&self, msg: &Message) {
        if let Err(e) = self
            .memory
            .update_message_in_context(&self.session_id, msg)
            .await
        {
            warn!(error = %e, "failed to persist partial message snapshot");
        }
    }
}

/// Single-consumer state machine folding chunks into one assistant turn.
pub struct StreamProcessor {
    message_id: String,
    reasoning_buffer: String,
    content_buffer: String,
    tool_calls: BTreeMap<u32, ToolCall>,

    meta_id: Option<String>,
    meta_model: Option<String>,
    meta_created: Option<i64>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,

    aborted: bool,
    abort_reason: Option<&'static str>,
    /// Set by partial recovery: stop consuming, the turn is complete.
    finished: bool,
    reasoning_started: bool,
    reasoning_completed: bool,
    text_started: bool,
    text_completed: bool,
    tool_calls_started: bool,

    max_buffer_size: usize,
    validator: ResponseValidator,
    recovery: Recovery,
    violations_handled: u32,
    compaction_pressure: bool,

    tx: mpsc::Sender<AgentEvent>,
    snapshots: Option<SnapshotSink>,
}

impl StreamProcessor {
    pub fn new(
        validator_cfg: &ValidatorConfig,
        tx: mpsc::Sender<AgentEvent>,
        snapshots: Option<SnapshotSink>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            reasoning_buffer: String::new(),
            content_buffer: String::new(),
            tool_calls: BTreeMap::new(),
            meta_id: None,
            meta_model: None,
            meta_created: None,
            finish_reason: None,
            usage: None,
            aborted: false,
            abort_reason: None,
            finished: false,
            reasoning_started: false,
            reasoning_completed: false,
            text_started: false,
            text_completed: false,
            tool_calls_started: false,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            validator: ResponseValidator::new(validator_cfg.clone()),
            recovery: Recovery::new(validator_cfg),
            violations_handled: 0,
            compaction_pressure: false,
            tx,
            snapshots,
        }
    }

    /// Shrink the buffer cap (tests exercise the overflow path with it).
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Tell the recovery policy whether the session is near its token budget.
    pub fn set_compaction_pressure(&mut self, pressure: bool) {
        self.compaction_pressure = pressure;
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn abort_reason(&self) -> Option<&'static str> {
        self.abort_reason
    }

    /// Whether partial recovery closed the turn early.
    pub fn finished_early(&self) -> bool {
        self.finished
    }

    /// Fold one chunk into the turn.
    ///
    /// Returns `Err(AgentError::ContextCompression)` when the recovery
    /// policy asks the loop to compact and retry; every other condition is
    /// absorbed into the turn state.
    pub async fn process_chunk(&mut self, chunk: &Chunk) -> Result<(), AgentError> {
        if self.aborted || self.finished {
            return Ok(());
        }

        if let Some(id) = &chunk.id {
            self.meta_id = Some(id.clone());
        }
        if let Some(model) = &chunk.model {
            self.meta_model = Some(model.clone());
        }
        if let Some(created) = chunk.created {
            self.meta_created = Some(created);
        }
        if let Some(usage) = &chunk.usage {
            self.usage.get_or_insert_with(Usage::default).add(usage);
            let _ = self.tx.send(AgentEvent::UsageUpdate(*usage)).await;
        }

        let Some(choice) = chunk.choices.first() else {
            return Ok(());
        };
        if let Some(fr) = choice.finish_reason {
            self.finish_reason = Some(fr);
        }
        let delta = choice.delta.clone();

        if let Some(reasoning) = delta.reasoning_content.as_deref() {
            if !reasoning.is_empty() {
                self.append_reasoning(reasoning).await;
            }
        }
        if self.aborted {
            return Ok(());
        }

        if let Some(text) = delta.content.as_deref() {
            if !text.is_empty() {
                self.append_text(text).await?;
            }
        }
        if self.aborted || self.finished {
            return Ok(());
        }

        if let Some(tool_deltas) = &delta.tool_calls {
            if !tool_deltas.is_empty() {
                self.append_tool_calls(tool_deltas).await;
            }
        }

        // A finish_reason (with or without payload) closes whatever is still
        // open and persists a final snapshot.
        if choice.finish_reason.is_some() {
            self.complete_open_sections().await;
            self.persist_snapshot().await;
        }

        Ok(())
    }

    /// Close any open sections after the producer runs dry.
    pub async fn finalize(&mut self) {
        if self.aborted {
            return;
        }
        self.complete_open_sections().await;
        self.persist_snapshot().await;
    }

    async fn append_reasoning(&mut self, delta: &str) {
        if self.overflows(self.reasoning_buffer.len(), delta.len()) {
            self.abort(ABORT_BUFFER_OVERFLOW);
            return;
        }
        if !self.reasoning_started {
            self.reasoning_started = true;
            let _ = self
                .tx
                .send(AgentEvent::ReasoningStart {
                    message_id: self.message_id.clone(),
                })
                .await;
        }
        self.reasoning_buffer.push_str(delta);
        let _ = self
            .tx
            .send(AgentEvent::ReasoningDelta(delta.to_string()))
            .await;
        self.persist_snapshot().await;
    }

    async fn append_text(&mut self, delta: &str) -> Result<(), AgentError> {
        // Reasoning precedes content: entering text closes an open block.
        if self.reasoning_started && !self.reasoning_completed {
            self.complete_reasoning().await;
        }
        if self.overflows(self.content_buffer.len(), delta.len()) {
            self.abort(ABORT_BUFFER_OVERFLOW);
            return Ok(());
        }
        if !self.text_started {
            self.text_started = true;
            let _ = self
                .tx
                .send(AgentEvent::TextStart {
                    message_id: self.message_id.clone(),
                })
                .await;
        }
        self.content_buffer.push_str(delta);
        let _ = self.tx.send(AgentEvent::TextDelta(delta.to_string())).await;
        self.persist_snapshot().await;

        if let Some(result) = self.validator.validate_incremental(&self.content_buffer) {
            if !result.valid {
                self.handle_violation(result).await?;
            }
        }
        Ok(())
    }

    async fn append_tool_calls(&mut self, deltas: &[ToolCallDelta]) {
        if !self.tool_calls_started {
            // Entering tool-call state closes open reasoning and text.
            if self.reasoning_started && !self.reasoning_completed {
                self.complete_reasoning().await;
            }
            if self.text_started && !self.text_completed {
                self.complete_text().await;
            }
            self.tool_calls_started = true;
        }

        for delta in deltas {
            match self.tool_calls.get_mut(&delta.index) {
                None => {
                    let created = ToolCall {
                        id: delta.id.clone().unwrap_or_default(),
                        kind: delta.kind.clone().unwrap_or_else(|| "function".into()),
                        index: delta.index,
                        function: FunctionCall {
                            name: delta
                                .function
                                .as_ref()
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default(),
                            arguments: delta
                                .function
                                .as_ref()
                                .and_then(|f| f.arguments.clone())
                                .unwrap_or_default(),
                        },
                    };
                    let _ = self
                        .tx
                        .send(AgentEvent::ToolCallCreated {
                            message_id: self.message_id.clone(),
                            tool_call: created.clone(),
                            content: self.content_buffer.clone(),
                        })
                        .await;
                    self.tool_calls.insert(delta.index, created);
                }
                Some(existing) => {
                    // id and name replace; arguments concatenate because the
                    // argument JSON streams character-wise.
                    if let Some(id) = &delta.id {
                        if !id.is_empty() {
                            existing.id = id.clone();
                        }
                    }
                    if let Some(f) = &delta.function {
                        if let Some(name) = &f.name {
                            if !name.is_empty() {
                                existing.function.name = name.clone();
                            }
                        }
                        if let Some(args) = &f.arguments {
                            existing.function.arguments.push_str(args);
                        }
                    }
                }
            }
        }
        self.persist_snapshot().await;
    }

    async fn handle_violation(
        &mut self,
        result: crate::validator::ValidationResult,
    ) -> Result<(), AgentError> {
        let window = self.validator.config().check_window_size;
        let turn = TurnView {
            clean_prefix_len: self.content_buffer.len().saturating_sub(window),
            has_incomplete_tool_calls: self
                .tool_calls
                .values()
                .any(|tc| !tc.arguments_complete()),
            compaction_pressure: self.compaction_pressure,
            prior_violations: self.violations_handled,
        };
        self.violations_handled += 1;
        match self.recovery.decide(&result, &turn) {
            RecoveryStrategy::WarnOnly => {
                warn!(patterns = ?result.detected_patterns, "validation warning (continuing)");
            }
            RecoveryStrategy::PartialRecover => {
                warn!(
                    patterns = ?result.detected_patterns,
                    kept_chars = turn.clean_prefix_len,
                    "recovering partial response after validation violation"
                );
                self.content_buffer = sanitize_content(&self.content_buffer);
                self.tool_calls.retain(|_, tc| tc.arguments_complete());
                self.complete_open_sections().await;
                self.finished = true;
                self.finish_reason = Some(FinishReason::Stop);
                self.persist_snapshot().await;
            }
            RecoveryStrategy::CompactRetry => {
                return Err(AgentError::ContextCompression(format!(
                    "validation violation under context pressure: {:?}",
                    result.detected_patterns
                )));
            }
            RecoveryStrategy::Abort => {
                self.aborted = true;
                self.abort_reason = Some(ABORT_VALIDATION);
                let _ = self
                    .tx
                    .send(AgentEvent::ValidationViolation(result))
                    .await;
            }
        }
        Ok(())
    }

    async fn complete_open_sections(&mut self) {
        if self.reasoning_started && !self.reasoning_completed {
            self.complete_reasoning().await;
        }
        if self.text_started && !self.text_completed {
            self.complete_text().await;
        }
    }

    async fn complete_reasoning(&mut self) {
        self.reasoning_completed = true;
        let _ = self
            .tx
            .send(AgentEvent::ReasoningComplete(self.reasoning_buffer.clone()))
            .await;
    }

    async fn complete_text(&mut self) {
        self.text_completed = true;
        let _ = self
            .tx
            .send(AgentEvent::TextComplete(self.content_buffer.clone()))
            .await;
    }

    fn overflows(&self, current: usize, incoming: usize) -> bool {
        current + incoming > self.max_buffer_size
    }

    fn abort(&mut self, reason: &'static str) {
        warn!(reason, "stream aborted");
        self.aborted = true;
        self.abort_reason = Some(reason);
    }

    async fn persist_snapshot(&self) {
        if let Some(sink) = &self.snapshots {
            sink.persist(&self.assemble()).await;
        }
    }

    fn assemble(&self) -> Message {
        // Tool calls without a name cannot be dispatched; storing them would
        // corrupt the conversation sent back on the next turn.
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .values()
            .filter(|tc| {
                if tc.function.name.is_empty() {
                    warn!(tool_call_id = %tc.id, "dropping tool call with empty name");
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();
        let has_tools = !tool_calls.is_empty();
        Message {
            message_id: self.message_id.clone(),
            role: Role::Assistant,
            content: MessageContent::Text(self.content_buffer.clone()),
            reasoning_content: (!self.reasoning_buffer.is_empty())
                .then(|| self.reasoning_buffer.clone()),
            tool_calls: has_tools.then(|| tool_calls),
            tool_call_id: None,
            message_type: if has_tools {
                MessageType::ToolCall
            } else {
                MessageType::Text
            },
            finish_reason: self
                .finish_reason
                .or(has_tools.then_some(FinishReason::ToolCalls)),
            usage: self.usage,
            excluded_from_context: false,
            excluded_reason: None,
            meta: Default::default(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Assemble the final turn message.
    pub fn build_response(&self) -> Message {
        self.assemble()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
