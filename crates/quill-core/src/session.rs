// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The ordered message log and its invariants.
//!
//! Every mutation goes through [`Session`]; after each one the log satisfies:
//! tool-call closure (every assistant tool call is answered before the next
//! assistant message), append-only ordering (compaction excepted), the role
//! sequence rules, exclusion semantics, and process-lifetime uniqueness of
//! tool-call ids.  A persistence snapshot follows every mutation; backend
//! failures are logged and swallowed so the main flow never stalls on disk.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use quill_config::CompactionConfig;
use quill_memory::{CompactionRecord, MemoryError, MemoryManager};
use quill_model::{LlmProvider, Message, MessageMeta, MessageType, Role};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compact;

/// Content of the synthetic tool message that closes an interrupted call.
pub fn interrupted_tool_result_content() -> String {
    serde_json::json!({
        "error": "TOOL_CALL_INTERRUPTED",
        "interrupted": true,
    })
    .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("system message must be first and unique")]
    MisplacedSystem,
    #[error("assistant message appended while tool calls are unanswered: {missing:?}")]
    DanglingToolCalls { missing: Vec<String> },
    #[error("two consecutive assistant messages")]
    ConsecutiveAssistant,
    #[error("tool message answers no pending tool call: {0}")]
    OrphanToolResult(String),
    #[error("duplicate tool call id: {0}")]
    DuplicateToolCallId(String),
}

pub struct Session {
    id: String,
    system_prompt: String,
    messages: Vec<Message>,
    /// Approximate token count of the context sent to the model
    /// (excluded messages do not count).
    token_estimate: usize,
    version: u64,
    seen_tool_call_ids: HashSet<String>,
    compaction_records: Vec<CompactionRecord>,
    compaction: CompactionConfig,
    memory: Arc<dyn MemoryManager>,
}

impl Session {
    /// Create a fresh session (or re-open an existing record by id) and seed
    /// it with the system prompt.
    pub async fn new(
        memory: Arc<dyn MemoryManager>,
        system_prompt: impl Into<String>,
        session_id: Option<String>,
        compaction: CompactionConfig,
    ) -> Result<Self, MemoryError> {
        let record = memory.create_session(session_id).await?;
        let system_prompt = system_prompt.into();
        let mut session = Self {
            id: record.session_id,
            system_prompt: system_prompt.clone(),
            messages: Vec::new(),
            token_estimate: 0,
            version: 0,
            seen_tool_call_ids: HashSet::new(),
            compaction_records: Vec::new(),
            compaction,
            memory,
        };
        if !system_prompt.is_empty() {
            let msg = Message::system(system_prompt);
            session.token_estimate = msg.approx_tokens();
            session.messages.push(msg);
        }
        session.save_current_context().await;
        Ok(session)
    }

    /// Load a persisted session.  Call [`Session::repair_on_load`] before the
    /// next model request to close any interrupted tool calls.
    pub async fn load(
        memory: Arc<dyn MemoryManager>,
        session_id: &str,
        compaction: CompactionConfig,
    ) -> Result<Self, MemoryError> {
        let record = memory
            .get_session(session_id)
            .await?
            .ok_or_else(|| MemoryError::SessionNotFound(session_id.into()))?;
        let messages = memory.get_current_context(session_id).await?;
        let compaction_records = memory.get_compaction_records(session_id).await?;
        let system_prompt = messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.as_text())
            .unwrap_or_default();
        let seen_tool_call_ids = messages
            .iter()
            .flat_map(|m| m.tool_calls())
            .map(|tc| tc.id.clone())
            .collect();
        let token_estimate = estimate(&messages);
        Ok(Self {
            id: record.session_id,
            system_prompt,
            messages,
            token_estimate,
            version: record.version,
            seen_tool_call_ids,
            compaction_records,
            compaction,
            memory,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.memory
    }

    pub fn compaction_records(&self) -> &[CompactionRecord] {
        &self.compaction_records
    }

    /// All in-session messages regardless of exclusion.
    pub fn get_full_history(&self) -> &[Message] {
        &self.messages
    }

    /// The ordered message list sent to the model: excluded messages are
    /// filtered out.
    pub fn context_for_llm(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.excluded_from_context)
            .cloned()
            .collect()
    }

    /// Append a message, enforcing the log invariants.
    pub async fn append(&mut self, msg: Message) -> Result<(), SessionError> {
        self.check_invariants(&msg)?;
        for tc in msg.tool_calls() {
            self.seen_tool_call_ids.insert(tc.id.clone());
        }
        if !msg.excluded_from_context {
            self.token_estimate += msg.approx_tokens();
        }
        self.messages.push(msg);
        self.version += 1;
        self.save_current_context().await;
        Ok(())
    }

    fn check_invariants(&self, msg: &Message) -> Result<(), SessionError> {
        match msg.role {
            Role::System => {
                if !self.messages.is_empty() {
                    return Err(SessionError::MisplacedSystem);
                }
            }
            Role::Assistant => {
                let pending = self.pending_tool_call_ids();
                if !pending.is_empty() {
                    return Err(SessionError::DanglingToolCalls { missing: pending });
                }
                // Role sequencing applies to the context the model sees:
                // excluded messages are invisible, and a compaction summary
                // may directly precede a fresh assistant turn.
                if let Some(last) = self.messages.iter().rev().find(|m| !m.excluded_from_context)
                {
                    if last.role == Role::Assistant && !last.meta.compacted {
                        return Err(SessionError::ConsecutiveAssistant);
                    }
                }
                let mut fresh = HashSet::new();
                for tc in msg.tool_calls() {
                    if self.seen_tool_call_ids.contains(&tc.id) || !fresh.insert(tc.id.clone()) {
                        return Err(SessionError::DuplicateToolCallId(tc.id.clone()));
                    }
                }
            }
            Role::Tool => {
                let pending = self.pending_tool_call_ids();
                let id = msg.tool_call_id.clone().unwrap_or_default();
                if !pending.contains(&id) {
                    return Err(SessionError::OrphanToolResult(id));
                }
            }
            Role::User => {}
        }
        Ok(())
    }

    /// Tool-call ids of the trailing assistant message that are not yet
    /// answered by following tool messages.
    pub fn pending_tool_call_ids(&self) -> Vec<String> {
        let mut answered = HashSet::new();
        for msg in self.messages.iter().rev().filter(|m| !m.excluded_from_context) {
            match msg.role {
                Role::Tool => {
                    if let Some(id) = &msg.tool_call_id {
                        answered.insert(id.clone());
                    }
                }
                Role::Assistant => {
                    return msg
                        .tool_calls()
                        .iter()
                        .filter(|tc| !answered.contains(&tc.id))
                        .map(|tc| tc.id.clone())
                        .collect();
                }
                _ => return Vec::new(),
            }
        }
        Vec::new()
    }

    /// Hide a message from future model requests while keeping it in history.
    pub fn mark_excluded(&mut self, message_id: &str, reason: &str) -> bool {
        let Some(msg) = self
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
        else {
            return false;
        };
        if msg.excluded_from_context {
            return true;
        }
        msg.excluded_from_context = true;
        msg.excluded_reason = Some(reason.to_string());
        let tokens = msg.approx_tokens();
        self.token_estimate = self.token_estimate.saturating_sub(tokens);
        self.version += 1;
        true
    }

    /// Idempotent persistence of the current context.  Backend errors are
    /// logged and swallowed — persistence must never fail the main flow.
    pub async fn save_current_context(&self) {
        if let Err(e) = self
            .memory
            .save_current_context(&self.id, &self.messages)
            .await
        {
            warn!(session_id = %self.id, error = %e, "failed to persist session context");
        }
    }

    /// Close interrupted tool calls after loading from persistence.
    ///
    /// Every assistant tool call without a matching tool message gets a
    /// synthetic `TOOL_CALL_INTERRUPTED` result, inserted directly after the
    /// existing results of its group, in ascending tool-call index order.
    /// Returns the number of synthesized messages.
    pub async fn repair_on_load(&mut self) -> usize {
        let mut synthesized = 0usize;
        let mut i = 0;
        while i < self.messages.len() {
            if self.messages[i].role != Role::Assistant || self.messages[i].tool_calls().is_empty()
            {
                i += 1;
                continue;
            }
            // Collect answered ids from the contiguous tool messages that follow.
            let mut j = i + 1;
            let mut answered = HashSet::new();
            while j < self.messages.len() && self.messages[j].role == Role::Tool {
                if let Some(id) = &self.messages[j].tool_call_id {
                    answered.insert(id.clone());
                }
                j += 1;
            }
            let mut calls: Vec<_> = self.messages[i]
                .tool_calls()
                .iter()
                .filter(|tc| !answered.contains(&tc.id))
                .cloned()
                .collect();
            calls.sort_by_key(|tc| tc.index);
            for tc in calls {
                debug!(tool_call_id = %tc.id, "closing interrupted tool call");
                let repair = Message::tool_result(&tc.id, interrupted_tool_result_content());
                self.messages.insert(j, repair);
                j += 1;
                synthesized += 1;
            }
            i = j;
        }
        if synthesized > 0 {
            self.token_estimate = estimate(&self.messages);
            self.version += 1;
            self.save_current_context().await;
        }
        synthesized
    }

    /// Whether the context estimate has reached the compaction trigger for
    /// the given provider token budget.
    pub fn needs_compaction(&self, budget_tokens: usize) -> bool {
        if budget_tokens == 0 {
            return false;
        }
        self.token_estimate as f32 >= self.compaction.trigger_ratio * budget_tokens as f32
    }

    /// Summarise the middle of the log into one synthetic assistant message.
    ///
    /// Partition: `[system] + middle + tail`, where the tail keeps the last
    /// `keep_messages_num` messages widened so a tool-call group is never
    /// split.  On summary failure the log is left untouched and a failed
    /// journal entry is recorded; the caller must not retry within the turn.
    /// Returns whether a compaction happened.
    pub async fn compact_before_next_llm_call(
        &mut self,
        provider: &dyn LlmProvider,
        reason: &str,
    ) -> bool {
        let pinned: usize = self
            .messages
            .first()
            .map(|m| (m.role == Role::System) as usize)
            .unwrap_or(0);
        let non_system = &self.messages[pinned..];
        let start = compact::tail_start(non_system, self.compaction.keep_messages_num);
        if start == 0 {
            debug!(session_id = %self.id, "nothing to compact");
            return false;
        }
        let middle: Vec<Message> = non_system[..start].to_vec();
        let tail: Vec<Message> = non_system[start..].to_vec();
        let tokens_before = self.token_estimate;
        let messages_before = self.messages.len();

        let cap = self
            .compaction
            .max_output_tokens
            .unwrap_or_else(|| provider.max_output_tokens());
        let summary = compact::request_summary(provider, &middle, cap).await;

        let summary_text = match summary {
            Ok(text) if !text.trim().is_empty() => text,
            outcome => {
                let error = match outcome {
                    Err(e) => e.to_string(),
                    Ok(_) => "empty summary".to_string(),
                };
                warn!(session_id = %self.id, error = %error, "compaction failed; leaving messages unchanged");
                let record = CompactionRecord {
                    compaction_id: Uuid::new_v4().to_string(),
                    compacted_at: Utc::now(),
                    messages_before,
                    messages_after: messages_before,
                    archived_message_ids: vec![],
                    tokens_before,
                    tokens_after: tokens_before,
                    reason: reason.to_string(),
                    succeeded: false,
                    error: Some(error),
                };
                self.record_compaction(record).await;
                return false;
            }
        };

        let mut summary_msg = Message::assistant(summary_text);
        summary_msg.meta = MessageMeta { compacted: true };
        summary_msg.message_type = MessageType::Text;

        let archived_ids: Vec<String> = middle.iter().map(|m| m.message_id.clone()).collect();
        if let Err(e) = self.memory.archive_messages(&self.id, &middle).await {
            warn!(session_id = %self.id, error = %e, "failed to archive compacted messages");
        }

        let mut rebuilt = Vec::with_capacity(2 + tail.len());
        rebuilt.extend(self.messages[..pinned].iter().cloned());
        rebuilt.push(summary_msg);
        rebuilt.extend(tail);
        self.messages = rebuilt;
        self.token_estimate = estimate(&self.messages);
        self.version += 1;

        let record = CompactionRecord {
            compaction_id: Uuid::new_v4().to_string(),
            compacted_at: Utc::now(),
            messages_before,
            messages_after: self.messages.len(),
            archived_message_ids: archived_ids,
            tokens_before,
            tokens_after: self.token_estimate,
            reason: reason.to_string(),
            succeeded: true,
            error: None,
        };
        self.record_compaction(record).await;
        self.save_current_context().await;
        true
    }

    async fn record_compaction(&mut self, record: CompactionRecord) {
        if let Err(e) = self.memory.add_compaction_record(&self.id, &record).await {
            warn!(session_id = %self.id, error = %e, "failed to persist compaction record");
        }
        self.compaction_records.push(record);
    }
}

fn estimate(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| !m.excluded_from_context)
        .map(|m| m.approx_tokens())
        .sum()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
