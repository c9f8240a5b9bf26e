// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use quill_model::{ToolCall, Usage};
use serde::{Deserialize, Serialize};

use crate::validator::ValidationResult;

/// Lifecycle state of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Idle,
    Running,
    Thinking,
    Retrying,
    Completed,
    Failed,
    Aborted,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Events emitted on the observation stream during a turn.
/// Consumers (CLI, TUI, supervising agents) subscribe to these; delivery
/// order always matches production order.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The model started a reasoning block.
    ReasoningStart { message_id: String },
    ReasoningDelta(String),
    /// The reasoning block ended; carries the accumulated reasoning text.
    ReasoningComplete(String),
    /// The model started emitting answer text.
    TextStart { message_id: String },
    TextDelta(String),
    /// The text section ended; carries the full accumulated content.
    TextComplete(String),
    /// A tool call was first seen in the stream.  `content` is the assistant
    /// content accumulated so far.
    ToolCallCreated {
        message_id: String,
        tool_call: ToolCall,
        content: String,
    },
    /// A dispatched tool call finished; `result` is already redacted.
    ToolCallResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
    },
    /// Usage attached to a chunk (per-chunk, not cumulative).
    UsageUpdate(Usage),
    /// A status transition, optionally with a human-readable note.
    Status {
        status: AgentStatus,
        message: Option<String>,
    },
    /// A recoverable error notice.
    Error(String),
    /// The validator aborted the stream.
    ValidationViolation(ValidationResult),
    /// A code patch produced by a tool (pass-through for UIs that render diffs).
    CodePatch { path: String, diff: String },
    /// Transparent pass-through from a nested agent instance.
    SubagentEvent {
        agent_id: String,
        event: Box<AgentEvent>,
    },
}
