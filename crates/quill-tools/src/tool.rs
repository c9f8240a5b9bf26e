// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-dispatch context carried into every tool invocation.
///
/// Tools belonging to different sessions run concurrently against the same
/// registry; the context is what keeps their side effects attributable and
/// isolated.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: String,
    pub working_directory: Option<String>,
}

/// The result of executing one tool call.
///
/// Serialized (after redaction) into the tool message content, so the shape
/// is part of the conversation format the model sees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Set on non-fatal failures (unknown tool, timeout) that the loop
    /// should surface as a warning but continue past.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub warning: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn unknown_tool() -> Self {
        Self {
            success: false,
            error: Some("unknown tool".into()),
            warning: true,
            ..Default::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            success: false,
            error: Some("timeout".into()),
            warning: true,
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Null)
    }
}

/// Trait that every tool exposed to the model must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Per-tool timeout override.  `None` uses the dispatcher default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
    /// Execute the tool.  Failures are expressed through
    /// [`ToolResult::err`], never by panicking.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
