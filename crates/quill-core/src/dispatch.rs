// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use quill_model::ToolCall;
use quill_tools::{ToolContext, ToolRegistry, ToolResult};
use serde_json::Value;
use tracing::warn;

/// Keys whose values are blanked (case-insensitively, at any depth) before a
/// tool result reaches the UI or the session.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "apikey",
    "api_key",
    "authorization",
];

const REDACTED: &str = "[REDACTED]";

/// One finished dispatch, redacted and ready to append.
#[derive(Debug, Clone)]
pub struct DispatchedResult {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: String,
    pub result: ToolResult,
}

impl DispatchedResult {
    pub fn is_failure(&self) -> bool {
        !self.result.success
    }
}

/// Executes one batch of tool calls for a session.
///
/// Calls run concurrently; results rendezvous in the original tool-call
/// index order so the conversation history is deterministic regardless of
/// completion order.  A panicking tool or a timeout becomes a failed result
/// for its call only — one bad call never poisons the batch.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub async fn dispatch(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<DispatchedResult> {
        let mut tasks = Vec::with_capacity(calls.len());
        for call in calls {
            let registry = Arc::clone(&self.registry);
            let ctx = ctx.clone();
            let timeout = self
                .registry
                .timeout_for(&call.function.name)
                .unwrap_or(self.default_timeout);
            let name = call.function.name.clone();
            let raw_args = call.function.arguments.clone();
            tasks.push(tokio::spawn(async move {
                let args: Value = if raw_args.is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&raw_args) {
                        Ok(v) => v,
                        Err(e) => {
                            return ToolResult::err(format!("invalid tool arguments: {e}"));
                        }
                    }
                };
                match tokio::time::timeout(timeout, registry.execute(&name, args, &ctx)).await {
                    Ok(result) => result,
                    Err(_) => ToolResult::timeout(),
                }
            }));
        }

        // Rendezvous in index order, not completion order.
        let mut results = Vec::with_capacity(calls.len());
        for (call, task) in calls.iter().zip(tasks) {
            let mut result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %call.function.name, error = %e, "tool task panicked");
                    ToolResult::err(format!("tool execution panicked: {e}"))
                }
            };
            redact_result(&mut result);
            results.push(DispatchedResult {
                tool_call_id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
                result,
            });
        }
        results
    }
}

fn redact_result(result: &mut ToolResult) {
    if let Some(output) = &mut result.output {
        redact_sensitive(output);
    }
    if let Some(metadata) = &mut result.metadata {
        redact_sensitive(metadata);
    }
}

/// Replace the value of any sensitive key with `"[REDACTED]"`, recursively.
pub fn redact_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.to_lowercase().as_str()) {
                    *v = Value::String(REDACTED.into());
                } else {
                    redact_sensitive(v);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_sensitive(item);
            }
        }
        _ => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
