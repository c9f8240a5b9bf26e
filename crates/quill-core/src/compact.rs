// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;
use quill_model::{
    Completion, CompletionRequest, LlmError, LlmProvider, Message, MessageContent, Role,
};

pub(crate) const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Index into the non-system message slice where the preserved tail begins.
///
/// The boundary walks backward past tool messages so an assistant message is
/// never separated from its tool results: summarising the assistant away
/// while keeping its results would orphan the `tool_call_id` references.
pub(crate) fn tail_start(non_system: &[Message], keep_n: usize) -> usize {
    let mut start = non_system.len().saturating_sub(keep_n);
    while start > 0 && non_system[start].role == Role::Tool {
        start -= 1;
    }
    start
}

/// Serialize messages into plain text for the compaction prompt.
pub(crate) fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let mut text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::Parts(_) => m.as_text(),
            };
            for tc in m.tool_calls() {
                text.push_str(&format!(
                    "\n[tool_call {}: {}({})]",
                    tc.id, tc.function.name, tc.function.arguments
                ));
            }
            if let Some(id) = &m.tool_call_id {
                text = format!("[tool_result {id}] {text}");
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Ask the provider for a bounded summary of `middle`.
///
/// The request carries no tools so the model focuses on summarising.  Both
/// completion shapes are handled; a streaming provider's text deltas are
/// folded into one string.
pub(crate) async fn request_summary(
    provider: &dyn LlmProvider,
    middle: &[Message],
    max_output_tokens: u32,
) -> Result<String, LlmError> {
    let req = CompletionRequest {
        messages: vec![
            Message::system(SUMMARIZE_PROMPT),
            Message::user(serialize_history(middle)),
        ],
        tools: vec![],
        stream: false,
        include_usage: false,
        max_output_tokens: Some(max_output_tokens),
    };
    match provider.generate(req).await? {
        Completion::Full(resp) => Ok(resp
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default()),
        Completion::Stream(mut chunks) => {
            let mut text = String::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                if let Some(choice) = chunk.choices.first() {
                    if let Some(delta) = &choice.delta.content {
                        text.push_str(delta);
                    }
                }
            }
            Ok(text)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
