// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::Completion, Chunk, CompletionRequest, FinishReason, LlmError, LlmProvider, Usage,
};

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these chunks in order.
    Chunks(Vec<Chunk>),
    /// Return a full (non-streaming) response.
    Full(crate::CompletionResponse),
    /// Fail the call with this error.
    Fail(LlmError),
}

/// A pre-scripted provider.  Each `generate` call pops the next script from
/// the front of the queue, so tests can specify exact chunk sequences —
/// including split tool-call arguments and errors — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Script>>,
    calls: AtomicUsize,
    context_window: u32,
    /// The last `CompletionRequest` seen by this provider.  Written on each
    /// `generate()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            calls: AtomicUsize::new(0),
            context_window: 128_000,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Shrink the claimed context window (drives compaction in tests).
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    /// Number of `generate` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Provider that always streams a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Script::Chunks(vec![
            Chunk::text(reply),
            Chunk::usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
                total_tokens: 10,
                ..Default::default()
            }),
            Chunk::finish(FinishReason::Stop),
        ])])
    }

    /// Provider that returns one tool call, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let (tool_id, tool_name, args_json) = (tool_id.into(), tool_name.into(), args_json.into());
        Self::new(vec![
            Script::Chunks(vec![
                Chunk::tool_call(
                    0,
                    Some(tool_id.as_str()),
                    Some(tool_name.as_str()),
                    Some(args_json.as_str()),
                ),
                Chunk::finish(FinishReason::ToolCalls),
            ]),
            Script::Chunks(vec![
                Chunk::text(final_text),
                Chunk::finish(FinishReason::Stop),
            ]),
        ])
    }

    /// Provider that returns `n` empty stop responses, then a text reply.
    pub fn empty_then_text(n: usize, final_text: impl Into<String>) -> Self {
        let mut scripts: Vec<Script> =
            std::iter::repeat_with(|| Script::Chunks(vec![Chunk::finish(FinishReason::Stop)]))
                .take(n)
                .collect();
        scripts.push(Script::Chunks(vec![
            Chunk::text(final_text),
            Chunk::finish(FinishReason::Stop),
        ]));
        Self::new(scripts)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn max_context_tokens(&self) -> u32 {
        self.context_window
    }

    fn max_output_tokens(&self) -> u32 {
        4096
    }

    async fn generate(&self, req: CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                Script::Chunks(vec![
                    Chunk::text("[no more scripts]"),
                    Chunk::finish(FinishReason::Stop),
                ])
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::Chunks(chunks) => {
                let wrapped: Vec<Result<Chunk, LlmError>> = chunks.into_iter().map(Ok).collect();
                Ok(Completion::Stream(Box::pin(stream::iter(wrapped))))
            }
            Script::Full(resp) => Ok(Completion::Full(resp)),
            Script::Fail(err) => Err(err),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
