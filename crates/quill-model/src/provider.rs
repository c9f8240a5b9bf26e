// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{Chunk, CompletionRequest, CompletionResponse, LlmError};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, LlmError>> + Send>>;

/// Either a complete response or an incremental chunk stream, depending on
/// the request's `stream` flag.
pub enum Completion {
    Full(CompletionResponse),
    Stream(ChunkStream),
}

/// Minimum surface the execution core consumes from a model provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request.  `req.stream` selects the return shape.
    async fn generate(&self, req: CompletionRequest) -> Result<Completion, LlmError>;

    /// Default per-request wall-clock budget, in milliseconds.  Used when
    /// the agent config does not set an explicit request timeout.
    fn time_timeout_ms(&self) -> u64 {
        120_000
    }

    /// Context window size for this provider/model combination.
    fn max_context_tokens(&self) -> u32;

    /// Maximum output tokens for this provider/model combination.
    fn max_output_tokens(&self) -> u32;
}
