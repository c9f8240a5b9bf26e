// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use quill_model::LlmError;
use serde::{Deserialize, Serialize};

use crate::input::InputError;

/// User-visible text for failures whose real cause must stay internal.
pub const SANITIZED_UNEXPECTED: &str = "An unexpected error occurred. Please try again.";

pub const CODE_MAX_RETRIES: &str = "AGENT_MAX_RETRIES_EXCEEDED";
pub const CODE_MAX_LOOPS: &str = "AGENT_MAX_LOOPS_EXCEEDED";
pub const CODE_RESPONSE_INVALID: &str = "LLM_RESPONSE_INVALID";
pub const CODE_UNEXPECTED: &str = "UNEXPECTED_ERROR";

/// Errors surfaced out of the execution core.
///
/// The loop branches on variant, never on message text.  Failures that end a
/// run with a terminal FAILED status are reported through [`Failure`] on the
/// execution outcome instead; only conditions that abort `execute` before or
/// outside the loop (invalid input) or that the loop handles internally
/// (compression, provider errors, abort) appear here.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    InvalidInput(#[from] InputError),
    /// The provider returned a response with no choices.
    #[error("[LLM_RESPONSE_INVALID] {0}")]
    ResponseInvalid(String),
    /// Raised mid-stream by validator recovery; the loop compacts the
    /// session and retries the turn without consuming a retry credit.
    #[error("context compression required: {0}")]
    ContextCompression(String),
    #[error(transparent)]
    Provider(#[from] LlmError),
    #[error("aborted")]
    Aborted,
    #[error("{0}")]
    Unexpected(String),
}

/// Terminal failure record attached to a FAILED outcome.
///
/// `message` is safe to show to the user; `internal` preserves the original
/// cause for diagnostics and is never rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub code: String,
    pub message: String,
    pub internal: String,
}

impl Failure {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        internal: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            internal: internal.into(),
        }
    }

    /// Failure whose user-visible message is the sanitized constant.
    pub fn unexpected(internal: impl Into<String>) -> Self {
        Self::new(CODE_UNEXPECTED, SANITIZED_UNEXPECTED, internal)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
