// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

/// Errors raised by model providers.
///
/// Every variant is classifiable as retryable or permanent so the agent loop
/// can branch on kind instead of matching strings.  Rate-limit responses
/// expose the provider's `retry_after` hint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("[{code}] {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("[NETWORK] {0}")]
    Network(String),
    #[error("[TIMEOUT] request timed out")]
    Timeout,
    #[error("[LLM_RESPONSE_INVALID] {0}")]
    InvalidResponse(String),
    #[error("[ABORTED] request aborted")]
    Aborted,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Network(_) | Self::Timeout => true,
            Self::InvalidResponse(_) | Self::Aborted => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short stable code used in sanitized `[CODE] message` retry reasons.
    pub fn code(&self) -> &str {
        match self {
            Self::Api { code, .. } => code,
            Self::Network(_) => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::InvalidResponse(_) => "LLM_RESPONSE_INVALID",
            Self::Aborted => "ABORTED",
        }
    }

    /// Convenience constructor for rate-limit errors.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Api {
            status: 429,
            code: "RATE_LIMITED".into(),
            message: message.into(),
            retry_after,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
