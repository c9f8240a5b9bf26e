// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider abstraction and data model for the quill agent core.
//!
//! The execution core consumes only the [`LlmProvider`] trait and the typed
//! message/chunk structures defined here; concrete drivers (the
//! OpenAI-compatible driver, mocks) live behind that seam.

mod error;
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use error::LlmError;
pub use mock::{Script, ScriptedProvider};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{ChunkStream, Completion, LlmProvider};
pub use types::*;

use quill_config::ModelConfig;

/// Build a provider from configuration.
///
/// `provider = "mock"` is rejected here — mocks are constructed directly in
/// tests with their scripts; everything else is treated as an
/// OpenAI-compatible endpoint.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<std::sync::Arc<dyn LlmProvider>> {
    anyhow::ensure!(
        cfg.provider != "mock",
        "mock provider must be constructed directly with its scripts"
    );
    let api_key = match (&cfg.api_key, &cfg.api_key_env) {
        (Some(key), _) => Some(key.clone()),
        (None, Some(env)) => std::env::var(env).ok(),
        (None, None) => None,
    };
    let base_url = cfg
        .base_url
        .clone()
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
    Ok(std::sync::Arc::new(OpenAiCompatProvider::new(
        "openai-compat",
        cfg.name.clone(),
        api_key,
        &base_url,
        cfg.context_window,
        cfg.max_output_tokens,
        cfg.temperature,
    )))
}
