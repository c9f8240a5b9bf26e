// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for fields that should be
/// enabled unless explicitly disabled.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" | any OpenAI-compatible endpoint | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local servers, LiteLLM, or proxies.
    pub base_url: Option<String>,
    /// Context window in tokens; drives the compaction budget
    pub context_window: Option<u32>,
    /// Maximum tokens to request in a single completion
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            context_window: None,
            max_output_tokens: Some(4096),
            temperature: Some(0.2),
        }
    }
}

fn default_max_loops() -> u32 {
    25
}
fn default_max_retries() -> u32 {
    5
}
fn default_max_compensation_retries() -> u32 {
    1
}
fn default_retry_delay_ms() -> u64 {
    // Deliberately conservative; a provider-supplied retry_after overrides
    // this when larger, and tests shrink it.  See AgentConfig docs.
    600_000
}
fn default_idle_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of model turns within a single execute() call.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Generic retry budget for transient provider errors (network, 5xx,
    /// rate limits).  Compression retries and empty-response compensation
    /// retries do NOT draw from this budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How many empty `finish_reason=stop` responses are compensated per
    /// execute() call before the run fails.
    #[serde(default = "default_max_compensation_retries")]
    pub max_compensation_retries: u32,
    /// Base delay between generic retries, in milliseconds.  When the
    /// provider supplies a retry_after hint the larger of the two is used.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-model-call wall-clock cap in milliseconds.  `None` falls back to
    /// the provider's own `time_timeout_ms()`.  Overridable at load time via
    /// the `AGENT_REQUEST_TIMEOUT_MS` environment variable.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Streaming-only: maximum time between consecutive chunks, in
    /// milliseconds.  Re-armed on every non-empty chunk.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            max_retries: default_max_retries(),
            max_compensation_retries: default_max_compensation_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_ms: None,
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_repetition_threshold() -> usize {
    5
}
fn default_nonsense_threshold() -> usize {
    3
}
fn default_max_response_length() -> usize {
    50_000
}
fn default_check_window_size() -> usize {
    1_000
}
fn default_check_frequency() -> usize {
    100
}
fn default_min_recoverable_chars() -> usize {
    200
}
fn default_hallucination_lexemes() -> Vec<String> {
    ["alpha", "daemon", "gamma", "beta", "omega", "lambda"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Knobs for the streaming response validator.
///
/// The validator runs incrementally over the assistant content buffer every
/// `check_frequency` characters, inspecting at most the trailing
/// `check_window_size` characters per pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Identical adjacent tokens tolerated before a repetition violation.
    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: usize,
    /// Distinct nonsense findings tolerated before the response is invalid.
    #[serde(default = "default_nonsense_threshold")]
    pub nonsense_threshold: usize,
    /// Hard cap on total assistant content length per turn.
    #[serde(default = "default_max_response_length")]
    pub max_response_length: usize,
    #[serde(default = "default_check_window_size")]
    pub check_window_size: usize,
    #[serde(default = "default_check_frequency")]
    pub check_frequency: usize,
    /// When false, violations downgrade from abort to warn.
    #[serde(default = "default_true")]
    pub abort_on_violation: bool,
    /// Minimum clean prefix length for partial recovery to be worthwhile.
    #[serde(default = "default_min_recoverable_chars")]
    pub min_recoverable_chars: usize,
    /// Lexemes counted by the hallucination-frequency check.  The default
    /// set is English-centric; override per deployment locale.
    #[serde(default = "default_hallucination_lexemes")]
    pub hallucination_lexemes: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            repetition_threshold: default_repetition_threshold(),
            nonsense_threshold: default_nonsense_threshold(),
            max_response_length: default_max_response_length(),
            check_window_size: default_check_window_size(),
            check_frequency: default_check_frequency(),
            abort_on_violation: true,
            min_recoverable_chars: default_min_recoverable_chars(),
            hallucination_lexemes: default_hallucination_lexemes(),
        }
    }
}

fn default_keep_messages_num() -> usize {
    40
}
fn default_trigger_ratio() -> f32 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Number of trailing messages preserved verbatim during compaction.
    /// The window is widened backward when its boundary would split an
    /// assistant message from its tool results.
    #[serde(default = "default_keep_messages_num")]
    pub keep_messages_num: usize,
    /// Fraction of the provider's context budget at which proactive
    /// compaction triggers (0.0–1.0).
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f32,
    /// Cap on the summary the model is asked to produce.  `None` falls back
    /// to the provider's `max_output_tokens()`.
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            keep_messages_num: default_keep_messages_num(),
            trigger_ratio: default_trigger_ratio(),
            max_output_tokens: None,
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout in seconds for a single tool call.  Individual tools may
    /// override this via `Tool::timeout()`.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
