// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for OpenAI-compatible chat completion APIs.
//!
//! A large family of providers (hosted and local) speak the same
//! `/chat/completions` wire format with SSE streaming.  This module provides
//! one driver configured with a base URL, model name, and optional bearer
//! key.  Streamed SSE events deserialize directly into [`Chunk`], so the
//! execution core never sees transport framing.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{ChunkStream, Completion},
    Chunk, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Message, MessageContent,
    Role,
};

pub struct OpenAiCompatProvider {
    /// Provider id returned by `LlmProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env); `None` for local servers.
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    context_window: u32,
    max_output_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// `base_url` ends **before** `/chat/completions`, e.g.
    /// `https://api.example.com/v1`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        context_window: Option<u32>,
        max_output_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            context_window: context_window.unwrap_or(128_000),
            max_output_tokens: max_output_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_context_tokens(&self) -> u32 {
        self.context_window
    }

    fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }

    async fn generate(&self, req: CompletionRequest) -> Result<Completion, LlmError> {
        let messages: Vec<Value> = req.messages.iter().map(wire_message).collect();
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "temperature": self.temperature,
            "max_tokens": req.max_output_tokens.unwrap_or(self.max_output_tokens),
        });
        if req.stream && req.include_usage {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            stream = req.stream,
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .map_err(|e| LlmError::Network(format!("{} request failed: {e}", self.driver_name)))?;

        if !resp.status().is_success() {
            return Err(api_error(self.driver_name, resp).await);
        }

        if !req.stream {
            let full: CompletionResponse = resp
                .json()
                .await
                .map_err(|e| LlmError::InvalidResponse(format!("malformed response body: {e}")))?;
            return Ok(Completion::Full(full));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let chunk_stream = byte_stream
            .scan(String::new(), |buf, piece| {
                let out: Vec<Result<Chunk, LlmError>> = match piece {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(LlmError::Network(e.to_string()))],
                };
                std::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Completion::Stream(Box::pin(chunk_stream) as ChunkStream))
    }
}

/// Map a non-success HTTP response into an [`LlmError::Api`].
///
/// The `Retry-After` header (seconds) is honoured for 429s; the error body
/// is probed for the standard `{"error":{"message","code"|"type"}}` shape.
async fn api_error(driver: &str, resp: reqwest::Response) -> LlmError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    let text = resp.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<Value>(&text) {
        Ok(v) => {
            let err = &v["error"];
            let code = err["code"]
                .as_str()
                .or_else(|| err["type"].as_str())
                .unwrap_or("HTTP_ERROR")
                .to_uppercase();
            let message = err["message"].as_str().unwrap_or(&text).to_string();
            (code, message)
        }
        Err(_) => ("HTTP_ERROR".to_string(), text),
    };
    LlmError::Api {
        status,
        code,
        message: format!("{driver}: {message}"),
        retry_after,
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so the next TCP chunk can
/// extend it.  A single SSE event may be split across multiple packets.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<Result<Chunk, LlmError>> {
    let mut out = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(chunk) = parse_sse_data_line(&line) {
            out.push(chunk);
        }
    }
    out
}

/// Parse a single complete SSE `data:` line into a [`Chunk`].
///
/// Returns `None` for empty lines, comments, the `[DONE]` sentinel, and
/// unparseable payloads (logged, not fatal — some servers interleave
/// keep-alive comments).
fn parse_sse_data_line(line: &str) -> Option<Result<Chunk, LlmError>> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<Chunk>(data) {
        Ok(chunk) => Some(Ok(chunk)),
        Err(e) => {
            tracing::warn!(error = %e, "skipping unparseable SSE data line");
            None
        }
    }
}

/// Serialize one context message into the provider wire shape.
fn wire_message(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut v = json!({ "role": role });
    match &msg.content {
        MessageContent::Text(t) => v["content"] = json!(t),
        MessageContent::Parts(parts) => v["content"] = json!(parts),
    }
    if let Some(tcs) = &msg.tool_calls {
        if !tcs.is_empty() {
            v["tool_calls"] = json!(tcs);
        }
    }
    if let Some(id) = &msg.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    v
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
