use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Content part types ───────────────────────────────────────────────────────

/// A single part in a multi-part message.
///
/// User queries may mix text with images, files, audio, and video.  Each
/// variant mirrors the OpenAI-compatible wire shape so the parts serialize
/// directly into provider requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    File {
        file: FilePart,
    },
    InputAudio {
        input_audio: AudioPart,
    },
    InputVideo {
        input_video: VideoPart,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
    pub url: String,
    /// Vision detail level: `"low"`, `"high"`, or `"auto"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// File reference or inline file payload.  At least one of `file_id` /
/// `file_data` must be present for the part to be valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioPart {
    /// Base64-encoded audio payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Container format, e.g. `"wav"` or `"mp3"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Video reference.  At least one of `url` / `file_id` / `data` must be
/// present for the part to be valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ContentPart {
    /// Convenience constructor for a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Convenience constructor for an image part.
    pub fn image(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
        }
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Coarse classification of a message, independent of its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Text,
    ToolCall,
    ToolResult,
}

/// The content of a message – a plain string or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain text of this content; multi-part content joins its text parts.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    /// Stream ordering position.  Providers interleave parallel tool calls
    /// by this index.
    #[serde(default)]
    pub index: u32,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as streamed by the provider.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            index: 0,
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// A tool call is complete when its accumulated arguments parse as JSON.
    pub fn arguments_complete(&self) -> bool {
        serde_json::from_str::<serde_json::Value>(&self.function.arguments).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

/// Token usage from one request, with optional prompt-cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl Usage {
    /// Accumulate another usage report into this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        if let Some(r) = other.cache_read_tokens {
            *self.cache_read_tokens.get_or_insert(0) += r;
        }
        if let Some(w) = other.cache_write_tokens {
            *self.cache_write_tokens.get_or_insert(0) += w;
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Auxiliary message metadata that is not part of the provider wire format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMeta {
    /// Set on the synthetic assistant message that replaces a compacted span.
    #[serde(default, skip_serializing_if = "is_false")]
    pub compacted: bool,
}

/// One entry in the ordered context log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub role: Role,
    pub content: MessageContent,
    /// Model reasoning that preceded the content (assistant only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool invocations requested by this assistant message, in index order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// The ToolCall this tool message answers (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Preserved in history but hidden from future provider requests.
    #[serde(default, skip_serializing_if = "is_false")]
    pub excluded_from_context: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_reason: Option<String>,
    #[serde(default)]
    pub meta: MessageMeta,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn base(role: Role, content: MessageContent, message_type: MessageType) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            role,
            content,
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
            message_type,
            finish_reason: None,
            usage: None,
            excluded_from_context: false,
            excluded_reason: None,
            meta: MessageMeta::default(),
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, MessageContent::Text(text.into()), MessageType::Text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(Role::User, MessageContent::Text(text.into()), MessageType::Text)
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self::base(Role::User, MessageContent::Parts(parts), MessageType::Text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(Role::Assistant, MessageContent::Text(text.into()), MessageType::Text)
    }

    /// An assistant message that requests tool invocations.  Empty content is
    /// allowed; `tool_calls` must already be in index order.
    pub fn assistant_with_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut m = Self::base(
            Role::Assistant,
            MessageContent::Text(text.into()),
            MessageType::ToolCall,
        );
        m.tool_calls = Some(tool_calls);
        m
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::base(
            Role::Tool,
            MessageContent::Text(content.into()),
            MessageType::ToolResult,
        );
        m.tool_call_id = Some(tool_call_id.into());
        m
    }

    /// Tool calls of this message, or an empty slice.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn as_text(&self) -> String {
        self.content.as_text()
    }

    /// Approximate token count used for context management.
    ///
    /// Uses a 4-chars-per-token heuristic for text.  Rich parts use fixed or
    /// payload-proportional surcharges so a screenshot or audio clip is not
    /// billed as a handful of tokens.
    pub fn approx_tokens(&self) -> usize {
        let mut chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ImageUrl { image_url } => {
                        // "low" → fixed 85 tokens; auto/high → ~765 tokens.
                        let tokens = if image_url.detail.as_deref() == Some("low") {
                            85
                        } else {
                            765
                        };
                        tokens * 4
                    }
                    ContentPart::File { file } => {
                        file.file_data.as_deref().map(str::len).unwrap_or(256 * 4)
                    }
                    ContentPart::InputAudio { input_audio } => {
                        input_audio.data.as_deref().map(str::len).unwrap_or(256 * 4)
                    }
                    ContentPart::InputVideo { input_video } => {
                        input_video.data.as_deref().map(str::len).unwrap_or(768 * 4)
                    }
                })
                .sum(),
        };
        if let Some(r) = &self.reasoning_content {
            chars += r.len();
        }
        for tc in self.tool_calls() {
            chars += tc.function.name.len() + tc.function.arguments.len();
        }
        (chars / 4).max(1)
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Ask the provider to attach usage reports to the stream.
    pub include_usage: bool,
    /// Per-request output cap (used by compaction summary requests).
    pub max_output_tokens: Option<u32>,
}

// ─── Streaming chunks ─────────────────────────────────────────────────────────

/// One incremental piece of a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// A partial tool call.  `id` and `function.name` replace on arrival;
/// `function.arguments` concatenates because providers stream the argument
/// JSON character-wise.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl Chunk {
    /// Chunk carrying a single text delta.
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: Some(delta.into()),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Chunk carrying a single reasoning delta.
    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    reasoning_content: Some(delta.into()),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Chunk carrying one tool-call delta at `index`.
    pub fn tool_call(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: id.map(String::from),
                        kind: Some("function".into()),
                        function: Some(FunctionDelta {
                            name: name.map(String::from),
                            arguments: arguments.map(String::from),
                        }),
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Chunk carrying only a finish_reason.
    pub fn finish(reason: FinishReason) -> Self {
        Self {
            choices: vec![ChunkChoice {
                finish_reason: Some(reason),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// Chunk carrying only a usage report.
    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Default::default()
        }
    }
}

// ─── Non-streaming responses ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl CompletionResponse {
    /// Whether the response carries at least one choice.
    pub fn has_choices(&self) -> bool {
        !self.choices.is_empty()
    }

    /// Convert into a single synthetic chunk so streaming and non-streaming
    /// responses share one assembly path.
    pub fn into_chunk(self) -> Chunk {
        let choices = self
            .choices
            .into_iter()
            .map(|c| ChunkChoice {
                index: c.index,
                delta: ChunkDelta {
                    role: c.message.role,
                    content: c.message.content,
                    reasoning_content: c.message.reasoning_content,
                    tool_calls: c.message.tool_calls.map(|tcs| {
                        tcs.into_iter()
                            .map(|tc| ToolCallDelta {
                                index: tc.index,
                                id: Some(tc.id),
                                kind: Some(tc.kind),
                                function: Some(FunctionDelta {
                                    name: Some(tc.function.name),
                                    arguments: Some(tc.function.arguments),
                                }),
                            })
                            .collect()
                    }),
                },
                finish_reason: c.finish_reason,
            })
            .collect();
        Chunk {
            id: self.id,
            model: self.model,
            created: self.created,
            usage: self.usage,
            choices,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
