// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use quill_model::ContentPart;

/// Hard cap on plain-text query length.
pub const MAX_QUERY_LENGTH: usize = 100_000;

/// A user query: plain text or an ordered list of content parts.
#[derive(Debug, Clone)]
pub enum UserInput {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<&str> for UserInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for UserInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<ContentPart>> for UserInput {
    fn from(parts: Vec<ContentPart>) -> Self {
        Self::Parts(parts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("query exceeds maximum length of {max} characters (got {len})")]
    TooLong { len: usize, max: usize },
    #[error("content parts must not be empty")]
    EmptyParts,
    #[error("content part {index}: {detail}")]
    InvalidPart { index: usize, detail: String },
    #[error("content part {index}: unknown type `{kind}`")]
    UnknownPartType { index: usize, kind: String },
}

/// Reject malformed user queries before any model call is issued.
///
/// Pure function: no I/O, no state.
pub fn validate_input(input: &UserInput) -> Result<(), InputError> {
    match input {
        UserInput::Text(text) => {
            if text.trim().is_empty() {
                return Err(InputError::EmptyQuery);
            }
            if text.len() > MAX_QUERY_LENGTH {
                return Err(InputError::TooLong {
                    len: text.len(),
                    max: MAX_QUERY_LENGTH,
                });
            }
            Ok(())
        }
        UserInput::Parts(parts) => {
            if parts.is_empty() {
                return Err(InputError::EmptyParts);
            }
            for (index, part) in parts.iter().enumerate() {
                validate_part(index, part)?;
            }
            Ok(())
        }
    }
}

fn validate_part(index: usize, part: &ContentPart) -> Result<(), InputError> {
    let invalid = |detail: &str| InputError::InvalidPart {
        index,
        detail: detail.to_string(),
    };
    match part {
        ContentPart::Text { text } => {
            if text.is_empty() {
                return Err(invalid("text part must not be empty"));
            }
        }
        ContentPart::ImageUrl { image_url } => {
            if image_url.url.is_empty() {
                return Err(invalid("image_url.url is required"));
            }
        }
        ContentPart::File { file } => {
            if file.file_id.is_none() && file.file_data.is_none() {
                return Err(invalid("file requires file_id or file_data"));
            }
        }
        ContentPart::InputAudio { input_audio } => {
            if input_audio.data.as_deref().unwrap_or("").is_empty() {
                return Err(invalid("input_audio.data is required"));
            }
            if input_audio.format.as_deref().unwrap_or("").is_empty() {
                return Err(invalid("input_audio.format is required"));
            }
        }
        ContentPart::InputVideo { input_video } => {
            if input_video.url.is_none()
                && input_video.file_id.is_none()
                && input_video.data.is_none()
            {
                return Err(invalid("input_video requires url, file_id, or data"));
            }
        }
    }
    Ok(())
}

/// Parse externally supplied JSON part objects into typed [`ContentPart`]s,
/// rejecting objects whose `type` tag is not one of the recognized kinds.
pub fn parts_from_json(values: Vec<serde_json::Value>) -> Result<Vec<ContentPart>, InputError> {
    let mut parts = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        match serde_json::from_value::<ContentPart>(value) {
            Ok(part) => parts.push(part),
            Err(_) => return Err(InputError::UnknownPartType { index, kind }),
        }
    }
    Ok(parts)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use quill_model::{AudioPart, FilePart, ImageUrl, VideoPart};
    use serde_json::json;

    use super::*;

    #[test]
    fn plain_text_passes() {
        assert!(validate_input(&"fix the bug".into()).is_ok());
    }

    #[test]
    fn empty_and_whitespace_queries_rejected() {
        assert_eq!(validate_input(&"".into()), Err(InputError::EmptyQuery));
        assert_eq!(validate_input(&"  \n\t ".into()), Err(InputError::EmptyQuery));
    }

    #[test]
    fn overlong_query_rejected() {
        let big = "x".repeat(MAX_QUERY_LENGTH + 1);
        match validate_input(&UserInput::Text(big)) {
            Err(InputError::TooLong { len, max }) => {
                assert_eq!(len, MAX_QUERY_LENGTH + 1);
                assert_eq!(max, MAX_QUERY_LENGTH);
            }
            other => panic!("expected TooLong, got {other:?}"),
        }
    }

    #[test]
    fn query_at_exact_limit_passes() {
        let at_limit = "x".repeat(MAX_QUERY_LENGTH);
        assert!(validate_input(&UserInput::Text(at_limit)).is_ok());
    }

    #[test]
    fn empty_parts_list_rejected() {
        assert_eq!(
            validate_input(&UserInput::Parts(vec![])),
            Err(InputError::EmptyParts)
        );
    }

    #[test]
    fn image_without_url_rejected() {
        let parts = vec![ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: String::new(),
                detail: None,
            },
        }];
        assert!(matches!(
            validate_input(&UserInput::Parts(parts)),
            Err(InputError::InvalidPart { index: 0, .. })
        ));
    }

    #[test]
    fn file_without_id_or_data_rejected() {
        let parts = vec![
            ContentPart::text("look at this"),
            ContentPart::File {
                file: FilePart::default(),
            },
        ];
        assert!(matches!(
            validate_input(&UserInput::Parts(parts)),
            Err(InputError::InvalidPart { index: 1, .. })
        ));
    }

    #[test]
    fn audio_missing_format_rejected() {
        let parts = vec![ContentPart::InputAudio {
            input_audio: AudioPart {
                data: Some("AAAA".into()),
                format: None,
            },
        }];
        assert!(validate_input(&UserInput::Parts(parts)).is_err());
    }

    #[test]
    fn video_with_any_source_passes() {
        let parts = vec![ContentPart::InputVideo {
            input_video: VideoPart {
                url: Some("https://example.com/clip.mp4".into()),
                file_id: None,
                data: None,
            },
        }];
        assert!(validate_input(&UserInput::Parts(parts)).is_ok());
    }

    #[test]
    fn unknown_part_type_rejected_from_json() {
        let err = parts_from_json(vec![json!({"type": "hologram", "data": "x"})]).unwrap_err();
        assert_eq!(
            err,
            InputError::UnknownPartType {
                index: 0,
                kind: "hologram".into()
            }
        );
    }

    #[test]
    fn known_part_types_parse_from_json() {
        let parts = parts_from_json(vec![
            json!({"type": "text", "text": "hi"}),
            json!({"type": "image_url", "image_url": {"url": "https://x/y.png"}}),
        ])
        .unwrap();
        assert_eq!(parts.len(), 2);
    }
}
