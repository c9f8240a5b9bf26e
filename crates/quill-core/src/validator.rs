// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pathological-output detection for streamed model responses.
//!
//! Degenerate model output has a small number of recognizable shapes: a word
//! or short phrase repeated in a tight loop, runs of a single letter or of
//! punctuation, control bytes, and tell-tale filler lexemes recurring far
//! above their natural frequency.  The validator scans the tail of the
//! content buffer for these shapes as the stream arrives; the recovery
//! policy then decides whether the turn can keep its clean prefix, should be
//! retried against a compacted context, or must be aborted.
//!
//! The `regex` crate has no backreferences, so the repeated-token,
//! letter-run, and repeated-substring detectors are hand-rolled scanners;
//! only the backreference-free patterns use compiled regexes.

use std::sync::OnceLock;

use quill_config::ValidatorConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationType {
    Repetition,
    Nonsense,
    Length,
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationAction {
    Abort,
    Warn,
    Truncate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violation_type: Option<ViolationType>,
    pub action: Option<ViolationAction>,
    pub detected_patterns: Vec<String>,
}

impl ValidationResult {
    fn ok(detected_patterns: Vec<String>) -> Self {
        Self {
            valid: true,
            violation_type: None,
            action: None,
            detected_patterns,
        }
    }
}

fn control_bytes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // ASCII control bytes except \t \n \r.
    RE.get_or_init(|| Regex::new("[\\x00-\\x08\\x0B\\x0C\\x0E-\\x1F]").unwrap())
}

fn punct_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("[[:punct:]]{20,}").unwrap())
}

fn newline_collapse_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("\n{3,}").unwrap())
}

/// Stateful per-turn validator.
pub struct ResponseValidator {
    cfg: ValidatorConfig,
    lexeme_re: Option<Regex>,
    /// Buffer length at the last incremental check.
    last_check_len: usize,
}

impl ResponseValidator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        let lexeme_re = if cfg.hallucination_lexemes.is_empty() {
            None
        } else {
            let alternation = cfg
                .hallucination_lexemes
                .iter()
                .map(|l| regex::escape(l))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!(r"(?i)\b({alternation})\b")).ok()
        };
        Self {
            cfg,
            lexeme_re,
            last_check_len: 0,
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.cfg
    }

    /// Incremental entry point: runs a window check once per
    /// `check_frequency` newly appended characters, otherwise returns `None`.
    pub fn validate_incremental(&mut self, buffer: &str) -> Option<ValidationResult> {
        if buffer.len() < self.last_check_len + self.cfg.check_frequency {
            return None;
        }
        self.last_check_len = buffer.len();
        Some(self.validate(buffer))
    }

    /// Validate the trailing window of `content`.
    pub fn validate(&self, content: &str) -> ValidationResult {
        let window = trailing_window(content, self.cfg.check_window_size);
        let mut findings: Vec<String> = Vec::new();

        // Hard cap on total response length.
        if content.len() > self.cfg.max_response_length {
            return ValidationResult {
                valid: false,
                violation_type: Some(ViolationType::Length),
                action: Some(ViolationAction::Truncate),
                detected_patterns: vec![format!(
                    "response length {} exceeds cap {}",
                    content.len(),
                    self.cfg.max_response_length
                )],
            };
        }

        // A replacement character means bytes were lost upstream: the text no
        // longer round-trips through an encode/decode cycle unchanged.
        if window.contains('\u{FFFD}') {
            return ValidationResult {
                valid: false,
                violation_type: Some(ViolationType::Encoding),
                action: Some(self.violation_action()),
                detected_patterns: vec!["replacement character in content".into()],
            };
        }

        // Adjacent identical tokens (covers plain word loops).
        let (run, token) = longest_adjacent_token_run(window);
        if run >= self.cfg.repetition_threshold {
            return ValidationResult {
                valid: false,
                violation_type: Some(ViolationType::Repetition),
                action: Some(self.violation_action()),
                detected_patterns: vec![format!("token `{token}` repeated {run}x")],
            };
        }
        if run >= 3 {
            findings.push(format!("token `{token}` repeated {run}x"));
        }

        if control_bytes_re().is_match(window) {
            findings.push("control bytes in content".into());
        }
        if let Some((ch, len)) = longest_letter_run(window) {
            if len >= 10 {
                findings.push(format!("letter `{ch}` repeated {len}x"));
            }
        }
        if punct_run_re().is_match(window) {
            findings.push("punctuation run >= 20".into());
        }
        if let Some(sub) = repeated_substring(window) {
            findings.push(format!("substring `{sub}` repeated >= 3x"));
        }

        // Hallucination lexemes: >= 3 occurrences is a finding; above one
        // occurrence per 100 chars AND >= 20 occurrences is a hard violation.
        if let Some(re) = &self.lexeme_re {
            let mut counts: std::collections::HashMap<String, usize> = Default::default();
            for m in re.find_iter(window) {
                *counts.entry(m.as_str().to_lowercase()).or_default() += 1;
            }
            for (lexeme, count) in counts {
                if count >= 20 && count * 100 > window.len() {
                    return ValidationResult {
                        valid: false,
                        violation_type: Some(ViolationType::Repetition),
                        action: Some(self.violation_action()),
                        detected_patterns: vec![format!(
                            "lexeme `{lexeme}` at {count} occurrences in {} chars",
                            window.len()
                        )],
                    };
                }
                if count >= 3 {
                    findings.push(format!("lexeme `{lexeme}` repeated {count}x"));
                }
            }
        }

        if findings.len() >= self.cfg.nonsense_threshold {
            return ValidationResult {
                valid: false,
                violation_type: Some(ViolationType::Nonsense),
                action: Some(self.violation_action()),
                detected_patterns: findings,
            };
        }

        ValidationResult::ok(findings)
    }

    fn violation_action(&self) -> ViolationAction {
        if self.cfg.abort_on_violation {
            ViolationAction::Abort
        } else {
            ViolationAction::Warn
        }
    }
}

/// Trailing `max_bytes` of `s`, snapped forward to a char boundary.
fn trailing_window(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Longest run of identical adjacent whitespace-separated tokens of at least
/// 3 characters.  Returns `(run_length, token)`.
fn longest_adjacent_token_run(s: &str) -> (usize, String) {
    let mut best = (0usize, String::new());
    let mut current: Option<(&str, usize)> = None;
    for token in s.split_whitespace() {
        if token.chars().count() < 3 {
            current = None;
            continue;
        }
        match current {
            Some((prev, count)) if prev == token => {
                let count = count + 1;
                current = Some((token, count));
                if count > best.0 {
                    best = (count, token.to_string());
                }
            }
            _ => current = Some((token, 1)),
        }
    }
    best
}

/// Longest run of one identical alphabetic character.
fn longest_letter_run(s: &str) -> Option<(char, usize)> {
    let mut best: Option<(char, usize)> = None;
    let mut current: Option<(char, usize)> = None;
    for ch in s.chars() {
        if !ch.is_alphabetic() {
            current = None;
            continue;
        }
        current = match current {
            Some((prev, n)) if prev == ch => Some((ch, n + 1)),
            _ => Some((ch, 1)),
        };
        if let Some((ch, n)) = current {
            if best.map(|(_, b)| n > b).unwrap_or(true) {
                best = Some((ch, n));
            }
        }
    }
    best
}

/// Any substring of 5..=50 characters repeated at least 3 times back to
/// back.  Works on chars, so short CJK loops are caught the same way as
/// ASCII ones.
fn repeated_substring(s: &str) -> Option<String> {
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    for len in 5..=50usize {
        if len * 3 > n {
            break;
        }
        for start in 0..=(n - len * 3) {
            let a = &chars[start..start + len];
            let b = &chars[start + len..start + 2 * len];
            let c = &chars[start + 2 * len..start + 3 * len];
            if a == b && b == c {
                return Some(a.iter().collect());
            }
        }
    }
    None
}

/// Strip control bytes (except `\t` `\n` `\r`), collapse 3+ consecutive
/// newlines to 2, and trim trailing whitespace.
pub fn sanitize_content(s: &str) -> String {
    let stripped: String = s
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect();
    let collapsed = newline_collapse_re().replace_all(&stripped, "\n\n");
    collapsed.trim_end().to_string()
}

// ─── Recovery policy ──────────────────────────────────────────────────────────

/// What the stream processor knows about the turn at violation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnView {
    /// Content length before the window in which the violation was found.
    pub clean_prefix_len: usize,
    /// Any started tool call whose arguments do not yet parse as JSON.
    pub has_incomplete_tool_calls: bool,
    /// Session token estimate is high enough that a bloated context is the
    /// likely cause of the degenerate output.
    pub compaction_pressure: bool,
    /// Violations already handled earlier in this turn.
    pub prior_violations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Keep the sanitized pre-violation content and any complete tool calls;
    /// finish the turn.
    PartialRecover,
    /// Raise a compression error so the loop compacts and retries the turn
    /// without consuming a retry credit.
    CompactRetry,
    /// Mark the stream aborted; the turn fails.
    Abort,
    /// Log and keep streaming (abort_on_violation = false).
    WarnOnly,
}

pub struct Recovery {
    min_recoverable_chars: usize,
}

impl Recovery {
    pub fn new(cfg: &ValidatorConfig) -> Self {
        Self {
            min_recoverable_chars: cfg.min_recoverable_chars,
        }
    }

    pub fn decide(&self, result: &ValidationResult, turn: &TurnView) -> RecoveryStrategy {
        match result.action {
            None | Some(ViolationAction::Warn) => RecoveryStrategy::WarnOnly,
            // Length overflow: the prefix is by definition substantial.
            Some(ViolationAction::Truncate) => RecoveryStrategy::PartialRecover,
            Some(ViolationAction::Abort) => {
                if turn.clean_prefix_len >= self.min_recoverable_chars
                    && !turn.has_incomplete_tool_calls
                {
                    RecoveryStrategy::PartialRecover
                } else if turn.compaction_pressure && turn.prior_violations == 0 {
                    RecoveryStrategy::CompactRetry
                } else {
                    RecoveryStrategy::Abort
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
