// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pluggable session persistence.
//!
//! The execution core talks to a [`MemoryManager`] and never to a concrete
//! backend.  Two backends ship here: [`InMemoryBackend`] for tests and
//! ephemeral runs, and [`FileBackend`] which keeps one JSON document per
//! session on disk.  Persistence failures must never fail the agent's main
//! flow — call sites log and continue.

mod file;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quill_model::Message;
use serde::{Deserialize, Serialize};

pub use file::FileBackend;
pub use memory::InMemoryBackend;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend closed")]
    Closed,
}

/// Stored metadata for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonically increasing; bumped on every context save.
    pub version: u64,
}

/// One entry in a session's compaction journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub compaction_id: String,
    pub compacted_at: DateTime<Utc>,
    pub messages_before: usize,
    pub messages_after: usize,
    /// Ids of the messages the summary replaced.
    pub archived_message_ids: Vec<String>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub reason: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Key/value/list persistence surface consumed by the session layer.
#[async_trait]
pub trait MemoryManager: Send + Sync {
    async fn initialize(&self) -> Result<(), MemoryError>;
    async fn close(&self) -> Result<(), MemoryError>;

    /// Create a session.  `id = None` generates a fresh uuid.
    async fn create_session(&self, id: Option<String>) -> Result<SessionRecord, MemoryError>;
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, MemoryError>;

    /// The active (non-archived) context for a session.
    async fn get_current_context(&self, id: &str) -> Result<Vec<Message>, MemoryError>;
    /// Replace the active context wholesale.  Idempotent.
    async fn save_current_context(&self, id: &str, ctx: &[Message]) -> Result<(), MemoryError>;
    async fn add_message_to_context(&self, id: &str, msg: &Message) -> Result<(), MemoryError>;
    /// Update a message in place by `message_id` (used for partial streaming
    /// snapshots).  Appends when the id is not present yet.
    async fn update_message_in_context(&self, id: &str, msg: &Message) -> Result<(), MemoryError>;

    /// Full history including messages archived by compaction.
    async fn get_full_history(&self, id: &str) -> Result<Vec<Message>, MemoryError>;
    /// Archive messages removed from the active context (compaction).
    async fn archive_messages(&self, id: &str, msgs: &[Message]) -> Result<(), MemoryError>;

    async fn add_compaction_record(
        &self,
        id: &str,
        record: &CompactionRecord,
    ) -> Result<(), MemoryError>;
    async fn get_compaction_records(&self, id: &str)
        -> Result<Vec<CompactionRecord>, MemoryError>;
}
