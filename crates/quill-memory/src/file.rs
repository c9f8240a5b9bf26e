// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use quill_model::Message;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{CompactionRecord, MemoryError, MemoryManager, SessionRecord};

/// On-disk document holding everything persisted for one session.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionDoc {
    record: Option<SessionRecord>,
    context: Vec<Message>,
    archived: Vec<Message>,
    compactions: Vec<CompactionRecord>,
}

/// File-backed persistence: one JSON document per session under `root`.
///
/// Writes go through a temp file followed by an atomic rename so a crash
/// mid-write never leaves a truncated document behind.  A single lock
/// serializes writers; the core only ever drives one session from one task,
/// so contention is not a concern.
pub struct FileBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn read_doc(&self, id: &str) -> Result<SessionDoc, MemoryError> {
        let path = self.doc_path(id);
        if !path.exists() {
            return Err(MemoryError::SessionNotFound(id.into()));
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_doc(&self, id: &str, doc: &SessionDoc) -> Result<(), MemoryError> {
        let path = self.doc_path(id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<(), MemoryError>
    where
        F: FnOnce(&mut SessionDoc),
    {
        let mut doc = self.read_doc(id)?;
        f(&mut doc);
        self.write_doc(id, &doc)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl MemoryManager for FileBackend {
    async fn initialize(&self) -> Result<(), MemoryError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn create_session(&self, id: Option<String>) -> Result<SessionRecord, MemoryError> {
        let _guard = self.write_lock.lock().await;
        let session_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let record = SessionRecord {
            session_id: session_id.clone(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        // Re-creating an existing session keeps its stored document.
        let mut doc = self.read_doc(&session_id).unwrap_or_default();
        if doc.record.is_none() {
            doc.record = Some(record.clone());
        }
        self.write_doc(&session_id, &doc)?;
        Ok(doc.record.clone().unwrap_or(record))
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, MemoryError> {
        match self.read_doc(id) {
            Ok(doc) => Ok(doc.record),
            Err(MemoryError::SessionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_current_context(&self, id: &str) -> Result<Vec<Message>, MemoryError> {
        Ok(self.read_doc(id)?.context)
    }

    async fn save_current_context(&self, id: &str, ctx: &[Message]) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        self.mutate(id, |doc| {
            doc.context = ctx.to_vec();
            if let Some(rec) = &mut doc.record {
                rec.updated_at = Utc::now();
                rec.version += 1;
            }
        })
    }

    async fn add_message_to_context(&self, id: &str, msg: &Message) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        self.mutate(id, |doc| doc.context.push(msg.clone()))
    }

    async fn update_message_in_context(&self, id: &str, msg: &Message) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        self.mutate(id, |doc| {
            match doc
                .context
                .iter_mut()
                .find(|m| m.message_id == msg.message_id)
            {
                Some(slot) => *slot = msg.clone(),
                None => doc.context.push(msg.clone()),
            }
        })
    }

    async fn get_full_history(&self, id: &str) -> Result<Vec<Message>, MemoryError> {
        let doc = self.read_doc(id)?;
        let mut all = doc.archived;
        all.extend(doc.context);
        Ok(all)
    }

    async fn archive_messages(&self, id: &str, msgs: &[Message]) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        self.mutate(id, |doc| doc.archived.extend(msgs.iter().cloned()))
    }

    async fn add_compaction_record(
        &self,
        id: &str,
        record: &CompactionRecord,
    ) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        self.mutate(id, |doc| doc.compactions.push(record.clone()))
    }

    async fn get_compaction_records(
        &self,
        id: &str,
    ) -> Result<Vec<CompactionRecord>, MemoryError> {
        Ok(self.read_doc(id)?.compactions)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
