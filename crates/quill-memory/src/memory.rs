// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use quill_model::Message;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{CompactionRecord, MemoryError, MemoryManager, SessionRecord};

#[derive(Default)]
struct SessionState {
    record: Option<SessionRecord>,
    context: Vec<Message>,
    archived: Vec<Message>,
    compactions: Vec<CompactionRecord>,
}

/// Process-local backend.  The default for tests and one-shot runs.
#[derive(Default)]
pub struct InMemoryBackend {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryManager for InMemoryBackend {
    async fn initialize(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn create_session(&self, id: Option<String>) -> Result<SessionRecord, MemoryError> {
        let session_id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let record = SessionRecord {
            session_id: session_id.clone(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let mut sessions = self.sessions.write().await;
        let state = sessions.entry(session_id).or_default();
        state.record = Some(record.clone());
        Ok(record)
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, MemoryError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(id)
            .and_then(|s| s.record.clone()))
    }

    async fn get_current_context(&self, id: &str) -> Result<Vec<Message>, MemoryError> {
        let sessions = self.sessions.read().await;
        let state = sessions
            .get(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        Ok(state.context.clone())
    }

    async fn save_current_context(&self, id: &str, ctx: &[Message]) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        state.context = ctx.to_vec();
        if let Some(rec) = &mut state.record {
            rec.updated_at = Utc::now();
            rec.version += 1;
        }
        Ok(())
    }

    async fn add_message_to_context(&self, id: &str, msg: &Message) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        state.context.push(msg.clone());
        Ok(())
    }

    async fn update_message_in_context(&self, id: &str, msg: &Message) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        match state
            .context
            .iter_mut()
            .find(|m| m.message_id == msg.message_id)
        {
            Some(slot) => *slot = msg.clone(),
            None => state.context.push(msg.clone()),
        }
        Ok(())
    }

    async fn get_full_history(&self, id: &str) -> Result<Vec<Message>, MemoryError> {
        let sessions = self.sessions.read().await;
        let state = sessions
            .get(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        let mut all = state.archived.clone();
        all.extend(state.context.clone());
        Ok(all)
    }

    async fn archive_messages(&self, id: &str, msgs: &[Message]) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        state.archived.extend(msgs.iter().cloned());
        Ok(())
    }

    async fn add_compaction_record(
        &self,
        id: &str,
        record: &CompactionRecord,
    ) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        state.compactions.push(record.clone());
        Ok(())
    }

    async fn get_compaction_records(
        &self,
        id: &str,
    ) -> Result<Vec<CompactionRecord>, MemoryError> {
        let sessions = self.sessions.read().await;
        let state = sessions
            .get(id)
            .ok_or_else(|| MemoryError::SessionNotFound(id.into()))?;
        Ok(state.compactions.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_session() {
        let be = InMemoryBackend::new();
        let rec = be.create_session(None).await.unwrap();
        let found = be.get_session(&rec.session_id).await.unwrap();
        assert!(found.is_some());
        assert!(be.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_session_with_explicit_id() {
        let be = InMemoryBackend::new();
        let rec = be.create_session(Some("fixed-id".into())).await.unwrap();
        assert_eq!(rec.session_id, "fixed-id");
    }

    #[tokio::test]
    async fn save_bumps_version() {
        let be = InMemoryBackend::new();
        let rec = be.create_session(None).await.unwrap();
        let id = rec.session_id;
        be.save_current_context(&id, &[Message::user("a")]).await.unwrap();
        be.save_current_context(&id, &[Message::user("a")]).await.unwrap();
        assert_eq!(be.get_session(&id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn update_message_replaces_by_id() {
        let be = InMemoryBackend::new();
        let id = be.create_session(None).await.unwrap().session_id;
        let mut msg = Message::assistant("partial");
        be.update_message_in_context(&id, &msg).await.unwrap();
        msg.content = quill_model::MessageContent::Text("partial plus more".into());
        be.update_message_in_context(&id, &msg).await.unwrap();
        let ctx = be.get_current_context(&id).await.unwrap();
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx[0].as_text(), "partial plus more");
    }

    #[tokio::test]
    async fn full_history_includes_archived_messages() {
        let be = InMemoryBackend::new();
        let id = be.create_session(None).await.unwrap().session_id;
        let old = Message::user("archived away");
        be.archive_messages(&id, &[old.clone()]).await.unwrap();
        be.save_current_context(&id, &[Message::user("current")])
            .await
            .unwrap();
        let history = be.get_full_history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message_id, old.message_id);
        assert_eq!(be.get_current_context(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_session_is_an_error() {
        let be = InMemoryBackend::new();
        let err = be.get_current_context("ghost").await.err().unwrap();
        assert!(matches!(err, MemoryError::SessionNotFound(_)));
    }
}
