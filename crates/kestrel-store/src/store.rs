// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persists sessions as one versioned JSON record per session, written
//! atomically via rename-over-temp so a crash mid-write never leaves a
//! truncated or partially-overwritten file on disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kestrel_config::StorageConfig;
use kestrel_model::Session;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

const RECORD_VERSION: u32 = 1;

/// On-disk envelope around a [`Session`]. The version lets a future store
/// migrate old records without guessing the shape from the JSON alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    version: u32,
    session: Session,
}

/// Lightweight listing entry — avoids deserializing every message in every
/// session just to render a picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub message_count: usize,
}

/// Result of a guarded delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Refused { reason: String },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("kestrel").join("sessions")
}

/// File-backed session store rooted at one directory, one `<session_id>.json`
/// file per session.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open a store at an explicit root, creating the directory if absent.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Io { path: root.clone(), source })?;
        Ok(Self { root })
    }

    /// Open a store at the location named by `cfg.data_dir`, or the platform
    /// data directory when unset.
    pub async fn from_config(cfg: &StorageConfig) -> Result<Self> {
        let root = cfg.data_dir.clone().unwrap_or_else(default_data_dir);
        Self::open(root).await
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    pub async fn load(&self, session_id: &str) -> Result<Session> {
        let path = self.path_for(session_id);
        let bytes = tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(session_id.to_string())
            } else {
                StoreError::Io { path: path.clone(), source }
            }
        })?;
        let record: SessionRecord =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })?;
        Ok(record.session)
    }

    /// Write `session` atomically: serialize to a temp file in the same
    /// directory, then rename over the target. A reader never observes a
    /// partially-written file, only the old version or the new one.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let record = SessionRecord { version: RECORD_VERSION, session: session.clone() };
        let path = self.path_for(&session.id);
        let root = self.root.clone();
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|source| StoreError::Corrupt { path: path.clone(), source })?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;
            let mut tmp = tempfile::NamedTempFile::new_in(&root)
                .map_err(|source| StoreError::Io { path: root.clone(), source })?;
            tmp.write_all(&body).map_err(|source| StoreError::Io { path: root.clone(), source })?;
            tmp.persist(&path).map_err(|e| StoreError::Io { path: path.clone(), source: e.error })?;
            Ok(())
        })
        .await
        .expect("save task panicked")?;

        debug!(session_id = %session.id, "session saved");
        Ok(())
    }

    /// Append one message to a session and persist the result atomically.
    /// Loads, mutates in memory, then calls [`Self::save`] — the rename step
    /// is what makes the on-disk write atomic, not the in-memory append.
    pub async fn append(&self, session_id: &str, message: kestrel_model::Message) -> Result<Session> {
        let mut session = self.load(session_id).await?;
        session.append(message);
        self.save(&session).await?;
        Ok(session)
    }

    /// List every session in the store, newest first. Corrupt records are
    /// skipped with a warning rather than failing the whole listing.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut entries =
            tokio::fs::read_dir(&self.root).await.map_err(|source| StoreError::Io { path: self.root.clone(), source })?;

        let mut summaries = Vec::new();
        while let Some(entry) =
            entries.next_entry().await.map_err(|source| StoreError::Io { path: self.root.clone(), source })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<SessionRecord>(&bytes) {
                    Ok(record) => summaries.push(SessionSummary {
                        id: record.session.id,
                        agent_id: record.session.agent_id,
                        created_at: record.session.created_at,
                        title: record.session.title,
                        message_count: record.session.messages.len(),
                    }),
                    Err(err) => warn!(path = %path.display(), error = %err, "skipping corrupt session record"),
                },
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable session record"),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Delete a session, refusing when other agents still hold a live
    /// reference to it (e.g. a coordinator session other agents are
    /// delegating through). `referents` is the caller's current view of who
    /// still points at this session, excluding the deleting caller itself.
    pub async fn delete(&self, session_id: &str, referents: &[String]) -> Result<DeleteOutcome> {
        if !referents.is_empty() {
            return Ok(DeleteOutcome::Refused {
                reason: format!("session {session_id} still referenced by {referents:?}"),
            });
        }
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(session_id.to_string()))
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_model::Message;

    async fn temp_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (store, _dir) = temp_store().await;
        let mut session = Session::new("agent-1");
        session.append(Message::user("hello"));
        store.save(&session).await.unwrap();

        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn save_load_save_is_byte_identical_with_multi_key_metadata() {
        let (store, _dir) = temp_store().await;
        let mut session = Session::new("agent-1");
        let message = Message::user("hello")
            .with_metadata("channel", serde_json::json!("impl"))
            .with_metadata("paused", serde_json::json!(false))
            .with_metadata("type", serde_json::json!("note"));
        session.append(message);
        store.save(&session).await.unwrap();
        let first_bytes = tokio::fs::read(store.path_for(&session.id)).await.unwrap();

        let loaded = store.load(&session.id).await.unwrap();
        store.save(&loaded).await.unwrap();
        let second_bytes = tokio::fs::read(store.path_for(&session.id)).await.unwrap();

        assert_eq!(first_bytes, second_bytes);
    }

    #[tokio::test]
    async fn load_missing_session_is_not_found() {
        let (store, _dir) = temp_store().await;
        let err = store.load("does-not-exist").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn append_persists_the_new_message() {
        let (store, _dir) = temp_store().await;
        let session = Session::new("agent-1");
        store.save(&session).await.unwrap();

        store.append(&session.id, Message::user("first")).await.unwrap();
        let loaded = store.load(&session.id).await.unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn list_returns_summaries_for_every_saved_session() {
        let (store, _dir) = temp_store().await;
        let a = Session::new("agent-1");
        let b = Session::new("agent-2");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().any(|s| s.id == a.id));
        assert!(summaries.iter().any(|s| s.id == b.id));
    }

    #[tokio::test]
    async fn list_skips_corrupt_records_instead_of_failing() {
        let (store, dir) = temp_store().await;
        let good = Session::new("agent-1");
        store.save(&good).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"not json").await.unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 1);
    }

    #[tokio::test]
    async fn delete_without_referents_removes_the_file() {
        let (store, _dir) = temp_store().await;
        let session = Session::new("agent-1");
        store.save(&session).await.unwrap();

        let outcome = store.delete(&session.id, &[]).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(store.load(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn delete_with_referents_is_refused() {
        let (store, _dir) = temp_store().await;
        let session = Session::new("agent-1");
        store.save(&session).await.unwrap();

        let outcome = store.delete(&session.id, &["sub-agent-7".to_string()]).await.unwrap();
        assert!(matches!(outcome, DeleteOutcome::Refused { .. }));
        assert!(store.load(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_missing_session_is_not_found() {
        let (store, _dir) = temp_store().await;
        let err = store.delete("does-not-exist", &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
