// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Point-in-time session snapshots: create, list, roll back to, and branch
//! from. Snapshots are full copies of a [`Session`] at the moment of
//! creation, stored next to (but independently of) the live session in
//! [`kestrel_store::SessionStore`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kestrel_config::StorageConfig;
use kestrel_model::Session;
use kestrel_store::SessionStore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CheckpointError, Result};

/// Metadata about one checkpoint, without the snapshot payload — what
/// `list()` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointRecord {
    checkpoint: Checkpoint,
    snapshot: Session,
}

async fn write_atomic(root: &Path, file_name: &str, body: Vec<u8>) -> Result<()> {
    let path = root.join(file_name);
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&root)
            .map_err(|source| CheckpointError::Io { path: root.clone(), source })?;
        tmp.write_all(&body).map_err(|source| CheckpointError::Io { path: root.clone(), source })?;
        tmp.persist(&path).map_err(|e| CheckpointError::Io { path: path.clone(), source: e.error })?;
        Ok(())
    })
    .await
    .expect("checkpoint write task panicked")
}

/// Snapshot/restore/branch over a [`SessionStore`], with age+count retention
/// and a FIFO auto-checkpoint worker (see [`crate::worker`]).
pub struct CheckpointManager {
    pub(crate) store: SessionStore,
    root: PathBuf,
    retention_count: usize,
    retention_max_age_secs: Option<u64>,
}

impl CheckpointManager {
    /// The underlying session store, so callers can save a session before
    /// checkpointing it.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }
}

impl CheckpointManager {
    pub async fn open(store: SessionStore, cfg: &StorageConfig) -> Result<Self> {
        let root = store.root().join("checkpoints");
        tokio::fs::create_dir_all(&root).await.map_err(|source| CheckpointError::Io { path: root.clone(), source })?;
        Ok(Self {
            store,
            root,
            retention_count: cfg.checkpoint_retention,
            retention_max_age_secs: cfg.checkpoint_max_age_secs,
        })
    }

    fn path_for(&self, checkpoint_id: &str) -> PathBuf {
        self.root.join(format!("{checkpoint_id}.json"))
    }

    /// Snapshot `session_id`'s current head. Prunes old checkpoints for the
    /// same session per the retention policy once the new one is written.
    pub async fn create(
        &self,
        session_id: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<String> {
        let snapshot = self.store.load(session_id).await?;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            name,
            description,
            created_at: Utc::now(),
            message_count: snapshot.messages.len(),
        };
        let id = checkpoint.id.clone();
        let record = CheckpointRecord { checkpoint, snapshot };
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|source| CheckpointError::Corrupt { path: self.path_for(&id), source })?;
        write_atomic(&self.root, &format!("{id}.json"), body).await?;
        debug!(checkpoint_id = %id, session_id, "checkpoint created");

        self.enforce_retention(session_id).await?;
        Ok(id)
    }

    async fn read_record(&self, checkpoint_id: &str) -> Result<CheckpointRecord> {
        let path = self.path_for(checkpoint_id);
        let bytes = tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CheckpointError::NotFound(checkpoint_id.to_string())
            } else {
                CheckpointError::Io { path: path.clone(), source }
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Corrupt { path, source })
    }

    /// List checkpoints, oldest first. `session_id` filters to one session
    /// when given, otherwise every checkpoint in the store is listed.
    pub async fn list(&self, session_id: Option<&str>) -> Result<Vec<Checkpoint>> {
        let mut entries =
            tokio::fs::read_dir(&self.root).await.map_err(|source| CheckpointError::Io { path: self.root.clone(), source })?;
        let mut checkpoints = Vec::new();
        while let Some(entry) =
            entries.next_entry().await.map_err(|source| CheckpointError::Io { path: self.root.clone(), source })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(record) = serde_json::from_slice::<CheckpointRecord>(&bytes) {
                    if session_id.map(|s| s == record.checkpoint.session_id).unwrap_or(true) {
                        checkpoints.push(record.checkpoint);
                    }
                }
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(checkpoints)
    }

    /// Replace the live session with `checkpoint_id`'s snapshot verbatim.
    pub async fn rollback(&self, checkpoint_id: &str) -> Result<bool> {
        let record = self.read_record(checkpoint_id).await?;
        self.store.save(&record.snapshot).await?;
        debug!(checkpoint_id, session_id = %record.checkpoint.session_id, "rolled back");
        Ok(true)
    }

    /// Fork a new session whose initial state is `checkpoint_id`'s snapshot.
    pub async fn branch(&self, checkpoint_id: &str, name: Option<String>) -> Result<String> {
        let record = self.read_record(checkpoint_id).await?;
        let mut branched = Session::new(record.snapshot.agent_id.clone());
        branched.title = name.or(record.snapshot.title.clone());
        branched.replace_messages(record.snapshot.messages.clone());
        self.store.save(&branched).await?;
        Ok(branched.id)
    }

    /// Drop checkpoints beyond the configured count (oldest first) and any
    /// older than the configured max age, for one session.
    async fn enforce_retention(&self, session_id: &str) -> Result<()> {
        let mut checkpoints = self.list(Some(session_id)).await?;
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let now = Utc::now();
        let mut to_drop: Vec<&Checkpoint> = Vec::new();
        if let Some(max_age) = self.retention_max_age_secs {
            to_drop.extend(checkpoints.iter().filter(|c| {
                (now - c.created_at).num_seconds().max(0) as u64 > max_age
            }));
        }
        if checkpoints.len() > self.retention_count {
            let overflow = checkpoints.len() - self.retention_count;
            to_drop.extend(checkpoints.iter().take(overflow));
        }

        let mut seen = std::collections::HashSet::new();
        for checkpoint in to_drop {
            if seen.insert(checkpoint.id.clone()) {
                let age = (now - checkpoint.created_at).to_std().unwrap_or_default();
                let path = self.path_for(&checkpoint.id);
                let _ = tokio::fs::remove_file(&path).await;
                debug!(
                    checkpoint_id = %checkpoint.id,
                    age = %humantime::format_duration(age),
                    "pruned checkpoint"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_model::Message;

    async fn setup() -> (CheckpointManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let mgr = CheckpointManager::open(store, &StorageConfig::default()).await.unwrap();
        (mgr, dir)
    }

    #[tokio::test]
    async fn create_then_list_returns_the_checkpoint() {
        let (mgr, _dir) = setup().await;
        let session = Session::new("agent-1");
        mgr.store.save(&session).await.unwrap();

        let id = mgr.create(&session.id, Some("before refactor".into()), None).await.unwrap();
        let checkpoints = mgr.list(Some(&session.id)).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].id, id);
        assert_eq!(checkpoints[0].name.as_deref(), Some("before refactor"));
    }

    #[tokio::test]
    async fn rollback_restores_the_snapshot_contents() {
        let (mgr, _dir) = setup().await;
        let mut session = Session::new("agent-1");
        session.append(Message::user("one"));
        mgr.store.save(&session).await.unwrap();
        let id = mgr.create(&session.id, None, None).await.unwrap();

        session.append(Message::user("two"));
        mgr.store.save(&session).await.unwrap();
        assert_eq!(mgr.store.load(&session.id).await.unwrap().messages.len(), 2);

        mgr.rollback(&id).await.unwrap();
        assert_eq!(mgr.store.load(&session.id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn branch_creates_a_new_session_with_the_same_messages() {
        let (mgr, _dir) = setup().await;
        let mut session = Session::new("agent-1");
        session.append(Message::user("shared history"));
        mgr.store.save(&session).await.unwrap();
        let id = mgr.create(&session.id, None, None).await.unwrap();

        let new_session_id = mgr.branch(&id, Some("fork".into())).await.unwrap();
        assert_ne!(new_session_id, session.id);
        let branched = mgr.store.load(&new_session_id).await.unwrap();
        assert_eq!(branched.messages.len(), 1);
        assert_eq!(branched.title.as_deref(), Some("fork"));
    }

    #[tokio::test]
    async fn retention_prunes_oldest_checkpoints_beyond_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let cfg = StorageConfig { checkpoint_retention: 2, ..StorageConfig::default() };
        let mgr = CheckpointManager::open(store, &cfg).await.unwrap();

        let session = Session::new("agent-1");
        mgr.store.save(&session).await.unwrap();
        for _ in 0..5 {
            mgr.create(&session.id, None, None).await.unwrap();
        }
        let checkpoints = mgr.list(Some(&session.id)).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn rollback_unknown_checkpoint_is_not_found() {
        let (mgr, _dir) = setup().await;
        let err = mgr.rollback("nope").await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }
}
