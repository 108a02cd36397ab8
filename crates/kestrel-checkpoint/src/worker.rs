// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background FIFO worker for auto-checkpointing: the engine enqueues a
//! request every N appended messages, the worker drains them in order on its
//! own task so checkpoint I/O never blocks a turn.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::checkpoint::CheckpointManager;

/// One enqueued auto-checkpoint request.
#[derive(Debug, Clone)]
pub struct AutoCheckpointRequest {
    pub session_id: String,
    /// The session's message count at enqueue time — used to dedupe against
    /// an already-checkpointed head.
    pub head_message_count: usize,
}

/// Handle to the running worker; dropping it (after dropping the sender)
/// lets the background task observe channel closure and exit.
pub struct AutoCheckpointWorker {
    tx: mpsc::UnboundedSender<AutoCheckpointRequest>,
    handle: JoinHandle<()>,
}

impl AutoCheckpointWorker {
    /// Spawn the worker against a shared manager. The manager is cheap to
    /// clone-by-reference (`Arc`) since every request just needs `create`.
    pub fn spawn(manager: Arc<CheckpointManager>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AutoCheckpointRequest>();
        let handle = tokio::spawn(async move {
            // Last head size we actually checkpointed per session, so a run
            // of consecutive requests at the same head (no intervening
            // append) collapses to a single write.
            let mut last_checkpointed: HashMap<String, usize> = HashMap::new();
            while let Some(req) = rx.recv().await {
                if last_checkpointed.get(&req.session_id) == Some(&req.head_message_count) {
                    trace!(session_id = %req.session_id, "skipping auto-checkpoint, head unchanged");
                    continue;
                }
                match manager.create(&req.session_id, Some("auto".into()), None).await {
                    Ok(id) => {
                        last_checkpointed.insert(req.session_id.clone(), req.head_message_count);
                        trace!(session_id = %req.session_id, checkpoint_id = %id, "auto-checkpoint created");
                    }
                    Err(err) => error!(session_id = %req.session_id, error = %err, "auto-checkpoint failed"),
                }
            }
        });
        Self { tx, handle }
    }

    /// Enqueue a request. Never blocks; the worker applies dedup and backs
    /// off independently of the caller.
    pub fn enqueue(&self, session_id: impl Into<String>, head_message_count: usize) {
        let _ = self.tx.send(AutoCheckpointRequest { session_id: session_id.into(), head_message_count });
    }

    /// Stop accepting new requests and wait for the queue to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}
