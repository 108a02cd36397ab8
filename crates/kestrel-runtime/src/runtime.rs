// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! [`Runtime`] — the single entry point that wires configuration, the model
//! gateway, the tool registry, the engine/coordinator, and persistence into
//! one owned set of service handles. No global state: every handle is
//! constructed here and passed down explicitly.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use kestrel_bus::{Coordinator, DelegationTool, ResumeSubAgentTool, SpawnOptions, SpawnSubAgentTool, StopSubAgentTool};
use kestrel_checkpoint::{AutoCheckpointWorker, CheckpointManager};
use kestrel_config::Config;
use kestrel_core::{AgentRuntimeContext, Dispatcher, EventEmitter, EventReceiver, RunTaskOptions, TaskOutcome, TurnOutcome};
use kestrel_store::SessionStore;
use kestrel_tools::{EchoTool, ReadFileTool, ToolRegistry};

/// Owns every long-lived service handle for one process. Frontends (a CLI,
/// a TUI, a CI runner) construct one `Runtime` and drive agents through it
/// instead of wiring the crates together themselves.
pub struct Runtime {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<SessionStore>,
    pub checkpoints: Arc<CheckpointManager>,
    auto_checkpoint: Option<AutoCheckpointWorker>,
    events_tx: EventEmitter,
}

impl Runtime {
    /// Build every service from configuration: resolve the model provider,
    /// assemble the tool registry (demo tools plus the bus delegation
    /// tools), open the session store and checkpoint manager, and start the
    /// auto-checkpoint worker.
    pub async fn bootstrap(config: Config) -> anyhow::Result<(Self, EventReceiver)> {
        let model: Arc<dyn kestrel_model::ModelProvider> = Arc::from(kestrel_model::from_config(&config.model)?);
        let store = Arc::new(SessionStore::from_config(&config.storage).await?);
        let checkpoint_store = SessionStore::open(store.root().to_path_buf()).await?;
        let checkpoints = Arc::new(CheckpointManager::open(checkpoint_store, &config.storage).await?);
        let auto_checkpoint = AutoCheckpointWorker::spawn(checkpoints.clone());

        let (events_tx, events_rx) = EventEmitter::channel();

        let depth = Arc::new(AtomicUsize::new(0));
        let agent_config = Arc::new(config.agent.clone());
        let tools_config = config.tools.clone();

        // The delegation tools call back into the very Coordinator that owns
        // their registry, so the registry must be built from a `Weak` handle
        // before the `Coordinator` exists. `Arc::new_cyclic` hands us that
        // handle up front and only turns it into a real `Arc` once the
        // closure returns.
        let coordinator = Arc::new_cyclic(|weak: &std::sync::Weak<Coordinator>| {
            let mut registry = ToolRegistry::new();
            registry.register(EchoTool).expect("built-in tool names are fixed and distinct");
            registry.register(ReadFileTool).expect("built-in tool names are fixed and distinct");
            registry
                .register(DelegationTool::new(weak.clone(), "root", depth.clone()))
                .expect("built-in tool names are fixed and distinct");
            registry
                .register(SpawnSubAgentTool::new(weak.clone(), "root"))
                .expect("built-in tool names are fixed and distinct");
            registry.register(StopSubAgentTool::new(weak.clone())).expect("built-in tool names are fixed and distinct");
            registry.register(ResumeSubAgentTool::new(weak.clone())).expect("built-in tool names are fixed and distinct");
            let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), &tools_config));

            Coordinator::new(model, dispatcher, agent_config, AgentRuntimeContext::default(), events_tx.clone())
        });

        let runtime = Self {
            coordinator,
            store,
            checkpoints,
            auto_checkpoint: Some(auto_checkpoint),
            events_tx,
        };
        Ok((runtime, events_rx))
    }

    pub fn events(&self) -> EventEmitter {
        self.events_tx.clone()
    }

    /// Spawn the top-level agent a frontend drives directly.
    pub async fn spawn_root_agent(&self, id: impl Into<String>) -> kestrel_bus::Result<()> {
        self.coordinator.spawn(id, None, SpawnOptions::default()).await
    }

    pub async fn run_turn(&self, agent_id: &str, prompt: impl Into<String>) -> kestrel_bus::Result<TurnOutcome> {
        self.coordinator.run_turn(agent_id, prompt, self.events()).await
    }

    pub async fn run_task(
        &self,
        agent_id: &str,
        prompt: impl Into<String>,
        opts: RunTaskOptions,
    ) -> kestrel_bus::Result<TaskOutcome> {
        self.coordinator.run_agent_task(agent_id, prompt, opts, self.events()).await
    }

    /// Queue a checkpoint of the named session at its current message count,
    /// deduplicating against the last checkpointed head for that session.
    pub fn request_checkpoint(&self, session_id: impl Into<String>, head_message_count: usize) {
        if let Some(worker) = &self.auto_checkpoint {
            worker.enqueue(session_id, head_message_count);
        }
    }

    /// Gracefully drain the auto-checkpoint worker before shutdown.
    pub async fn shutdown(mut self) {
        if let Some(worker) = self.auto_checkpoint.take() {
            worker.shutdown().await;
        }
    }
}
