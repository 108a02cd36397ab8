// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Owns every live agent's [`Engine`] and routes envelopes between them,
//! between roles, and to/from the human outside the model loop.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_config::AgentConfig;
use kestrel_core::{
    AgentRuntimeContext, Dispatcher, Engine, EngineEvent, EventEmitter, RunTaskOptions, TaskOutcome, TurnOutcome,
};
use kestrel_model::{Message, MessageCategory, ModelProvider};
use tokio::sync::Mutex;
use tracing::warn;

use crate::envelope::{Envelope, Recipient, RouteOutcome};
use crate::error::{BusError, Result};
use crate::registry::{AgentRecord, AgentRegistry};

/// Options for [`Coordinator::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub persona: Option<String>,
    /// Agent id to share a session (and therefore context window) with,
    /// rather than starting a fresh one.
    pub share_session: Option<String>,
    /// Share the parent's context window instance outright. Since an
    /// `Engine` owns exactly one `Session`/`ContextWindow` pair, this
    /// collapses onto the same engine as the parent, like `share_session`
    /// pointed at it — there is no separate-session, shared-CWM engine in
    /// this design.
    pub share_context_window: bool,
    /// When the child gets its own session (`share_session=None` and
    /// `share_context_window=false`), clamp its fresh context window's
    /// `max_tokens` to `min(parent.max_tokens, shared_cw_max_tokens)` and
    /// note the clamp in the parent's session.
    pub shared_cw_max_tokens: Option<usize>,
    pub initial_prompt: Option<String>,
}

type SharedEngine = Arc<Mutex<Engine>>;

pub struct Coordinator {
    model: Arc<dyn ModelProvider>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<AgentConfig>,
    runtime: AgentRuntimeContext,
    registry: Mutex<AgentRegistry>,
    /// Keyed by session id rather than agent id, so `share_session` agents
    /// transparently reuse the same `Engine`/`ContextWindow`.
    engines: Mutex<HashMap<String, SharedEngine>>,
    /// Envelopes addressed to a paused agent, held until it resumes.
    inbox: Mutex<HashMap<String, Vec<Envelope>>>,
    events: EventEmitter,
}

impl Coordinator {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<AgentConfig>,
        runtime: AgentRuntimeContext,
        events: EventEmitter,
    ) -> Self {
        Self {
            model,
            dispatcher,
            config,
            runtime,
            registry: Mutex::new(AgentRegistry::new()),
            engines: Mutex::new(HashMap::new()),
            inbox: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn dead_letter(&self, envelope: &Envelope, reason: &str) {
        warn!(correlation_id = %envelope.correlation_id, reason, "dead-lettering envelope");
        let _ = self.events.send(EngineEvent::Error {
            kind: "dead_letter".into(),
            message: reason.to_string(),
            correlation_id: Some(envelope.correlation_id.clone()),
        });
    }

    /// Create the agent record and, unless sharing an existing session or
    /// context window, a fresh `Engine`. A child with its own session
    /// (`share_session=None`, `share_context_window=false`) gets a one-time
    /// clone of the parent's CONTEXT messages and, if `shared_cw_max_tokens`
    /// is set, a clamped `max_tokens` plus a `cw_clamp_notice` left in the
    /// parent's session. Seeds `initial_prompt` as a plain appended message —
    /// it is up to the caller to actually drive a turn.
    pub async fn spawn(&self, id: impl Into<String>, parent: Option<String>, opts: SpawnOptions) -> Result<()> {
        let id = id.into();
        let mut registry = self.registry.lock().await;
        if registry.get(&id).is_some() {
            return Err(BusError::AlreadyExists(id));
        }

        // An unknown parent is not itself an error here — only the optional
        // CONTEXT-clone/clamp step below depends on resolving it, and that
        // step already tolerates a missing parent engine. A caller
        // delegating from an id it hasn't registered with the bus yet still
        // gets a normal, parentless child.
        let parent_session_id = parent.as_ref().and_then(|p| registry.get(p).map(|r| r.session_id.clone()));

        let session_id = match &opts.share_session {
            Some(shared_with) => {
                registry.get(shared_with).map(|r| r.session_id.clone()).ok_or_else(|| {
                    BusError::UnknownAgent(shared_with.clone())
                })?
            }
            None if opts.share_context_window => parent_session_id
                .clone()
                .ok_or_else(|| BusError::UnknownAgent("share_context_window requires a parent".into()))?,
            None => id.clone(),
        };

        let independent_child = opts.share_session.is_none() && !opts.share_context_window;

        {
            let mut engines = self.engines.lock().await;
            let is_new = !engines.contains_key(&session_id);
            let engine = engines
                .entry(session_id.clone())
                .or_insert_with(|| {
                    let engine = Engine::new(
                        session_id.clone(),
                        self.model.clone(),
                        self.dispatcher.clone(),
                        self.config.clone(),
                        self.runtime.clone(),
                    );
                    Arc::new(Mutex::new(engine))
                })
                .clone();

            if is_new && independent_child {
                if let Some(parent_sid) = &parent_session_id {
                    if let Some(parent_engine) = engines.get(parent_sid).cloned() {
                        let (parent_max_tokens, context_messages) = {
                            let parent_engine = parent_engine.lock().await;
                            let max_tokens = parent_engine.context_window().max_tokens;
                            let messages = parent_engine
                                .context_window()
                                .session()
                                .messages
                                .iter()
                                .filter(|m| m.category == MessageCategory::Context)
                                .cloned()
                                .collect::<Vec<_>>();
                            (max_tokens, messages)
                        };

                        {
                            let mut child_engine = engine.lock().await;
                            for message in context_messages {
                                child_engine.context_window_mut().on_append(message);
                            }
                            if let Some(clamp) = opts.shared_cw_max_tokens {
                                child_engine.context_window_mut().max_tokens = parent_max_tokens.min(clamp);
                            }
                        }

                        if let Some(clamp) = opts.shared_cw_max_tokens {
                            let mut parent_engine = parent_engine.lock().await;
                            parent_engine.context_window_mut().on_append(Message::status_notice(
                                format!("child '{id}' context window clamped to {clamp} tokens"),
                                "cw_clamp_notice",
                            ));
                        }
                    }
                }
            }
        }

        registry.insert(AgentRecord {
            id: id.clone(),
            parent,
            role: opts.persona,
            session_id: session_id.clone(),
            paused: false,
        });
        drop(registry);

        if let Some(prompt) = opts.initial_prompt {
            self.append_to_session(&session_id, None, &prompt).await;
        }
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.set_paused(id, true) {
            Ok(())
        } else {
            Err(BusError::UnknownAgent(id.to_string()))
        }
    }

    /// Resume an agent and flush any directed envelopes it queued while
    /// paused, in the order they arrived.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if !registry.set_paused(id, false) {
            return Err(BusError::UnknownAgent(id.to_string()));
        }
        drop(registry);

        let pending = self.inbox.lock().await.remove(id).unwrap_or_default();
        for envelope in pending {
            self.deliver_directed(id, envelope).await;
        }
        Ok(())
    }

    /// Remove the agent from routing. The session (and its `Engine`, if no
    /// other agent still shares it) is left alone — sessions persist.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let record = registry.remove(id).ok_or_else(|| BusError::UnknownAgent(id.to_string()))?;
        if registry.session_refcount(&record.session_id) == 0 {
            drop(registry);
            self.engines.lock().await.remove(&record.session_id);
        }
        Ok(())
    }

    /// Route one envelope. Never fails — unroutable envelopes are
    /// dead-lettered rather than raising to the caller.
    pub async fn route(&self, envelope: Envelope) -> RouteOutcome {
        match envelope.to.clone() {
            Recipient::Human => {
                let message_type = envelope.metadata.message_type.clone().unwrap_or_else(|| "info".into());
                let _ = self.events.send(EngineEvent::HumanMessage { text: envelope.content.clone(), message_type });
                RouteOutcome::Delivered
            }
            Recipient::Agent(id) => self.deliver_directed(&id, envelope).await,
            Recipient::Role(role) => {
                let target = self.registry.lock().await.next_for_role(&role);
                match target {
                    Some(id) => self.deliver_directed(&id, envelope).await,
                    None => {
                        self.dead_letter(&envelope, "no active agent for role");
                        RouteOutcome::DeadLetter
                    }
                }
            }
        }
    }

    async fn deliver_directed(&self, id: &str, envelope: Envelope) -> RouteOutcome {
        let record = self.registry.lock().await.get(id).cloned();
        let record = match record {
            Some(r) => r,
            None => {
                self.dead_letter(&envelope, "unknown agent");
                return RouteOutcome::DeadLetter;
            }
        };

        if record.paused {
            let mut paused_envelope = envelope;
            paused_envelope.metadata.paused = true;
            self.inbox.lock().await.entry(id.to_string()).or_default().push(paused_envelope);
            return RouteOutcome::Queued;
        }

        self.append_to_session(&record.session_id, envelope.from_agent.as_deref(), &envelope.content).await;
        RouteOutcome::Delivered
    }

    async fn append_to_session(&self, session_id: &str, from_agent: Option<&str>, content: &str) {
        let engine = { self.engines.lock().await.get(session_id).cloned() };
        let Some(engine) = engine else {
            warn!(session_id, "append targeted a session with no live engine");
            return;
        };
        let mut engine = engine.lock().await;
        let mut message = Message::user(content.to_string());
        if let Some(from) = from_agent {
            message = message.with_agent_id(from.to_string());
        }
        engine.context_window_mut().on_append(message);
        let _ = self.events.send(EngineEvent::Message {
            role: kestrel_model::Role::User,
            content: content.to_string(),
            agent_id: from_agent.map(str::to_string),
            session_id: session_id.to_string(),
        });
    }

    /// Feed `initial_input` through each role's agent in turn, round-robin
    /// selecting the live agent for that role and passing agent N's
    /// response as agent N+1's prompt.
    pub async fn run_chain(&self, roles: &[String], initial_input: String) -> Result<String> {
        let mut input = initial_input;
        for role in roles {
            let id = self.registry.lock().await.next_for_role(role).ok_or_else(|| BusError::UnknownRole(role.clone()))?;
            let session_id = self
                .registry
                .lock()
                .await
                .get(&id)
                .map(|r| r.session_id.clone())
                .ok_or_else(|| BusError::UnknownAgent(id.clone()))?;
            let engine = self.engines.lock().await.get(&session_id).cloned().ok_or_else(|| BusError::UnknownAgent(id.clone()))?;
            let mut engine = engine.lock().await;
            let (tx, _rx) = EventEmitter::channel();
            let outcome = engine.run_single_turn(input, tx).await?;
            input = outcome.assistant_response;
        }
        Ok(input)
    }

    /// Run a single turn directly on one agent, bypassing routing. This is
    /// the primary entry point for a caller (CLI, TUI) driving its own
    /// top-level agent rather than relaying through the bus.
    pub async fn run_turn(
        &self,
        agent_id: &str,
        prompt: impl Into<String>,
        tx: EventEmitter,
    ) -> Result<TurnOutcome> {
        let engine = self.engine_for(agent_id).await?;
        let mut engine = engine.lock().await;
        Ok(engine.run_single_turn(prompt, tx).await?)
    }

    /// Run a full reason/act task directly on one agent.
    pub async fn run_agent_task(
        &self,
        agent_id: &str,
        prompt: impl Into<String>,
        opts: RunTaskOptions,
        tx: EventEmitter,
    ) -> Result<TaskOutcome> {
        let engine = self.engine_for(agent_id).await?;
        let mut engine = engine.lock().await;
        Ok(engine.run_task(prompt, opts, tx).await?)
    }

    /// Like [`Coordinator::run_agent_task`], but the caller can interrupt the
    /// run by dropping (or sending on) the paired `oneshot::Sender<()>`.
    pub async fn run_agent_task_with_cancel(
        &self,
        agent_id: &str,
        prompt: impl Into<String>,
        opts: RunTaskOptions,
        tx: EventEmitter,
        cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<TaskOutcome> {
        let engine = self.engine_for(agent_id).await?;
        let mut engine = engine.lock().await;
        Ok(engine.run_task_with_cancel(prompt, opts, tx, cancel).await?)
    }

    async fn engine_for(&self, agent_id: &str) -> Result<SharedEngine> {
        let session_id = self
            .registry
            .lock()
            .await
            .get(agent_id)
            .map(|r| r.session_id.clone())
            .ok_or_else(|| BusError::UnknownAgent(agent_id.to_string()))?;
        self.engines
            .lock()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| BusError::UnknownAgent(agent_id.to_string()))
    }

    /// Snapshot of one agent's session messages, for callers (CLI status
    /// views, checkpoint triggers, tests) that need to inspect state without
    /// driving a turn.
    pub async fn session_messages(&self, agent_id: &str) -> Result<Vec<Message>> {
        let engine = self.engine_for(agent_id).await?;
        let engine = engine.lock().await;
        Ok(engine.context_window().session().messages.clone())
    }

    /// The agent's current context window budget, in tokens.
    pub async fn context_window_max_tokens(&self, agent_id: &str) -> Result<usize> {
        let engine = self.engine_for(agent_id).await?;
        let engine = engine.lock().await;
        Ok(engine.context_window().max_tokens)
    }

    pub fn send_to_human(&self, text: impl Into<String>, message_type: impl Into<String>) {
        let _ = self.events.send(EngineEvent::HumanMessage { text: text.into(), message_type: message_type.into() });
    }

    pub async fn human_reply(&self, agent_id: &str, text: impl Into<String>) -> Result<()> {
        let session_id =
            self.registry.lock().await.get(agent_id).map(|r| r.session_id.clone()).ok_or_else(|| {
                BusError::UnknownAgent(agent_id.to_string())
            })?;
        self.append_to_session(&session_id, None, &text.into()).await;
        Ok(())
    }

    /// Spawn a child agent, drive it through a full reason/act task, then
    /// tear it down. Blocks the calling turn's dispatch slot until the child
    /// finishes — not the coordinator itself, which remains free to route
    /// other agents' traffic concurrently.
    pub async fn delegate(&self, parent_id: &str, child_id: impl Into<String>, prompt: String) -> Result<String> {
        let child_id = child_id.into();
        self.spawn(
            child_id.clone(),
            Some(parent_id.to_string()),
            SpawnOptions { persona: Some("delegate".into()), ..SpawnOptions::default() },
        )
        .await?;

        let session_id =
            self.registry.lock().await.get(&child_id).map(|r| r.session_id.clone()).expect("just spawned");
        let engine = self.engines.lock().await.get(&session_id).cloned().expect("just spawned");
        let outcome = {
            let mut engine = engine.lock().await;
            let (tx, _rx) = EventEmitter::channel();
            engine.run_task(prompt, RunTaskOptions::default(), tx).await?
        };

        let _ = self.destroy(&child_id).await;
        Ok(outcome.assistant_response)
    }
}
