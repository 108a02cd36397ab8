// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The reason/act loop: feeds the conversation to a [`ModelProvider`], parses
//! any actions out of its response, dispatches them as tool calls, appends
//! the results, and repeats until the model stops asking for tools.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kestrel_config::AgentConfig;
use kestrel_model::{
    CompletionRequest, Message, MessageCategory, ModelProvider, ResponseEvent, Role,
    ToolSchema as GatewayToolSchema,
};
use kestrel_tools::ToolCall as ExecToolCall;
use tokio::sync::oneshot;

use crate::action_parser::{self, Action};
use crate::context_window::ContextWindow;
use crate::dispatcher::{Dispatcher, ToolResult};
use crate::events::{CompactionKind, EngineEvent, EventEmitter, StreamChannel};
use crate::prompts::{system_prompt, PromptContext};
use crate::runtime_context::AgentRuntimeContext;

/// How a single model turn concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCall,
    Error,
}

/// Token accounting for one turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    pub tokens_prompt: u32,
    pub tokens_completion: u32,
    pub wall_clock_ms: u128,
}

/// One dispatched action and the outcome of executing it.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action: Action,
    pub result: ToolResult,
}

/// Result of [`Engine::run_single_turn`].
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub assistant_response: String,
    pub action_results: Vec<ActionOutcome>,
    pub usage: ResourceSnapshot,
    pub finish_reason: FinishReason,
}

/// Status a task run finished with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    MaxIterationsReached,
    Cancelled,
}

/// Options controlling [`Engine::run_task`].
pub struct RunTaskOptions {
    pub max_iterations: u32,
    /// Phrases that, when present verbatim in the assistant's text, end the
    /// task with `TaskStatus::Completed`.
    pub completion_phrases: Vec<String>,
}

impl Default for RunTaskOptions {
    fn default() -> Self {
        Self { max_iterations: 50, completion_phrases: vec!["TASK_COMPLETE".to_string()] }
    }
}

/// Result of [`Engine::run_task`].
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub assistant_response: String,
    pub iterations: u32,
    pub wall_clock_ms: u128,
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ExecToolCall {
        let args = serde_json::from_str(&self.args_buf).unwrap_or_else(|_| serde_json::json!({}));
        ExecToolCall { id: self.id, name: self.name, args }
    }
}

/// Owns one agent's conversation and drives the reason/act loop against a
/// model provider and a tool dispatcher.
pub struct Engine {
    cw: ContextWindow,
    dispatcher: Arc<Dispatcher>,
    model: Arc<dyn ModelProvider>,
    config: Arc<AgentConfig>,
    runtime: AgentRuntimeContext,
}

impl Engine {
    pub fn new(
        agent_id: impl Into<String>,
        model: Arc<dyn ModelProvider>,
        dispatcher: Arc<Dispatcher>,
        config: Arc<AgentConfig>,
        runtime: AgentRuntimeContext,
    ) -> Self {
        let max_tokens = model.catalog_context_window().unwrap_or(8192) as usize;
        let mut cw = ContextWindow::new(agent_id, max_tokens);
        cw.max_output_tokens = model.catalog_max_output_tokens().unwrap_or(4096) as usize;
        Self { cw, dispatcher, model, config, runtime }
    }

    pub fn context_window(&self) -> &ContextWindow {
        &self.cw
    }

    pub fn context_window_mut(&mut self) -> &mut ContextWindow {
        &mut self.cw
    }

    /// Emit a `message` event for a user or assistant append, in the same
    /// order the session records it.
    fn emit_message_event(&self, tx: &EventEmitter, role: Role, content: String) {
        let _ = tx.send(EngineEvent::Message {
            role,
            content,
            agent_id: Some(self.cw.session().agent_id.clone()),
            session_id: self.cw.session().id.clone(),
        });
    }

    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            git_context: self.runtime.git_context_note.as_deref(),
            project_context_file: self.runtime.project_context_file.as_deref(),
            ci_context: self.runtime.ci_context_note.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
        }
    }

    fn custom_system_prompt(&self) -> Option<&str> {
        self.runtime.system_prompt_override.as_deref().or(self.config.system_prompt.as_deref())
    }

    fn ensure_system_message(&mut self) {
        if self.cw.session().system_prompt().is_some() {
            return;
        }
        let ctx = self.prompt_context();
        let text = system_prompt(self.custom_system_prompt(), ctx.stable_only());
        self.cw.on_append(Message::system(text));
    }

    fn dynamic_suffix(&self) -> Option<String> {
        if self.custom_system_prompt().is_some() {
            return None;
        }
        self.prompt_context().dynamic_block()
    }

    fn tool_schemas(&self) -> Vec<GatewayToolSchema> {
        self.dispatcher
            .registry()
            .schemas()
            .into_iter()
            .map(|s| GatewayToolSchema { name: s.name, description: s.description, parameters: s.parameters })
            .collect()
    }

    fn estimate_schema_overhead(&self) -> usize {
        let schema_chars: usize = self
            .tool_schemas()
            .iter()
            .map(|s| s.name.len() + s.description.len() + s.parameters.to_string().len())
            .sum();
        let dynamic_chars = self.dynamic_suffix().map(|s| s.len()).unwrap_or(0);
        let overhead_chars = schema_chars + dynamic_chars;
        let reserve = (overhead_chars / 4) as f32 * (1.0 + self.config.schema_overhead_fraction);
        reserve as usize
    }

    /// Proactive/emergency compaction, run before every turn once the session
    /// is within `compaction_threshold` of the usable input budget.
    async fn compact_if_needed(&mut self, tx: &EventEmitter) {
        self.cw.schema_overhead = self.estimate_schema_overhead();
        if !self.cw.is_near_limit(self.config.compaction_threshold) {
            return;
        }
        let tokens_before = self.cw.session().total_tokens();
        let plan = self.cw.plan_compaction(&self.config);
        if plan.emergency {
            let tokens_after = self.cw.apply_emergency_compaction(&self.config);
            let _ = tx.send(EngineEvent::compacted(CompactionKind::Emergency, tokens_before, tokens_after));
            return;
        }

        let original = self.cw.session().messages.clone();
        self.cw.restore(plan.request.clone());
        let summary_turn = self.stream_one_turn(tx, false).await;
        match summary_turn {
            Ok(turn) if !turn.text.trim().is_empty() => {
                self.cw.restore(original);
                let kind = match self.config.compaction_strategy {
                    kestrel_config::CompactionStrategy::Structured => CompactionKind::Structured,
                    kestrel_config::CompactionStrategy::Narrative => CompactionKind::Narrative,
                };
                self.cw.apply_compaction_summary(plan, turn.text);
                let tokens_after = self.cw.session().total_tokens();
                let _ = tx.send(EngineEvent::compacted(kind, tokens_before, tokens_after));
            }
            _ => {
                self.cw.restore(original);
                let tokens_after = self.cw.apply_emergency_compaction(&self.config);
                let _ = tx.send(EngineEvent::compacted(CompactionKind::Emergency, tokens_before, tokens_after));
            }
        }
    }

    fn build_request(&self, with_tools: bool) -> CompletionRequest {
        CompletionRequest {
            messages: self.cw.format_for_gateway(),
            tools: if with_tools { self.tool_schemas() } else { Vec::new() },
            stream: true,
            system_dynamic_suffix: self.dynamic_suffix(),
        }
    }

    /// Stream one model turn, accumulating text/reasoning/tool calls and
    /// emitting `StreamChunk`/`TokenUpdate` events as they arrive. Does not
    /// mutate the session — the caller appends the resulting message(s).
    async fn stream_one_turn(
        &self,
        tx: &EventEmitter,
        with_tools: bool,
    ) -> anyhow::Result<StreamedTurn> {
        let req = self.build_request(with_tools);
        let mut stream = self.model.complete(req).await?;

        let mut full_text = String::new();
        let mut reasoning_text = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut usage = ResourceSnapshot::default();
        let mut finish_reason = FinishReason::Stop;
        let mut text_final_sent = false;

        while let Some(event) = stream.next().await {
            match event {
                Ok(ResponseEvent::TextDelta(delta)) => {
                    full_text.push_str(&delta);
                    let is_final = action_parser::contains_complete_action(&full_text);
                    let _ = tx.send(EngineEvent::StreamChunk {
                        chunk: delta,
                        channel: StreamChannel::Text,
                        is_final,
                        agent_id: None,
                    });
                    if is_final {
                        text_final_sent = true;
                        finish_reason = FinishReason::ToolCall;
                        break;
                    }
                }
                Ok(ResponseEvent::ThinkingDelta(delta)) => {
                    reasoning_text.push_str(&delta);
                    let _ = tx.send(EngineEvent::StreamChunk {
                        chunk: delta,
                        channel: StreamChannel::Reasoning,
                        is_final: false,
                        agent_id: None,
                    });
                }
                Ok(ResponseEvent::ToolCall { index, id, name, arguments }) => {
                    finish_reason = FinishReason::ToolCall;
                    let entry = pending.entry(index).or_insert_with(|| PendingToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        args_buf: String::new(),
                    });
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments);
                }
                Ok(ResponseEvent::Usage { input_tokens, output_tokens, .. }) => {
                    usage.tokens_prompt = input_tokens;
                    usage.tokens_completion = output_tokens;
                    let per_category: Vec<_> = self
                        .cw
                        .budgets(&crate::context_window::CategoryBudgets::default())
                        .into_iter()
                        .map(|(cat, u)| (cat, u.used))
                        .collect();
                    let _ = tx.send(EngineEvent::TokenUpdate {
                        used: (input_tokens + output_tokens) as usize,
                        max: self.cw.max_tokens,
                        per_category,
                    });
                }
                Ok(ResponseEvent::Done) => break,
                Ok(ResponseEvent::Error(msg)) => {
                    finish_reason = FinishReason::Error;
                    let _ = tx.send(EngineEvent::Error { kind: "gateway".into(), message: msg, correlation_id: None });
                    break;
                }
                Err(err) => {
                    finish_reason = FinishReason::Error;
                    let _ = tx.send(EngineEvent::Error {
                        kind: "gateway".into(),
                        message: err.to_string(),
                        correlation_id: None,
                    });
                    break;
                }
            }
        }

        if !reasoning_text.is_empty() {
            let _ = tx.send(EngineEvent::StreamChunk {
                chunk: String::new(),
                channel: StreamChannel::Reasoning,
                is_final: true,
                agent_id: None,
            });
        }

        // Every assistant message closes its text channel with exactly one
        // final chunk, whether or not an action interrupt already sent one —
        // this also covers an empty response with no deltas at all.
        if !text_final_sent {
            let _ = tx.send(EngineEvent::StreamChunk {
                chunk: String::new(),
                channel: StreamChannel::Text,
                is_final: true,
                agent_id: None,
            });
        }

        let clean_text = action_parser::strip_incomplete_tags(&full_text);
        let tool_calls: Vec<ExecToolCall> = {
            let mut entries: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
            entries.sort_by_key(|(idx, _)| *idx);
            entries
                .into_iter()
                .filter(|(_, p)| !p.name.is_empty())
                .map(|(_, p)| p.finish())
                .collect()
        };

        Ok(StreamedTurn { text: clean_text, reasoning_text, tool_calls, usage, finish_reason })
    }

    /// Execute every action from one assistant message concurrently, then
    /// append their TOOL_RESULT messages and emit their events in the order
    /// the actions appeared in the text — execution is parallel, ordering is
    /// not.
    async fn dispatch_actions(
        &mut self,
        actions: Vec<Action>,
        tx: &EventEmitter,
    ) -> Vec<ActionOutcome> {
        let dispatcher = &self.dispatcher;
        let calls: Vec<(Action, kestrel_tools::OutputCategory, Instant)> = actions
            .into_iter()
            .map(|action| {
                let category = dispatcher.output_category(&action_to_tool_call(&action).name);
                (action, category, Instant::now())
            })
            .collect();
        let executions = calls.iter().map(|(action, _, _)| dispatcher.execute(action_to_tool_call(action)));
        let results = futures::future::join_all(executions).await;

        let mut outcomes = Vec::with_capacity(results.len());
        for ((action, category, start), result) in calls.into_iter().zip(results) {
            let duration_ms = start.elapsed().as_millis() as u64;

            let _ = tx.send(EngineEvent::ToolInvocation {
                name: action.name.clone(),
                input_summary: action.payload.chars().take(200).collect(),
                ok: result.ok,
                duration_ms,
                timed_out: result.timed_out,
            });

            let raw = result.value.clone().or_else(|| result.error.clone()).unwrap_or_default();
            let cap = self.config.tool_result_token_cap;
            let truncated = crate::compact::smart_truncate(&raw, category, cap);
            let mut msg = Message::tool_result(format!("action:{}", action.name), truncated);
            msg.category = MessageCategory::ToolResult;
            self.cw.on_append(msg);

            outcomes.push(ActionOutcome { action, result });
        }
        outcomes
    }

    /// Run one reason/act turn: append `prompt` as a dialog message, stream
    /// a model response, dispatch any actions it produced, and append the
    /// tool results. Does not loop — see [`Engine::run_task`] for that.
    pub async fn run_single_turn(
        &mut self,
        prompt: impl Into<String>,
        tx: EventEmitter,
    ) -> anyhow::Result<TurnOutcome> {
        self.ensure_system_message();
        let user_text = prompt.into();
        self.cw.on_append(Message::user(user_text.clone()));
        self.emit_message_event(&tx, Role::User, user_text);
        self.compact_if_needed(&tx).await;

        let started = Instant::now();
        let turn = self.stream_one_turn(&tx, true).await?;

        if !turn.reasoning_text.is_empty() {
            self.cw.on_append(Message::reasoning(turn.reasoning_text.clone()));
        }
        let mut assistant_msg = Message::assistant(turn.text.clone());
        if turn.text.trim().is_empty() {
            assistant_msg = assistant_msg.with_metadata("empty", serde_json::Value::Bool(true));
        }
        self.cw.on_append(assistant_msg);
        self.emit_message_event(&tx, Role::Assistant, turn.text.clone());

        let actions = action_parser::parse(&turn.text);
        let action_results = if actions.is_empty() { Vec::new() } else { self.dispatch_actions(actions, &tx).await };

        let mut usage = turn.usage;
        usage.wall_clock_ms = started.elapsed().as_millis();

        Ok(TurnOutcome { assistant_response: turn.text, action_results, usage, finish_reason: turn.finish_reason })
    }

    /// Run an autonomous reason/act loop: repeat [`Engine::run_single_turn`]-style
    /// steps, feeding each turn's tool results back in as the next prompt,
    /// until a completion phrase appears in the assistant's text or
    /// `max_iterations` is reached.
    pub async fn run_task(
        &mut self,
        prompt: impl Into<String>,
        opts: RunTaskOptions,
        tx: EventEmitter,
    ) -> anyhow::Result<TaskOutcome> {
        let started = Instant::now();
        let _ = tx.send(EngineEvent::status("task_started"));

        let mut next_prompt = prompt.into();
        let mut iterations = 0u32;
        let mut last_response = String::new();

        loop {
            iterations += 1;
            let turn = self.run_single_turn(std::mem::take(&mut next_prompt), tx.clone()).await?;
            last_response = turn.assistant_response.clone();

            if opts.completion_phrases.iter().any(|p| last_response.contains(p.as_str())) {
                let _ = tx.send(EngineEvent::status("task_completed"));
                return Ok(TaskOutcome {
                    status: TaskStatus::Completed,
                    assistant_response: last_response,
                    iterations,
                    wall_clock_ms: started.elapsed().as_millis(),
                });
            }

            if turn.action_results.is_empty() {
                // No tool calls and no completion phrase: the model believes
                // it is done but did not say so explicitly. Treat as complete
                // rather than looping forever on a silent turn.
                let _ = tx.send(EngineEvent::status("task_completed"));
                return Ok(TaskOutcome {
                    status: TaskStatus::Completed,
                    assistant_response: last_response,
                    iterations,
                    wall_clock_ms: started.elapsed().as_millis(),
                });
            }

            if iterations >= opts.max_iterations {
                let _ = tx.send(EngineEvent::status("task_max_iterations"));
                return Ok(TaskOutcome {
                    status: TaskStatus::MaxIterationsReached,
                    assistant_response: last_response,
                    iterations,
                    wall_clock_ms: started.elapsed().as_millis(),
                });
            }

            next_prompt = "Continue.".to_string();
        }
    }

    /// Like [`Engine::run_single_turn`] but cooperatively cancellable.
    ///
    /// Checked once up front and raced against the model call via
    /// `tokio::select!`: if `cancel` resolves (sent or the sender half was
    /// dropped) before the model finishes streaming, the in-flight turn is
    /// abandoned — nothing from it has been committed to the session yet at
    /// that point, so there is no partial assistant message to append.
    /// Returns `Ok(None)` when cancelled, `Ok(Some(_))` otherwise.
    pub async fn run_single_turn_with_cancel(
        &mut self,
        prompt: impl Into<String>,
        tx: EventEmitter,
        cancel: &mut oneshot::Receiver<()>,
    ) -> anyhow::Result<Option<TurnOutcome>> {
        // A dropped sender is cancellation too, not just an explicit send —
        // only `Empty` means "still live, not cancelled yet".
        if !matches!(cancel.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            let _ = tx.send(EngineEvent::status("cancelled"));
            return Ok(None);
        }

        self.ensure_system_message();
        let user_text = prompt.into();
        self.cw.on_append(Message::user(user_text.clone()));
        self.emit_message_event(&tx, Role::User, user_text);
        self.compact_if_needed(&tx).await;

        let started = Instant::now();
        let turn = tokio::select! {
            biased;
            _ = &mut *cancel => {
                let _ = tx.send(EngineEvent::status("cancelled"));
                return Ok(None);
            }
            result = self.stream_one_turn(&tx, true) => result?,
        };

        if !turn.reasoning_text.is_empty() {
            self.cw.on_append(Message::reasoning(turn.reasoning_text.clone()));
        }
        let mut assistant_msg = Message::assistant(turn.text.clone());
        if turn.text.trim().is_empty() {
            assistant_msg = assistant_msg.with_metadata("empty", serde_json::Value::Bool(true));
        }
        self.cw.on_append(assistant_msg);
        self.emit_message_event(&tx, Role::Assistant, turn.text.clone());

        let actions = action_parser::parse(&turn.text);
        let action_results = if actions.is_empty() { Vec::new() } else { self.dispatch_actions(actions, &tx).await };

        let mut usage = turn.usage;
        usage.wall_clock_ms = started.elapsed().as_millis();

        Ok(Some(TurnOutcome { assistant_response: turn.text, action_results, usage, finish_reason: turn.finish_reason }))
    }

    /// Like [`Engine::run_task`] but cooperatively cancellable. Cancellation
    /// is checked at the top of every iteration (by
    /// [`Engine::run_single_turn_with_cancel`]) as well as raced against the
    /// model call mid-iteration; either way the task ends with
    /// `TaskStatus::Cancelled` and a `status=cancelled` event, keeping
    /// whatever prior iterations already completed and committed to the
    /// session.
    pub async fn run_task_with_cancel(
        &mut self,
        prompt: impl Into<String>,
        opts: RunTaskOptions,
        tx: EventEmitter,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<TaskOutcome> {
        let started = Instant::now();
        let _ = tx.send(EngineEvent::status("task_started"));

        let mut next_prompt = prompt.into();
        let mut iterations = 0u32;
        let mut last_response = String::new();

        loop {
            iterations += 1;
            let turn = match self
                .run_single_turn_with_cancel(std::mem::take(&mut next_prompt), tx.clone(), &mut cancel)
                .await?
            {
                Some(turn) => turn,
                None => {
                    return Ok(TaskOutcome {
                        status: TaskStatus::Cancelled,
                        assistant_response: last_response,
                        iterations,
                        wall_clock_ms: started.elapsed().as_millis(),
                    });
                }
            };
            last_response = turn.assistant_response.clone();

            if opts.completion_phrases.iter().any(|p| last_response.contains(p.as_str())) {
                let _ = tx.send(EngineEvent::status("task_completed"));
                return Ok(TaskOutcome {
                    status: TaskStatus::Completed,
                    assistant_response: last_response,
                    iterations,
                    wall_clock_ms: started.elapsed().as_millis(),
                });
            }

            if turn.action_results.is_empty() {
                let _ = tx.send(EngineEvent::status("task_completed"));
                return Ok(TaskOutcome {
                    status: TaskStatus::Completed,
                    assistant_response: last_response,
                    iterations,
                    wall_clock_ms: started.elapsed().as_millis(),
                });
            }

            if iterations >= opts.max_iterations {
                let _ = tx.send(EngineEvent::status("task_max_iterations"));
                return Ok(TaskOutcome {
                    status: TaskStatus::MaxIterationsReached,
                    assistant_response: last_response,
                    iterations,
                    wall_clock_ms: started.elapsed().as_millis(),
                });
            }

            next_prompt = "Continue.".to_string();
        }
    }
}

struct StreamedTurn {
    text: String,
    reasoning_text: String,
    tool_calls: Vec<ExecToolCall>,
    usage: ResourceSnapshot,
    finish_reason: FinishReason,
}

/// Map a parsed action tag to a tool call. JSON-object payloads (the newer
/// action shape — `delegate`, `spawn_sub_agent`, ...) are parsed as-is;
/// everything else carries its raw payload under a single `payload` field,
/// leaving field-specific parsing (e.g. `task_create`'s colon-delimited
/// fields) to the tool that declares itself for that action name.
fn action_to_tool_call(action: &Action) -> ExecToolCall {
    let trimmed = action.payload.trim();
    let args = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::json!({ "payload": action.payload }))
    } else {
        serde_json::json!({ "payload": action.payload })
    };
    ExecToolCall { id: format!("action-{}", action.name), name: action.name.clone(), args }
}
