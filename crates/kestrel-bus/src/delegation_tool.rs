// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Exposes sub-agent spawn/delegate/pause/resume as ordinary tools, so the
//! model invokes them through the same dispatcher path as every other tool
//! rather than through a side channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kestrel_tools::{ApprovalPolicy, Tool, ToolCall, ToolOutput};
use serde_json::json;

use crate::coordinator::{Coordinator, SpawnOptions};

/// Sub-agent nesting is capped so a delegate chain cannot recurse forever.
pub const MAX_DELEGATION_DEPTH: usize = 3;

/// The delegation tools hold a `Weak` handle rather than an `Arc` because
/// they are registered into the registry the `Coordinator` itself is built
/// from — an `Arc` back-reference would be a cycle. The coordinator outlives
/// every tool call made through it in practice; `upgrade()` only fails if
/// the whole runtime has already been torn down.
fn upgrade(coordinator: &Weak<Coordinator>, call_id: &str) -> Result<Arc<Coordinator>, ToolOutput> {
    coordinator.upgrade().ok_or_else(|| ToolOutput::err(call_id, "coordinator has shut down"))
}

/// Runs a sub-task to completion on a freshly spawned agent and returns its
/// final response. Blocks only the calling turn's dispatch slot — the
/// coordinator remains free to route other agents' traffic while this runs.
pub struct DelegationTool {
    coordinator: Weak<Coordinator>,
    parent_id: String,
    depth: Arc<AtomicUsize>,
}

impl DelegationTool {
    pub fn new(coordinator: Weak<Coordinator>, parent_id: impl Into<String>, depth: Arc<AtomicUsize>) -> Self {
        Self { coordinator, parent_id: parent_id.into(), depth }
    }
}

#[async_trait]
impl Tool for DelegationTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained sub-task to a fresh agent and wait for its result."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "the task to hand off" }
            },
            "required": ["prompt"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        if self.depth.load(Ordering::SeqCst) >= MAX_DELEGATION_DEPTH {
            return ToolOutput::err(&call.id, "maximum sub-agent delegation depth reached");
        }
        let Some(prompt) = call.args.get("prompt").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field 'prompt'");
        };
        let coordinator = match upgrade(&self.coordinator, &call.id) {
            Ok(c) => c,
            Err(out) => return out,
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        let child_id = format!("{}-delegate-{}", self.parent_id, uuid::Uuid::new_v4());
        let result = coordinator.delegate(&self.parent_id, child_id, prompt.to_string()).await;
        self.depth.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(response) => ToolOutput::ok(&call.id, response),
            Err(err) => ToolOutput::err(&call.id, err.to_string()),
        }
    }
}

/// Spawns a durable named sub-agent that keeps running after this call
/// returns, rather than being awaited to completion like [`DelegationTool`].
pub struct SpawnSubAgentTool {
    coordinator: Weak<Coordinator>,
    parent_id: String,
}

impl SpawnSubAgentTool {
    pub fn new(coordinator: Weak<Coordinator>, parent_id: impl Into<String>) -> Self {
        Self { coordinator, parent_id: parent_id.into() }
    }
}

#[async_trait]
impl Tool for SpawnSubAgentTool {
    fn name(&self) -> &str {
        "spawn_sub_agent"
    }

    fn description(&self) -> &str {
        "Spawn a named sub-agent that keeps running after this call returns."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "persona": { "type": "string" },
                "share_session": { "type": "boolean", "description": "share this agent's session instead of starting a fresh one" },
                "initial_prompt": { "type": "string" }
            },
            "required": ["id"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(id) = call.args.get("id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field 'id'");
        };
        let coordinator = match upgrade(&self.coordinator, &call.id) {
            Ok(c) => c,
            Err(out) => return out,
        };
        let persona = call.args.get("persona").and_then(|v| v.as_str()).map(str::to_string);
        let share_session = call
            .args
            .get("share_session")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
            .then(|| self.parent_id.clone());
        let initial_prompt = call.args.get("initial_prompt").and_then(|v| v.as_str()).map(str::to_string);

        let opts = SpawnOptions { persona, share_session, initial_prompt };
        match coordinator.spawn(id, Some(self.parent_id.clone()), opts).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("spawned sub-agent '{id}'")),
            Err(err) => ToolOutput::err(&call.id, err.to_string()),
        }
    }
}

/// Pauses a sub-agent: role-routed traffic skips it and directed envelopes
/// queue until it resumes.
pub struct StopSubAgentTool {
    coordinator: Weak<Coordinator>,
}

impl StopSubAgentTool {
    pub fn new(coordinator: Weak<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Tool for StopSubAgentTool {
    fn name(&self) -> &str {
        "stop_sub_agent"
    }

    fn description(&self) -> &str {
        "Pause a sub-agent so it stops receiving routed work until resumed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": { "id": { "type": "string" } }, "required": ["id"] })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(id) = call.args.get("id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field 'id'");
        };
        let coordinator = match upgrade(&self.coordinator, &call.id) {
            Ok(c) => c,
            Err(out) => return out,
        };
        match coordinator.pause(id).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("paused sub-agent '{id}'")),
            Err(err) => ToolOutput::err(&call.id, err.to_string()),
        }
    }
}

/// Resumes a paused sub-agent, flushing any envelopes it queued while paused.
pub struct ResumeSubAgentTool {
    coordinator: Weak<Coordinator>,
}

impl ResumeSubAgentTool {
    pub fn new(coordinator: Weak<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Tool for ResumeSubAgentTool {
    fn name(&self) -> &str {
        "resume_sub_agent"
    }

    fn description(&self) -> &str {
        "Resume a paused sub-agent, flushing any envelopes queued while it was paused."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": { "id": { "type": "string" } }, "required": ["id"] })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(id) = call.args.get("id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required field 'id'");
        };
        let coordinator = match upgrade(&self.coordinator, &call.id) {
            Ok(c) => c,
            Err(out) => return out,
        };
        match coordinator.resume(id).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("resumed sub-agent '{id}'")),
            Err(err) => ToolOutput::err(&call.id, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait as at;
    use futures::stream;
    use kestrel_config::{AgentConfig, ToolsConfig};
    use kestrel_core::{AgentRuntimeContext, Dispatcher, EventEmitter};
    use kestrel_model::{CompletionRequest, ModelProvider, ResponseEvent};
    use std::pin::Pin;

    struct EchoProvider;
    #[at]
    impl ModelProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        fn model_name(&self) -> &str {
            "echo-1"
        }
        async fn complete(
            &self,
            _req: CompletionRequest,
        ) -> anyhow::Result<Pin<Box<dyn futures::Stream<Item = anyhow::Result<ResponseEvent>> + Send>>> {
            Ok(Box::pin(stream::iter(vec![
                Ok(ResponseEvent::TextDelta("ack".into())),
                Ok(ResponseEvent::Done),
            ])))
        }
    }

    fn coordinator() -> Arc<Coordinator> {
        let (tx, _rx) = EventEmitter::channel();
        let registry = kestrel_tools::ToolRegistry::new();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), &ToolsConfig::default()));
        Arc::new(Coordinator::new(
            Arc::new(EchoProvider),
            dispatcher,
            Arc::new(AgentConfig::default()),
            AgentRuntimeContext::default(),
            tx,
        ))
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "1".into(), name: "x".into(), args }
    }

    #[tokio::test]
    async fn delegate_tool_runs_a_sub_task_and_returns_its_response() {
        let coord = coordinator();
        let tool = DelegationTool::new(Arc::downgrade(&coord), "parent", Arc::new(AtomicUsize::new(0)));
        let output = tool.execute(&call(json!({ "prompt": "do it" }))).await;
        assert!(!output.is_error);
        assert_eq!(output.content, "ack");
    }

    #[tokio::test]
    async fn delegate_tool_refuses_past_max_depth() {
        let coord = coordinator();
        let tool = DelegationTool::new(
            Arc::downgrade(&coord),
            "parent",
            Arc::new(AtomicUsize::new(MAX_DELEGATION_DEPTH)),
        );
        let output = tool.execute(&call(json!({ "prompt": "do it" }))).await;
        assert!(output.is_error);
        assert!(output.content.contains("maximum"));
    }

    #[tokio::test]
    async fn delegate_tool_errors_once_the_coordinator_is_gone() {
        let coord = coordinator();
        let weak = Arc::downgrade(&coord);
        drop(coord);
        let tool = DelegationTool::new(weak, "parent", Arc::new(AtomicUsize::new(0)));
        let output = tool.execute(&call(json!({ "prompt": "do it" }))).await;
        assert!(output.is_error);
        assert!(output.content.contains("shut down"));
    }

    #[tokio::test]
    async fn spawn_then_stop_then_resume_round_trips() {
        let coord = coordinator();
        let spawn_tool = SpawnSubAgentTool::new(Arc::downgrade(&coord), "parent");
        let stop_tool = StopSubAgentTool::new(Arc::downgrade(&coord));
        let resume_tool = ResumeSubAgentTool::new(Arc::downgrade(&coord));

        let spawn_out = spawn_tool.execute(&call(json!({ "id": "child-1" }))).await;
        assert!(!spawn_out.is_error);

        let stop_out = stop_tool.execute(&call(json!({ "id": "child-1" }))).await;
        assert!(!stop_out.is_error);

        let resume_out = resume_tool.execute(&call(json!({ "id": "child-1" }))).await;
        assert!(!resume_out.is_error);
    }

    #[tokio::test]
    async fn stop_unknown_sub_agent_is_an_error_result_not_a_panic() {
        let coord = coordinator();
        let tool = StopSubAgentTool::new(Arc::downgrade(&coord));
        let output = tool.execute(&call(json!({ "id": "ghost" }))).await;
        assert!(output.is_error);
    }
}
