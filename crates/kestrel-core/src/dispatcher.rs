// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Validates and executes tool calls with a bounded deadline and an approval
//! gate, wrapping [`kestrel_tools::ToolRegistry`] and [`kestrel_tools::ToolPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_config::ToolsConfig;
use kestrel_tools::{ApprovalPolicy, Tool, ToolCall, ToolOutput, ToolPolicy, ToolRegistry};

/// Resolves `Ask` decisions to a yes/no. The default always approves; an
/// embedder wires in a real prompt (TUI confirmation, Slack approval, ...).
#[async_trait]
pub trait ApprovalHook: Send + Sync {
    async fn approve(&self, call: &ToolCall) -> bool;
}

pub struct AutoApprove;

#[async_trait]
impl ApprovalHook for AutoApprove {
    async fn approve(&self, _call: &ToolCall) -> bool {
        true
    }
}

/// Outcome of dispatching one tool call.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub ok: bool,
    pub value: Option<String>,
    pub error: Option<String>,
    /// Process exit code for shell-like tools that report one; `None` for
    /// tools with no notion of a return code.
    pub returncode: Option<i32>,
    pub timed_out: bool,
}

impl ToolResult {
    fn from_output(output: ToolOutput) -> Self {
        if output.is_error {
            Self { ok: false, value: None, error: Some(output.content), returncode: output.returncode, timed_out: false }
        } else {
            Self { ok: true, value: Some(output.content), error: None, returncode: output.returncode, timed_out: false }
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self { ok: false, value: None, error: Some(reason.into()), returncode: None, timed_out: false }
    }

    fn timeout(tool_name: &str, deadline: Duration) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(format!("tool '{tool_name}' timed out after {:?}", deadline)),
            returncode: None,
            timed_out: true,
        }
    }

    fn invalid_args(tool_name: &str, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(format!("tool '{tool_name}' rejected: {}", detail.into())),
            returncode: None,
            timed_out: false,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    policy: ToolPolicy,
    default_timeout: Duration,
    /// Per-tool timeout overrides, e.g. from `KESTREL_TOOL_TIMEOUT_<NAME>` env vars.
    per_tool_timeout: HashMap<String, Duration>,
    approval: Arc<dyn ApprovalHook>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, tools_cfg: &ToolsConfig) -> Self {
        Self {
            registry,
            policy: ToolPolicy::from_config(tools_cfg),
            default_timeout: Duration::from_secs(tools_cfg.timeout_secs),
            per_tool_timeout: HashMap::new(),
            approval: Arc::new(AutoApprove),
        }
    }

    pub fn with_approval_hook(mut self, hook: Arc<dyn ApprovalHook>) -> Self {
        self.approval = hook;
        self
    }

    pub fn with_tool_timeout(mut self, tool_name: impl Into<String>, timeout: Duration) -> Self {
        self.per_tool_timeout.insert(tool_name.into(), timeout);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The effective `OutputCategory` for a tool, defaulting to `Generic`
    /// when the tool is not registered (used by the context window's
    /// deterministic truncation before the tool call fails at execute time).
    pub fn output_category(&self, tool_name: &str) -> kestrel_tools::OutputCategory {
        self.registry.get(tool_name).map(|t| t.output_category()).unwrap_or_default()
    }

    fn timeout_for(&self, tool_name: &str) -> Duration {
        self.per_tool_timeout.get(tool_name).copied().unwrap_or(self.default_timeout)
    }

    /// Checks `call.args` against the tool's declared JSON Schema before
    /// invocation. A schema that fails to compile is treated as permissive
    /// (the tool is responsible for its own schema correctness; we don't
    /// want a malformed schema to take down every call to that tool).
    fn validate_args(&self, call: &ToolCall, schema: serde_json::Value) -> Result<(), String> {
        let compiled = match jsonschema::JSONSchema::compile(&schema) {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        let errors: Vec<String> =
            compiled.validate(&call.args).err().into_iter().flatten().map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// Deny wins over auto-approve on a conflicting glob pattern; when no
    /// pattern matches at all the tool's own declared default applies,
    /// rather than a hardcoded `Ask`.
    fn decide(&self, call: &ToolCall, tool_default: ApprovalPolicy) -> ApprovalPolicy {
        let rendered = format!("{} {}", call.name, call.args);
        match self.policy.decide(&rendered) {
            ApprovalPolicy::Ask => tool_default,
            decided => decided,
        }
    }

    /// Validate approval policy, then execute with a bounded deadline.
    /// Never raises — failures (unknown tool, denied, timed out, tool error)
    /// all come back as a `ToolResult` with `ok: false`.
    pub async fn execute(&self, call: ToolCall) -> ToolResult {
        let tool = match self.registry.get(&call.name) {
            Some(t) => t,
            None => return ToolResult::denied(format!("unknown tool: {}", call.name)),
        };

        match self.decide(&call, tool.default_policy()) {
            ApprovalPolicy::Deny => {
                return ToolResult::denied(format!("tool '{}' denied by policy", call.name));
            }
            ApprovalPolicy::Ask => {
                if !self.approval.approve(&call).await {
                    return ToolResult::denied(format!("tool '{}' not approved", call.name));
                }
            }
            ApprovalPolicy::Auto => {}
        }

        if let Err(detail) = self.validate_args(&call, tool.parameters_schema()) {
            return ToolResult::invalid_args(&call.name, detail);
        }

        let deadline = self.timeout_for(&call.name);
        match tokio::time::timeout(deadline, tool.execute(&call)).await {
            Ok(output) => ToolResult::from_output(output),
            Err(_) => ToolResult::timeout(&call.name, deadline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kestrel_tools::{ApprovalPolicy as AP, ToolOutput};
    use serde_json::json;

    struct SlowTool;
    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> AP {
            AP::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ToolOutput::ok(&call.id, "done")
        }
    }

    struct AskTool;
    #[async_trait]
    impl Tool for AskTool {
        fn name(&self) -> &str {
            "ask_tool"
        }
        fn description(&self) -> &str {
            "needs confirmation"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        fn default_policy(&self) -> AP {
            AP::Ask
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "ran")
        }
    }

    struct StrictTool;
    #[async_trait]
    impl Tool for StrictTool {
        fn name(&self) -> &str {
            "strict"
        }
        fn description(&self) -> &str {
            "requires an integer 'count' argument"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": { "count": { "type": "integer" } },
                "required": ["count"],
            })
        }
        fn default_policy(&self) -> AP {
            AP::Auto
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("counted {}", call.args["count"]))
        }
    }

    struct DenyOnce;
    #[async_trait]
    impl ApprovalHook for DenyOnce {
        async fn approve(&self, _call: &ToolCall) -> bool {
            false
        }
    }

    fn registry_with(tools: Vec<Box<dyn Tool>>) -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        for t in tools {
            reg.register(BoxedTool(t)).unwrap();
        }
        Arc::new(reg)
    }

    // `ToolRegistry::register` takes `impl Tool + 'static` by value, so box
    // dynamic tools behind a thin newtype that forwards the trait.
    struct BoxedTool(Box<dyn Tool>);
    #[async_trait]
    impl Tool for BoxedTool {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn description(&self) -> &str {
            self.0.description()
        }
        fn parameters_schema(&self) -> serde_json::Value {
            self.0.parameters_schema()
        }
        fn default_policy(&self) -> AP {
            self.0.default_policy()
        }
        fn output_category(&self) -> kestrel_tools::OutputCategory {
            self.0.output_category()
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            self.0.execute(call).await
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall { id: "1".into(), name: name.into(), args: json!({}) }
    }

    fn call_with_args(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall { id: "1".into(), name: name.into(), args }
    }

    #[tokio::test]
    async fn unknown_tool_is_denied_not_panicked() {
        let reg = registry_with(vec![]);
        let dispatcher = Dispatcher::new(reg, &ToolsConfig::default());
        let result = dispatcher.execute(call("nope")).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn auto_policy_tool_executes_without_approval_hook() {
        let reg = registry_with(vec![Box::new(SlowTool)]);
        let mut cfg = ToolsConfig::default();
        cfg.timeout_secs = 5;
        let dispatcher = Dispatcher::new(reg, &cfg);
        let result = dispatcher.execute(call("slow")).await;
        assert!(result.ok);
        assert_eq!(result.value.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn per_tool_timeout_override_fires() {
        let reg = registry_with(vec![Box::new(SlowTool)]);
        let mut cfg = ToolsConfig::default();
        cfg.timeout_secs = 5;
        let dispatcher = Dispatcher::new(reg, &cfg).with_tool_timeout("slow", Duration::from_millis(10));
        let result = dispatcher.execute(call("slow")).await;
        assert!(result.timed_out);
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn zero_timeout_times_out_immediately() {
        let reg = registry_with(vec![Box::new(SlowTool)]);
        let dispatcher = Dispatcher::new(reg, &ToolsConfig::default()).with_tool_timeout("slow", Duration::ZERO);
        let result = dispatcher.execute(call("slow")).await;
        assert!(result.timed_out);
        assert!(!result.ok);
    }

    #[tokio::test]
    async fn deny_pattern_beats_tool_auto_default() {
        let reg = registry_with(vec![Box::new(SlowTool)]);
        let mut cfg = ToolsConfig::default();
        cfg.deny_patterns = vec!["slow *".into()];
        let dispatcher = Dispatcher::new(reg, &cfg);
        let result = dispatcher.execute(call("slow")).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("denied by policy"));
    }

    #[tokio::test]
    async fn args_failing_the_tool_schema_are_rejected_before_execute() {
        let reg = registry_with(vec![Box::new(StrictTool)]);
        let dispatcher = Dispatcher::new(reg, &ToolsConfig::default());
        let result = dispatcher.execute(call_with_args("strict", json!({ "count": "not a number" }))).await;
        assert!(!result.ok);
        assert!(!result.timed_out);
        assert!(result.error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn args_matching_the_tool_schema_execute_normally() {
        let reg = registry_with(vec![Box::new(StrictTool)]);
        let dispatcher = Dispatcher::new(reg, &ToolsConfig::default());
        let result = dispatcher.execute(call_with_args("strict", json!({ "count": 3 }))).await;
        assert!(result.ok);
        assert_eq!(result.value.as_deref(), Some("counted 3"));
    }

    #[tokio::test]
    async fn ask_policy_defers_to_approval_hook() {
        let reg = registry_with(vec![Box::new(AskTool)]);
        let dispatcher = Dispatcher::new(reg, &ToolsConfig::default()).with_approval_hook(Arc::new(DenyOnce));
        let result = dispatcher.execute(call("ask_tool")).await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("not approved"));
    }

    #[tokio::test]
    async fn auto_approve_hook_lets_ask_tool_run() {
        let reg = registry_with(vec![Box::new(AskTool)]);
        let dispatcher = Dispatcher::new(reg, &ToolsConfig::default());
        let result = dispatcher.execute(call("ask_tool")).await;
        assert!(result.ok);
    }

    #[test]
    fn output_category_defaults_for_unregistered_tool() {
        let reg = registry_with(vec![]);
        let dispatcher = Dispatcher::new(reg, &ToolsConfig::default());
        assert_eq!(dispatcher.output_category("nope"), kestrel_tools::OutputCategory::Generic);
    }
}
