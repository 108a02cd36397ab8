// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Echoes its `text` argument back unchanged. Useful for exercising the
/// dispatch path without touching the filesystem or network.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back. Useful for testing the tool pipeline."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo back" }
            },
            "required": ["text"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match call.args.get("text").and_then(|v| v.as_str()) {
            Some(text) => ToolOutput::ok(&call.id, text),
            None => ToolOutput::err(&call.id, "missing 'text'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(text: &str) -> ToolCall {
        ToolCall { id: "1".into(), name: "echo".into(), args: json!({ "text": text }) }
    }

    #[tokio::test]
    async fn echoes_input_text() {
        let out = EchoTool.execute(&call("hello")).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn missing_text_is_error() {
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({}) };
        let out = EchoTool.execute(&call).await;
        assert!(out.is_error);
    }
}
