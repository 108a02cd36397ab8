// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolOutput};

const READ_LIMIT: usize = 200_000;

/// Reads a UTF-8 text file from disk. Reference implementation of a
/// `FileContent`-categorised tool for the truncation path to exercise.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the file" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'path'"),
        };

        debug!(path = %path, "read_file tool");

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let content = if text.len() > READ_LIMIT {
                    format!("{}...[truncated]", &text[..READ_LIMIT])
                } else {
                    text.to_string()
                };
                ToolOutput::ok(&call.id, content)
            }
            Err(e) => ToolOutput::err(&call.id, format!("read error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/tmp/kestrel_read_file_test_{}_{n}.txt", std::process::id())
    }

    #[tokio::test]
    async fn reads_existing_file() {
        let path = tmp_path();
        std::fs::write(&path, "hello file").unwrap();

        let call = ToolCall { id: "1".into(), name: "read_file".into(), args: json!({ "path": path }) };
        let out = ReadFileTool.execute(&call).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "hello file");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let call = ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            args: json!({ "path": "/tmp/kestrel_does_not_exist_xyz.txt" }),
        };
        let out = ReadFileTool.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("read error"));
    }

    #[tokio::test]
    async fn missing_path_is_error() {
        let call = ToolCall { id: "1".into(), name: "read_file".into(), args: json!({}) };
        let out = ReadFileTool.execute(&call).await;
        assert!(out.is_error);
    }

    #[test]
    fn output_category_is_file_content() {
        assert_eq!(ReadFileTool.output_category(), OutputCategory::FileContent);
    }
}
