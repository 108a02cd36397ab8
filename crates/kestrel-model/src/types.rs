// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Used for user and assistant messages that mix text with images.
/// Images are always represented as data URLs (`data:<mime>;base64,<b64>`)
/// or HTTPS URLs for providers that accept remote references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image {
        /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
        image_url: String,
        /// OpenAI vision detail level: `"low"`, `"high"`, or `"auto"`.
        ///
        /// Ignored by providers that do not distinguish detail levels.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into(), detail: None }
    }

    pub fn image_with_detail(image_url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Image { image_url: image_url.into(), detail: Some(detail.into()) }
    }
}

/// Content returned by a tool – either a plain string or structured parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ToolContentPart>),
}

impl ToolResultContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(_) => None,
        }
    }

    pub fn image_urls(&self) -> Vec<&str> {
        match self {
            Self::Text(_) => vec![],
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ToolContentPart::Image { image_url } => Some(image_url.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }
}

impl From<String> for ToolResultContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResultContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl std::fmt::Display for ToolResultContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(t) => write!(f, "{t}"),
            Self::Parts(parts) => {
                let text = parts
                    .iter()
                    .filter_map(|p| match p {
                        ToolContentPart::Text { text } => Some(text.as_str()),
                        ToolContentPart::Image { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                write!(f, "{text}")
            }
        }
    }
}

/// A single content part in a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContentPart {
    Text { text: String },
    Image {
        /// Data URL (`data:image/png;base64,...`).
        image_url: String,
    },
}

// ─── Data URL helpers ─────────────────────────────────────────────────────────

/// Parse a data URL of the form `data:<mime>;base64,<b64>` and return
/// `Ok((mime_type, base64_string))`.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

// ─── Message categories ───────────────────────────────────────────────────────

/// The context-window category a message belongs to.
///
/// Drives budgeting and trim order in the context window manager: `Reasoning`
/// is trimmed first, then `ToolResult` (oldest/biggest first), then `Dialog`
/// (oldest first); `SystemPrompt` and `Context` are preserved preferentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    SystemPrompt,
    Context,
    #[default]
    Dialog,
    ToolResult,
    Status,
    Reasoning,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in a conversation.
///
/// This type doubles as both the session-persisted entity (carrying
/// provenance, category, and budgeting metadata) and the wire shape consumed
/// by a [`crate::ModelProvider`] — the gateway reads only `role`/`content`
/// and ignores the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    /// Context-window budgeting category. Defaults to `Dialog`.
    #[serde(default)]
    pub category: MessageCategory,
    /// The agent whose session this message was appended to.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// For bus-routed messages, the intended recipient (agent id, role, or "human").
    #[serde(default)]
    pub recipient_id: Option<String>,
    /// Semantic tag such as `"delegation"`, `"human_reply"`, `"cw_clamp_notice"`.
    #[serde(default)]
    pub message_type: Option<String>,
    /// Arbitrary provenance map: `channel`, `paused`, `type`, etc.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Authoritative token count, set retroactively once the gateway reports usage.
    /// Falls back to [`Message::approx_tokens`] when unset.
    #[serde(default)]
    pub tokens_estimate: Option<u32>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn base(role: Role, content: MessageContent, category: MessageCategory) -> Self {
        Self {
            id: new_message_id(),
            role,
            content,
            category,
            agent_id: None,
            recipient_id: None,
            message_type: None,
            metadata: BTreeMap::new(),
            tokens_estimate: None,
            created_at: now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, MessageContent::Text(text.into()), MessageCategory::SystemPrompt)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(Role::User, MessageContent::Text(text.into()), MessageCategory::Dialog)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(Role::Assistant, MessageContent::Text(text.into()), MessageCategory::Dialog)
    }

    /// An assistant message that is a request to call a tool.
    pub fn assistant_tool_call(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::base(
            Role::Assistant,
            MessageContent::ToolCall {
                tool_call_id: tool_call_id.into(),
                function: FunctionCall { name: name.into(), arguments: arguments.into() },
            },
            MessageCategory::Dialog,
        )
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::base(
            Role::Tool,
            MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: ToolResultContent::Text(content.into()),
            },
            MessageCategory::ToolResult,
        )
    }

    /// Construct a tool result that contains text plus one or more image parts.
    pub fn tool_result_with_parts(id: impl Into<String>, parts: Vec<ToolContentPart>) -> Self {
        let content = if parts.is_empty() {
            ToolResultContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ToolContentPart::Text { text } = &parts[0] {
                ToolResultContent::Text(text.clone())
            } else {
                ToolResultContent::Parts(parts)
            }
        } else {
            ToolResultContent::Parts(parts)
        };
        Self::base(
            Role::Tool,
            MessageContent::ToolResult { tool_call_id: id.into(), content },
            MessageCategory::ToolResult,
        )
    }

    /// Construct a user message from a list of content parts (text + images).
    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.is_empty() {
            MessageContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::ContentParts(parts)
            }
        } else {
            MessageContent::ContentParts(parts)
        };
        Self::base(Role::User, content, MessageCategory::Dialog)
    }

    /// A reasoning/"thinking" message. Never placed in `Dialog`; budgeted separately.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::base(Role::Assistant, MessageContent::Text(text.into()), MessageCategory::Reasoning)
    }

    /// A provenance/system notice such as a `cw_clamp_notice`. Category `Status`.
    pub fn status_notice(text: impl Into<String>, message_type: impl Into<String>) -> Self {
        let mut m = Self::base(Role::System, MessageContent::Text(text.into()), MessageCategory::Status);
        m.message_type = Some(message_type.into());
        m
    }

    pub fn with_category(mut self, category: MessageCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Return the plain text of this message, if it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::ContentParts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Collect all image URLs present in this message (user or tool content).
    pub fn image_urls(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::ContentParts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Image { image_url, .. } => Some(image_url.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::ToolResult { content, .. } => content.image_urls(),
            _ => vec![],
        }
    }

    /// Approximate token count used for context management.
    ///
    /// Uses a 4-chars-per-token heuristic for text. Images use conservative
    /// fixed estimates: 85 tokens for `detail = "low"`, 765 tokens otherwise.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ContentParts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::Image { detail, .. } => {
                        let tokens = if detail.as_deref() == Some("low") { 85 } else { 765 };
                        tokens * 4
                    }
                })
                .sum(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => match content {
                ToolResultContent::Text(t) => t.len(),
                ToolResultContent::Parts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        ToolContentPart::Text { text } => text.len(),
                        ToolContentPart::Image { .. } => 765 * 4,
                    })
                    .sum(),
            },
        };
        (chars / 4).max(1)
    }

    /// The token count to use for budgeting: the authoritative
    /// [`Message::tokens_estimate`] when known, else [`Message::approx_tokens`].
    pub fn effective_tokens(&self) -> usize {
        self.tokens_estimate.map(|t| t as usize).unwrap_or_else(|| self.approx_tokens())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ContentParts(Vec<ContentPart>),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: ToolResultContent,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Dynamic context (e.g. git branch/commit, CI info) that should NOT be
    /// included in the cached portion of the system prompt.
    pub system_dynamic_suffix: Option<String>,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model on the assistant channel.
    TextDelta(String),
    /// The model wants to call a tool.
    ToolCall {
        /// Position among tool calls emitted in this turn (for parallel calls).
        index: u32,
        id: String,
        name: String,
        /// Accumulated JSON arguments (may arrive across multiple deltas)
        arguments: String,
    },
    /// A thinking/reasoning delta from the model (reasoning channel).
    ThinkingDelta(String),
    /// Final usage statistics
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    },
    /// The stream finished normally.
    Done,
    /// A recoverable error (non-fatal warning).
    Error(String),
}

/// Token usage from one turn.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_text_and_category() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
        assert_eq!(m.category, MessageCategory::Dialog);
    }

    #[test]
    fn message_system_is_system_prompt_category() {
        let m = Message::system("you are helpful");
        assert_eq!(m.category, MessageCategory::SystemPrompt);
    }

    #[test]
    fn message_tool_result_is_tool_result_category() {
        let m = Message::tool_result("id-1", "output");
        assert_eq!(m.category, MessageCategory::ToolResult);
        assert!(m.as_text().is_none());
    }

    #[test]
    fn message_reasoning_is_reasoning_category() {
        let m = Message::reasoning("thinking...");
        assert_eq!(m.category, MessageCategory::Reasoning);
        assert_eq!(m.role, Role::Assistant);
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::user("x");
        let b = Message::user("x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn message_tool_result_with_image_parts() {
        let parts = vec![
            ToolContentPart::Text { text: "here is the chart".into() },
            ToolContentPart::Image { image_url: "data:image/png;base64,ABC".into() },
        ];
        let m = Message::tool_result_with_parts("call-1", parts);
        assert_eq!(m.image_urls(), vec!["data:image/png;base64,ABC"]);
    }

    #[test]
    fn message_user_with_parts_image() {
        let parts = vec![
            ContentPart::Text { text: "what is this?".into() },
            ContentPart::image("data:image/png;base64,XYZ"),
        ];
        let m = Message::user_with_parts(parts);
        assert_eq!(m.image_urls(), vec!["data:image/png;base64,XYZ"]);
        assert!(m.as_text().is_none());
    }

    #[test]
    fn as_text_returns_none_for_tool_call_content() {
        let m = Message::assistant_tool_call("x", "f", "{}");
        assert!(m.as_text().is_none());
    }

    #[test]
    fn approx_tokens_text_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = Message::user("hi");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn effective_tokens_prefers_authoritative_count() {
        let mut m = Message::user("12345678"); // approx = 2
        m.tokens_estimate = Some(99);
        assert_eq!(m.effective_tokens(), 99);
    }

    #[test]
    fn effective_tokens_falls_back_to_approx() {
        let m = Message::user("12345678");
        assert_eq!(m.effective_tokens(), m.approx_tokens());
    }

    #[test]
    fn approx_tokens_tool_call_uses_name_plus_args() {
        let m = Message::assistant_tool_call("id", "aaaa", "bbbbbbbb"); // 12 chars / 4 = 3
        assert_eq!(m.approx_tokens(), 3);
    }

    #[test]
    fn approx_tokens_tool_result_uses_content() {
        let m = Message::tool_result("id", "1234567890123456"); // 16 chars → 4 tokens
        assert_eq!(m.approx_tokens(), 4);
    }

    #[test]
    fn approx_tokens_image_detail_low_uses_85_tokens() {
        let parts = vec![ContentPart::image_with_detail("data:image/png;base64,A", "low")];
        let m = Message::user_with_parts(parts);
        assert_eq!(m.approx_tokens(), 85);
    }

    #[test]
    fn message_serialises_and_deserialises() {
        let original = Message::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.role, Role::User);
        assert_eq!(decoded.as_text(), Some("test payload"));
        assert_eq!(decoded.id, original.id);
    }

    #[test]
    fn message_deserialises_without_new_fields_uses_defaults() {
        // Old-shaped record (pre-category/id enrichment) still parses.
        let json = r#"{"role":"user","content":"legacy"}"#;
        let m: Message = serde_json::from_str(json).unwrap();
        assert_eq!(m.category, MessageCategory::Dialog);
        assert!(m.metadata.is_empty());
    }

    #[test]
    fn with_metadata_round_trips() {
        let m = Message::user("hi").with_metadata("channel", serde_json::json!("impl"));
        assert_eq!(m.metadata.get("channel").unwrap(), "impl");
    }

    #[test]
    fn content_part_image_round_trip() {
        let p = ContentPart::image("data:image/png;base64,ABC");
        let json = serde_json::to_string(&p).unwrap();
        let back: ContentPart = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
