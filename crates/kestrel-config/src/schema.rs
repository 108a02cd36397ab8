// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-opus-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier. Only `"mock"` ships an in-tree gateway
    /// implementation; other values are expected to be resolved by a
    /// [`crate::ModelProvider`] the embedder supplies.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override, for providers that support one.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message.
    ///
    /// The core does not implement caching itself — these flags exist so a
    /// real gateway adapter has somewhere to read its caching knobs from.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,
    /// Cache tool definitions, which are stable across requests within a session.
    #[serde(default = "default_true")]
    pub cache_tools: bool,
    /// Cache conversation history up to the last message.
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    // ── Mock provider ─────────────────────────────────────────────────────────
    /// Path to a YAML mock-responses file (used when provider = "mock").
    /// Can also be set via the KESTREL_MOCK_RESPONSES environment variable.
    pub mock_responses_file: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            cache_system_prompt: true,
            cache_tools: true,
            cache_conversation: true,
            mock_responses_file: None,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_compaction_threshold() -> f32 {
    0.85
}

/// Strategy used when compacting the session context.
///
/// `Structured` (default) instructs the model to produce a typed Markdown
/// checkpoint with fixed sections (Active Task, Key Decisions, Files &
/// Artifacts, Constraints, Pending Items, Session Narrative).  This produces
/// checkpoints that are easier for the model to navigate on future turns.
///
/// `Narrative` uses a free-form summarisation prompt and is available for
/// backward-compatibility or when a simpler output is preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous reason/act iterations before stopping
    /// (`run_task`'s `max_iterations`).
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Fraction of the usable input budget at which the context window
    /// manager performs proactive compaction (0.0–1.0).
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of recent non-system messages preserved verbatim during
    /// compaction. The oldest messages beyond this tail are summarised.
    /// Set to 0 to summarise the full history.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Compaction checkpoint format: selects which of the two compaction
    /// prompts the context window manager uses.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the session.
    /// A value of 0 disables per-result truncation entirely.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Fraction of the context window reserved for tool schemas, dynamic
    /// context (git/CI info), and measurement error in the token estimate.
    /// Reduces the effective compaction trigger threshold.
    #[serde(default = "default_schema_overhead_fraction")]
    pub schema_overhead_fraction: f32,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Per-turn wall-clock timeout in seconds (0 = no limit).
    #[serde(default)]
    pub max_step_timeout_secs: u64,
    /// Total `run_task` wall-clock timeout in seconds (0 = no limit).
    #[serde(default)]
    pub max_run_timeout_secs: u64,
}

fn default_compaction_keep_recent() -> usize {
    6
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_schema_overhead_fraction() -> f32 {
    0.10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            compaction_threshold: default_compaction_threshold(),
            compaction_keep_recent: default_compaction_keep_recent(),
            compaction_strategy: CompactionStrategy::Structured,
            tool_result_token_cap: default_tool_result_token_cap(),
            schema_overhead_fraction: default_schema_overhead_fraction(),
            system_prompt: None,
            max_step_timeout_secs: 0,
            max_run_timeout_secs: 0,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve tool invocations matching these glob patterns.
    pub auto_approve_patterns: Vec<String>,
    /// Block tool invocations matching these glob patterns, checked before
    /// `auto_approve_patterns`.
    pub deny_patterns: Vec<String>,
    /// Default timeout in seconds for a single tool call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec![
                "cat *".into(),
                "ls *".into(),
                "find *".into(),
                "rg *".into(),
                "grep *".into(),
            ],
            deny_patterns: vec!["rm -rf /*".into(), "dd if=*".into()],
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Where sessions, checkpoints, and other on-disk state live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for sessions/checkpoints. `None` resolves to the
    /// platform data directory (e.g. `~/.local/share/kestrel`) at runtime.
    pub data_dir: Option<std::path::PathBuf>,
    /// Maximum number of checkpoints kept per session; the oldest are pruned
    /// first once this is exceeded.
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention: usize,
    /// Checkpoints older than this are pruned regardless of count. `None`
    /// disables age-based pruning (count is still enforced).
    #[serde(default)]
    pub checkpoint_max_age_secs: Option<u64>,
    /// Enqueue an automatic checkpoint every N appended messages. `0`
    /// disables auto-checkpointing.
    #[serde(default = "default_auto_checkpoint_interval")]
    pub auto_checkpoint_interval: usize,
}

fn default_checkpoint_retention() -> usize {
    20
}

fn default_auto_checkpoint_interval() -> usize {
    20
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            checkpoint_retention: default_checkpoint_retention(),
            checkpoint_max_age_secs: None,
            auto_checkpoint_interval: default_auto_checkpoint_interval(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
