// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod action_parser;
mod compact;
mod context_window;
mod dispatcher;
mod engine;
mod events;
mod prompts;
mod runtime_context;

pub use action_parser::{
    contains_complete_action, parse, parse_summary_note, split_colon_fields, strip_incomplete_tags,
    Action, KNOWN_ACTIONS,
};
pub use compact::{compact_session, compact_session_with_strategy, emergency_compact, smart_truncate};
pub use context_window::{CategoryBudgets, CategoryUsage, CompactionPlan, ContextWindow, TrimEvent};
pub use dispatcher::{ApprovalHook, AutoApprove, Dispatcher, ToolResult};
pub use engine::{
    ActionOutcome, Engine, FinishReason, ResourceSnapshot, RunTaskOptions, TaskOutcome, TaskStatus,
    TurnOutcome,
};
pub use events::{CompactionKind, EngineEvent, EventEmitter, EventReceiver, StreamChannel};
pub use prompts::{system_prompt, PromptContext};
pub use runtime_context::AgentRuntimeContext;
