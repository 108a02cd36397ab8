// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-category token budgeting and trimming, plus the two coarser
//! compaction mechanisms (proactive and emergency) that sit above it.
//!
//! `ContextWindow` owns a [`kestrel_model::Session`] and is the only thing in
//! this crate allowed to mutate its message list. Everything here is
//! synchronous; the one step that needs a model call (turning a compaction
//! prompt into a summary) is left to the caller — see [`ContextWindow::plan_compaction`].

use std::collections::HashMap;

use kestrel_config::AgentConfig;
use kestrel_model::{Message, MessageCategory, MessageContent, Session};

use crate::compact::{compact_session_with_strategy, emergency_compact};

/// Fraction of `max_tokens` reserved for each message category. Used only
/// for [`ContextWindow::budgets`] (UI display); trimming order is fixed and
/// does not read these fractions directly.
#[derive(Debug, Clone)]
pub struct CategoryBudgets {
    pub system_prompt: f32,
    pub context: f32,
    pub dialog: f32,
    pub tool_result: f32,
    pub status: f32,
    pub reasoning: f32,
}

impl Default for CategoryBudgets {
    fn default() -> Self {
        Self { system_prompt: 0.05, context: 0.15, dialog: 0.55, tool_result: 0.15, status: 0.02, reasoning: 0.08 }
    }
}

/// Token/message counts dropped from one category during a trim pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimEvent {
    pub category: MessageCategory,
    pub dropped_tokens: usize,
    pub dropped_messages: usize,
}

/// `{used, max}` for one category, as reported to a UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryUsage {
    pub used: usize,
    pub max: usize,
}

/// A prepared compaction request: either the deterministic emergency path,
/// or a model-bound summarization prompt plus the verbatim tail to splice
/// the eventual summary back in front of.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub emergency: bool,
    /// When `!emergency`, the messages to send to the gateway for a summary.
    /// When `emergency`, empty — the caller should use [`ContextWindow::apply_emergency_compaction`] instead.
    pub request: Vec<Message>,
    recent: Vec<Message>,
    system: Option<Message>,
}

pub struct ContextWindow {
    session: Session,
    pub max_tokens: usize,
    pub max_output_tokens: usize,
    /// Tokens reserved for tool schemas and the dynamic (git/CI) context
    /// block — items sent with every request but not stored as messages.
    pub schema_overhead: usize,
}

impl ContextWindow {
    pub fn new(agent_id: impl Into<String>, max_tokens: usize) -> Self {
        Self::from_session(Session::new(agent_id), max_tokens)
    }

    pub fn from_session(session: Session, max_tokens: usize) -> Self {
        Self { session, max_tokens, max_output_tokens: 0, schema_overhead: 0 }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Usable input budget: the context window minus reserved output tokens
    /// minus estimated schema/dynamic-context overhead.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens).saturating_sub(self.schema_overhead)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        let budget = self.input_budget();
        if budget == 0 {
            return false;
        }
        (self.session.total_tokens() as f32 / budget as f32) >= threshold
    }

    /// Append a message and reconcile per-category overflow immediately.
    pub fn on_append(&mut self, message: Message) -> Vec<TrimEvent> {
        self.session.append(message);
        self.reconcile()
    }

    /// Trim REASONING → TOOL_RESULT (biggest-first, to free the most tokens
    /// per message removed) → DIALOG (oldest-first) → CONTEXT (oldest-first,
    /// last resort) until the session fits `input_budget()`, or until nothing
    /// left to trim. SYSTEM_PROMPT is never trimmed.
    fn reconcile(&mut self) -> Vec<TrimEvent> {
        let budget = self.input_budget();
        if budget == 0 {
            return Vec::new();
        }
        let mut events = Vec::new();
        for category in [
            MessageCategory::Reasoning,
            MessageCategory::ToolResult,
            MessageCategory::Dialog,
            MessageCategory::Context,
        ] {
            if self.session.total_tokens() <= budget {
                break;
            }
            if let Some(ev) = self.trim_category(category, budget) {
                events.push(ev);
            }
        }
        if !events.is_empty() {
            let notice = trim_notice(&events);
            self.session.append(Message::status_notice(notice, "cw_clamp_notice"));
        }
        events
    }

    fn trim_category(&mut self, category: MessageCategory, budget: usize) -> Option<TrimEvent> {
        let mut indices: Vec<usize> = self
            .session
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.category == category)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return None;
        }
        // TOOL_RESULT drops the biggest entries first (frees the most tokens
        // per removal); every other trimmed category drops the oldest first.
        if category == MessageCategory::ToolResult {
            indices.sort_by_key(|&i| std::cmp::Reverse(self.session.messages[i].effective_tokens()));
        }

        let mut dropped_tokens = 0usize;
        let mut dropped_messages = 0usize;
        let mut to_remove = Vec::new();
        for idx in indices {
            if self.session.total_tokens() - dropped_tokens <= budget {
                break;
            }
            dropped_tokens += self.session.messages[idx].effective_tokens();
            dropped_messages += 1;
            to_remove.push(idx);
        }
        if to_remove.is_empty() {
            return None;
        }
        to_remove.sort_unstable();
        for &idx in to_remove.iter().rev() {
            self.session.messages.remove(idx);
        }
        Some(TrimEvent { category, dropped_tokens, dropped_messages })
    }

    /// `{category: {used, max}}` for UI display.
    pub fn budgets(&self, fractions: &CategoryBudgets) -> HashMap<MessageCategory, CategoryUsage> {
        let max_total = self.max_tokens as f32;
        let used = |cat: MessageCategory| -> usize {
            self.session.messages_in_category(cat).map(Message::effective_tokens).sum()
        };
        let mut out = HashMap::new();
        out.insert(
            MessageCategory::SystemPrompt,
            CategoryUsage { used: used(MessageCategory::SystemPrompt), max: (max_total * fractions.system_prompt) as usize },
        );
        out.insert(
            MessageCategory::Context,
            CategoryUsage { used: used(MessageCategory::Context), max: (max_total * fractions.context) as usize },
        );
        out.insert(
            MessageCategory::Dialog,
            CategoryUsage { used: used(MessageCategory::Dialog), max: (max_total * fractions.dialog) as usize },
        );
        out.insert(
            MessageCategory::ToolResult,
            CategoryUsage { used: used(MessageCategory::ToolResult), max: (max_total * fractions.tool_result) as usize },
        );
        out.insert(
            MessageCategory::Status,
            CategoryUsage { used: used(MessageCategory::Status), max: (max_total * fractions.status) as usize },
        );
        out.insert(
            MessageCategory::Reasoning,
            CategoryUsage { used: used(MessageCategory::Reasoning), max: (max_total * fractions.reasoning) as usize },
        );
        out
    }

    /// Ordered, trimmed message view for the gateway: system prompt first,
    /// then every other message in session order.
    pub fn format_for_gateway(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.session.messages.len());
        if let Some(sys) = self.session.system_prompt() {
            out.push(sys.clone());
        }
        out.extend(self.session.messages.iter().filter(|m| m.category != MessageCategory::SystemPrompt).cloned());
        out
    }

    /// Build a compaction plan without issuing any gateway call. When the
    /// plan's old-messages portion alone would overflow the budget, the plan
    /// is marked `emergency` and the caller should use
    /// [`ContextWindow::apply_emergency_compaction`] instead of sending `request`.
    pub fn plan_compaction(&self, cfg: &AgentConfig) -> CompactionPlan {
        let sys = self.session.system_prompt().cloned();
        let keep_n = cfg.compaction_keep_recent;
        let non_system: Vec<Message> =
            self.session.messages.iter().filter(|m| m.category != MessageCategory::SystemPrompt).cloned().collect();

        let preserve_count = if non_system.len() > keep_n * 2 { keep_n } else { 0 };
        let mut summarize_count = non_system.len().saturating_sub(preserve_count);

        // Never split in the middle of a tool-call/tool-result pair — back
        // off until the recent tail starts on a clean conversation boundary.
        while summarize_count > 0 && summarize_count < non_system.len() {
            match &non_system[summarize_count].content {
                MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => summarize_count -= 1,
                _ => break,
            }
        }

        let recent: Vec<Message> = non_system[summarize_count..].to_vec();
        let recent_tokens: usize = recent.iter().map(Message::approx_tokens).sum();
        let total = self.session.total_tokens();
        let compaction_input = total.saturating_sub(recent_tokens);
        let budget = self.input_budget();
        let emergency_fraction = 0.95_f32;
        let emergency =
            summarize_count == 0 || budget == 0 || (compaction_input as f32 / budget.max(1) as f32) >= emergency_fraction;

        let request = if emergency {
            Vec::new()
        } else {
            let mut to_compact = non_system[..summarize_count].to_vec();
            compact_session_with_strategy(&mut to_compact, sys.clone(), &cfg.compaction_strategy);
            to_compact
        };

        CompactionPlan { emergency, request, recent, system: sys }
    }

    /// Deterministic, model-free compaction: keeps only the last `keep_n`
    /// non-system messages and prepends a canned drop notice. Always succeeds.
    pub fn apply_emergency_compaction(&mut self, cfg: &AgentConfig) -> usize {
        let sys = self.session.system_prompt().cloned();
        emergency_compact(&mut self.session.messages, sys, cfg.compaction_keep_recent);
        self.session.total_tokens()
    }

    /// Splice a model-produced summary back into the session: system prompt,
    /// then the summary as an assistant message, then the preserved tail.
    pub fn apply_compaction_summary(&mut self, plan: CompactionPlan, summary: String) {
        let mut messages = Vec::with_capacity(plan.recent.len() + 2);
        if let Some(sys) = plan.system {
            messages.push(sys);
        }
        messages.push(Message::assistant(summary));
        messages.extend(plan.recent);
        self.session.replace_messages(messages);
    }

    /// Restore the session verbatim (checkpoint rollback, or aborting a
    /// compaction attempt whose model call failed).
    pub fn restore(&mut self, messages: Vec<Message>) {
        self.session.replace_messages(messages);
    }
}

fn trim_notice(events: &[TrimEvent]) -> String {
    let total_tokens: usize = events.iter().map(|e| e.dropped_tokens).sum();
    let total_messages: usize = events.iter().map(|e| e.dropped_messages).sum();
    let per_category = events
        .iter()
        .map(|e| format!("{:?}: {} messages / {} tokens", e.category, e.dropped_messages, e.dropped_tokens))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "[context window clamp: dropped {total_messages} messages / {total_tokens} tokens to stay under budget ({per_category})]"
    )
}
