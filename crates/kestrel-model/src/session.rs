// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Message, MessageCategory};

/// An ordered, append-only log of messages belonging to one agent.
///
/// Persisted verbatim by a session store; `created_at` is monotonically
/// non-decreasing and message ids are unique within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            created_at: Utc::now(),
            title: None,
            messages: Vec::new(),
        }
    }

    /// Append a message, enforcing the at-most-one, logically-first
    /// `SYSTEM_PROMPT` invariant.
    ///
    /// A second `SYSTEM_PROMPT` message replaces the first rather than being
    /// appended, since the session's persisted form is append-only and a
    /// session may only ever have one system prompt of record.
    pub fn append(&mut self, message: Message) {
        if message.category == MessageCategory::SystemPrompt {
            if let Some(existing) = self
                .messages
                .iter_mut()
                .find(|m| m.category == MessageCategory::SystemPrompt)
            {
                *existing = message;
                return;
            }
            self.messages.insert(0, message);
            return;
        }
        self.messages.push(message);
    }

    /// The system prompt message, if one has been set.
    pub fn system_prompt(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.category == MessageCategory::SystemPrompt)
    }

    /// Total approximate (or authoritative, where known) token count across
    /// all messages in the session.
    pub fn total_tokens(&self) -> usize {
        self.messages.iter().map(Message::effective_tokens).sum()
    }

    /// Messages of a given category, in session order.
    pub fn messages_in_category(&self, category: MessageCategory) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.category == category)
    }

    /// Replace the message list wholesale — used when restoring from a checkpoint
    /// snapshot or after a compaction pass summarizes the history.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }
}
