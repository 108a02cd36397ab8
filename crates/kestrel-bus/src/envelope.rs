// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The routed message shape: who sent it, who (or what role, or the human)
//! it's addressed to, and enough metadata to reconstruct provenance once it
//! lands in a recipient's session.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Agent(String),
    Role(String),
    Human,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub channel: Option<String>,
    pub message_type: Option<String>,
    /// Set by the bus itself when a directed delivery lands on a paused
    /// agent: the envelope was logged but not yet applied to the session.
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from_agent: Option<String>,
    pub to: Recipient,
    pub content: String,
    pub metadata: EnvelopeMetadata,
    pub correlation_id: String,
}

impl Envelope {
    pub fn new(from_agent: Option<String>, to: Recipient, content: impl Into<String>) -> Self {
        Self {
            from_agent,
            to,
            content: content.into(),
            metadata: EnvelopeMetadata::default(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_metadata(mut self, metadata: EnvelopeMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What happened to a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// Directed delivery to a paused agent — logged, not yet applied.
    Queued,
    DeadLetter,
}
