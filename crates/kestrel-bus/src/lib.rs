// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod coordinator;
mod delegation_tool;
mod envelope;
mod error;
mod registry;

pub use coordinator::{Coordinator, SpawnOptions};
pub use delegation_tool::{
    DelegationTool, ResumeSubAgentTool, SpawnSubAgentTool, StopSubAgentTool, MAX_DELEGATION_DEPTH,
};
pub use envelope::{Envelope, EnvelopeMetadata, Recipient, RouteOutcome};
pub use error::{BusError, Result};
pub use registry::{AgentRecord, AgentRegistry};
