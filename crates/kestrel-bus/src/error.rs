// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("agent already exists: {0}")]
    AlreadyExists(String),
    #[error("no active agent for role: {0}")]
    UnknownRole(String),
    #[error("engine error: {0}")]
    Engine(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;
