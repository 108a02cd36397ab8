// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' is already registered with a different description or parameter schema")]
    SchemaConflict(String),
}

pub type Result<T> = std::result::Result<T, ToolError>;
