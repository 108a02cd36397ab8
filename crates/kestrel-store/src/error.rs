// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io { path: std::path::PathBuf, #[source] source: std::io::Error },
    #[error("corrupt session record at {path}: {source}")]
    Corrupt { path: std::path::PathBuf, #[source] source: serde_json::Error },
    #[error("refusing to delete session {session_id}: still referenced by {referents:?}")]
    StillReferenced { session_id: String, referents: Vec<String> },
}

pub type Result<T> = std::result::Result<T, StoreError>;
