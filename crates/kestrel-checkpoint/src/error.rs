// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(String),
    #[error("io error at {path}: {source}")]
    Io { path: std::path::PathBuf, #[source] source: std::io::Error },
    #[error("corrupt checkpoint record at {path}: {source}")]
    Corrupt { path: std::path::PathBuf, #[source] source: serde_json::Error },
    #[error("session store error: {0}")]
    Store(#[from] kestrel_store::StoreError),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
