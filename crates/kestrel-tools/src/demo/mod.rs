// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

//! Reference tool implementations.
//!
//! Concrete tools (shell execution, editors, web search, ...) are an
//! integration concern for the embedder. The two tools here exist to give
//! the dispatch contract something real to run against in tests and demos.

pub mod echo;
pub mod read_file;
